pub mod error;
pub mod utils;
pub mod verdict;

pub use error::JudgeError;
pub use verdict::{JudgeReport, Problem, Submission, SubmissionState};
