//! Problem test data: local cache of remote files and test case discovery

pub mod cache;
pub mod testcase;

pub use cache::{DataCache, DataSet, SPECIAL_JUDGE_FILE};
pub use testcase::{discover, TestCase};
