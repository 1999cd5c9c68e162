//! Infrastructure failure taxonomy
//!
//! Bad user code (compile errors, crashes, timeouts, wrong answers) is never
//! an error here; those are ordinary outcomes. Everything below ends a
//! judgement in `cant_be_judged`.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("unsupported language: {0}")]
    UnknownLanguage(String),

    #[error("unknown differ module: {0}")]
    UnknownDiffer(String),

    #[error("special judge is not enabled for problem {0}")]
    SpecialJudgeNotAllowed(i64),

    #[error("no test cases found in {}", .0.display())]
    NoTestCases(PathBuf),

    #[error("test case {name} must have exactly one .in and one .out file")]
    UnmatchedTestCase { name: String },

    #[error("invalid sandbox path: {0}")]
    InvalidPath(String),

    #[error("sandbox is already frozen")]
    AlreadyFrozen,

    #[error("sandbox has been torn down")]
    TornDown,

    #[error("failed to launch sandboxed process: {0}")]
    Launch(String),

    #[error("monitor misbehaved: {0}")]
    Monitor(String),

    #[error("special judge failed: {0}")]
    SpecialJudge(String),
}
