//! Submission states and the records the orchestrator reads and produces

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a submission
///
/// `Received`/`RejudgeRequested` are initial, `Compiling`/`Running` are
/// intermediate, everything else is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionState {
    Received,
    RejudgeRequested,
    Compiling,
    CompileError,
    Running,
    Accepted,
    WrongAnswer,
    RuntimeError,
    TimeLimitExceeded,
    CantBeJudged,
}

impl SubmissionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubmissionState::CompileError
                | SubmissionState::Accepted
                | SubmissionState::WrongAnswer
                | SubmissionState::RuntimeError
                | SubmissionState::TimeLimitExceeded
                | SubmissionState::CantBeJudged
        )
    }
}

impl fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubmissionState::Received => "received",
            SubmissionState::RejudgeRequested => "rejudge_requested",
            SubmissionState::Compiling => "compiling",
            SubmissionState::CompileError => "compile_error",
            SubmissionState::Running => "running",
            SubmissionState::Accepted => "accepted",
            SubmissionState::WrongAnswer => "wrong_answer",
            SubmissionState::RuntimeError => "runtime_error",
            SubmissionState::TimeLimitExceeded => "time_limit_exceeded",
            SubmissionState::CantBeJudged => "cant_be_judged",
        };
        write!(f, "{}", s)
    }
}

/// A judging request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: i64,
    pub problem_id: i64,
    pub language: String,
    pub source: String,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default = "default_state")]
    pub state: SubmissionState,
    #[serde(default)]
    pub message: Option<String>,
    /// Aggregate CPU time in milliseconds
    #[serde(default)]
    pub time: Option<u64>,
    /// Peak memory in KB
    #[serde(default)]
    pub memory: Option<u64>,
}

fn default_state() -> SubmissionState {
    SubmissionState::Received
}

impl Submission {
    /// Reset judging results so the pipeline can run again from scratch
    pub fn reset_for_rejudge(&mut self) {
        self.state = SubmissionState::RejudgeRequested;
        self.message = None;
        self.time = None;
        self.memory = None;
    }

    pub fn apply(&mut self, report: &JudgeReport) {
        self.state = report.state;
        self.message = report.message.clone();
        self.time = report.time_ms;
        self.memory = report.memory_kb;
    }
}

/// Read-only problem settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    pub id: i64,
    /// Time limit in milliseconds
    pub time_limit: u64,
    /// Memory limit in KB
    pub memory_limit: u64,
    /// Differ module identifier (e.g. "strict")
    pub differ: String,
    /// Remote data file references (test files, archives, special judge)
    pub data_files: Vec<String>,
}

/// Final outcome of one judgement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeReport {
    pub state: SubmissionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub time_ms: Option<u64>,
    pub memory_kb: Option<u64>,
}

impl JudgeReport {
    pub fn new(state: SubmissionState) -> Self {
        Self {
            state,
            message: None,
            time_ms: None,
            memory_kb: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_stats(mut self, time_ms: u64, memory_kb: u64) -> Self {
        self.time_ms = Some(time_ms);
        self.memory_kb = Some(memory_kb);
        self
    }
}
