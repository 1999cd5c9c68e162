//! Problem-supplied special judge
//!
//! The data directory may ship an executable named `spj`. It is invoked as
//! `spj <input> <output> <expected>` and answers through its exit code,
//! using the testlib.h conventions.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use super::Differ;
use crate::core::JudgeError;
use crate::data::SPECIAL_JUDGE_FILE;
use crate::runner::TrustedRunner;

/// testlib.h exit codes
mod testlib_exit_codes {
    pub const OK: i32 = 0; // _ok
    pub const WRONG_ANSWER: i32 = 1; // _wa
    pub const PRESENTATION_ERROR: i32 = 2; // _pe
    pub const DIRT: i32 = 4; // _dirt
    pub const UNEXPECTED_EOF: i32 = 8; // _unexpected_eof
}

/// Map a checker exit code to accept/reject
///
/// `None` for codes that signal a broken checker (including `_fail`).
fn verdict_for_exit_code(code: i32) -> Option<bool> {
    use testlib_exit_codes::*;
    match code {
        OK => Some(true),
        WRONG_ANSWER | PRESENTATION_ERROR | DIRT | UNEXPECTED_EOF => Some(false),
        _ => None,
    }
}

pub struct SpecialJudge {
    runner: TrustedRunner,
}

impl SpecialJudge {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            runner: TrustedRunner::new(timeout_secs),
        }
    }
}

#[async_trait]
impl Differ for SpecialJudge {
    fn desc(&self) -> &str {
        "problem-supplied checker"
    }

    async fn judge(
        &self,
        data_dir: &Path,
        input: &Path,
        output: &Path,
        expected: &Path,
    ) -> Result<bool> {
        let checker = data_dir.join(SPECIAL_JUDGE_FILE);
        if !checker.is_file() {
            return Err(JudgeError::SpecialJudge(format!(
                "{} is missing from the test data",
                SPECIAL_JUDGE_FILE
            ))
            .into());
        }

        let result = self
            .runner
            .execute(&checker, &[input, output, expected])
            .await?;
        debug!(
            "Checker result: exit_code={:?}, stdout={}, stderr={}",
            result.exit_code,
            result.stdout.trim(),
            result.stderr.trim()
        );

        match result.exit_code.and_then(verdict_for_exit_code) {
            Some(accepted) => Ok(accepted),
            None => {
                warn!("Unknown checker exit code: {:?}", result.exit_code);
                Err(JudgeError::SpecialJudge(format!(
                    "checker exited with {:?}: {}",
                    result.exit_code,
                    result.stderr.trim()
                ))
                .into())
            }
        }
    }
}
