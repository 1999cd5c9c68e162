//! Trusted runner implementation

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::debug;

/// Captured result of a trusted program
#[derive(Debug, Clone)]
pub struct TrustedOutput {
    /// `None` when terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runner that executes trusted code directly without sandbox
#[derive(Debug, Clone)]
pub struct TrustedRunner {
    timeout: Duration,
}

impl TrustedRunner {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Run a program to completion, or fail once the timeout elapses
    pub async fn execute<S: AsRef<OsStr>>(&self, program: &Path, args: &[S]) -> Result<TrustedOutput> {
        debug!("Running trusted program: {}", program.display());

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program.display()))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .with_context(|| format!("{} timed out after {:?}", program.display(), self.timeout))?
            .with_context(|| format!("Failed to wait for {}", program.display()))?;

        Ok(TrustedOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl Default for TrustedRunner {
    fn default() -> Self {
        Self::new(30)
    }
}
