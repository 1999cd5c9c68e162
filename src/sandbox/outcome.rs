//! Interpretation of a finished monitor invocation
//!
//! The monitor's report is trusted for *how* the program ended, but the
//! limits are checked again here against the exact requested values: the
//! monitor only enforces whole CPU seconds and the cgroup limit carries
//! headroom.

use std::process::Output;
use std::time::Duration;

use crate::monitor::MonitorReport;

/// Result of one sandboxed run
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Ok { cpu_time: Duration, max_rss_kb: u64 },
    RuntimeError { reason: String },
    TimeLimitExceeded,
    MemoryLimitExceeded,
    /// The sandbox machinery itself misbehaved; the verdict is unknown
    InfrastructureFailure { reason: String },
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok { .. })
    }
}

/// Map the captured output of the sandbox entrypoint to an outcome
pub fn from_monitor_output(
    output: &Output,
    time_limit: Option<Duration>,
    memory_limit_kb: u64,
) -> Outcome {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        return Outcome::InfrastructureFailure {
            reason: format!("monitor exited with {}: {}", output.status, stderr.trim()),
        };
    }
    if !stderr.trim().is_empty() {
        return Outcome::InfrastructureFailure {
            reason: format!("monitor wrote to stderr: {}", stderr.trim()),
        };
    }

    match stdout.parse::<MonitorReport>() {
        Ok(report) => revalidate(report, time_limit, memory_limit_kb),
        Err(e) => Outcome::InfrastructureFailure {
            reason: e.to_string(),
        },
    }
}

/// Convert a monitor report, enforcing the exact limits
pub fn revalidate(
    report: MonitorReport,
    time_limit: Option<Duration>,
    memory_limit_kb: u64,
) -> Outcome {
    match report {
        MonitorReport::Ok {
            cpu_time,
            max_rss_kb,
        } => {
            if time_limit.is_some_and(|limit| cpu_time > limit) {
                Outcome::TimeLimitExceeded
            } else if max_rss_kb > memory_limit_kb {
                Outcome::MemoryLimitExceeded
            } else {
                Outcome::Ok {
                    cpu_time,
                    max_rss_kb,
                }
            }
        }
        MonitorReport::RuntimeError(reason) => Outcome::RuntimeError { reason },
        MonitorReport::TimeLimitExceeded(_) => Outcome::TimeLimitExceeded,
        MonitorReport::MemoryLimitExceeded(_) => Outcome::MemoryLimitExceeded,
    }
}
