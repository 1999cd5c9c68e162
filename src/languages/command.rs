//! Command-table driven language adapter

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::{FailVerdict, LanguageAdapter, RunOutcome, SetupOutcome};
use crate::core::JudgeError;
use crate::sandbox::{Outcome, RunSpec, Sandbox};

/// Compiler diagnostics, stdout and stderr merged
const COMPILE_LOG: &str = ".compile.log";
const OUTPUT_FILE: &str = "output";
const STDERR_FILE: &str = ".stderr";

/// Bytes of the program's stderr attached to a runtime error
const STDERR_PREVIEW_BYTES: usize = 4096;

/// One row of the language table
#[derive(Debug, Clone, Deserialize)]
pub struct LanguageSpec {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub version: String,
    /// Name of the source file (e.g., "main.cpp")
    pub source_file: String,
    /// Compile command template (None if not needed)
    #[serde(default)]
    pub compile_command: Option<String>,
    /// Run command template
    pub run_command: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub limit_address_space: bool,
    #[serde(default)]
    pub max_processes: Option<u64>,
}

pub struct CommandAdapter {
    name: String,
    ext: String,
    spec: LanguageSpec,
    compile_time_limit: Duration,
}

impl CommandAdapter {
    pub fn new(name: &str, spec: LanguageSpec, compile_time_limit: Duration) -> Self {
        let ext = Path::new(&spec.source_file)
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name: name.to_string(),
            ext,
            spec,
            compile_time_limit,
        }
    }

    pub fn spec(&self) -> &LanguageSpec {
        &self.spec
    }

    fn render(&self, template: &str, memory_kb: u64) -> String {
        template.replace("{memory_mb}", &(memory_kb / 1024).max(1).to_string())
    }

    async fn read_text(sandbox: &Sandbox, name: &str, limit: usize) -> String {
        match sandbox.read_file(name).await {
            Ok(mut bytes) => {
                bytes.truncate(limit);
                String::from_utf8_lossy(&bytes).into_owned()
            }
            Err(_) => String::new(),
        }
    }
}

#[async_trait]
impl LanguageAdapter for CommandAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn ext(&self) -> &str {
        &self.ext
    }

    fn version(&self) -> &str {
        &self.spec.version
    }

    async fn setup(&self, sandbox: &mut Sandbox, source: &str) -> Result<SetupOutcome> {
        sandbox.write_file(source.as_bytes(), &self.spec.source_file, None)?;

        let Some(template) = &self.spec.compile_command else {
            return Ok(SetupOutcome::Ok);
        };
        let command = format!("{} 2>&1", self.render(template, sandbox.memory_kb()));
        info!("Compiling {} submission", self.name);

        let run = RunSpec::new(command)
            .with_stdout(COMPILE_LOG)
            .with_time_limit(self.compile_time_limit)
            .with_max_processes(self.spec.max_processes);
        let outcome = sandbox.run(&run).await?;
        debug!("Compilation finished: {:?}", outcome);

        let message = match outcome {
            Outcome::Ok { .. } => return Ok(SetupOutcome::Ok),
            Outcome::RuntimeError { reason } => {
                let log = Self::read_text(sandbox, COMPILE_LOG, usize::MAX).await;
                if log.trim().is_empty() {
                    format!("compiler failed: {}", reason)
                } else {
                    log
                }
            }
            Outcome::TimeLimitExceeded => "compilation time limit exceeded".to_string(),
            Outcome::MemoryLimitExceeded => "compilation memory limit exceeded".to_string(),
            Outcome::InfrastructureFailure { reason } => {
                return Err(JudgeError::Monitor(reason).into())
            }
        };
        Ok(SetupOutcome::Error { message })
    }

    async fn run(
        &self,
        sandbox: &mut Sandbox,
        input_file: &str,
        time_limit: Duration,
        memory_limit_kb: u64,
    ) -> Result<RunOutcome> {
        let run = RunSpec::new(self.render(&self.spec.run_command, memory_limit_kb))
            .with_stdin(input_file)
            .with_stdout(OUTPUT_FILE)
            .with_stderr(STDERR_FILE)
            .with_time_limit(time_limit)
            .with_memory_limit(memory_limit_kb)
            .with_address_space_limit(self.spec.limit_address_space)
            .with_max_processes(self.spec.max_processes);

        let outcome = match sandbox.run(&run).await? {
            Outcome::Ok {
                cpu_time,
                max_rss_kb,
            } => match sandbox.read_file(OUTPUT_FILE).await {
                Ok(output) => RunOutcome::Ok {
                    time_ms: cpu_time.as_millis() as u64,
                    memory_kb: max_rss_kb,
                    output,
                },
                // the program replaced its output with a FIFO, socket or symlink
                Err(e) if is_invalid_path(&e) => RunOutcome::Fail {
                    verdict: FailVerdict::RuntimeError,
                    message: Some("output is not a regular file".to_string()),
                },
                Err(e) => return Err(e),
            },
            Outcome::RuntimeError { reason } => {
                let stderr = Self::read_text(sandbox, STDERR_FILE, STDERR_PREVIEW_BYTES).await;
                let message = if stderr.trim().is_empty() {
                    reason
                } else {
                    format!("{}\n{}", reason, stderr.trim_end())
                };
                RunOutcome::Fail {
                    verdict: FailVerdict::RuntimeError,
                    message: Some(message),
                }
            }
            Outcome::TimeLimitExceeded => RunOutcome::Fail {
                verdict: FailVerdict::TimeLimitExceeded,
                message: None,
            },
            Outcome::MemoryLimitExceeded => RunOutcome::Fail {
                verdict: FailVerdict::MemoryLimitExceeded,
                message: Some("memory limit exceeded".to_string()),
            },
            Outcome::InfrastructureFailure { reason } => {
                return Err(JudgeError::Monitor(reason).into())
            }
        };
        Ok(outcome)
    }
}

fn is_invalid_path(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<JudgeError>(), Some(JudgeError::InvalidPath(_)))
}
