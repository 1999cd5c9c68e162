//! Language adapters
//!
//! A language adapter knows how to turn a submission into something
//! runnable inside a sandbox (`setup`) and how to run it against one test
//! input (`run`). The built-in adapters are data-driven from a TOML table,
//! see `files/languages.toml`.

pub mod command;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::core::JudgeError;
use crate::sandbox::Sandbox;

pub use command::{CommandAdapter, LanguageSpec};

/// Result of preparing a submission
#[derive(Debug, Clone, PartialEq)]
pub enum SetupOutcome {
    Ok,
    /// The submission is at fault (e.g. does not compile)
    Error { message: String },
}

/// Why a run did not produce an output worth comparing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailVerdict {
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
}

/// Result of running a prepared submission on one input
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Ok {
        time_ms: u64,
        memory_kb: u64,
        output: Vec<u8>,
    },
    Fail {
        verdict: FailVerdict,
        message: Option<String>,
    },
}

#[async_trait]
pub trait LanguageAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Source file extension, without the dot
    fn ext(&self) -> &str;

    fn version(&self) -> &str;

    /// Write the source into the sandbox and compile it if needed
    async fn setup(&self, sandbox: &mut Sandbox, source: &str) -> Result<SetupOutcome>;

    /// Run the prepared program with `input_file` (in the sandbox home) as stdin
    async fn run(
        &self,
        sandbox: &mut Sandbox,
        input_file: &str,
        time_limit: Duration,
        memory_limit_kb: u64,
    ) -> Result<RunOutcome>;
}

/// Built-in language table
const BUILTIN_LANGUAGES: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));

/// Adapters by identifier (case-insensitive, aliases included)
#[derive(Default)]
pub struct LanguageRegistry {
    adapters: HashMap<String, Arc<dyn LanguageAdapter>>,
    identifiers: Vec<String>,
}

impl LanguageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry of the built-in language table
    pub fn builtin(compile_time_limit_secs: u64) -> Result<Self> {
        Self::from_toml(BUILTIN_LANGUAGES, compile_time_limit_secs)
    }

    /// Load a language table from a file
    pub fn from_file(path: &Path, compile_time_limit_secs: u64) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read language table {}", path.display()))?;
        Self::from_toml(&content, compile_time_limit_secs)
            .with_context(|| format!("Invalid language table {}", path.display()))
    }

    pub fn from_toml(content: &str, compile_time_limit_secs: u64) -> Result<Self> {
        let table: HashMap<String, LanguageSpec> =
            toml::from_str(content).context("Failed to parse language table")?;

        let mut registry = Self::new();
        let mut names: Vec<_> = table.keys().cloned().collect();
        names.sort();
        for name in names {
            let Some(spec) = table.get(&name) else {
                continue;
            };
            let adapter: Arc<dyn LanguageAdapter> = Arc::new(CommandAdapter::new(
                &name,
                spec.clone(),
                Duration::from_secs(compile_time_limit_secs),
            ));
            registry.register(&name, &spec.aliases, adapter);
        }
        Ok(registry)
    }

    pub fn register(&mut self, name: &str, aliases: &[String], adapter: Arc<dyn LanguageAdapter>) {
        self.adapters.insert(name.to_lowercase(), adapter.clone());
        for alias in aliases {
            self.adapters.insert(alias.to_lowercase(), adapter.clone());
        }
        self.identifiers.push(name.to_lowercase());
    }

    pub fn get(&self, language: &str) -> Option<Arc<dyn LanguageAdapter>> {
        self.adapters.get(&language.to_lowercase()).cloned()
    }

    pub fn resolve(&self, language: &str) -> Result<Arc<dyn LanguageAdapter>, JudgeError> {
        self.get(language)
            .ok_or_else(|| JudgeError::UnknownLanguage(language.to_string()))
    }

    /// Primary identifiers, without aliases
    pub fn identifiers(&self) -> &[String] {
        &self.identifiers
    }
}
