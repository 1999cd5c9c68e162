//! Sandbox module - isolated environment for untrusted programs
//!
//! This module handles:
//! - Building a throwaway root filesystem per judgement (tmpfs + overlays)
//! - Resource groups bounding memory and process count
//! - Moving files in and out of the sandbox user's home directory
//! - Running commands under the monitor with a wall-clock watchdog
//! - Unwinding all of the above, even after partial construction
//!
//! The sandbox module does NOT:
//! - Interpret verdicts (that's the judger's job)
//! - Know about languages or compilation
//! - Compare outputs

pub mod config;
pub mod environment;
pub mod isolation;
pub mod kernel;
pub mod outcome;

use std::sync::Arc;

pub use config::{BackendKind, SandboxConfig};
pub use environment::{shell_quote, RunSpec, Sandbox};
pub use isolation::{DirectBackend, IsolationBackend, LaunchSpec, MountSpec};
pub use kernel::KernelBackend;
pub use outcome::Outcome;

/// Instantiate the backend selected in the configuration
pub fn backend_for(config: &SandboxConfig) -> Arc<dyn IsolationBackend> {
    match config.backend {
        BackendKind::Kernel => Arc::new(KernelBackend::new(config)),
        BackendKind::Direct => Arc::new(DirectBackend::new()),
    }
}
