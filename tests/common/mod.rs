#![allow(dead_code)]

use std::path::{Path, PathBuf};

use judgehost::sandbox::{BackendKind, SandboxConfig};

pub fn monitor_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_judgehost-monitor"))
}

/// Sandbox settings for unprivileged test runs
pub fn sandbox_config(work_root: &Path) -> SandboxConfig {
    SandboxConfig {
        backend: BackendKind::Direct,
        work_root: work_root.to_path_buf(),
        uid: nix::unistd::getuid().as_raw(),
        gid: nix::unistd::getgid().as_raw(),
        max_processes: None,
        min_memory_kb: 64 * 1024,
        monitor_path: monitor_path(),
        watchdog_grace_secs: 3,
        compile_time_limit_secs: 10,
        ..SandboxConfig::default()
    }
}
