//! Sandbox configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which isolation backend drives the sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Mount namespaces, overlays, cgroups and chroot (requires root)
    #[default]
    Kernel,
    /// Plain directories and processes, no isolation (development only)
    Direct,
}

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub backend: BackendKind,
    /// Directory holding the per-judgement temporary roots
    pub work_root: PathBuf,
    /// Lower layer of the system overlay
    pub base_root: PathBuf,
    /// Size cap of the sandbox tmpfs in MB
    pub fs_size_mb: u64,
    /// Added on top of every memory limit for interpreter/runtime overhead
    pub memory_headroom_kb: u64,
    /// Extra wall-clock seconds granted before the watchdog kills a run
    pub watchdog_grace_secs: u64,
    /// Fixed compile time budget, independent of the problem
    pub compile_time_limit_secs: u64,
    /// Lower bound of the sandbox memory size (compilers need headroom)
    pub min_memory_kb: u64,
    /// Process-count limit for the sandbox user
    pub max_processes: Option<u64>,
    /// Upper bound on bytes read back from a sandbox file
    pub max_read_bytes: u64,
    pub uid: u32,
    pub gid: u32,
    /// Home directory of the sandbox user, as seen inside the sandbox
    pub home_path: PathBuf,
    /// Monitor binary, as seen inside the sandbox
    pub monitor_path: PathBuf,
    /// Parent cgroup (v2) under which one group per sandbox is created
    pub cgroup_root: PathBuf,
    /// Give sandboxed processes an empty network namespace
    pub isolate_network: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Kernel,
            work_root: PathBuf::from("/tmp/judgehost"),
            base_root: PathBuf::from("/"),
            fs_size_mb: 512,
            memory_headroom_kb: 64 * 1024,
            watchdog_grace_secs: 5,
            compile_time_limit_secs: 30,
            min_memory_kb: 512 * 1024,
            max_processes: Some(64),
            max_read_bytes: 64 * 1024 * 1024,
            uid: 65534,
            gid: 65534,
            home_path: PathBuf::from("/home/judge"),
            monitor_path: PathBuf::from("/usr/local/bin/judgehost-monitor"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup/judgehost"),
            isolate_network: true,
        }
    }
}
