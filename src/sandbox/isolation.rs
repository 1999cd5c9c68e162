//! Isolation backends
//!
//! The sandbox describes *what* it needs (mounts, a resource group, a
//! process entering the sandbox); a backend decides *how*. `KernelBackend`
//! talks to the kernel directly, `DirectBackend` only keeps the bookkeeping
//! and runs processes unconfined.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use nix::unistd::{setpgid, Pid};
use tokio::process::Command;
use tracing::debug;

/// One mount performed while building a sandbox
#[derive(Debug, Clone, PartialEq)]
pub enum MountSpec {
    /// Size-capped tmpfs
    Tmpfs { target: PathBuf, size_mb: u64 },
    /// Copy-on-write overlay: writes land in `upper`, `lower` is never touched
    Overlay {
        lower: PathBuf,
        upper: PathBuf,
        work: PathBuf,
        target: PathBuf,
    },
    /// Recursive bind mount
    Bind { source: PathBuf, target: PathBuf },
}

impl MountSpec {
    pub fn target(&self) -> &Path {
        match self {
            MountSpec::Tmpfs { target, .. }
            | MountSpec::Overlay { target, .. }
            | MountSpec::Bind { target, .. } => target,
        }
    }
}

/// How to start the sandbox entrypoint
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Host path of the sandbox root filesystem
    pub root: PathBuf,
    /// Working directory, as seen by the launched process
    pub workdir: PathBuf,
    /// Script to execute with `/bin/sh`, as seen by the launched process
    pub script: PathBuf,
    pub uid: u32,
    pub gid: u32,
    /// Resource group to join before exec
    pub group: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

pub trait IsolationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether launched processes see `LaunchSpec::root` as `/`
    fn chroots(&self) -> bool;

    /// Verify the host can run sandboxes at all
    fn preflight(&self) -> Result<()> {
        Ok(())
    }

    fn mount(&self, spec: &MountSpec) -> Result<()>;

    /// Unmount `target`; unmounting something that is not mounted succeeds
    fn unmount(&self, target: &Path) -> Result<()>;

    /// Create a resource group with the given memory limit
    ///
    /// Returns `None` when the backend does not account resources.
    fn create_group(&self, name: &str, memory_limit_kb: u64) -> Result<Option<PathBuf>>;

    fn set_group_memory(&self, group: &Path, memory_limit_kb: u64) -> Result<()>;

    /// Kill every process inside the group
    fn kill_group(&self, group: &Path) -> Result<()>;

    fn remove_group(&self, group: &Path) -> Result<()>;

    /// Build the command that enters the sandbox and runs `launch.script`
    ///
    /// The spawned process must lead its own process group.
    fn command(&self, launch: &LaunchSpec) -> Command;
}

/// Backend without any isolation
///
/// Mounts are only recorded, processes run as the worker's own user in the
/// host filesystem. Useful on development machines and in tests; never use
/// it for untrusted code.
#[derive(Debug, Default)]
pub struct DirectBackend {
    active: Mutex<Vec<PathBuf>>,
}

impl DirectBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Targets currently recorded as mounted
    pub fn active_mounts(&self) -> Vec<PathBuf> {
        self.active
            .lock()
            .map(|active| active.clone())
            .unwrap_or_default()
    }
}

impl IsolationBackend for DirectBackend {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn chroots(&self) -> bool {
        false
    }

    fn mount(&self, spec: &MountSpec) -> Result<()> {
        debug!("direct backend: record mount {:?}", spec);
        let mut active = self
            .active
            .lock()
            .map_err(|_| anyhow::anyhow!("mount table poisoned"))?;
        active.push(spec.target().to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| anyhow::anyhow!("mount table poisoned"))?;
        if let Some(pos) = active.iter().rposition(|t| t == target) {
            active.remove(pos);
        }
        Ok(())
    }

    fn create_group(&self, _name: &str, _memory_limit_kb: u64) -> Result<Option<PathBuf>> {
        Ok(None)
    }

    fn set_group_memory(&self, _group: &Path, _memory_limit_kb: u64) -> Result<()> {
        Ok(())
    }

    fn kill_group(&self, _group: &Path) -> Result<()> {
        Ok(())
    }

    fn remove_group(&self, _group: &Path) -> Result<()> {
        Ok(())
    }

    fn command(&self, launch: &LaunchSpec) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg(&launch.script)
            .current_dir(&launch.workdir)
            .env_clear()
            .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true);
        unsafe {
            cmd.pre_exec(|| {
                setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
                Ok(())
            });
        }
        cmd
    }
}
