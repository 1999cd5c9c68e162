//! Kernel isolation: mounts, cgroup v2 and namespace/credential switching
//!
//! Requires root. Every sandbox gets its own cgroup under
//! `SandboxConfig::cgroup_root`; the launched process joins it, moves into
//! a fresh network namespace, chroots into the sandbox root and drops to
//! the unprivileged judge user before exec.
//!
//! The monitor shares the group with the judged program but is exempt from
//! the OOM killer, so a group OOM kills the program and the monitor reports
//! it. `memory.oom.group` stays off for the same reason.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{chdir, chroot, geteuid, setgid, setgroups, setpgid, setuid, Gid, Pid, Uid};
use tokio::process::Command;
use tracing::{debug, warn};

use super::config::SandboxConfig;
use super::isolation::{IsolationBackend, LaunchSpec, MountSpec};

/// Controllers the sandbox groups rely on
const CONTROLLERS: &str = "+memory +pids";

pub struct KernelBackend {
    cgroup_root: PathBuf,
    max_processes: Option<u64>,
    isolate_network: bool,
}

impl KernelBackend {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            cgroup_root: config.cgroup_root.clone(),
            max_processes: config.max_processes,
            isolate_network: config.isolate_network,
        }
    }

    fn ensure_cgroup_root(&self) -> Result<()> {
        if !self.cgroup_root.exists() {
            fs::create_dir_all(&self.cgroup_root).with_context(|| {
                format!("Failed to create cgroup root {}", self.cgroup_root.display())
            })?;
        }
        let control = self.cgroup_root.join("cgroup.subtree_control");
        fs::write(&control, CONTROLLERS)
            .with_context(|| format!("Failed to enable controllers in {}", control.display()))?;
        Ok(())
    }
}

fn write_control(group: &Path, file: &str, value: &str) -> Result<()> {
    let path = group.join(file);
    fs::write(&path, value).with_context(|| format!("Failed to write {}", path.display()))
}

impl IsolationBackend for KernelBackend {
    fn name(&self) -> &'static str {
        "kernel"
    }

    fn chroots(&self) -> bool {
        true
    }

    fn preflight(&self) -> Result<()> {
        if !geteuid().is_root() {
            anyhow::bail!("The kernel sandbox backend must run as root");
        }
        if !Path::new("/sys/fs/cgroup/cgroup.controllers").exists() {
            anyhow::bail!("cgroup v2 is required but /sys/fs/cgroup is not a unified hierarchy");
        }
        self.ensure_cgroup_root()
    }

    fn mount(&self, spec: &MountSpec) -> Result<()> {
        debug!("mount {:?}", spec);
        match spec {
            MountSpec::Tmpfs { target, size_mb } => {
                let data = format!("size={}m,mode=0755", size_mb);
                mount(
                    Some("tmpfs"),
                    target,
                    Some("tmpfs"),
                    MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                    Some(data.as_str()),
                )
            }
            MountSpec::Overlay {
                lower,
                upper,
                work,
                target,
            } => {
                let data = format!(
                    "lowerdir={},upperdir={},workdir={}",
                    lower.display(),
                    upper.display(),
                    work.display()
                );
                mount(
                    Some("overlay"),
                    target,
                    Some("overlay"),
                    MsFlags::MS_NOSUID,
                    Some(data.as_str()),
                )
            }
            MountSpec::Bind { source, target } => mount(
                Some(source.as_path()),
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            ),
        }
        .with_context(|| format!("Failed to mount {}", spec.target().display()))
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        match umount2(target, MntFlags::MNT_DETACH) {
            Ok(()) | Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to unmount {}", target.display())),
        }
    }

    fn create_group(&self, name: &str, memory_limit_kb: u64) -> Result<Option<PathBuf>> {
        let group = self.cgroup_root.join(name);
        fs::create_dir(&group)
            .with_context(|| format!("Failed to create cgroup {}", group.display()))?;

        self.set_group_memory(&group, memory_limit_kb)?;
        if let Err(e) = write_control(&group, "memory.swap.max", "0") {
            // kernels built without swap accounting
            warn!("{:#}", e);
        }
        if let Some(max) = self.max_processes {
            write_control(&group, "pids.max", &max.to_string())?;
        }
        Ok(Some(group))
    }

    fn set_group_memory(&self, group: &Path, memory_limit_kb: u64) -> Result<()> {
        write_control(group, "memory.max", &(memory_limit_kb * 1024).to_string())
    }

    fn kill_group(&self, group: &Path) -> Result<()> {
        if write_control(group, "cgroup.kill", "1").is_ok() {
            return Ok(());
        }

        // cgroup.kill needs 5.14+, fall back to killing member by member
        let procs = group.join("cgroup.procs");
        let content = match fs::read_to_string(&procs) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", procs.display()))
            }
        };
        let pids: Vec<Pid> = content
            .lines()
            .filter_map(|line| line.trim().parse::<i32>().ok())
            .map(Pid::from_raw)
            .collect();
        for &pid in &pids {
            let _ = kill(pid, Signal::SIGSTOP);
        }
        for &pid in &pids {
            let _ = kill(pid, Signal::SIGKILL);
        }
        Ok(())
    }

    fn remove_group(&self, group: &Path) -> Result<()> {
        // killed members linger briefly before the group becomes empty
        let mut attempts = 0;
        loop {
            match fs::remove_dir(group) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) if attempts < 20 => {
                    debug!("cgroup {} busy: {}", group.display(), e);
                    attempts += 1;
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to remove cgroup {}", group.display()))
                }
            }
        }
    }

    fn command(&self, launch: &LaunchSpec) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg(&launch.script)
            .env_clear()
            .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true);

        let root = launch.root.clone();
        let workdir = launch.workdir.clone();
        let uid = Uid::from_raw(launch.uid);
        let gid = Gid::from_raw(launch.gid);
        let procs = launch.group.as_ref().map(|g| g.join("cgroup.procs"));
        let isolate_network = self.isolate_network;

        unsafe {
            cmd.pre_exec(move || {
                setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
                if let Some(procs) = &procs {
                    fs::write(procs, b"0")?;
                }
                // a group OOM must take the judged program, never the monitor
                fs::write("/proc/self/oom_score_adj", b"-1000")?;
                if isolate_network {
                    unshare(CloneFlags::CLONE_NEWNET)?;
                }
                chroot(&root)?;
                chdir(&workdir)?;
                setgroups(&[gid])?;
                setgid(gid)?;
                setuid(uid)?;
                Ok(())
            });
        }
        cmd
    }
}
