//! Per-judgement sandbox
//!
//! Layout of one sandbox, all under a fresh directory in `work_root`:
//!
//! ```text
//! <dir>                 tmpfs, size-capped
//! ├── base-upper/       writable layer of the system overlay
//! ├── base-work/
//! ├── merged/           overlay(base_root, base-upper) = sandbox `/`
//! │   ├── proc          bind of /proc
//! │   ├── dev/{null,..} binds of the host device nodes
//! │   └── <home_path>   bind of home/ (setup), overlay(home, home-upper) once frozen
//! ├── home/             sandbox user's files written during setup
//! ├── home-upper/
//! └── home-work/
//! ```
//!
//! Every mount is recorded as it is made so teardown can unwind exactly
//! what exists, whether construction finished or not.

use std::fs::{self, OpenOptions, Permissions};
use std::io::{Read, Write};
use std::os::unix::fs::{chown, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use super::config::SandboxConfig;
use super::isolation::{IsolationBackend, LaunchSpec, MountSpec};
use super::outcome::{self, Outcome};
use crate::core::JudgeError;
use crate::monitor::MonitorArgs;

/// Host device nodes exposed inside the sandbox
const DEVICE_NODES: &[&str] = &["null", "zero", "random", "urandom"];

/// Root-owned directory (inside the sandbox) holding entrypoint scripts
const ENTRY_DIR: &str = ".judgehost";

/// Command search path inside the sandbox
const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How the home directory is presented inside the sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HomeMode {
    /// Writes go straight to the home layer
    Bind,
    /// Writes land in a scratch layer; the home layer stays pristine
    CopyOnWrite,
}

/// One sandboxed command execution
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub command: String,
    /// Home-relative file names; stdout/stderr are discarded when unset
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub time_limit: Option<Duration>,
    /// Overrides the sandbox memory size for this run
    pub memory_limit_kb: Option<u64>,
    /// Also cap the address space (breaks runtimes that reserve large heaps)
    pub limit_address_space: bool,
    /// Overrides the configured process-count limit
    pub max_processes: Option<u64>,
}

impl RunSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            stdin: None,
            stdout: None,
            stderr: None,
            time_limit: None,
            memory_limit_kb: None,
            limit_address_space: false,
            max_processes: None,
        }
    }

    pub fn with_stdin(mut self, name: impl Into<String>) -> Self {
        self.stdin = Some(name.into());
        self
    }

    pub fn with_stdout(mut self, name: impl Into<String>) -> Self {
        self.stdout = Some(name.into());
        self
    }

    pub fn with_stderr(mut self, name: impl Into<String>) -> Self {
        self.stderr = Some(name.into());
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn with_memory_limit(mut self, memory_kb: u64) -> Self {
        self.memory_limit_kb = Some(memory_kb);
        self
    }

    pub fn with_address_space_limit(mut self, value: bool) -> Self {
        self.limit_address_space = value;
        self
    }

    pub fn with_max_processes(mut self, max: Option<u64>) -> Self {
        self.max_processes = max;
        self
    }
}

pub struct Sandbox {
    config: SandboxConfig,
    backend: Arc<dyn IsolationBackend>,
    dir: Option<TempDir>,
    root: PathBuf,
    merged: PathBuf,
    home: PathBuf,
    home_upper: PathBuf,
    home_work: PathBuf,
    /// Host path of the home directory as the sandbox user sees it
    home_view: PathBuf,
    /// Mount targets in the order they were made
    mounts: Vec<PathBuf>,
    group: Option<PathBuf>,
    memory_kb: u64,
    frozen: bool,
    torn_down: bool,
    runs: u32,
}

impl Sandbox {
    /// Build a sandbox whose processes may use `memory_kb` of memory
    ///
    /// On failure everything built so far is torn down before returning.
    pub fn new(
        config: &SandboxConfig,
        backend: Arc<dyn IsolationBackend>,
        memory_kb: u64,
    ) -> Result<Self> {
        fs::create_dir_all(&config.work_root).with_context(|| {
            format!("Failed to create work root {}", config.work_root.display())
        })?;
        let dir = tempfile::Builder::new()
            .prefix("sandbox-")
            .tempdir_in(&config.work_root)
            .context("Failed to create sandbox directory")?;

        let root = dir.path().to_path_buf();
        let merged = root.join("merged");
        let home_rel = config
            .home_path
            .strip_prefix("/")
            .unwrap_or(&config.home_path)
            .to_path_buf();

        let mut sandbox = Self {
            config: config.clone(),
            backend,
            home: root.join("home"),
            home_upper: root.join("home-upper"),
            home_work: root.join("home-work"),
            home_view: merged.join(home_rel),
            merged,
            root,
            dir: Some(dir),
            mounts: Vec::new(),
            group: None,
            memory_kb,
            frozen: false,
            torn_down: false,
            runs: 0,
        };

        if let Err(e) = sandbox.construct() {
            if let Err(cleanup) = sandbox.teardown() {
                warn!("Cleanup after failed sandbox construction failed: {:#}", cleanup);
            }
            return Err(e);
        }

        info!(
            "Created sandbox at {} (backend: {}, memory: {} KB)",
            sandbox.root.display(),
            sandbox.backend.name(),
            memory_kb
        );
        Ok(sandbox)
    }

    fn construct(&mut self) -> Result<()> {
        self.mount(MountSpec::Tmpfs {
            target: self.root.clone(),
            size_mb: self.config.fs_size_mb,
        })?;

        let name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sandbox".to_string());
        self.group = self
            .backend
            .create_group(&name, self.memory_kb + self.config.memory_headroom_kb)?;

        let base_upper = self.root.join("base-upper");
        let base_work = self.root.join("base-work");
        for dir in [
            &base_upper,
            &base_work,
            &self.merged,
            &self.home,
            &self.home_upper,
            &self.home_work,
        ] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        self.mount(MountSpec::Overlay {
            lower: self.config.base_root.clone(),
            upper: base_upper,
            work: base_work,
            target: self.merged.clone(),
        })?;

        let proc_dir = self.merged.join("proc");
        fs::create_dir_all(&proc_dir)?;
        self.mount(MountSpec::Bind {
            source: PathBuf::from("/proc"),
            target: proc_dir,
        })?;

        let dev_dir = self.merged.join("dev");
        fs::create_dir_all(&dev_dir)?;
        for node in DEVICE_NODES {
            let target = dev_dir.join(node);
            if !target.exists() {
                fs::File::create(&target)
                    .with_context(|| format!("Failed to create {}", target.display()))?;
            }
            self.mount(MountSpec::Bind {
                source: Path::new("/dev").join(node),
                target,
            })?;
        }

        let entry_dir = self.merged.join(ENTRY_DIR);
        fs::create_dir_all(&entry_dir)?;
        fs::set_permissions(&entry_dir, Permissions::from_mode(0o755))?;

        self.prepare_user_dir(&self.home)?;
        fs::create_dir_all(&self.home_view)
            .with_context(|| format!("Failed to create {}", self.home_view.display()))?;
        self.mount_home(HomeMode::Bind)
    }

    fn prepare_user_dir(&self, dir: &Path) -> Result<()> {
        chown(dir, Some(self.config.uid), Some(self.config.gid))
            .with_context(|| format!("Failed to chown {}", dir.display()))?;
        fs::set_permissions(dir, Permissions::from_mode(0o700))?;
        Ok(())
    }

    fn mount(&mut self, spec: MountSpec) -> Result<()> {
        self.backend.mount(&spec)?;
        self.mounts.push(spec.target().to_path_buf());
        Ok(())
    }

    fn mount_home(&mut self, mode: HomeMode) -> Result<()> {
        let spec = match mode {
            HomeMode::Bind => MountSpec::Bind {
                source: self.home.clone(),
                target: self.home_view.clone(),
            },
            HomeMode::CopyOnWrite => {
                self.prepare_user_dir(&self.home_upper)?;
                MountSpec::Overlay {
                    lower: self.home.clone(),
                    upper: self.home_upper.clone(),
                    work: self.home_work.clone(),
                    target: self.home_view.clone(),
                }
            }
        };
        self.mount(spec)
    }

    /// Memory size the sandbox was created with
    pub fn memory_kb(&self) -> u64 {
        self.memory_kb
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn ensure_live(&self) -> Result<()> {
        if self.torn_down {
            return Err(JudgeError::TornDown.into());
        }
        Ok(())
    }

    /// Resolve a home-relative name to a host path
    ///
    /// Rejects absolute paths and `..`, and refuses to traverse symlinks
    /// the sandboxed program may have planted in place of directories.
    fn host_path(&self, name: &str) -> Result<PathBuf> {
        let rel = Path::new(name);
        if name.is_empty() || !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(JudgeError::InvalidPath(name.to_string()).into());
        }

        let mut path = self.home_view.clone();
        let mut components = rel.components().peekable();
        while let Some(component) = components.next() {
            path.push(component);
            if components.peek().is_none() {
                break;
            }
            match fs::symlink_metadata(&path) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => return Err(JudgeError::InvalidPath(name.to_string()).into()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    fs::create_dir(&path)
                        .with_context(|| format!("Failed to create {}", path.display()))?;
                    chown(&path, Some(self.config.uid), Some(self.config.gid))?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(path)
    }

    /// Write a file into the sandbox user's home directory
    pub fn write_file(&self, content: &[u8], name: &str, mode: Option<u32>) -> Result<()> {
        self.ensure_live()?;
        let path = self.host_path(name)?;

        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => {
                return Err(JudgeError::InvalidPath(name.to_string()).into())
            }
            Ok(_) => fs::remove_file(&path)
                .with_context(|| format!("Failed to replace {}", path.display()))?,
            Err(_) => {}
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode.unwrap_or(0o644))
            .custom_flags(nix::libc::O_NOFOLLOW)
            .open(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        file.write_all(content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        chown(&path, Some(self.config.uid), Some(self.config.gid))
            .with_context(|| format!("Failed to chown {}", path.display()))?;
        if let Some(mode) = mode {
            fs::set_permissions(&path, Permissions::from_mode(mode))?;
        }
        debug!("Wrote {} ({} bytes)", path.display(), content.len());
        Ok(())
    }

    /// Copy a host file into the sandbox user's home directory
    pub fn put_file(&self, source: &Path, name: &str, mode: Option<u32>) -> Result<()> {
        let content =
            fs::read(source).with_context(|| format!("Failed to read {}", source.display()))?;
        self.write_file(&content, name, mode)
    }

    /// Read a regular file from the sandbox user's home directory
    ///
    /// Symlinks are not followed and anything but a regular file (FIFOs,
    /// sockets, devices) is rejected; at most `max_read_bytes` are returned.
    pub async fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        self.ensure_live()?;
        let path = self.host_path(name)?;
        let limit = self.config.max_read_bytes;
        let name = name.to_string();
        tokio::task::spawn_blocking(move || read_regular_file(&path, &name, limit))
            .await
            .context("File read task failed")?
    }

    /// Make the home directory copy-on-write
    ///
    /// Everything written so far stays visible; later writes no longer
    /// reach the home layer. Allowed once.
    pub fn freeze(&mut self) -> Result<()> {
        self.ensure_live()?;
        if self.frozen {
            return Err(JudgeError::AlreadyFrozen.into());
        }

        let target = self.home_view.clone();
        self.backend.unmount(&target)?;
        if let Some(pos) = self.mounts.iter().rposition(|t| *t == target) {
            self.mounts.remove(pos);
        }
        self.mount_home(HomeMode::CopyOnWrite)?;
        self.frozen = true;
        debug!("Froze sandbox {}", self.root.display());
        Ok(())
    }

    /// Run a command inside the sandbox under the monitor
    ///
    /// Failures of the judged program are part of the returned `Outcome`;
    /// `Err` means the command could not be launched at all.
    pub async fn run(&mut self, spec: &RunSpec) -> Result<Outcome> {
        self.ensure_live()?;
        self.runs += 1;

        let memory_kb = spec.memory_limit_kb.unwrap_or(self.memory_kb);
        let limit_kb = memory_kb + self.config.memory_headroom_kb;
        if let Some(group) = &self.group {
            self.backend.set_group_memory(group, limit_kb)?;
        }

        let cpu_secs = spec
            .time_limit
            .map(|limit| limit.as_secs_f64().ceil().max(1.0) as u64);
        let monitor_args = MonitorArgs {
            stdin: spec.stdin.as_ref().map(PathBuf::from),
            stdout: spec.stdout.as_ref().map(PathBuf::from),
            stderr: spec.stderr.as_ref().map(PathBuf::from),
            cpu_time: cpu_secs,
            memory: spec.limit_address_space.then_some(limit_kb * 1024),
            nproc: spec.max_processes.or(self.config.max_processes),
            command: spec.command.clone(),
        };

        let (script_host, script_guest, workdir) = self.entry_paths();
        let script = format!(
            "#!/bin/sh\nexec {} {}\n",
            shell_quote(&self.config.monitor_path.to_string_lossy()),
            monitor_args
                .to_args()
                .iter()
                .map(|arg| shell_quote(arg))
                .collect::<Vec<_>>()
                .join(" ")
        );
        fs::write(&script_host, script)
            .with_context(|| format!("Failed to write {}", script_host.display()))?;

        let home = workdir.to_string_lossy().into_owned();
        let launch = LaunchSpec {
            root: self.merged.clone(),
            workdir,
            script: script_guest,
            uid: self.config.uid,
            gid: self.config.gid,
            group: self.group.clone(),
            env: vec![
                ("PATH".to_string(), SANDBOX_PATH.to_string()),
                ("HOME".to_string(), home),
                ("LANG".to_string(), "C.UTF-8".to_string()),
            ],
        };

        let mut cmd = self.backend.command(&launch);
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        debug!("Sandbox run #{}: {}", self.runs, spec.command);
        let child = cmd
            .spawn()
            .map_err(|e| JudgeError::Launch(e.to_string()))?;
        let pid = child.id();

        let budget = cpu_secs.unwrap_or(self.config.compile_time_limit_secs);
        let watchdog = Duration::from_secs(budget + self.config.watchdog_grace_secs);

        let result = tokio::time::timeout(watchdog, child.wait_with_output()).await;
        // nothing started by this run may outlive it
        self.kill_processes(pid);

        let output = match result {
            Ok(output) => output.context("Failed to wait for sandboxed process")?,
            Err(_) => {
                warn!(
                    "Watchdog fired after {:?} for: {}",
                    watchdog, spec.command
                );
                return Ok(Outcome::TimeLimitExceeded);
            }
        };

        let outcome = outcome::from_monitor_output(&output, spec.time_limit, memory_kb);
        debug!("Sandbox run #{} finished: {:?}", self.runs, outcome);
        Ok(outcome)
    }

    /// Host path, in-sandbox path and working directory for the next run
    fn entry_paths(&self) -> (PathBuf, PathBuf, PathBuf) {
        let file = format!("entry-{}.sh", self.runs);
        let host = self.merged.join(ENTRY_DIR).join(&file);
        if self.backend.chroots() {
            (
                host,
                Path::new("/").join(ENTRY_DIR).join(&file),
                self.config.home_path.clone(),
            )
        } else {
            (host.clone(), host, self.home_view.clone())
        }
    }

    fn kill_processes(&self, pid: Option<u32>) {
        if let Some(pid) = pid {
            // the entrypoint leads its own process group
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
        if let Some(group) = &self.group {
            if let Err(e) = self.backend.kill_group(group) {
                warn!("Failed to kill sandbox group: {:#}", e);
            }
        }
    }

    /// Release every mount, the resource group and the directory
    ///
    /// Idempotent. Unmounting continues past failures; the first error is
    /// returned after everything else was attempted.
    pub fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;

        let mut first_error: Option<anyhow::Error> = None;

        if let Some(group) = self.group.take() {
            if let Err(e) = self
                .backend
                .kill_group(&group)
                .and_then(|_| self.backend.remove_group(&group))
            {
                warn!("Failed to release sandbox group: {:#}", e);
                first_error.get_or_insert(e);
            }
        }

        let mut unmount_failed = false;
        while let Some(target) = self.mounts.pop() {
            if let Err(e) = self.backend.unmount(&target) {
                warn!("Failed to unmount {}: {:#}", target.display(), e);
                unmount_failed = true;
                first_error.get_or_insert(e);
            }
        }

        if let Some(dir) = self.dir.take() {
            if unmount_failed {
                // never recurse into something that may still be mounted
                let path = dir.keep();
                warn!("Leaving sandbox directory {} behind", path.display());
            } else if let Err(e) = dir.close() {
                warn!("Failed to remove sandbox directory: {}", e);
                first_error.get_or_insert(e.into());
            }
        }

        info!("Tore down sandbox {}", self.root.display());
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if !self.torn_down {
            warn!("Sandbox {} dropped without teardown", self.root.display());
            if let Err(e) = self.teardown() {
                warn!("Teardown on drop failed: {:#}", e);
            }
        }
    }
}

fn read_regular_file(path: &Path, name: &str, limit: u64) -> Result<Vec<u8>> {
    // a FIFO planted by the program must not block the open
    let file = match OpenOptions::new()
        .read(true)
        .custom_flags(nix::libc::O_NOFOLLOW | nix::libc::O_NONBLOCK)
        .open(path)
    {
        Ok(file) => file,
        Err(e) if e.raw_os_error() == Some(nix::libc::ELOOP) => {
            return Err(JudgeError::InvalidPath(name.to_string()).into())
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to open {}", path.display()))
        }
    };
    let meta = file
        .metadata()
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    if !meta.file_type().is_file() {
        return Err(JudgeError::InvalidPath(name.to_string()).into());
    }
    let mut content = Vec::new();
    file.take(limit)
        .read_to_end(&mut content)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(content)
}

/// Quote a word for `/bin/sh`
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}
