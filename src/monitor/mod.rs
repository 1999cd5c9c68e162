//! Resource-limited process monitor
//!
//! Runs inside the sandbox as the direct parent of the judged program:
//! - applies CPU/address-space/process-count limits to the child before exec
//! - waits for it and classifies how it ended
//! - reports a single `MonitorReport` line on stdout
//!
//! The monitor never retries; one invocation is one run.

pub mod report;

pub use report::{parse_memory, MalformedReport, MonitorReport};

use std::fs::File;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::resource::{getrusage, setrlimit, Resource, UsageWho};
use nix::sys::signal::Signal;
use nix::sys::time::TimeVal;

/// Command line of the monitor binary
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "judgehost-monitor", about = "Run a command under resource limits")]
pub struct MonitorArgs {
    /// File to use as the command's stdin
    #[arg(long)]
    pub stdin: Option<PathBuf>,

    /// File receiving the command's stdout (discarded when absent)
    #[arg(long)]
    pub stdout: Option<PathBuf>,

    /// File receiving the command's stderr (discarded when absent)
    #[arg(long)]
    pub stderr: Option<PathBuf>,

    /// CPU time limit in seconds
    #[arg(long = "cpu-time")]
    pub cpu_time: Option<u64>,

    /// Address space limit: bytes, or a number with K/M/G suffix
    #[arg(long, value_parser = parse_memory)]
    pub memory: Option<u64>,

    /// Maximum number of processes for the sandbox user
    #[arg(long)]
    pub nproc: Option<u64>,

    /// Command line, run through `/bin/sh -c`
    ///
    /// The command replaces the shell, so it must be a single simple
    /// command (redirections are fine).
    pub command: String,
}

impl MonitorArgs {
    /// Render as arguments for the monitor binary
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ref stdin) = self.stdin {
            args.push("--stdin".to_string());
            args.push(stdin.display().to_string());
        }
        if let Some(ref stdout) = self.stdout {
            args.push("--stdout".to_string());
            args.push(stdout.display().to_string());
        }
        if let Some(ref stderr) = self.stderr {
            args.push("--stderr".to_string());
            args.push(stderr.display().to_string());
        }
        if let Some(cpu_time) = self.cpu_time {
            args.push("--cpu-time".to_string());
            args.push(cpu_time.to_string());
        }
        if let Some(memory) = self.memory {
            args.push("--memory".to_string());
            args.push(memory.to_string());
        }
        if let Some(nproc) = self.nproc {
            args.push("--nproc".to_string());
            args.push(nproc.to_string());
        }
        args.push("--".to_string());
        args.push(self.command.clone());
        args
    }
}

const OOM_SCORE_ADJ: &str = "/proc/self/oom_score_adj";

#[derive(Debug, Clone, Copy)]
struct Limits {
    cpu_time: Option<u64>,
    memory: Option<u64>,
    nproc: Option<u64>,
}

impl Limits {
    fn apply(&self) -> std::io::Result<()> {
        // the monitor itself may be exempt from the OOM killer; its command is not
        let _ = std::fs::write(OOM_SCORE_ADJ, "0");
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        if let Some(cpu) = self.cpu_time {
            setrlimit(Resource::RLIMIT_CPU, cpu, cpu)?;
        }
        if let Some(memory) = self.memory {
            setrlimit(Resource::RLIMIT_AS, memory, memory)?;
        }
        if let Some(nproc) = self.nproc {
            setrlimit(Resource::RLIMIT_NPROC, nproc, nproc)?;
        }
        Ok(())
    }
}

/// Run the command under the requested limits and classify its termination
///
/// Errors only when the command cannot be launched at all.
pub fn run(args: &MonitorArgs) -> Result<MonitorReport> {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(format!("exec {}", args.command));

    match args.stdin {
        Some(ref path) => cmd.stdin(
            File::open(path).with_context(|| format!("Failed to open stdin {:?}", path))?,
        ),
        None => cmd.stdin(Stdio::null()),
    };

    // Our own stdout carries the report; never let the child write to it.
    match args.stdout {
        Some(ref path) => cmd.stdout(
            File::create(path).with_context(|| format!("Failed to create stdout {:?}", path))?,
        ),
        None => cmd.stdout(Stdio::null()),
    };

    match args.stderr {
        Some(ref path) => cmd.stderr(
            File::create(path).with_context(|| format!("Failed to create stderr {:?}", path))?,
        ),
        None => cmd.stderr(Stdio::null()),
    };

    let limits = Limits {
        cpu_time: args.cpu_time,
        memory: args.memory,
        nproc: args.nproc,
    };
    unsafe {
        cmd.pre_exec(move || limits.apply());
    }

    let status = cmd.status().context("Failed to launch command")?;

    let usage = getrusage(UsageWho::RUSAGE_CHILDREN).context("Failed to read rusage")?;
    let cpu_time = timeval_to_duration(usage.user_time()) + timeval_to_duration(usage.system_time());
    let max_rss_kb = u64::try_from(usage.max_rss()).unwrap_or(0);

    Ok(classify(status, cpu_time, max_rss_kb, args.cpu_time))
}

/// Map an exit status to a report
///
/// A SIGKILL is ambiguous: the kernel sends it both when the CPU limit is hit
/// and when the OOM killer fires, so consumed CPU time decides.
pub fn classify(
    status: ExitStatus,
    cpu_time: Duration,
    max_rss_kb: u64,
    cpu_limit_secs: Option<u64>,
) -> MonitorReport {
    if let Some(signo) = status.signal() {
        let reason = match Signal::try_from(signo) {
            Ok(Signal::SIGABRT) => "aborted, likely an assertion failure".to_string(),
            Ok(Signal::SIGFPE) => "floating point error, likely divide by zero".to_string(),
            Ok(Signal::SIGSEGV) => "invalid memory access".to_string(),
            Ok(Signal::SIGXCPU) => {
                return MonitorReport::TimeLimitExceeded("cpu time limit exceeded".to_string());
            }
            Ok(Signal::SIGKILL) => {
                let timed_out = cpu_limit_secs
                    .map(|limit| cpu_time >= Duration::from_secs(limit))
                    .unwrap_or(false);
                if timed_out {
                    return MonitorReport::TimeLimitExceeded("cpu time limit exceeded".to_string());
                }
                "forcefully killed, likely memory limit exceeded".to_string()
            }
            Ok(other) => format!("unknown signal {}", other.as_str()),
            Err(_) => format!("unknown signal {}", signo),
        };
        return MonitorReport::RuntimeError(reason);
    }

    match status.code() {
        Some(0) => MonitorReport::Ok {
            cpu_time,
            max_rss_kb,
        },
        _ => MonitorReport::RuntimeError("nonzero return code".to_string()),
    }
}

fn timeval_to_duration(tv: TimeVal) -> Duration {
    let secs = u64::try_from(tv.tv_sec()).unwrap_or(0);
    let micros = u32::try_from(tv.tv_usec()).unwrap_or(0);
    Duration::from_secs(secs) + Duration::from_micros(micros as u64)
}
