//! The monitor binary, run directly

mod common;

use std::process::{Command, Output};

use judgehost::monitor::MonitorReport;

fn monitor(dir: &std::path::Path, args: &[&str]) -> Output {
    Command::new(common::monitor_path())
        .current_dir(dir)
        .args(args)
        .output()
        .unwrap()
}

fn report(output: &Output) -> MonitorReport {
    assert!(output.status.success(), "{:?}", output);
    assert!(output.stderr.is_empty(), "{:?}", output);
    String::from_utf8_lossy(&output.stdout).parse().unwrap()
}

#[test]
fn test_clean_exit_reports_usage() {
    let dir = tempfile::tempdir().unwrap();
    let output = monitor(dir.path(), &["--stdout", "out", "--", "echo hello"]);
    assert!(matches!(report(&output), MonitorReport::Ok { .. }));
    assert_eq!(std::fs::read_to_string(dir.path().join("out")).unwrap(), "hello\n");
}

#[test]
fn test_stdin_stdout_redirection() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("in"), "1 2 3\n").unwrap();
    let output = monitor(
        dir.path(),
        &["--stdin", "in", "--stdout", "out", "--cpu-time", "2", "--", "cat"],
    );
    assert!(matches!(report(&output), MonitorReport::Ok { .. }));
    assert_eq!(std::fs::read_to_string(dir.path().join("out")).unwrap(), "1 2 3\n");
}

#[test]
fn test_child_output_never_reaches_report() {
    let dir = tempfile::tempdir().unwrap();
    let output = monitor(dir.path(), &["--", "echo RTE (fake)"]);
    assert!(matches!(report(&output), MonitorReport::Ok { .. }));
}

#[test]
fn test_nonzero_exit() {
    let dir = tempfile::tempdir().unwrap();
    let output = monitor(dir.path(), &["--", "sh -c 'exit 3'"]);
    assert_eq!(
        report(&output),
        MonitorReport::RuntimeError("nonzero return code".into())
    );
}

#[test]
fn test_crash_signals() {
    let dir = tempfile::tempdir().unwrap();
    for (signal, reason) in [
        ("SEGV", "invalid memory access"),
        ("FPE", "floating point error, likely divide by zero"),
        ("ABRT", "aborted, likely an assertion failure"),
        // what the OOM killer sends
        ("KILL", "forcefully killed, likely memory limit exceeded"),
    ] {
        let command = format!("sh -c 'kill -{} $$'", signal);
        let output = monitor(dir.path(), &["--", &command]);
        assert_eq!(report(&output), MonitorReport::RuntimeError(reason.into()));
    }
}

#[test]
fn test_cpu_limit() {
    let dir = tempfile::tempdir().unwrap();
    let output = monitor(
        dir.path(),
        &["--cpu-time", "1", "--", "sh -c 'while :; do :; done'"],
    );
    assert!(matches!(
        report(&output),
        MonitorReport::TimeLimitExceeded(_)
    ));
}

#[test]
fn test_missing_stdin_is_launch_failure() {
    let dir = tempfile::tempdir().unwrap();
    let output = monitor(dir.path(), &["--stdin", "missing", "--", "cat"]);
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    assert!(!output.stderr.is_empty());
}
