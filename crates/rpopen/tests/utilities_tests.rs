#![cfg(unix)]

use rpopen::SpawnOptions;
use rpopen::utilities::{run, run_collecting_output, run_input};

#[test]
fn test_run_returns_output() {
    let (stdout, stderr) = run("echo out; echo err >&2").unwrap();
    assert_eq!(stdout, "out\n");
    assert_eq!(stderr, "err\n");
}

#[test]
fn test_run_reports_failure_with_output() {
    let err = run("echo partial; exit 3").unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("echo partial; exit 3"));
    assert!(message.contains("exit status 3"));
    assert!(message.contains("partial"));
}

#[test]
fn test_run_collecting_output_keeps_status() {
    let (status, stdout, _) = run_collecting_output(&SpawnOptions::new("echo x; exit 5")).unwrap();
    assert_eq!(status.exit_status(), Some(5));
    assert_eq!(stdout, "x\n");
}

#[test]
fn test_run_input_feeds_stdin() {
    let (status, stdout, _) = run_input(&SpawnOptions::new("tr a-z A-Z"), "shout").unwrap();
    assert_eq!(status.success(), Some(true));
    assert_eq!(stdout, "SHOUT");
}
