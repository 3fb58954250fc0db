#![cfg(unix)]

use rpopen::{Command, OutputCollector, PopenError, ProcessId, SpawnOptions, Target, popen3_async};
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_line_number(true)
        .with_test_writer()
        .try_init();
}

async fn collect(options: &SpawnOptions) -> OutputCollector {
    popen3_async(options, OutputCollector::new())
        .unwrap()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_async_thousand_lines_then_exit_status() {
    init_tracing();
    let options = SpawnOptions::new(
        "i=0; while [ $i -lt 1000 ]; do echo \"stdout $i\"; i=$((i+1)); done; exit 99",
    );
    let collector = collect(&options).await;

    let expected: String = (0..1000).map(|i| format!("stdout {i}\n")).collect();
    assert_eq!(collector.stdout_lossy(), expected);
    assert_eq!(collector.exit_status(), Some(99));
    assert_eq!(collector.exit_calls, 1);
    assert!(collector.errors.is_empty());
}

#[tokio::test]
async fn test_async_input_round_trip() {
    init_tracing();
    let options = SpawnOptions::builder()
        .command("read n; expr $n + 1")
        .input(b"42\n".to_vec())
        .build()
        .unwrap();
    let collector = collect(&options).await;
    assert_eq!(collector.stdout_lossy(), "43\n");
    assert_eq!(collector.exit_status(), Some(0));
}

#[tokio::test]
async fn test_async_exec_failure_reaches_target() {
    init_tracing();
    let options = SpawnOptions::new(Command::argv(["rpopen-no-such-binary"]));
    let collector = collect(&options).await;

    assert_eq!(collector.exit_calls, 1);
    assert_eq!(collector.exit_status(), Some(127));
    assert!(
        collector
            .errors
            .iter()
            .any(|e| e.contains("rpopen-no-such-binary"))
    );
}

#[tokio::test]
async fn test_async_synchronous_spawn_failure_is_returned() {
    let options = SpawnOptions::new("");
    let err = popen3_async(&options, ()).unwrap_err();
    assert!(matches!(err, PopenError::Configuration(_)));
}

#[tokio::test]
async fn test_async_timeout() {
    init_tracing();
    let options = SpawnOptions::builder()
        .command("sleep 30")
        .timeout_seconds(0.3)
        .build()
        .unwrap();
    let started = Instant::now();
    let collector = collect(&options).await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(collector.timed_out);
    assert!(collector.status.unwrap().term_signal().is_some());
}

#[tokio::test]
async fn test_async_size_limit() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let options = SpawnOptions::builder()
        .command("head -c 20000 /dev/zero > big.bin; exec sleep 10")
        .directory(dir.path())
        .size_limit_bytes(1000u64)
        .build()
        .unwrap();
    let collector = collect(&options).await;

    assert!(collector.size_limit_exceeded);
    assert!(!collector.timed_out);
}

#[derive(Default)]
struct Panicky {
    pid: Option<ProcessId>,
    errors: Vec<String>,
    exited: bool,
}

impl Target for Panicky {
    fn on_pid(&mut self, pid: ProcessId) {
        self.pid = Some(pid);
    }

    fn on_stdout(&mut self, _data: &[u8]) {
        panic!("stdout handler failed");
    }

    fn on_exit(&mut self, _status: &rpopen::ProcessStatus) {
        self.exited = true;
    }

    fn on_async_exception(&mut self, error: &PopenError) {
        self.errors.push(error.to_string());
    }
}

#[tokio::test]
async fn test_async_callback_panic_is_reported() {
    init_tracing();
    let target = popen3_async(&SpawnOptions::new("echo hi"), Panicky::default())
        .unwrap()
        .await
        .unwrap();

    assert!(target.pid.is_some());
    assert!(target.exited);
    assert!(
        target
            .errors
            .iter()
            .any(|e| e.contains("stdout handler failed"))
    );
}
