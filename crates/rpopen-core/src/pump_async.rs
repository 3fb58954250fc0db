//! Event-driven stream pump on tokio.
//!
//! The process and its target move into one task; channel reads and
//! watchdog ticks are multiplexed with `select!` so no state is shared
//! across threads. Panics raised by target callbacks are caught at this
//! boundary and reported through `on_async_exception`.

use crate::error::PopenError;
use crate::process::ChildProcess;
use crate::pump::exec_failure;
use crate::target::Target;
use crate::watch::{WatchInterval, WatchOutcome, watch_tick};
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_stream::StreamExt;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{BytesCodec, FramedRead};
use tracing::{debug, info};

type Frames = FramedRead<Box<dyn AsyncRead + Send + Unpin>, BytesCodec>;

enum Event {
    Stdout(Option<io::Result<BytesMut>>),
    Stderr(Option<io::Result<BytesMut>>),
    Status(Option<io::Result<BytesMut>>),
    Tick,
}

/// Spawns the pump on the current runtime. The handle resolves to the
/// target once `on_exit` has fired.
pub fn spawn_pump<P, T>(process: P, target: T) -> JoinHandle<T>
where
    P: ChildProcess + 'static,
    T: Target + Send + 'static,
{
    tokio::spawn(run_to_exit_async(process, target))
}

/// Drives the child to exit. Errors never escape: they go to
/// `on_async_exception` and `on_exit` is still attempted once a status is
/// known.
pub async fn run_to_exit_async<P, T>(mut process: P, mut target: T) -> T
where
    P: ChildProcess,
    T: Target,
{
    let pid = process.pid();
    guarded(&mut target, |t| t.on_pid(pid));

    let io = match process.take_async_io() {
        Ok(io) => io,
        Err(err) => {
            report(&mut target, &err);
            finish(&mut process, &mut target, &[]);
            return target;
        }
    };

    let keep_stdin_open = process.base().keep_stdin_open();
    let writer = io
        .stdin
        .map(|stdin| write_input(pid, stdin, process.base_mut().take_input(), keep_stdin_open));

    let mut stdout = io.stdout.map(|r| FramedRead::new(r, BytesCodec::new()));
    let mut stderr = io.stderr.map(|r| FramedRead::new(r, BytesCodec::new()));
    let mut status = io.status.map(|r| FramedRead::new(r, BytesCodec::new()));
    let mut status_bytes = Vec::new();

    let mut watching = guarded(&mut target, |t| t.on_watch(&mut process)).unwrap_or(true);
    if !watching {
        info!(pid = %pid, "watchdog stopped by target");
    }

    let mut interval = WatchInterval::new();
    let sleep = time::sleep(interval.next_delay());
    tokio::pin!(sleep);

    loop {
        let event = tokio::select! {
            chunk = next_chunk(&mut stdout) => Event::Stdout(chunk),
            chunk = next_chunk(&mut stderr) => Event::Stderr(chunk),
            chunk = next_chunk(&mut status) => Event::Status(chunk),
            _ = &mut sleep => Event::Tick,
        };

        match event {
            Event::Stdout(Some(Ok(data))) => {
                guarded(&mut target, |t| t.on_stdout(&data));
            }
            Event::Stderr(Some(Ok(data))) => {
                guarded(&mut target, |t| t.on_stderr(&data));
            }
            Event::Status(Some(Ok(data))) => status_bytes.extend_from_slice(&data),
            Event::Stdout(end) => {
                close_stream(pid, "stdout", end, &mut stdout);
                sleep.as_mut().reset(Instant::now());
            }
            Event::Stderr(end) => {
                close_stream(pid, "stderr", end, &mut stderr);
                sleep.as_mut().reset(Instant::now());
            }
            Event::Status(end) => close_stream(pid, "status", end, &mut status),
            Event::Tick => {
                let drained = stdout.is_none() && stderr.is_none() && status.is_none();
                match process.is_alive() {
                    Ok(false) if drained => break,
                    Ok(_) => {}
                    Err(err) => {
                        report(&mut target, &err);
                        break;
                    }
                }

                if watching {
                    match guarded(&mut target, |t| watch_tick(&mut process, t)) {
                        Some(Ok(WatchOutcome::Continue)) => {}
                        Some(Ok(WatchOutcome::Abandon)) => {
                            info!(pid = %pid, "watchdog stopped by target");
                            watching = false;
                        }
                        Some(Err(err)) => {
                            report(&mut target, &err);
                            if err.is_fatal() {
                                watching = false;
                            }
                        }
                        None => {}
                    }
                }

                let delay = if drained {
                    WatchInterval::INITIAL
                } else {
                    interval.next_delay()
                };
                sleep.as_mut().reset(Instant::now() + delay);
            }
        }
    }

    if let Some(writer) = writer {
        if writer.is_finished() {
            let _ = writer.await;
        } else {
            writer.abort();
        }
    }
    finish(&mut process, &mut target, &status_bytes);
    target
}

async fn next_chunk(frames: &mut Option<Frames>) -> Option<io::Result<BytesMut>> {
    match frames {
        Some(frames) => frames.next().await,
        None => std::future::pending().await,
    }
}

fn close_stream(
    pid: u32,
    name: &str,
    end: Option<io::Result<BytesMut>>,
    frames: &mut Option<Frames>,
) {
    match end {
        Some(Err(err)) => {
            debug!(pid = %pid, channel = name, error = %err, "read failed, treating as end of stream")
        }
        _ => debug!(pid = %pid, channel = name, "channel reached end of stream"),
    }
    *frames = None;
}

fn write_input(
    pid: u32,
    mut stdin: Box<dyn AsyncWrite + Send + Unpin>,
    input: Option<Vec<u8>>,
    keep_open: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Some(input) = input {
            if let Err(err) = stdin.write_all(&input).await {
                debug!(pid = %pid, error = %err, "failed to write input");
                return;
            }
            let _ = stdin.flush().await;
        }
        if keep_open {
            // held until the pump aborts this task after exit
            std::future::pending::<()>().await;
        } else {
            let _ = stdin.shutdown().await;
        }
    })
}

/// Exit hooks and cleanup, reached exactly once per run.
fn finish<P, T>(process: &mut P, target: &mut T, status_bytes: &[u8])
where
    P: ChildProcess,
    T: Target,
{
    match process.wait_for_exit_status() {
        Ok(status) => {
            if process.did_timeout() {
                guarded(target, |t| t.on_timeout());
            }
            if process.did_exceed_size_limit() {
                guarded(target, |t| t.on_size_limit());
            }
            guarded(target, |t| t.on_exit(&status));
        }
        Err(err) => report(target, &err),
    }
    process.safe_close_io();

    if let Some(err) = exec_failure(process.base().command(), status_bytes) {
        report(target, &err);
    }
}

fn report<T: Target>(target: &mut T, err: &PopenError) {
    let _ = panic::catch_unwind(AssertUnwindSafe(|| target.on_async_exception(err)));
}

/// Runs a callback, converting a panic into `on_async_exception`
fn guarded<T, R>(target: &mut T, f: impl FnOnce(&mut T) -> R) -> Option<R>
where
    T: Target,
{
    match panic::catch_unwind(AssertUnwindSafe(|| f(target))) {
        Ok(value) => Some(value),
        Err(payload) => {
            let err = PopenError::Callback(panic_message(payload.as_ref()));
            report(target, &err);
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "callback panicked".to_string()
    }
}
