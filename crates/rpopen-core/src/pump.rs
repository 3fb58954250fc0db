//! Synchronous stream pump.
//!
//! Drives one child from spawn to exit on the calling thread: announces the
//! pid, feeds stdin, multiplexes stdout, stderr and the status channel with a
//! 100 ms poll cadence, runs the watchdog, and fires the exit hooks.

use crate::error::{PopenError, SpawnFailure};
use crate::exec_failure::ExecFailure;
use crate::process::{Channel, ChildProcess};
use crate::status::ProcessStatus;
use crate::target::Target;
use crate::watch::{WatchOutcome, watch_tick};
use std::io::{self, Write};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

const READ_CHUNK: usize = 64 * 1024;

/// How a synchronous run ended
#[derive(Debug)]
pub enum Completion<P> {
    Exited(ProcessStatus),
    /// `on_watch` returned `false`. The caller owns the process and its
    /// channels and is responsible for `safe_close_io`.
    Abandoned(P),
}

impl<P> Completion<P> {
    pub fn status(&self) -> Option<&ProcessStatus> {
        match self {
            Completion::Exited(status) => Some(status),
            Completion::Abandoned(_) => None,
        }
    }

    pub fn into_status(self) -> Option<ProcessStatus> {
        match self {
            Completion::Exited(status) => Some(status),
            Completion::Abandoned(_) => None,
        }
    }

    pub fn is_abandoned(&self) -> bool {
        matches!(self, Completion::Abandoned(_))
    }
}

enum PumpEnd {
    Exited {
        status: ProcessStatus,
        status_bytes: Vec<u8>,
    },
    Abandoned,
}

/// Blocks until the child exited and every channel reached end of stream.
///
/// Channels are closed on every return path except abandonment without a
/// kill. A failure reported by the child before exec is returned as
/// [`PopenError::Spawn`] after `on_exit` fired and the channels were closed.
pub fn run_to_exit<P, T>(mut process: P, target: &mut T) -> Result<Completion<P>, PopenError>
where
    P: ChildProcess,
    T: Target + ?Sized,
{
    let pid = process.pid();
    target.on_pid(pid);

    let writer = start_input(&mut process);
    let result = pump(&mut process, target);
    if let Some(writer) = writer {
        finish_input(writer);
    }

    match result {
        Ok(PumpEnd::Abandoned) => {
            info!(pid = %pid, "caller abandoned automatic draining");
            if process.interrupted() {
                process.safe_close_io();
            }
            Ok(Completion::Abandoned(process))
        }
        Ok(PumpEnd::Exited {
            status,
            status_bytes,
        }) => {
            if process.did_timeout() {
                target.on_timeout();
            }
            if process.did_exceed_size_limit() {
                target.on_size_limit();
            }
            target.on_exit(&status);
            process.safe_close_io();

            match exec_failure(process.base().command(), &status_bytes) {
                Some(err) => Err(err),
                None => Ok(Completion::Exited(status)),
            }
        }
        Err(err) => {
            process.safe_close_io();
            Err(err)
        }
    }
}

fn pump<P, T>(process: &mut P, target: &mut T) -> Result<PumpEnd, PopenError>
where
    P: ChildProcess,
    T: Target + ?Sized,
{
    if !target.on_watch(process) {
        return Ok(PumpEnd::Abandoned);
    }

    let mut open = process.open_channels();
    let mut status_bytes = Vec::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut last_tick = Instant::now();

    loop {
        let alive = process.is_alive()?;
        if open.is_empty() && !alive {
            break;
        }

        if open.is_empty() {
            thread::sleep(POLL_INTERVAL);
        } else {
            let draining = !alive && process.drain_all_upon_death();
            let ready = if draining {
                open.clone()
            } else {
                match process.poll_channels(&open, POLL_INTERVAL) {
                    Ok(ready) => ready,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => Vec::new(),
                    Err(err) => {
                        debug!(pid = %process.pid(), error = %err, "poll failed, reading every channel");
                        open.clone()
                    }
                }
            };

            let mut idle = true;
            for channel in ready {
                match read_once(process, target, channel, &mut buf, &mut status_bytes) {
                    Some(read) => idle &= read == 0,
                    None => {
                        idle = false;
                        process.close_channel(channel);
                        open.retain(|c| *c != channel);
                    }
                }
            }
            // a dead child's descendants may still hold a pipe open
            if draining && idle {
                thread::sleep(POLL_INTERVAL);
            }
        }

        if last_tick.elapsed() >= POLL_INTERVAL {
            last_tick = Instant::now();
            if watch_tick(process, target)? == WatchOutcome::Abandon {
                return Ok(PumpEnd::Abandoned);
            }
        }
    }

    let status = process.wait_for_exit_status()?;
    Ok(PumpEnd::Exited {
        status,
        status_bytes,
    })
}

/// Reads one chunk and returns how many bytes arrived, or `None` once the
/// channel is finished. Read errors count as end of stream.
fn read_once<P, T>(
    process: &mut P,
    target: &mut T,
    channel: Channel,
    buf: &mut [u8],
    status_bytes: &mut Vec<u8>,
) -> Option<usize>
where
    P: ChildProcess,
    T: Target + ?Sized,
{
    match process.read_channel(channel, buf) {
        Ok(0) => {
            debug!(pid = %process.pid(), channel = ?channel, "channel reached end of stream");
            None
        }
        Ok(n) => {
            let data = &buf[..n];
            match channel {
                Channel::Stdout => target.on_stdout(data),
                Channel::Stderr => target.on_stderr(data),
                Channel::Status => status_bytes.extend_from_slice(data),
            }
            Some(n)
        }
        Err(err) if err.kind() == io::ErrorKind::Interrupted => Some(0),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Some(0),
        Err(err) => {
            debug!(pid = %process.pid(), channel = ?channel, error = %err, "read failed, treating as end of stream");
            None
        }
    }
}

pub(crate) fn exec_failure(command: &str, status_bytes: &[u8]) -> Option<PopenError> {
    if status_bytes.is_empty() {
        return None;
    }
    let failure = match ExecFailure::decode(status_bytes) {
        Ok(failure) => SpawnFailure::Exec(failure),
        Err(malformed) => SpawnFailure::Garbled(malformed.len),
    };
    error!(command = %command, error = %failure, "child failed before exec");
    Some(PopenError::spawn(command, failure))
}

/// Writes queued input on a helper thread so the pump can drain output
/// meanwhile. Without input, stdin is closed unless it should stay open.
fn start_input<P: ChildProcess>(process: &mut P) -> Option<JoinHandle<()>> {
    let pid = process.pid();
    let input = process.base_mut().take_input();
    let keep_open = process.base().keep_stdin_open();

    let Some(input) = input else {
        if !keep_open {
            process.close_stdin();
        }
        return None;
    };
    let stdin = if keep_open {
        process.clone_stdin().unwrap_or_else(|err| {
            debug!(pid = %pid, error = %err, "failed to duplicate stdin");
            None
        })
    } else {
        process.take_stdin()
    };
    let mut stdin = stdin?;
    Some(thread::spawn(move || {
        if let Err(err) = stdin.write_all(&input).and_then(|()| stdin.flush()) {
            debug!(pid = %pid, error = %err, "failed to write input");
        }
    }))
}

fn finish_input(writer: JoinHandle<()>) {
    // A writer still blocked means another process holds the read end.
    if writer.is_finished() {
        let _ = writer.join();
    }
}
