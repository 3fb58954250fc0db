use crate::config::SpawnOptions;
use crate::error::PopenError;
use crate::status::{ProcessId, ProcessStatus};
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, warn};
use walkdir::WalkDir;

/// Readable channels of a child process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Stdout,
    Stderr,
    /// Exec-failure channel, only open until the child execs
    Status,
}

/// Signal strength used when forcibly terminating a child
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KillTier {
    Soft,
    Hard,
    Final,
}

impl KillTier {
    fn after(last: Option<KillTier>) -> Option<KillTier> {
        match last {
            None => Some(KillTier::Soft),
            Some(KillTier::Soft) => Some(KillTier::Hard),
            Some(KillTier::Hard) => Some(KillTier::Final),
            Some(KillTier::Final) => None,
        }
    }
}

impl fmt::Display for KillTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KillTier::Soft => "soft",
            KillTier::Hard => "hard",
            KillTier::Final => "final",
        };
        f.write_str(name)
    }
}

/// Where the kill escalation currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationState {
    Idle,
    Sent(KillTier),
    Abandoned,
}

/// What a single `interrupt` call should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationStep {
    Send(KillTier),
    Wait,
    Exhausted,
}

/// Escalating kill state machine: idle → soft → hard → final → abandoned.
///
/// Each `advance` moves at most one step and never blocks. A tier is only
/// followed by the next one after the grace period has elapsed.
#[derive(Debug, Clone)]
pub struct Escalation {
    grace: Duration,
    state: EscalationState,
    next_eligible: Option<Instant>,
    interrupted: bool,
}

impl Escalation {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            state: EscalationState::Idle,
            next_eligible: None,
            interrupted: false,
        }
    }

    pub fn advance(&mut self, now: Instant) -> EscalationStep {
        if self.state == EscalationState::Abandoned {
            return EscalationStep::Exhausted;
        }
        if self.next_eligible.is_some_and(|at| now < at) {
            return EscalationStep::Wait;
        }

        let last = match self.state {
            EscalationState::Sent(tier) => Some(tier),
            _ => None,
        };
        match KillTier::after(last) {
            Some(tier) => {
                self.state = EscalationState::Sent(tier);
                self.next_eligible = Some(now + self.grace);
                self.interrupted = true;
                EscalationStep::Send(tier)
            }
            None => {
                self.state = EscalationState::Abandoned;
                EscalationStep::Exhausted
            }
        }
    }

    pub fn state(&self) -> EscalationState {
        self.state
    }

    /// Sticky: true from the first signal sent
    pub fn interrupted(&self) -> bool {
        self.interrupted
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }
}

/// State shared by every platform's child process
#[derive(Debug)]
pub struct ProcessBase {
    pid: ProcessId,
    command: String,
    start_time: Instant,
    deadline: Option<Instant>,
    size_limit: Option<u64>,
    watch_directory: Option<PathBuf>,
    input: Option<Vec<u8>>,
    keep_stdin_open: bool,
    escalation: Escalation,
    status: Option<ProcessStatus>,
    timed_out: bool,
    size_limit_hit: bool,
}

impl ProcessBase {
    pub fn new(pid: ProcessId, options: &SpawnOptions) -> Self {
        let start_time = Instant::now();
        Self {
            pid,
            command: options.command.to_string(),
            start_time,
            deadline: options.timeout().map(|timeout| start_time + timeout),
            size_limit: options.size_limit_bytes,
            watch_directory: options.effective_watch_directory(),
            input: options.input.clone(),
            keep_stdin_open: options.keep_stdin_open,
            escalation: Escalation::new(options.interrupt_grace()),
            status: None,
            timed_out: false,
            size_limit_hit: false,
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn timer_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Sums file sizes under the watched directory, stopping as soon as the
    /// running total passes the limit. Entries that vanish or cannot be
    /// stat'ed while the child writes are skipped.
    pub fn size_limit_exceeded(&self) -> bool {
        match (self.size_limit, &self.watch_directory) {
            (Some(limit), Some(directory)) => directory_exceeds(directory, limit),
            _ => false,
        }
    }

    pub fn note_timeout(&mut self) {
        if !self.timed_out {
            warn!(pid = %self.pid, command = %self.command, "child process timed out");
        }
        self.timed_out = true;
    }

    pub fn note_size_limit(&mut self) {
        if !self.size_limit_hit {
            warn!(pid = %self.pid, command = %self.command, "child process exceeded size limit");
        }
        self.size_limit_hit = true;
    }

    pub fn did_timeout(&self) -> bool {
        self.timed_out
    }

    pub fn did_exceed_size_limit(&self) -> bool {
        self.size_limit_hit
    }

    /// Input bytes still to be written to stdin
    pub fn take_input(&mut self) -> Option<Vec<u8>> {
        self.input.take()
    }

    pub fn keep_stdin_open(&self) -> bool {
        self.keep_stdin_open
    }

    pub fn escalation(&self) -> &Escalation {
        &self.escalation
    }

    pub fn escalation_mut(&mut self) -> &mut Escalation {
        &mut self.escalation
    }

    pub fn status(&self) -> Option<&ProcessStatus> {
        self.status.as_ref()
    }

    /// Records the terminal status once; later calls keep the first value.
    pub fn set_status(&mut self, status: ProcessStatus) -> ProcessStatus {
        self.status.get_or_insert(status).clone()
    }
}

fn directory_exceeds(directory: &Path, limit: u64) -> bool {
    let mut total: u64 = 0;
    for entry in WalkDir::new(directory).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            total = total.saturating_add(metadata.len());
            if total > limit {
                return true;
            }
        }
    }
    false
}

/// Async handles of a child, taken once by the async pump
pub struct AsyncIo {
    pub stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub status: Option<Box<dyn AsyncRead + Send + Unpin>>,
}

/// One spawned OS process and its channels.
///
/// Implemented once per platform. Shared bookkeeping lives in
/// [`ProcessBase`]; implementations provide liveness, signalling and raw
/// channel access.
pub trait ChildProcess: Send {
    fn base(&self) -> &ProcessBase;

    fn base_mut(&mut self) -> &mut ProcessBase;

    fn pid(&self) -> ProcessId {
        self.base().pid()
    }

    /// Non-blocking liveness check. Caches the terminal status once the
    /// child is observed dead, including when it was reaped elsewhere.
    fn is_alive(&mut self) -> Result<bool, PopenError>;

    /// Blocks until the child exits and always yields a status.
    fn wait_for_exit_status(&mut self) -> Result<ProcessStatus, PopenError>;

    /// Delivers one tier's signal. Returns `false` if the child was already gone.
    fn send_signal(&mut self, tier: KillTier) -> Result<bool, PopenError>;

    /// Channels the pump should watch, in the order they were opened
    fn open_channels(&self) -> Vec<Channel>;

    /// Whether every channel should be read once the child has died, rather
    /// than only those reported ready
    fn drain_all_upon_death(&self) -> bool;

    /// Waits up to `timeout` for any of `channels` to become readable
    fn poll_channels(&mut self, channels: &[Channel], timeout: Duration)
    -> io::Result<Vec<Channel>>;

    /// Reads available bytes; `Ok(0)` is end of stream.
    fn read_channel(&mut self, channel: Channel, buf: &mut [u8]) -> io::Result<usize>;

    fn close_channel(&mut self, channel: Channel);

    /// Hands the stdin writer to the caller; the pipe closes when it drops.
    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>>;

    /// Second writer on the same stdin pipe; dropping it leaves stdin open.
    /// `Ok(None)` once stdin is closed.
    fn clone_stdin(&self) -> io::Result<Option<Box<dyn Write + Send>>>;

    fn close_stdin(&mut self) {
        drop(self.take_stdin());
    }

    /// Closes every channel still open. Idempotent.
    fn safe_close_io(&mut self);

    /// Moves the channels into async handles for the async pump
    fn take_async_io(&mut self) -> Result<AsyncIo, PopenError>;

    /// Advances the kill escalation by at most one tier.
    ///
    /// Returns `Ok(false)` when the child is already dead. Fails with
    /// [`PopenError::KillEscalationExhausted`] once the final tier's grace
    /// period passed with the child still alive.
    fn interrupt(&mut self) -> Result<bool, PopenError> {
        if !self.is_alive()? {
            return Ok(false);
        }

        let pid = self.pid();
        match self.base_mut().escalation_mut().advance(Instant::now()) {
            EscalationStep::Send(tier) => {
                warn!(pid = %pid, tier = %tier, "interrupting child process");
                if !self.send_signal(tier)? {
                    debug!(pid = %pid, "child exited before the signal was delivered");
                }
            }
            EscalationStep::Wait => {}
            EscalationStep::Exhausted => {
                error!(pid = %pid, "kill escalation exhausted");
                return Err(PopenError::KillEscalationExhausted { pid });
            }
        }
        Ok(true)
    }

    /// True once any kill signal has been sent
    fn interrupted(&self) -> bool {
        self.base().escalation().interrupted()
    }

    fn did_timeout(&self) -> bool {
        self.base().did_timeout()
    }

    fn did_exceed_size_limit(&self) -> bool {
        self.base().did_exceed_size_limit()
    }
}

impl fmt::Debug for dyn ChildProcess + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildProcess")
            .field("pid", &self.pid())
            .field("command", &self.base().command())
            .finish()
    }
}
