use crate::error::PopenError;
use crate::process::ChildProcess;
use crate::target::Target;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    Continue,
    /// The target asked to stop automatic draining
    Abandon,
}

/// One watchdog tick.
///
/// The timeout is checked before the size limit. Once either fired, every
/// later tick keeps escalating the interrupt instead of calling `on_watch`.
pub fn watch_tick<T: Target + ?Sized>(
    process: &mut dyn ChildProcess,
    target: &mut T,
) -> Result<WatchOutcome, PopenError> {
    let base = process.base_mut();
    if base.did_timeout() || base.timer_expired() {
        base.note_timeout();
        process.interrupt()?;
        return Ok(WatchOutcome::Continue);
    }
    if base.did_exceed_size_limit() || base.size_limit_exceeded() {
        base.note_size_limit();
        process.interrupt()?;
        return Ok(WatchOutcome::Continue);
    }

    if target.on_watch(process) {
        Ok(WatchOutcome::Continue)
    } else {
        Ok(WatchOutcome::Abandon)
    }
}

/// Interval between async watchdog ticks: doubles per tick up to a ceiling
#[derive(Debug, Clone)]
pub struct WatchInterval {
    current: Duration,
}

impl WatchInterval {
    pub const INITIAL: Duration = Duration::from_millis(100);
    pub const CEILING: Duration = Duration::from_secs(1);

    pub fn new() -> Self {
        Self {
            current: Self::INITIAL,
        }
    }

    /// Returns the next delay and backs off
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(Self::CEILING);
        delay
    }

    pub fn reset(&mut self) {
        self.current = Self::INITIAL;
    }
}

impl Default for WatchInterval {
    fn default() -> Self {
        Self::new()
    }
}
