use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a process
pub type ProcessId = u32;

/// Terminal state of a child process
///
/// At most one of `exit_status` and `term_signal` explains why the child
/// stopped. Values are immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    pid: ProcessId,
    exit_status: Option<i32>,
    term_signal: Option<String>,
}

impl ProcessStatus {
    pub fn exited(pid: ProcessId, code: i32) -> Self {
        Self {
            pid,
            exit_status: Some(code),
            term_signal: None,
        }
    }

    /// Signal names are stored without the `SIG` prefix (`"KILL"`, `"TERM"`).
    pub fn signaled(pid: ProcessId, signal: impl Into<String>) -> Self {
        let signal = signal.into();
        let signal = signal
            .strip_prefix("SIG")
            .map(str::to_string)
            .unwrap_or(signal);
        Self {
            pid,
            exit_status: None,
            term_signal: Some(signal),
        }
    }

    /// Status for a child whose exit was observed without a usable code,
    /// e.g. reaped elsewhere after a forced kill.
    pub fn synthesized(pid: ProcessId, interrupted: bool) -> Self {
        Self::exited(pid, if interrupted { 1 } else { 0 })
    }

    /// Raw exit code reported by a child that was killed by this library
    /// (platforms without signals report a code and a tier name).
    pub fn killed(pid: ProcessId, code: i32, signal: impl Into<String>) -> Self {
        let mut status = Self::signaled(pid, signal);
        status.exit_status = Some(code);
        status
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    pub fn term_signal(&self) -> Option<&str> {
        self.term_signal.as_deref()
    }

    /// Always true; a status only exists once the child has stopped.
    pub fn has_exited(&self) -> bool {
        true
    }

    /// `None` when the child was terminated by a signal
    pub fn success(&self) -> Option<bool> {
        if self.term_signal.is_some() {
            return None;
        }
        self.exit_status.map(|code| code == 0)
    }

    pub fn reason(&self) -> String {
        match (&self.term_signal, self.exit_status) {
            (Some(signal), _) => format!("due to SIG{signal}"),
            (None, Some(code)) => format!("with exit status {code}"),
            (None, None) => "for an unknown reason".to_string(),
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {} exited {}", self.pid, self.reason())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_status() {
        let status = ProcessStatus::exited(10, 99);
        assert_eq!(status.exit_status(), Some(99));
        assert_eq!(status.term_signal(), None);
        assert_eq!(status.success(), Some(false));
        assert_eq!(status.reason(), "with exit status 99");
        assert!(status.has_exited());

        assert_eq!(ProcessStatus::exited(10, 0).success(), Some(true));
    }

    #[test]
    fn test_signal_status() {
        let status = ProcessStatus::signaled(11, "SIGKILL");
        assert_eq!(status.term_signal(), Some("KILL"));
        assert_eq!(status.exit_status(), None);
        assert_eq!(status.success(), None);
        assert_eq!(status.reason(), "due to SIGKILL");

        let status = ProcessStatus::signaled(11, "TERM");
        assert_eq!(status.term_signal(), Some("TERM"));
    }

    #[test]
    fn test_synthesized_status_depends_on_interrupt() {
        assert_eq!(ProcessStatus::synthesized(5, false).exit_status(), Some(0));
        assert_eq!(ProcessStatus::synthesized(5, true).exit_status(), Some(1));
    }

    #[test]
    fn test_killed_status_keeps_code_and_tier() {
        let status = ProcessStatus::killed(3, 1, "KILL");
        assert_eq!(status.exit_status(), Some(1));
        assert_eq!(status.term_signal(), Some("KILL"));
        assert_eq!(status.success(), None);
    }

    #[test]
    fn test_serialization() {
        let status = ProcessStatus::exited(1234, 146);
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"exitStatus\":146"));
        let deserialized: ProcessStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(status, deserialized);
    }
}
