use crate::error::PopenError;
use crate::process::ChildProcess;
use crate::status::{ProcessId, ProcessStatus};

/// Callbacks driven by the stream pump. Every method defaults to a no-op.
///
/// Ordering: `on_pid` fires before any output, `on_timeout` and
/// `on_size_limit` fire before `on_exit`, and `on_exit` fires exactly once
/// after all channels reached end of stream.
pub trait Target {
    fn on_pid(&mut self, _pid: ProcessId) {}

    fn on_stdout(&mut self, _data: &[u8]) {}

    fn on_stderr(&mut self, _data: &[u8]) {}

    /// Periodic tick. Returning `false` abandons automatic draining.
    fn on_watch(&mut self, _process: &mut dyn ChildProcess) -> bool {
        true
    }

    fn on_timeout(&mut self) {}

    fn on_size_limit(&mut self) {}

    fn on_exit(&mut self, _status: &ProcessStatus) {}

    /// Errors raised inside the async pump, which cannot reach the caller
    fn on_async_exception(&mut self, _error: &PopenError) {}
}

impl Target for () {}

impl<T: Target + ?Sized> Target for &mut T {
    fn on_pid(&mut self, pid: ProcessId) {
        (**self).on_pid(pid)
    }

    fn on_stdout(&mut self, data: &[u8]) {
        (**self).on_stdout(data)
    }

    fn on_stderr(&mut self, data: &[u8]) {
        (**self).on_stderr(data)
    }

    fn on_watch(&mut self, process: &mut dyn ChildProcess) -> bool {
        (**self).on_watch(process)
    }

    fn on_timeout(&mut self) {
        (**self).on_timeout()
    }

    fn on_size_limit(&mut self) {
        (**self).on_size_limit()
    }

    fn on_exit(&mut self, status: &ProcessStatus) {
        (**self).on_exit(status)
    }

    fn on_async_exception(&mut self, error: &PopenError) {
        (**self).on_async_exception(error)
    }
}

/// Target that keeps everything it is told
#[derive(Debug, Default, Clone)]
pub struct OutputCollector {
    pub pid: Option<ProcessId>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: Option<ProcessStatus>,
    pub timed_out: bool,
    pub size_limit_exceeded: bool,
    pub exit_calls: usize,
    pub errors: Vec<String>,
}

impl OutputCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.status.as_ref().and_then(ProcessStatus::exit_status)
    }
}

impl Target for OutputCollector {
    fn on_pid(&mut self, pid: ProcessId) {
        self.pid = Some(pid);
    }

    fn on_stdout(&mut self, data: &[u8]) {
        self.stdout.extend_from_slice(data);
    }

    fn on_stderr(&mut self, data: &[u8]) {
        self.stderr.extend_from_slice(data);
    }

    fn on_timeout(&mut self) {
        self.timed_out = true;
    }

    fn on_size_limit(&mut self) {
        self.size_limit_exceeded = true;
    }

    fn on_exit(&mut self, status: &ProcessStatus) {
        self.exit_calls += 1;
        self.status = Some(status.clone());
    }

    fn on_async_exception(&mut self, error: &PopenError) {
        self.errors.push(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_accumulates() {
        let mut collector = OutputCollector::new();
        {
            let target: &mut OutputCollector = &mut collector;
            target.on_pid(12);
            target.on_stdout(b"hello ");
            target.on_stdout(b"world");
            target.on_stderr(b"oops");
            target.on_timeout();
            target.on_exit(&ProcessStatus::exited(12, 4));
        }
        assert_eq!(collector.pid, Some(12));
        assert_eq!(collector.stdout_lossy(), "hello world");
        assert_eq!(collector.stderr_lossy(), "oops");
        assert!(collector.timed_out);
        assert!(!collector.size_limit_exceeded);
        assert_eq!(collector.exit_calls, 1);
        assert_eq!(collector.exit_status(), Some(4));
    }

    #[test]
    fn test_unit_target_is_a_no_op() {
        let mut target = ();
        target.on_stdout(b"ignored");
        target.on_exit(&ProcessStatus::exited(1, 0));
        target.on_async_exception(&PopenError::Callback("boom".to_string()));
    }
}
