//! POSIX child processes: fork/exec with close-on-exec pipes, `poll(2)`
//! readiness and an INT → TERM → KILL escalation.

#[cfg(unix)]
mod exec_plan;
mod unix_process;

#[cfg(unix)]
pub use unix_process::{UnixChildProcess, UnixSpawner};
