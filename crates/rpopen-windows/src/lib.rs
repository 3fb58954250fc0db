//! Windows child processes built on `std::process` with anonymous pipes.
//!
//! Windows has no fork/exec split, so spawn failures surface synchronously
//! and there is no status channel. Output readiness is detected by peeking
//! the pipes.

mod windows_process;

#[cfg(windows)]
pub use windows_process::{WindowsChildProcess, WindowsSpawner, command_line};
