//! rpopen core - platform-independent process lifecycle and stream pumping
//!
//! This crate provides the options, status and error types, the callback
//! contract, the `ChildProcess` trait implemented by the platform crates,
//! and the synchronous and async pumps that drive a child to exit.

mod config;
mod environment;
mod error;
mod exec_failure;
mod process;
mod pump;
mod pump_async;
mod spawner;
mod status;
mod target;
mod watch;

pub use config::*;
pub use environment::*;
pub use error::*;
pub use exec_failure::*;
pub use process::*;
pub use pump::{Completion, POLL_INTERVAL, run_to_exit};
pub use pump_async::{run_to_exit_async, spawn_pump};
pub use spawner::*;
pub use status::*;
pub use target::*;
pub use watch::*;
