use crate::config::SpawnOptions;
use crate::error::PopenError;
use crate::process::ChildProcess;

/// Creates platform child processes.
///
/// Platform crates implement this; the facade picks one at compile time.
pub trait ProcessSpawner {
    /// The process type produced by this spawner
    type Process: ChildProcess + 'static;

    /// Starts the child described by `options`.
    ///
    /// Options are validated first. On POSIX a failure after fork is only
    /// known once the status channel is read, so it surfaces from the pump
    /// rather than from here.
    fn spawn(options: &SpawnOptions) -> Result<Self::Process, PopenError>;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}
