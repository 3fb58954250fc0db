use rpopen_core::{PopenError, ProcessSpawner, SpawnOptions};

/// Spawner for the platform this crate was compiled for
pub struct PlatformSpawner;

/// Child process type produced by [`PlatformSpawner`]
pub type PlatformProcess = <PlatformSpawner as ProcessSpawner>::Process;

impl ProcessSpawner for PlatformSpawner {
    #[cfg(unix)]
    type Process = rpopen_unix::UnixChildProcess;

    #[cfg(windows)]
    type Process = rpopen_windows::WindowsChildProcess;

    fn spawn(options: &SpawnOptions) -> Result<Self::Process, PopenError> {
        #[cfg(unix)]
        return rpopen_unix::UnixSpawner::spawn(options);

        #[cfg(windows)]
        return rpopen_windows::WindowsSpawner::spawn(options);
    }

    fn platform_name() -> &'static str {
        #[cfg(unix)]
        return rpopen_unix::UnixSpawner::platform_name();

        #[cfg(windows)]
        return rpopen_windows::WindowsSpawner::platform_name();
    }
}
