//! Spawn child processes and stream their output to callbacks.
//!
//! [`popen3_sync`] blocks the caller until the child exits;
//! [`popen3_async`] runs the same pump as a tokio task. Both deliver
//! stdout and stderr to a [`Target`], enforce the optional timeout and
//! watched-directory size limit, and interrupt runaway children with an
//! escalating series of signals.

mod factory;
mod safe_output_buffer;
pub mod utilities;

pub use factory::{PlatformProcess, PlatformSpawner};
pub use safe_output_buffer::SafeOutputBuffer;

// Re-export core functionality
pub use rpopen_core::*;

use tokio::task::JoinHandle;
use tracing::debug;

/// Spawns `options.command` and pumps it to completion on this thread.
///
/// Returns [`Completion::Abandoned`] with the live process when
/// `on_watch` returned `false`; otherwise the final status. Spawn failures,
/// including those only reported by the child before exec, come back as
/// [`PopenError::Spawn`].
pub fn popen3_sync<T>(
    options: &SpawnOptions,
    target: &mut T,
) -> Result<Completion<PlatformProcess>, PopenError>
where
    T: Target + ?Sized,
{
    let process = PlatformSpawner::spawn(options)?;
    debug!(
        pid = process.pid(),
        platform = PlatformSpawner::platform_name(),
        "pumping child synchronously"
    );
    run_to_exit(process, target)
}

/// Spawns `options.command` and hands the pump to the current tokio
/// runtime.
///
/// Synchronous spawn failures are returned directly. Everything after that,
/// including exec failures reported by the child, is delivered through
/// `on_async_exception`; the handle resolves to the target after `on_exit`.
pub fn popen3_async<T>(options: &SpawnOptions, target: T) -> Result<JoinHandle<T>, PopenError>
where
    T: Target + Send + 'static,
{
    let process = PlatformSpawner::spawn(options)?;
    debug!(
        pid = process.pid(),
        platform = PlatformSpawner::platform_name(),
        "pumping child asynchronously"
    );
    Ok(spawn_pump(process, target))
}
