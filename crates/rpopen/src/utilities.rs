//! Blocking helpers for the common "run it and give me the output" case

use crate::popen3_sync;
use anyhow::{Context, Result, bail};
use rpopen_core::{Command, OutputCollector, ProcessStatus, SpawnOptions};

/// Runs `command` and returns its `(stdout, stderr)`.
///
/// Fails when the child could not be started or did not exit with status
/// zero; the error names the command, why it stopped and what it printed.
pub fn run(command: impl Into<Command>) -> Result<(String, String)> {
    let options = SpawnOptions::new(command);
    let (status, stdout, stderr) = run_collecting_output(&options)?;
    if status.success() != Some(true) {
        bail!(
            "command `{}` failed {}\nstdout:\n{}\nstderr:\n{}",
            options.command,
            status.reason(),
            stdout,
            stderr
        );
    }
    Ok((stdout, stderr))
}

/// Runs to completion and returns the status with everything printed
pub fn run_collecting_output(options: &SpawnOptions) -> Result<(ProcessStatus, String, String)> {
    let mut collector = OutputCollector::new();
    let completion = popen3_sync(options, &mut collector)
        .with_context(|| format!("failed to run `{}`", options.command))?;
    let status = completion
        .into_status()
        .with_context(|| format!("`{}` was abandoned before exiting", options.command))?;
    Ok((status, collector.stdout_lossy(), collector.stderr_lossy()))
}

/// Like [`run_collecting_output`], feeding `input` to the child's stdin
pub fn run_input(
    options: &SpawnOptions,
    input: impl Into<Vec<u8>>,
) -> Result<(ProcessStatus, String, String)> {
    let options = SpawnOptions {
        input: Some(input.into()),
        keep_stdin_open: false,
        ..options.clone()
    };
    run_collecting_output(&options)
}
