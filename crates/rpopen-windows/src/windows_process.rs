#[cfg(windows)]
mod windows_impl {
    use rpopen_core::{
        AsyncIo, Channel, ChildProcess, Command, EscalationState, KillTier, PopenError,
        ProcessBase, ProcessSpawner, ProcessStatus, SpawnFailure, SpawnOptions, merge_environment,
    };
    use std::collections::HashMap;
    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::os::windows::io::{AsHandle, AsRawHandle};
    use std::os::windows::process::CommandExt;
    use std::path::Path;
    use std::process::{
        Child, ChildStderr, ChildStdin, ChildStdout, Command as StdCommand, ExitStatus, Stdio,
    };
    use std::time::{Duration, Instant};
    use tracing::{debug, info, warn};
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::Pipes::PeekNamedPipe;
    use windows::Win32::System::Threading::CREATE_NO_WINDOW;

    const PEEK_INTERVAL: Duration = Duration::from_millis(10);
    const DEFAULT_SHELL: &str = "cmd.exe";

    /// Windows child with piped standard streams
    pub struct WindowsChildProcess {
        base: ProcessBase,
        child: Child,
        stdin: Option<ChildStdin>,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
    }

    /// Name reported as `term_signal` for each tier
    fn tier_name(tier: KillTier) -> &'static str {
        match tier {
            KillTier::Soft => "INT",
            KillTier::Hard => "BRK",
            KillTier::Final => "KILL",
        }
    }

    fn lookup<'a>(environment: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
        environment
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Shell lines run through `%ComSpec% /d /s /c`; argv programs are
    /// resolved against the child's own `PATH` and working directory.
    pub fn command_line(
        command: &Command,
        environment: &HashMap<String, String>,
        directory: &Path,
    ) -> Result<StdCommand, SpawnFailure> {
        match command {
            Command::Shell(line) => {
                let shell = lookup(environment, "ComSpec").unwrap_or(DEFAULT_SHELL);
                let mut cmd = StdCommand::new(shell);
                cmd.raw_arg("/d /s /c").raw_arg(format!("\"{line}\""));
                Ok(cmd)
            }
            Command::Argv(argv) => {
                let (program, args) = argv.split_first().ok_or(SpawnFailure::NotFound)?;
                let resolved = which::which_in(program, lookup(environment, "PATH"), directory)
                    .map_err(|_| SpawnFailure::NotFound)?;
                let mut cmd = StdCommand::new(resolved);
                cmd.args(args);
                Ok(cmd)
            }
        }
    }

    /// Bytes waiting in a pipe. A broken pipe counts as readable so the
    /// following read observes end of stream.
    fn bytes_available(handle: &impl AsRawHandle) -> Option<u32> {
        let mut available = 0u32;
        // SAFETY: the handle stays owned by the caller for the whole call.
        let peeked = unsafe {
            PeekNamedPipe(
                HANDLE(handle.as_raw_handle()),
                None,
                0,
                None,
                Some(&mut available as *mut u32),
                None,
            )
        };
        peeked.ok().map(|()| available)
    }

    fn read_available<R: Read + AsRawHandle>(pipe: &mut R, buf: &mut [u8]) -> io::Result<usize> {
        match bytes_available(&*pipe) {
            Some(0) => Err(io::ErrorKind::WouldBlock.into()),
            Some(available) => {
                let len = buf.len().min(available as usize);
                pipe.read(&mut buf[..len])
            }
            None => pipe.read(buf),
        }
    }

    impl WindowsChildProcess {
        /// Starts `options.command` with piped standard streams.
        ///
        /// The child's environment is the current process environment merged
        /// with `options.environment`. The per-user and machine registry maps
        /// handed to [`merge_environment`] are always empty; callers that
        /// want registry values must read them and pass them in through
        /// `options.environment`.
        pub fn spawn(options: &SpawnOptions) -> Result<Self, PopenError> {
            options.validate()?;
            let command = options.command.to_string();
            if options.user.is_some() || options.group.is_some() || options.umask.is_some() {
                warn!(command = %command, "user, group and umask are ignored on Windows");
            }

            let process_env: HashMap<String, String> = std::env::vars().collect();
            let environment = merge_environment(
                &options.environment,
                &HashMap::new(),
                &HashMap::new(),
                &process_env,
                true,
            );
            let directory = match &options.directory {
                Some(directory) => directory.clone(),
                None => std::env::current_dir()?,
            };

            let mut cmd = command_line(&options.command, &environment, &directory)
                .map_err(|failure| PopenError::spawn(command.clone(), failure))?;
            cmd.env_clear()
                .envs(&environment)
                .current_dir(&directory)
                .creation_flags(CREATE_NO_WINDOW.0)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            let mut child = cmd.spawn().map_err(|err| {
                let failure = match err.kind() {
                    io::ErrorKind::NotFound => SpawnFailure::NotFound,
                    _ => SpawnFailure::Io(err),
                };
                PopenError::spawn(command.clone(), failure)
            })?;
            info!(pid = child.id(), command = %command, "spawned child process");

            Ok(Self {
                base: ProcessBase::new(child.id(), options),
                stdin: child.stdin.take(),
                stdout: child.stdout.take(),
                stderr: child.stderr.take(),
                child,
            })
        }

        fn record(&mut self, exit: ExitStatus) -> ProcessStatus {
            let pid = self.base.pid();
            let status = match self.base.escalation().state() {
                EscalationState::Sent(tier) => ProcessStatus::killed(pid, 1, tier_name(tier)),
                EscalationState::Abandoned => ProcessStatus::killed(pid, 1, "KILL"),
                EscalationState::Idle => ProcessStatus::exited(pid, exit.code().unwrap_or(1)),
            };
            debug!(pid = %pid, status = %status, "child process exited");
            self.base.set_status(status)
        }

        fn taskkill(&self, extra: &[&str]) -> Result<bool, PopenError> {
            let pid = self.base.pid().to_string();
            let output = StdCommand::new("taskkill")
                .args(extra)
                .args(["/PID", &pid])
                .creation_flags(CREATE_NO_WINDOW.0)
                .output()?;
            Ok(output.status.success())
        }

        fn has_channel(&self, channel: Channel) -> bool {
            match channel {
                Channel::Stdout => self.stdout.is_some(),
                Channel::Stderr => self.stderr.is_some(),
                Channel::Status => false,
            }
        }

        fn ready(&self, channel: Channel) -> bool {
            let available = match channel {
                Channel::Stdout => self.stdout.as_ref().map(bytes_available),
                Channel::Stderr => self.stderr.as_ref().map(bytes_available),
                Channel::Status => None,
            };
            match available {
                Some(Some(bytes)) => bytes > 0,
                Some(None) => true,
                None => false,
            }
        }
    }

    impl ChildProcess for WindowsChildProcess {
        fn base(&self) -> &ProcessBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut ProcessBase {
            &mut self.base
        }

        fn is_alive(&mut self) -> Result<bool, PopenError> {
            if self.base.status().is_some() {
                return Ok(false);
            }
            match self.child.try_wait()? {
                Some(exit) => {
                    self.record(exit);
                    Ok(false)
                }
                None => Ok(true),
            }
        }

        fn wait_for_exit_status(&mut self) -> Result<ProcessStatus, PopenError> {
            if let Some(status) = self.base.status() {
                return Ok(status.clone());
            }
            let exit = self.child.wait()?;
            Ok(self.record(exit))
        }

        fn send_signal(&mut self, tier: KillTier) -> Result<bool, PopenError> {
            if self.child.try_wait()?.is_some() {
                return Ok(false);
            }
            let delivered = match tier {
                KillTier::Soft => self.taskkill(&[])?,
                KillTier::Hard => self.taskkill(&["/T", "/F"])?,
                KillTier::Final => match self.child.kill() {
                    Ok(()) => true,
                    Err(err) if err.kind() == io::ErrorKind::InvalidInput => false,
                    Err(err) => return Err(err.into()),
                },
            };
            if delivered {
                info!(pid = self.base.pid(), signal = tier_name(tier), "sent signal to child process");
            } else {
                warn!(pid = self.base.pid(), signal = tier_name(tier), "child process did not accept signal");
            }
            Ok(true)
        }

        fn open_channels(&self) -> Vec<Channel> {
            [Channel::Stdout, Channel::Stderr]
                .into_iter()
                .filter(|c| self.has_channel(*c))
                .collect()
        }

        fn drain_all_upon_death(&self) -> bool {
            true
        }

        fn poll_channels(
            &mut self,
            channels: &[Channel],
            timeout: Duration,
        ) -> io::Result<Vec<Channel>> {
            let deadline = Instant::now() + timeout;
            loop {
                let ready: Vec<Channel> =
                    channels.iter().copied().filter(|c| self.ready(*c)).collect();
                let now = Instant::now();
                if !ready.is_empty() || now >= deadline {
                    return Ok(ready);
                }
                std::thread::sleep(PEEK_INTERVAL.min(deadline - now));
            }
        }

        /// Never blocks: an open pipe with nothing buffered yields
        /// `WouldBlock`, since a descendant may keep it open after exit.
        fn read_channel(&mut self, channel: Channel, buf: &mut [u8]) -> io::Result<usize> {
            let read = match channel {
                Channel::Stdout => self.stdout.as_mut().map(|pipe| read_available(pipe, buf)),
                Channel::Stderr => self.stderr.as_mut().map(|pipe| read_available(pipe, buf)),
                Channel::Status => None,
            };
            match read {
                Some(Err(err)) if err.kind() == io::ErrorKind::BrokenPipe => Ok(0),
                Some(result) => result,
                None => Ok(0),
            }
        }

        fn close_channel(&mut self, channel: Channel) {
            match channel {
                Channel::Stdout => drop(self.stdout.take()),
                Channel::Stderr => drop(self.stderr.take()),
                Channel::Status => {}
            }
        }

        fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>> {
            self.stdin
                .take()
                .map(|pipe| Box::new(pipe) as Box<dyn Write + Send>)
        }

        fn clone_stdin(&self) -> io::Result<Option<Box<dyn Write + Send>>> {
            self.stdin
                .as_ref()
                .map(|pipe| {
                    pipe.as_handle()
                        .try_clone_to_owned()
                        .map(|handle| Box::new(File::from(handle)) as Box<dyn Write + Send>)
                })
                .transpose()
        }

        fn safe_close_io(&mut self) {
            self.stdin.take();
            self.stdout.take();
            self.stderr.take();
        }

        fn take_async_io(&mut self) -> Result<AsyncIo, PopenError> {
            let stdin = self
                .stdin
                .take()
                .map(tokio::process::ChildStdin::from_std)
                .transpose()?
                .map(|w| Box::new(w) as Box<dyn tokio::io::AsyncWrite + Send + Unpin>);
            let stdout = self
                .stdout
                .take()
                .map(tokio::process::ChildStdout::from_std)
                .transpose()?
                .map(|r| Box::new(r) as Box<dyn tokio::io::AsyncRead + Send + Unpin>);
            let stderr = self
                .stderr
                .take()
                .map(tokio::process::ChildStderr::from_std)
                .transpose()?
                .map(|r| Box::new(r) as Box<dyn tokio::io::AsyncRead + Send + Unpin>);
            Ok(AsyncIo {
                stdin,
                stdout,
                stderr,
                status: None,
            })
        }
    }

    /// Spawner for Windows
    pub struct WindowsSpawner;

    impl ProcessSpawner for WindowsSpawner {
        type Process = WindowsChildProcess;

        fn spawn(options: &SpawnOptions) -> Result<Self::Process, PopenError> {
            WindowsChildProcess::spawn(options)
        }

        fn platform_name() -> &'static str {
            "Windows"
        }
    }

}

#[cfg(windows)]
pub use windows_impl::{WindowsChildProcess, WindowsSpawner, command_line};
