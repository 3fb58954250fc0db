#[cfg(unix)]
mod unix_impl {
    use crate::exec_plan::{ChildFds, ExecPlan};
    use nix::errno::Errno;
    use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
    use nix::sys::signal::{self, Signal};
    use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
    use nix::unistd::{ForkResult, Pid, fork, setpgid};
    use rpopen_core::{
        AsyncIo, Channel, ChildProcess, KillTier, PopenError, ProcessBase, ProcessSpawner,
        ProcessStatus, SpawnFailure, SpawnOptions,
    };
    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::os::fd::{AsFd, AsRawFd, OwnedFd};
    use std::time::Duration;
    use tokio::net::unix::pipe;
    use tracing::{debug, info, warn};

    /// POSIX child created with fork/exec and four pipes
    #[derive(Debug)]
    pub struct UnixChildProcess {
        base: ProcessBase,
        pid: Pid,
        stdin: Option<File>,
        stdout: Option<File>,
        stderr: Option<File>,
        status: Option<File>,
    }

    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
        nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
        use nix::fcntl::{FcntlArg, FdFlag, fcntl};
        let (read, write) = nix::unistd::pipe()?;
        fcntl(&read, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        fcntl(&write, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        Ok((read, write))
    }

    fn spawn_io_error(command: &str, errno: Errno) -> PopenError {
        PopenError::spawn(command, SpawnFailure::Io(errno.into()))
    }

    impl UnixChildProcess {
        pub fn spawn(options: &SpawnOptions) -> Result<Self, PopenError> {
            options.validate()?;
            let plan = ExecPlan::new(options)?;
            let command = options.command.to_string();

            let pipes = || cloexec_pipe().map_err(|errno| spawn_io_error(&command, errno));
            let (stdin_r, stdin_w) = pipes()?;
            let (stdout_r, stdout_w) = pipes()?;
            let (stderr_r, stderr_w) = pipes()?;
            let (status_r, status_w) = pipes()?;

            let fds = ChildFds {
                stdin: stdin_r.as_raw_fd(),
                stdout: stdout_w.as_raw_fd(),
                stderr: stderr_w.as_raw_fd(),
                status: status_w.as_raw_fd(),
            };

            // SAFETY: the child only runs `exec_child`, which makes
            // async-signal-safe libc calls on data prepared above.
            match unsafe { fork() } {
                Ok(ForkResult::Child) => unsafe { plan.exec_child(fds) },
                Ok(ForkResult::Parent { child }) => {
                    drop((stdin_r, stdout_w, stderr_w, status_w));
                    // races the child's own setpgid; whichever runs first wins
                    let _ = setpgid(child, child);
                    info!(pid = %child, command = %command, argc = plan.argv().len(), "spawned child process");

                    let base = ProcessBase::new(child.as_raw() as u32, options);
                    Ok(Self {
                        base,
                        pid: child,
                        stdin: Some(File::from(stdin_w)),
                        stdout: Some(File::from(stdout_r)),
                        stderr: Some(File::from(stderr_r)),
                        status: Some(File::from(status_r)),
                    })
                }
                Err(errno) => Err(spawn_io_error(&command, errno)),
            }
        }

        fn channel(&self, channel: Channel) -> Option<&File> {
            match channel {
                Channel::Stdout => self.stdout.as_ref(),
                Channel::Stderr => self.stderr.as_ref(),
                Channel::Status => self.status.as_ref(),
            }
        }

        fn channel_mut(&mut self, channel: Channel) -> &mut Option<File> {
            match channel {
                Channel::Stdout => &mut self.stdout,
                Channel::Stderr => &mut self.stderr,
                Channel::Status => &mut self.status,
            }
        }

        fn record(&mut self, wait_status: WaitStatus) -> Option<ProcessStatus> {
            let pid = self.base.pid();
            let status = match wait_status {
                WaitStatus::Exited(_, code) => ProcessStatus::exited(pid, code),
                WaitStatus::Signaled(_, signal, _) if self.base.escalation().interrupted() => {
                    ProcessStatus::killed(pid, 1, signal.as_str())
                }
                WaitStatus::Signaled(_, signal, _) => ProcessStatus::signaled(pid, signal.as_str()),
                _ => return None,
            };
            debug!(pid = %pid, status = %status, "child process exited");
            Some(self.base.set_status(status))
        }

        fn reaped_elsewhere(&mut self) -> ProcessStatus {
            let pid = self.base.pid();
            let interrupted = self.base.escalation().interrupted();
            debug!(pid = %pid, "child already reaped, synthesizing status");
            self.base.set_status(ProcessStatus::synthesized(pid, interrupted))
        }
    }

    impl ChildProcess for UnixChildProcess {
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
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => Ok(true),
                Ok(wait_status) => Ok(self.record(wait_status).is_none()),
                Err(Errno::ECHILD) => {
                    self.reaped_elsewhere();
                    Ok(false)
                }
                Err(Errno::EINTR) => Ok(true),
                Err(errno) => Err(PopenError::Io(errno.into())),
            }
        }

        fn wait_for_exit_status(&mut self) -> Result<ProcessStatus, PopenError> {
            loop {
                if let Some(status) = self.base.status() {
                    return Ok(status.clone());
                }
                match waitpid(self.pid, None) {
                    Ok(wait_status) => {
                        self.record(wait_status);
                    }
                    Err(Errno::ECHILD) => return Ok(self.reaped_elsewhere()),
                    Err(Errno::EINTR) => {}
                    Err(errno) => return Err(PopenError::Io(errno.into())),
                }
            }
        }

        fn send_signal(&mut self, tier: KillTier) -> Result<bool, PopenError> {
            let signal = match tier {
                KillTier::Soft => Signal::SIGINT,
                KillTier::Hard => Signal::SIGTERM,
                KillTier::Final => Signal::SIGKILL,
            };
            match signal::killpg(self.pid, signal).or_else(|_| signal::kill(self.pid, signal)) {
                Ok(()) => {
                    info!(pid = %self.pid, signal = signal.as_str(), "sent signal to child process");
                    Ok(true)
                }
                Err(Errno::ESRCH) => Ok(false),
                Err(errno) => {
                    warn!(pid = %self.pid, signal = signal.as_str(), error = %errno, "failed to signal child process");
                    Err(PopenError::Io(errno.into()))
                }
            }
        }

        fn open_channels(&self) -> Vec<Channel> {
            [Channel::Stdout, Channel::Stderr, Channel::Status]
                .into_iter()
                .filter(|c| self.channel(*c).is_some())
                .collect()
        }

        fn drain_all_upon_death(&self) -> bool {
            false
        }

        fn poll_channels(
            &mut self,
            channels: &[Channel],
            timeout: Duration,
        ) -> io::Result<Vec<Channel>> {
            let watched: Vec<(Channel, &File)> = channels
                .iter()
                .filter_map(|c| self.channel(*c).map(|file| (*c, file)))
                .collect();
            let mut fds: Vec<PollFd> = watched
                .iter()
                .map(|(_, file)| PollFd::new(file.as_fd(), PollFlags::POLLIN))
                .collect();

            let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
            poll(&mut fds, PollTimeout::from(millis)).map_err(io::Error::from)?;

            let readable = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL;
            Ok(watched
                .iter()
                .zip(fds.iter())
                .filter(|(_, fd)| fd.revents().is_some_and(|r| r.intersects(readable)))
                .map(|((channel, _), _)| *channel)
                .collect())
        }

        fn read_channel(&mut self, channel: Channel, buf: &mut [u8]) -> io::Result<usize> {
            match self.channel_mut(channel) {
                Some(file) => file.read(buf),
                None => Ok(0),
            }
        }

        fn close_channel(&mut self, channel: Channel) {
            self.channel_mut(channel).take();
        }

        fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>> {
            self.stdin
                .take()
                .map(|file| Box::new(file) as Box<dyn Write + Send>)
        }

        fn clone_stdin(&self) -> io::Result<Option<Box<dyn Write + Send>>> {
            self.stdin
                .as_ref()
                .map(|file| {
                    file.try_clone()
                        .map(|clone| Box::new(clone) as Box<dyn Write + Send>)
                })
                .transpose()
        }

        fn safe_close_io(&mut self) {
            self.stdin.take();
            self.stdout.take();
            self.stderr.take();
            self.status.take();
        }

        fn take_async_io(&mut self) -> Result<AsyncIo, PopenError> {
            let receiver = |file: Option<File>| -> io::Result<_> {
                file.map(|file| {
                    pipe::Receiver::from_owned_fd(OwnedFd::from(file))
                        .map(|r| Box::new(r) as Box<dyn tokio::io::AsyncRead + Send + Unpin>)
                })
                .transpose()
            };
            let stdin = self
                .stdin
                .take()
                .map(|file| {
                    pipe::Sender::from_owned_fd(OwnedFd::from(file))
                        .map(|w| Box::new(w) as Box<dyn tokio::io::AsyncWrite + Send + Unpin>)
                })
                .transpose()?;
            Ok(AsyncIo {
                stdin,
                stdout: receiver(self.stdout.take())?,
                stderr: receiver(self.stderr.take())?,
                status: receiver(self.status.take())?,
            })
        }
    }

    /// Spawner for POSIX platforms
    pub struct UnixSpawner;

    impl ProcessSpawner for UnixSpawner {
        type Process = UnixChildProcess;

        fn spawn(options: &SpawnOptions) -> Result<Self::Process, PopenError> {
            UnixChildProcess::spawn(options)
        }

        fn platform_name() -> &'static str {
            "Unix"
        }
    }
}

#[cfg(unix)]
pub use unix_impl::{UnixChildProcess, UnixSpawner};
