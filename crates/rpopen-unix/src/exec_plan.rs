//! Everything the forked child needs, prepared before `fork`.
//!
//! Between `fork` and `exec` the child may only make async-signal-safe
//! calls, so argument vectors, the environment, exec candidates and error
//! details are all built up front and the child side uses raw libc calls.

use nix::libc::{self, c_char, c_int, gid_t, mode_t, uid_t};
use nix::unistd::{Group, User};
use rpopen_core::{
    Command, ExecStage, Identity, PopenError, SpawnFailure, SpawnOptions, encode_header,
    posix_environment,
};
use std::ffi::{CString, OsStr, OsString};
use std::os::fd::RawFd;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;
use std::ptr;

const SHELL: &str = "/bin/sh";
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const MAX_FD_CEILING: c_int = 65_536;
const EXEC_FAILED_EXIT: c_int = 127;

/// Descriptors the child wires onto its standard streams
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChildFds {
    pub stdin: RawFd,
    pub stdout: RawFd,
    pub stderr: RawFd,
    pub status: RawFd,
}

pub(crate) struct ExecPlan {
    program: CString,
    candidates: Vec<CString>,
    argv: Vec<CString>,
    // backs the pointers in envp_ptrs
    envp: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    envp_ptrs: Vec<*const c_char>,
    directory: Option<CString>,
    uid: Option<uid_t>,
    gid: Option<gid_t>,
    umask: Option<mode_t>,
    inherit_io: bool,
    max_fd: c_int,
    uid_detail: Vec<u8>,
    gid_detail: Vec<u8>,
}

impl ExecPlan {
    pub fn new(options: &SpawnOptions) -> Result<Self, PopenError> {
        let command_name = options.command.to_string();
        let spawn_err = |failure| PopenError::spawn(command_name.clone(), failure);

        let argv: Vec<String> = match &options.command {
            Command::Shell(line) => vec![SHELL.to_string(), "-c".to_string(), line.clone()],
            Command::Argv(argv) => argv.clone(),
        };
        let argv = argv
            .into_iter()
            .map(|arg| c_string(arg.into_bytes()))
            .collect::<Result<Vec<_>, _>>()?;

        let environment = posix_environment(
            std::env::vars_os(),
            &options.environment,
            options.locale,
        );
        let path = environment.get(OsStr::new("PATH")).cloned();
        let envp = environment
            .into_iter()
            .map(|(key, value)| {
                let mut entry = key.into_vec();
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                c_string(entry)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let program = argv
            .first()
            .cloned()
            .ok_or_else(|| PopenError::Configuration("missing command".to_string()))?;
        let candidates = exec_candidates(program.as_bytes(), path.as_deref())?;

        let uid = options
            .user
            .as_ref()
            .map(resolve_user)
            .transpose()
            .map_err(spawn_err)?;
        let gid = options
            .group
            .as_ref()
            .map(resolve_group)
            .transpose()
            .map_err(spawn_err)?;

        let directory = options
            .directory
            .as_deref()
            .map(|dir| c_string(dir.as_os_str().as_bytes().to_vec()))
            .transpose()?;

        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = null_terminated(&envp);

        Ok(Self {
            program,
            candidates,
            argv,
            envp,
            argv_ptrs,
            envp_ptrs,
            directory,
            uid,
            gid,
            umask: options.umask.map(|mask| mask as mode_t),
            inherit_io: options.inherit_io,
            max_fd: max_fd(),
            uid_detail: uid.map(|id| format!("uid {id}")).unwrap_or_default().into_bytes(),
            gid_detail: gid.map(|id| format!("gid {id}")).unwrap_or_default().into_bytes(),
        })
    }

    pub fn argv(&self) -> &[CString] {
        &self.argv
    }

    /// Runs in the forked child. Never returns: either `execve` replaces the
    /// image or a failure record is written and the child exits.
    ///
    /// # Safety
    ///
    /// Must only be called in the child right after `fork`.
    pub unsafe fn exec_child(&self, fds: ChildFds) -> ! {
        unsafe {
            reset_signals();

            if libc::dup2(fds.stdin, 0) < 0
                || libc::dup2(fds.stdout, 1) < 0
                || libc::dup2(fds.stderr, 2) < 0
            {
                report(fds.status, ExecStage::Redirect, errno(), b"stdio");
            }

            if !self.inherit_io {
                for fd in 3..self.max_fd {
                    if fd != fds.status {
                        libc::close(fd);
                    }
                }
            }

            // own process group so the whole tree can be signalled
            libc::setpgid(0, 0);

            if let Some(gid) = self.gid {
                if libc::setgid(gid) != 0 {
                    report(fds.status, ExecStage::SetGroup, errno(), &self.gid_detail);
                }
            }
            if let Some(uid) = self.uid {
                if libc::setuid(uid) != 0 {
                    report(fds.status, ExecStage::SetUser, errno(), &self.uid_detail);
                }
            }
            if let Some(mask) = self.umask {
                libc::umask(mask);
            }
            if let Some(directory) = &self.directory {
                if libc::chdir(directory.as_ptr()) != 0 {
                    report(fds.status, ExecStage::Chdir, errno(), directory.as_bytes());
                }
            }

            let mut failure = libc::ENOENT;
            let mut saw_eacces = false;
            for candidate in &self.candidates {
                libc::execve(
                    candidate.as_ptr(),
                    self.argv_ptrs.as_ptr(),
                    self.envp_ptrs.as_ptr(),
                );
                failure = errno();
                match failure {
                    libc::EACCES => saw_eacces = true,
                    libc::ENOENT | libc::ENOTDIR => {}
                    _ => break,
                }
            }
            if saw_eacces && matches!(failure, libc::ENOENT | libc::ENOTDIR) {
                failure = libc::EACCES;
            }
            report(fds.status, ExecStage::Exec, failure, self.program.as_bytes())
        }
    }
}

unsafe fn reset_signals() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::pthread_sigmask(libc::SIG_SETMASK, &set, ptr::null_mut());
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}

/// Writes a failure record to the status pipe and exits without cleanup
unsafe fn report(status: RawFd, stage: ExecStage, errno: c_int, detail: &[u8]) -> ! {
    let header = encode_header(stage, errno, detail.len() as u32);
    unsafe {
        libc::write(status, header.as_ptr().cast(), header.len());
        libc::write(status, detail.as_ptr().cast(), detail.len());
        libc::_exit(EXEC_FAILED_EXIT)
    }
}

fn errno() -> c_int {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn max_fd() -> c_int {
    let limit = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if limit <= 0 {
        1024
    } else {
        limit.min(MAX_FD_CEILING as libc::c_long) as c_int
    }
}

fn c_string(bytes: Vec<u8>) -> Result<CString, PopenError> {
    CString::new(bytes).map_err(|err| {
        PopenError::Configuration(format!(
            "argument or environment entry contains a NUL byte at {}",
            err.nul_position()
        ))
    })
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// Paths to try with `execve`, in `PATH` order. Programs containing a slash
/// are used as given; empty `PATH` entries mean the current directory.
fn exec_candidates(program: &[u8], path: Option<&OsStr>) -> Result<Vec<CString>, PopenError> {
    if program.contains(&b'/') {
        return Ok(vec![c_string(program.to_vec())?]);
    }

    let path = path.unwrap_or(OsStr::new(DEFAULT_PATH));
    path.as_bytes()
        .split(|byte| *byte == b':')
        .map(|dir| {
            let dir = if dir.is_empty() { b".".as_slice() } else { dir };
            let candidate = Path::new(OsStr::from_bytes(dir)).join(OsStr::from_bytes(program));
            c_string(OsString::from(candidate).into_vec())
        })
        .collect()
}

fn resolve_user(identity: &Identity) -> Result<uid_t, SpawnFailure> {
    match identity {
        Identity::Id(id) => Ok(*id),
        Identity::Name(name) => match User::from_name(name) {
            Ok(Some(user)) => Ok(user.uid.as_raw()),
            Ok(None) => Err(SpawnFailure::UnknownUser(name.clone())),
            Err(errno) => Err(SpawnFailure::Io(errno.into())),
        },
    }
}

fn resolve_group(identity: &Identity) -> Result<gid_t, SpawnFailure> {
    match identity {
        Identity::Id(id) => Ok(*id),
        Identity::Name(name) => match Group::from_name(name) {
            Ok(Some(group)) => Ok(group.gid.as_raw()),
            Ok(None) => Err(SpawnFailure::UnknownGroup(name.clone())),
            Err(errno) => Err(SpawnFailure::Io(errno.into())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_command_runs_through_sh() {
        let plan = ExecPlan::new(&SpawnOptions::new("echo $HOME")).unwrap();
        let argv: Vec<&[u8]> = plan.argv().iter().map(|a| a.as_bytes()).collect();
        assert_eq!(argv, vec![&b"/bin/sh"[..], b"-c", b"echo $HOME"]);
        assert_eq!(plan.candidates.len(), 1);
    }

    #[test]
    fn test_candidates_follow_path() {
        let candidates = exec_candidates(b"ls", Some(OsStr::new("/a::/b"))).unwrap();
        let candidates: Vec<&[u8]> = candidates.iter().map(|c| c.as_bytes()).collect();
        assert_eq!(candidates, vec![&b"/a/ls"[..], b"./ls", b"/b/ls"]);

        let candidates = exec_candidates(b"./run.sh", Some(OsStr::new("/a"))).unwrap();
        assert_eq!(candidates[0].as_bytes(), b"./run.sh");
    }

    #[test]
    fn test_environment_overrides_and_locale() {
        let options = SpawnOptions::builder()
            .argv(["env"])
            .env("RPOPEN_TEST_VAR", "1")
            .build()
            .unwrap();
        let plan = ExecPlan::new(&options).unwrap();
        assert!(plan.envp.iter().any(|e| e.as_bytes() == b"RPOPEN_TEST_VAR=1"));
        assert!(plan.envp.iter().any(|e| e.as_bytes() == b"LC_ALL=C"));
        assert_eq!(plan.envp_ptrs.len(), plan.envp.len() + 1);
        assert!(plan.envp_ptrs.last().is_some_and(|p| p.is_null()));
    }

    #[test]
    fn test_nul_bytes_are_rejected() {
        let options = SpawnOptions::new(Command::argv(["echo", "a\0b"]));
        assert!(matches!(
            ExecPlan::new(&options),
            Err(PopenError::Configuration(_))
        ));
    }

    #[test]
    fn test_unknown_user_is_a_spawn_failure() {
        let options = SpawnOptions::builder()
            .argv(["true"])
            .user("rpopen-no-such-user")
            .build()
            .unwrap();
        let err = ExecPlan::new(&options).err().unwrap();
        assert!(err.is_spawn_failure());
        assert!(err.to_string().contains("rpopen-no-such-user"));
    }
}
