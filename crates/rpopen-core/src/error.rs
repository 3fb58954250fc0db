use crate::exec_failure::ExecFailure;
use thiserror::Error;

/// Core error types for popen operations
#[derive(Error, Debug)]
pub enum PopenError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: SpawnFailure,
    },

    #[error("invalid process state: {0}")]
    ProcessState(String),

    #[error("unable to kill child process {pid}")]
    KillEscalationExhausted { pid: u32 },

    #[error("configuration error: {0}")]
    Configuration(String),

    /// A target callback panicked while driven by the async pump
    #[error("callback failed: {0}")]
    Callback(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a command could not become the target program
#[derive(Error, Debug)]
pub enum SpawnFailure {
    /// Reported by the child over the status channel before exec completed
    #[error(transparent)]
    Exec(ExecFailure),

    #[error("unknown user `{0}`")]
    UnknownUser(String),

    #[error("unknown group `{0}`")]
    UnknownGroup(String),

    #[error("executable not found")]
    NotFound,

    #[error("unrecognized status channel payload ({0} bytes)")]
    Garbled(usize),

    #[error(transparent)]
    Io(std::io::Error),
}

impl PopenError {
    pub fn spawn(command: impl Into<String>, source: SpawnFailure) -> Self {
        PopenError::Spawn {
            command: command.into(),
            source,
        }
    }

    pub fn process_state(message: impl Into<String>) -> Self {
        PopenError::ProcessState(message.into())
    }

    /// Check if the child never became the requested program
    pub fn is_spawn_failure(&self) -> bool {
        matches!(self, PopenError::Spawn { .. })
    }

    /// Check if this error indicates a programmer error or an unkillable child
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PopenError::ProcessState(_)
                | PopenError::KillEscalationExhausted { .. }
                | PopenError::Configuration(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec_failure::ExecStage;

    #[test]
    fn test_spawn_error_names_command() {
        let error = PopenError::spawn(
            "no-such-binary",
            SpawnFailure::Exec(ExecFailure::new(ExecStage::Exec, 2, "no-such-binary")),
        );
        let display = format!("{error}");
        assert!(display.contains("no-such-binary"));
        assert!(error.is_spawn_failure());
        assert!(!error.is_fatal());
    }

    #[test]
    fn test_error_categorization() {
        assert!(PopenError::KillEscalationExhausted { pid: 7 }.is_fatal());
        assert!(PopenError::process_state("stdin already closed").is_fatal());
        assert!(PopenError::Configuration("empty command".to_string()).is_fatal());

        let io = PopenError::from(std::io::Error::other("boom"));
        assert!(!io.is_fatal());
        assert!(!io.is_spawn_failure());
    }

    #[test]
    fn test_error_display() {
        let error = PopenError::KillEscalationExhausted { pid: 42 };
        assert_eq!(format!("{error}"), "unable to kill child process 42");

        let error = PopenError::spawn("app", SpawnFailure::UnknownUser("nobody2".to_string()));
        let display = format!("{error}");
        assert!(display.contains("app"));
        assert!(display.contains("unknown user `nobody2`"));
    }
}
