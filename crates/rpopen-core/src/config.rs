use crate::environment::EnvironmentOverrides;
use crate::error::PopenError;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Command to run: a shell command line or an argv vector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_more::From)]
#[serde(untagged)]
pub enum Command {
    Shell(String),
    Argv(Vec<String>),
}

impl Command {
    pub fn argv<S: ToString, I: IntoIterator<Item = S>>(iter: I) -> Self {
        Command::Argv(iter.into_iter().map(|s| s.to_string()).collect())
    }

    /// Executable named by this command (the whole line for shell commands)
    pub fn program(&self) -> &str {
        match self {
            Command::Shell(line) => line,
            Command::Argv(argv) => argv.first().map(String::as_str).unwrap_or(""),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Command::Shell(line) => line.trim().is_empty(),
            Command::Argv(argv) => argv.first().is_none_or(|program| program.is_empty()),
        }
    }
}

impl Default for Command {
    fn default() -> Self {
        Command::Shell(String::new())
    }
}

impl From<&str> for Command {
    fn from(line: &str) -> Self {
        Command::Shell(line.to_string())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Shell(line) => f.write_str(line),
            Command::Argv(argv) => f.write_str(&argv.join(" ")),
        }
    }
}

/// User or group given by name or numeric id (POSIX only)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_more::From)]
#[serde(untagged)]
pub enum Identity {
    Id(u32),
    Name(String),
}

impl From<&str> for Identity {
    fn from(name: &str) -> Self {
        Identity::Name(name.to_string())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Id(id) => write!(f, "{id}"),
            Identity::Name(name) => f.write_str(name),
        }
    }
}

/// Options for spawning one child process
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into, strip_option))]
#[serde(rename_all = "camelCase")]
pub struct SpawnOptions {
    pub command: Command,

    /// Variables set in the child; a `None` value unsets an inherited one
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub environment: EnvironmentOverrides,

    #[builder(default)]
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Bytes written to the child's stdin before it is closed
    #[builder(default)]
    #[serde(default)]
    pub input: Option<Vec<u8>>,

    #[builder(default)]
    #[serde(default)]
    pub user: Option<Identity>,

    #[builder(default)]
    #[serde(default)]
    pub group: Option<Identity>,

    #[builder(default)]
    #[serde(default)]
    pub umask: Option<u32>,

    /// Force `LC_ALL=C` in the child (POSIX only)
    #[builder(default = "true")]
    #[serde(default = "default_locale")]
    pub locale: bool,

    /// Let the child inherit descriptors beyond the standard streams
    #[builder(default)]
    #[serde(default)]
    pub inherit_io: bool,

    /// Leave stdin open after `input` is written; the caller closes it
    #[builder(default)]
    #[serde(default)]
    pub keep_stdin_open: bool,

    #[builder(default)]
    #[serde(default)]
    pub timeout_seconds: Option<f64>,

    #[builder(default)]
    #[serde(default)]
    pub size_limit_bytes: Option<u64>,

    /// Directory summed for the size limit; defaults to `directory`, then the
    /// current directory
    #[builder(default)]
    #[serde(default)]
    pub watch_directory: Option<PathBuf>,

    /// Grace period between interrupt tiers (in milliseconds)
    #[builder(default = "default_interrupt_grace_ms()")]
    #[serde(default = "default_interrupt_grace_ms")]
    pub interrupt_grace_ms: u64,
}

impl SpawnOptions {
    pub fn builder() -> SpawnOptionsBuilder {
        SpawnOptionsBuilder::default()
    }

    pub fn new(command: impl Into<Command>) -> Self {
        Self {
            command: command.into(),
            environment: HashMap::new(),
            directory: None,
            input: None,
            user: None,
            group: None,
            umask: None,
            locale: default_locale(),
            inherit_io: false,
            keep_stdin_open: false,
            timeout_seconds: None,
            size_limit_bytes: None,
            watch_directory: None,
            interrupt_grace_ms: default_interrupt_grace_ms(),
        }
    }

    /// Validate the options and return errors if invalid
    pub fn validate(&self) -> Result<(), PopenError> {
        if self.command.is_empty() {
            return Err(PopenError::Configuration("missing command".to_string()));
        }

        if let Some(timeout) = self.timeout_seconds {
            if !timeout.is_finite() || timeout < 0.0 {
                return Err(PopenError::Configuration(format!(
                    "timeout_seconds must be a non-negative number, got {timeout}"
                )));
            }
        }

        if self.size_limit_bytes == Some(0) {
            return Err(PopenError::Configuration(
                "size_limit_bytes must be greater than zero".to_string(),
            ));
        }

        if let Some(umask) = self.umask {
            if umask > 0o7777 {
                return Err(PopenError::Configuration(format!(
                    "umask {umask:o} is wider than 0o7777"
                )));
            }
        }

        if self.interrupt_grace_ms == 0 {
            return Err(PopenError::Configuration(
                "interrupt_grace_ms must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs_f64)
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }

    /// Directory summed for the size-limit watch, if a limit is configured
    pub fn effective_watch_directory(&self) -> Option<PathBuf> {
        self.size_limit_bytes?;
        self.watch_directory
            .clone()
            .or_else(|| self.directory.clone())
            .or_else(|| std::env::current_dir().ok())
    }
}

impl SpawnOptionsBuilder {
    pub fn env<K: ToString, V: ToString>(&mut self, key: K, value: V) -> &mut Self {
        let map = self.environment.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), Some(value.to_string()));
        self
    }

    /// Removes `key` from the environment the child inherits
    pub fn env_remove<K: ToString>(&mut self, key: K) -> &mut Self {
        let map = self.environment.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), None);
        self
    }

    pub fn env_multi<K: ToString, V: ToString, I: IntoIterator<Item = (K, V)>>(
        &mut self,
        iter: I,
    ) -> &mut Self {
        let env = self.environment.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), Some(value.to_string()));
        }
        self
    }

    pub fn argv<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        self.command = Some(Command::argv(iter));
        self
    }
}

// Default value functions for serde
fn default_locale() -> bool {
    true
}
fn default_interrupt_grace_ms() -> u64 {
    3_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let options = SpawnOptions::builder().command("echo hi").build().unwrap();
        assert_eq!(options.command, Command::Shell("echo hi".to_string()));
        assert!(options.locale);
        assert!(!options.inherit_io);
        assert_eq!(options.interrupt_grace(), Duration::from_secs(3));
        assert_eq!(options.timeout(), None);
        assert!(options.validate().is_ok());
        assert_eq!(options, SpawnOptions::new("echo hi"));
    }

    #[test]
    fn test_builder_custom_setters() {
        let options = SpawnOptions::builder()
            .argv(["ruby", "-e", "puts 1"])
            .env("FOO", "bar")
            .env_multi([("A", "1"), ("B", "2")])
            .input("42\n")
            .timeout_seconds(1.5)
            .build()
            .unwrap();
        assert_eq!(options.command.program(), "ruby");
        assert_eq!(options.environment.len(), 3);
        assert_eq!(options.environment["FOO"].as_deref(), Some("bar"));
        assert_eq!(options.input.as_deref(), Some(&b"42\n"[..]));
        assert_eq!(options.timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_invalid_options() {
        let options = SpawnOptions::new("");
        assert!(options.validate().is_err());

        let options = SpawnOptions::new(Command::Argv(vec![]));
        assert!(options.validate().is_err());

        let mut options = SpawnOptions::new("true");
        options.timeout_seconds = Some(-1.0);
        assert!(options.validate().is_err());

        options.timeout_seconds = Some(f64::NAN);
        assert!(options.validate().is_err());

        options.timeout_seconds = None;
        options.size_limit_bytes = Some(0);
        assert!(options.validate().is_err());

        options.size_limit_bytes = None;
        options.umask = Some(0o17777);
        assert!(options.validate().is_err());

        options.umask = Some(0o022);
        options.interrupt_grace_ms = 0;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_watch_directory_fallbacks() {
        let mut options = SpawnOptions::new("true");
        assert_eq!(options.effective_watch_directory(), None);

        options.size_limit_bytes = Some(10);
        options.directory = Some(PathBuf::from("/work"));
        assert_eq!(
            options.effective_watch_directory(),
            Some(PathBuf::from("/work"))
        );

        options.watch_directory = Some(PathBuf::from("/watched"));
        assert_eq!(
            options.effective_watch_directory(),
            Some(PathBuf::from("/watched"))
        );
    }

    #[test]
    fn test_deserialize_from_json() {
        let json = r#"{
            "command": ["sh", "-c", "exit 3"],
            "environment": {"FOO": "bar", "UNSET_ME": null},
            "timeoutSeconds": 2.5,
            "user": 1000,
            "group": "staff"
        }"#;
        let options: SpawnOptions = serde_json::from_str(json).unwrap();
        assert_eq!(options.command, Command::argv(["sh", "-c", "exit 3"]));
        assert_eq!(options.environment["FOO"].as_deref(), Some("bar"));
        assert_eq!(options.environment["UNSET_ME"], None);
        assert_eq!(options.user, Some(Identity::Id(1000)));
        assert_eq!(options.group, Some(Identity::Name("staff".to_string())));
        assert!(options.locale);
        assert_eq!(options.interrupt_grace_ms, 3_000);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_command_display() {
        assert_eq!(Command::argv(["ls", "-l"]).to_string(), "ls -l");
        assert_eq!(Command::from("echo $HOME").program(), "echo $HOME");
    }
}
