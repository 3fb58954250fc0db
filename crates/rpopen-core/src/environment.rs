//! Environment construction for child processes.
//!
//! Caller-supplied entries always win. On Windows the process environment is
//! layered under the machine and current-user registry environments with
//! case-insensitive keys, and `PATH` is list-merged rather than replaced.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::{OsStr, OsString};

/// Variables never taken from registry sources; some differ under WoW64 or
/// describe the identity of the live session.
pub const BLACKLIST_MERGE_ENV_KEYS: &[&str] = &[
    "CommonProgramFiles",
    "CommonProgramFiles(x86)",
    "CommonProgramW6432",
    "ComSpec",
    "NUMBER_OF_PROCESSORS",
    "OS",
    "PROCESSOR_ARCHITECTURE",
    "PROCESSOR_IDENTIFIER",
    "PROCESSOR_LEVEL",
    "PROCESSOR_REVISION",
    "ProgramFiles",
    "ProgramFiles(x86)",
    "ProgramW6432",
    "PSModulePath",
    "TEMP",
    "TMP",
    "USERDOMAIN",
    "USERNAME",
    "USERPROFILE",
    "windir",
];

const WINDOWS_PATH_SEPARATOR: char = ';';

/// Caller-supplied variables; `None` removes an inherited variable.
pub type EnvironmentOverrides = HashMap<String, Option<String>>;

/// Environment of a POSIX child: the given process environment, then
/// `LC_ALL=C` when `locale` is set, then the caller's overrides.
pub fn posix_environment<I>(
    process: I,
    overrides: &EnvironmentOverrides,
    locale: bool,
) -> BTreeMap<OsString, OsString>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env: BTreeMap<OsString, OsString> = process.into_iter().collect();
    if locale {
        env.insert("LC_ALL".into(), "C".into());
    }
    for (key, value) in overrides {
        match value {
            Some(value) => env.insert(key.into(), value.into()),
            None => env.remove(OsStr::new(key)),
        };
    }
    env
}

/// Case-insensitive map that remembers the first spelling of each key
#[derive(Debug, Default)]
struct NoCaseMap {
    entries: BTreeMap<String, (String, String)>,
}

impl NoCaseMap {
    fn merge<'a, I>(&mut self, from: I, blacklist: &[&str])
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (key, value) in from {
            let folded = key.to_lowercase();
            if blacklist.iter().any(|b| b.eq_ignore_ascii_case(key)) {
                continue;
            }
            match self.entries.get_mut(&folded) {
                Some((_, existing)) if folded == "path" => {
                    *existing = merge_path_value(value, existing);
                }
                Some((_, existing)) => *existing = value.clone(),
                None => {
                    self.entries.insert(folded, (key.clone(), value.clone()));
                }
            }
        }
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(&key.to_lowercase());
    }

    fn into_map(self) -> HashMap<String, String> {
        self.entries.into_values().collect()
    }
}

/// Merges, in increasing precedence: the process environment, the machine
/// registry environment, the current user's registry environment (skipped
/// for the system account) and the caller's overrides. Registry sources are
/// filtered through [`BLACKLIST_MERGE_ENV_KEYS`]; a caller entry of `None`
/// removes the variable whatever its spelling.
pub fn merge_environment(
    caller: &EnvironmentOverrides,
    current_user: &HashMap<String, String>,
    machine: &HashMap<String, String>,
    process: &HashMap<String, String>,
    include_current_user: bool,
) -> HashMap<String, String> {
    let mut merged = NoCaseMap::default();
    merged.merge(process, &[]);
    merged.merge(machine, BLACKLIST_MERGE_ENV_KEYS);
    if include_current_user {
        merged.merge(current_user, BLACKLIST_MERGE_ENV_KEYS);
    }
    for (key, value) in caller {
        match value {
            Some(value) => merged.merge([(key, value)], &[]),
            None => merged.remove(key),
        }
    }
    merged.into_map()
}

/// Appends the entries of `to_value` missing from `from_value`, keeping
/// `from_value` order first. Matching is case-insensitive and separators are
/// normalized to backslashes.
pub fn merge_path_value(from_value: &str, to_value: &str) -> String {
    let from_value = from_value.replace('/', "\\");
    let to_value = to_value.replace('/', "\\");

    if to_value.is_empty() {
        return from_value;
    }
    if from_value.is_empty() {
        return to_value;
    }

    let mut seen: HashSet<String> = from_value
        .split(WINDOWS_PATH_SEPARATOR)
        .map(str::to_lowercase)
        .collect();
    let mut merged = from_value.clone();
    for path in to_value.split(WINDOWS_PATH_SEPARATOR) {
        if seen.insert(path.to_lowercase()) {
            merged.push(WINDOWS_PATH_SEPARATOR);
            merged.push_str(path);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn overrides(pairs: &[(&str, Option<&str>)]) -> EnvironmentOverrides {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
            .collect()
    }

    #[test]
    fn test_posix_environment_layers() {
        let process = vec![
            (OsString::from("HOME"), OsString::from("/root")),
            (OsString::from("LC_ALL"), OsString::from("en_US.UTF-8")),
        ];
        let env = posix_environment(process.clone(), &overrides(&[("FOO", Some("bar"))]), true);
        assert_eq!(env.get(&OsString::from("LC_ALL")), Some(&OsString::from("C")));
        assert_eq!(env.get(&OsString::from("FOO")), Some(&OsString::from("bar")));

        let env = posix_environment(process, &overrides(&[("LC_ALL", Some("fr_FR"))]), true);
        assert_eq!(
            env.get(&OsString::from("LC_ALL")),
            Some(&OsString::from("fr_FR"))
        );
    }

    #[test]
    fn test_caller_overrides_everything() {
        let merged = merge_environment(
            &overrides(&[("foo", Some("caller"))]),
            &map(&[("FOO", "user")]),
            &map(&[("Foo", "machine")]),
            &map(&[("FOO", "process")]),
            true,
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.get("FOO").map(String::as_str), Some("caller"));
    }

    #[test]
    fn test_registry_blacklist() {
        let merged = merge_environment(
            &HashMap::new(),
            &map(&[("USERNAME", "registry-user")]),
            &map(&[("Processor_Architecture", "x86")]),
            &map(&[("USERNAME", "live"), ("PROCESSOR_ARCHITECTURE", "AMD64")]),
            true,
        );
        assert_eq!(merged.get("USERNAME").map(String::as_str), Some("live"));
        assert_eq!(
            merged.get("PROCESSOR_ARCHITECTURE").map(String::as_str),
            Some("AMD64")
        );

        let merged = merge_environment(
            &overrides(&[("TEMP", Some("C:\\caller"))]),
            &HashMap::new(),
            &HashMap::new(),
            &map(&[("TEMP", "C:\\live")]),
            true,
        );
        assert_eq!(merged.get("TEMP").map(String::as_str), Some("C:\\caller"));
    }

    #[test]
    fn test_system_account_skips_user_registry() {
        let merged = merge_environment(
            &HashMap::new(),
            &map(&[("EDITOR", "notepad")]),
            &HashMap::new(),
            &HashMap::new(),
            false,
        );
        assert!(merged.is_empty());
    }

    #[test]
    fn test_path_is_list_merged() {
        let merged = merge_environment(
            &overrides(&[("PATH", Some("C:\\caller"))]),
            &map(&[("Path", "C:\\user;c:\\MACHINE")]),
            &map(&[("PATH", "C:\\machine")]),
            &map(&[("PATH", "C:\\process")]),
            true,
        );
        assert_eq!(
            merged.get("PATH").map(String::as_str),
            Some("C:\\caller;C:\\user;c:\\MACHINE;C:\\process")
        );
    }

    #[test]
    fn test_none_removes_inherited_variable() {
        let process = vec![
            (OsString::from("HOME"), OsString::from("/root")),
            (OsString::from("SECRET"), OsString::from("hunter2")),
        ];
        let env = posix_environment(process, &overrides(&[("SECRET", None)]), false);
        assert!(!env.contains_key(OsStr::new("SECRET")));
        assert!(env.contains_key(OsStr::new("HOME")));

        let merged = merge_environment(
            &overrides(&[("secret", None), ("MISSING", None)]),
            &HashMap::new(),
            &map(&[("Secret", "machine")]),
            &map(&[("SECRET", "process"), ("HOME", "C:\\home")]),
            true,
        );
        assert_eq!(merged.len(), 1);
        assert!(merged.contains_key("HOME"));
    }

    #[test]
    fn test_merge_path_value() {
        assert_eq!(merge_path_value("C:/a;C:/b", "c:\\B;C:\\c"), "C:\\a;C:\\b;C:\\c");
        assert_eq!(merge_path_value("", "C:\\x"), "C:\\x");
        assert_eq!(merge_path_value("C:\\x", ""), "C:\\x");
    }

    proptest! {
        #[test]
        fn prop_path_merge_is_idempotent(parts in prop::collection::vec("[A-Za-z0-9:\\\\ ._-]{1,12}", 0..8)) {
            let value = parts.join(";");
            let mut unique = Vec::new();
            let mut seen = HashSet::new();
            for part in &parts {
                if seen.insert(part.to_lowercase()) {
                    unique.push(part.clone());
                }
            }
            let deduped = unique.join(";");
            prop_assert_eq!(merge_path_value(&deduped, &deduped), deduped.clone());
            let once = merge_path_value(&value, &value);
            prop_assert_eq!(merge_path_value(&once, &once), once.clone());
        }

        #[test]
        fn prop_empty_caller_reproduces_process_environment(
            process in prop::collection::hash_map("[A-Z][A-Z0-9_]{0,7}", "[a-z0-9]{0,8}", 0..12)
        ) {
            let merged = merge_environment(
                &HashMap::new(),
                &HashMap::new(),
                &HashMap::new(),
                &process,
                true,
            );
            prop_assert_eq!(merged, process.clone());

            let posix = posix_environment(
                process.iter().map(|(k, v)| (OsString::from(k), OsString::from(v))),
                &HashMap::new(),
                false,
            );
            prop_assert_eq!(posix.len(), process.len());
            for (key, value) in &process {
                prop_assert_eq!(posix.get(&OsString::from(key)), Some(&OsString::from(value)));
            }
        }
    }
}
