//! The live key/value environment accumulated from directives.
//!
//! `ConfigStore` keeps the values set by `env`/`envscript` directives on top of
//! an explicit base environment (normally a snapshot of the supervisor's own
//! environment). It knows how to export itself for a child process and how to
//! compare itself with another store so the poller can detect drift.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use regex::{Captures, Regex};

/// Ordered string map used for both the stored data and the base environment.
pub type EnvMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    data: EnvMap,
    base: Arc<EnvMap>,
}

impl ConfigStore {
    /// Creates an empty store that falls back to `base` for lookups.
    pub fn new(base: Arc<EnvMap>) -> Self {
        Self {
            data: EnvMap::new(),
            base,
        }
    }

    /// Creates an empty store backed by a snapshot of this process's environment.
    pub fn from_process_env() -> Self {
        Self::new(Arc::new(process_env()))
    }

    /// The base environment this store falls back to.
    pub fn base(&self) -> &Arc<EnvMap> {
        &self.base
    }

    /// The values set on this store, without the base environment.
    pub fn data(&self) -> &EnvMap {
        &self.data
    }

    /// Looks up a key: the stored value if non-empty, then the base environment,
    /// then the empty string.
    pub fn get(&self, key: &str) -> String {
        match self.data.get(key) {
            Some(value) if !value.is_empty() => value.clone(),
            _ => self.base.get(key).cloned().unwrap_or_default(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data.insert(key.into(), value.into());
    }

    /// Exports the stored keys as sorted `KEY=VALUE` entries.
    ///
    /// Empty keys are skipped and empty values are replaced by the base
    /// environment's value for the same key.
    pub fn to_env_list(&self) -> Vec<String> {
        let mut list: Vec<String> = self
            .data
            .iter()
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, value)| {
                let value = if value.is_empty() {
                    self.base.get(key).map(String::as_str).unwrap_or("")
                } else {
                    value.as_str()
                };
                format!("{}={}", key, value)
            })
            .collect();
        list.sort();
        list
    }

    /// The base environment minus any stored key, followed by `to_env_list`.
    pub fn overlay(&self) -> Vec<String> {
        let mut list: Vec<String> = self
            .base
            .iter()
            .filter(|(key, _)| !self.data.contains_key(*key))
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        list.extend(self.to_env_list());
        list
    }

    /// Compares the stored data of two stores.
    ///
    /// Every key whose value differs (or which is missing on one side) is
    /// recorded with `other`'s value, the empty string when `other` lacks it.
    /// Returns `None` when both stores hold identical data.
    pub fn diff(&self, other: &ConfigStore) -> Option<ConfigStore> {
        let mut diff = EnvMap::new();
        compare_into(&self.data, &other.data, &other.data, &mut diff);
        compare_into(&other.data, &self.data, &other.data, &mut diff);
        if diff.is_empty() {
            return None;
        }
        Some(ConfigStore {
            data: diff,
            base: Arc::clone(&self.base),
        })
    }

    /// Substitutes `${VAR}` and `$VAR` references using [`ConfigStore::get`].
    ///
    /// A `$` that does not start a variable name is kept as is, so command
    /// substitutions like `$(date)` survive for the shell.
    pub fn expand(&self, text: &str) -> String {
        expand_with(text, |name| self.get(name))
    }
}

fn compare_into(a: &EnvMap, b: &EnvMap, target: &EnvMap, diff: &mut EnvMap) {
    for (key, value) in a {
        if b.get(key) != Some(value) {
            diff.insert(key.clone(), target.get(key).cloned().unwrap_or_default());
        }
    }
}

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
            .expect("variable pattern is valid")
    })
}

/// Shell-style variable expansion with a caller supplied lookup.
pub fn expand_with<F>(text: &str, lookup: F) -> String
where
    F: Fn(&str) -> String,
{
    variable_pattern()
        .replace_all(text, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            lookup(name)
        })
        .into_owned()
}

/// Snapshot of this process's environment, lossily decoded.
pub fn process_env() -> EnvMap {
    std::env::vars_os()
        .map(|(key, value)| {
            (
                key.to_string_lossy().into_owned(),
                value.to_string_lossy().into_owned(),
            )
        })
        .collect()
}

/// Splits `KEY=VALUE` entries into pairs; entries without `=` get an empty value.
pub fn split_env_list(list: &[String]) -> Vec<(String, String)> {
    list.iter()
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (entry.clone(), String::new()),
        })
        .collect()
}
