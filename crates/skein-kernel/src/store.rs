//! The insert store: the keyed state that interpolation reads and tasks
//! mutate.
//!
//! Lookup order is: the local mapping (which includes the `ARG1`, `ARG2`,
//! ... startup arguments), then the optional read-only fallback directory
//! (`<dir>/<key>.json5` parsed as JSON5, else `<dir>/<key>` read as a
//! trimmed string), then the computed time keys (`HH:MM`, `HH:MM:SS`). File
//! contents are escaped on read so they interpolate as literal text. A miss
//! is the recoverable [`Error::MissingKey`].
//!
//! Keys may contain `/`; that is conventional namespacing and carries no
//! structural meaning.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use skein_glob::wildcard_match;
use skein_types::{json_to_value, Error, Result, Value, ValueMap};

use crate::interp::escape_value;

#[derive(Debug, Clone, Default)]
pub struct InsertStore {
    entries: ValueMap,
    fallback_dir: Option<PathBuf>,
}

impl InsertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: ValueMap) -> Self {
        Self {
            entries,
            fallback_dir: None,
        }
    }

    /// Attach the read-only fallback directory. Carried on clones, never
    /// serialized.
    pub fn set_fallback_dir(&mut self, dir: Option<PathBuf>) {
        self.fallback_dir = dir;
    }

    pub fn fallback_dir(&self) -> Option<&Path> {
        self.fallback_dir.as_deref()
    }

    pub fn entries(&self) -> &ValueMap {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Local presence only; computed keys and fallback files don't count.
    /// (`await_insert` waits on this.)
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.shift_remove(key)
    }

    /// Resolve a key to a value.
    ///
    /// Lookup order: local mapping, fallback file, computed time keys. A
    /// local entry wins over a fallback file of the same name; the time
    /// keys are re-evaluated at every lookup that reaches them.
    pub fn get(&self, key: &str) -> Result<Value> {
        if key.is_empty() {
            return Err(Error::Parse("tried to interpolate the empty key ''".into()));
        }

        if let Some(value) = self.entries.get(key) {
            return Ok(value.clone());
        }

        if let Some(dir) = self.fallback_dir.as_ref() {
            let json5_path = dir.join(format!("{key}.json5"));
            if json5_path.exists() {
                let raw = fs::read_to_string(&json5_path)?;
                let json: serde_json::Value = json5::from_str(&raw)
                    .map_err(|e| Error::Parse(format!("{}: {e}", json5_path.display())))?;
                return Ok(escape_value(json_to_value(json)));
            }
            let plain_path = dir.join(key);
            if plain_path.is_file() {
                let raw = fs::read_to_string(&plain_path)?;
                return Ok(escape_value(Value::String(raw.trim().to_string())));
            }
        }

        match key {
            "HH:MM" => Ok(Value::String(Local::now().format("%H:%M").to_string())),
            "HH:MM:SS" => Ok(Value::String(Local::now().format("%H:%M:%S").to_string())),
            _ => Err(Error::MissingKey(key.to_string())),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Remove every key matching any pattern. Protected keys survive.
    /// Returns the removed keys in store order. Fallback files are never
    /// touched.
    pub fn delete_matching(&mut self, patterns: &[String]) -> Vec<String> {
        self.bulk_delete(patterns, true)
    }

    /// Remove every key matching no pattern. Protected keys survive.
    pub fn retain_matching(&mut self, patterns: &[String]) -> Vec<String> {
        self.bulk_delete(patterns, false)
    }

    fn bulk_delete(&mut self, patterns: &[String], delete_on_match: bool) -> Vec<String> {
        let mut removed = Vec::new();
        for key in self.keys() {
            if is_protected_key(&key) {
                continue;
            }
            let matched = patterns.iter().any(|p| wildcard_match(p, &key));
            if matched == delete_on_match {
                self.entries.shift_remove(&key);
                removed.push(key);
            }
        }
        removed
    }
}

/// The startup-argument keys (`ARG1`, `ARG2`, ...) are always protected from
/// bulk deletion.
pub fn is_protected_key(key: &str) -> bool {
    key.len() > 3 && key.starts_with("ARG") && key[3..].chars().all(|c| c.is_ascii_digit())
}
