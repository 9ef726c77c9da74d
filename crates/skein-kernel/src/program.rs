//! Program and state types.
//!
//! A [`Program`] is the parsed form of a JSON5 program file: the top-level
//! `order` task list, the `named_tasks` table, the initial state, recorded
//! save slots, and default chat completion arguments. A [`Task`] is simply an
//! ordered mapping with a `cmd` key; the parser annotates each with a `line`
//! field for diagnostics.

use std::collections::HashMap;
use std::path::PathBuf;

use indexmap::IndexMap;
use skein_types::{Error, Result, Value, ValueMap};

use crate::store::InsertStore;

/// One command invocation: a mapping with a required `cmd` key.
pub type Task = ValueMap;

/// A parsed program.
#[derive(Debug, Clone)]
pub struct Program {
    pub order: Vec<Task>,
    pub named_tasks: HashMap<String, Task>,
    pub default_state: State,
    pub save_states: ValueMap,
    pub completion_args: ValueMap,
}

/// Where a program was loaded from, and where its insert fallback files live.
#[derive(Debug, Clone)]
pub struct LoadContext {
    pub program_path: PathBuf,
    pub program_dir: PathBuf,
    pub inserts_dir: Option<PathBuf>,
}

impl LoadContext {
    pub fn new(program_path: PathBuf, inserts_dir: Option<PathBuf>) -> Result<Self> {
        let program_dir = program_path
            .parent()
            .ok_or_else(|| Error::Parse("program path has no parent directory".into()))?
            .to_path_buf();
        if let Some(dir) = inserts_dir.as_ref() {
            if !dir.is_dir() {
                return Err(Error::Parse(format!(
                    "inserts dir must be an existing directory, got '{}'",
                    dir.display()
                )));
            }
        }
        Ok(Self {
            program_path,
            program_dir,
            inserts_dir,
        })
    }
}

/// Mutable execution state.
///
/// `order_index` is the 1-based cursor into the top-level `order` list; 0
/// means "before the first task" and an index past the end terminates the
/// run. `cursors` holds the transient positions of nested frames (`serial`,
/// `for`) keyed by frame path, so a saved state can resume mid-frame.
/// `inserts` is the sole communication channel between tasks.
#[derive(Debug, Clone)]
pub struct State {
    pub order_index: i64,
    pub output: String,
    pub inserts: InsertStore,
    pub cursors: IndexMap<String, i64>,
}

impl State {
    pub fn new() -> Self {
        Self {
            order_index: 1,
            output: String::new(),
            inserts: InsertStore::new(),
            cursors: IndexMap::new(),
        }
    }

    /// Build a state from a program's `default_state` mapping (or a save
    /// slot). Missing fields take their defaults; `inserts` must be a
    /// mapping when present.
    pub fn from_value(map: &ValueMap) -> Result<Self> {
        let order_index = match map.get("order_index") {
            None => 1,
            Some(Value::Int(i)) => *i,
            Some(other) => {
                return Err(Error::Type(format!(
                    "state order_index must be an integer, got {}",
                    other.to_display()
                )))
            }
        };
        let output = match map.get("output") {
            None => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => {
                return Err(Error::Type(format!(
                    "state output must be a string, got {}",
                    other.to_display()
                )))
            }
        };
        let inserts = match map.get("inserts") {
            None => InsertStore::new(),
            Some(Value::Map(entries)) => InsertStore::from_entries(entries.clone()),
            Some(_) => return Err(Error::Type("state inserts must be a mapping".into())),
        };
        let mut cursors = IndexMap::new();
        if let Some(value) = map.get("cursors") {
            let entries = value
                .as_map()
                .ok_or_else(|| Error::Type("state cursors must be a mapping".into()))?;
            for (k, v) in entries {
                let i = v
                    .as_i64()
                    .ok_or_else(|| Error::Type("state cursors must hold integers".into()))?;
                cursors.insert(k.clone(), i);
            }
        }
        Ok(Self {
            order_index,
            output,
            inserts,
            cursors,
        })
    }

    /// Serialize to a plain value mapping, the inverse of [`from_value`].
    ///
    /// [`from_value`]: State::from_value
    pub fn to_value(&self) -> Value {
        let mut map = ValueMap::new();
        map.insert("order_index".into(), Value::Int(self.order_index));
        map.insert("output".into(), Value::String(self.output.clone()));
        map.insert("inserts".into(), Value::Map(self.inserts.entries().clone()));
        if !self.cursors.is_empty() {
            let cursors: ValueMap = self
                .cursors
                .iter()
                .map(|(k, v)| (k.clone(), Value::Int(*v)))
                .collect();
            map.insert("cursors".into(), Value::Map(cursors));
        }
        Value::Map(map)
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// Field accessors shared by the analyzer and the interpreter.
pub fn task_cmd(task: &Task) -> Option<&str> {
    task.get("cmd").and_then(Value::as_str)
}

pub fn task_line(task: &Task) -> Option<i64> {
    task.get("line").and_then(Value::as_i64)
}

pub fn field_str(task: &Task, key: &str) -> Result<String> {
    task.get(key)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .ok_or_else(|| Error::Type(format!("field '{key}' must be a string")))
}

pub fn field_list(task: &Task, key: &str) -> Result<Vec<Value>> {
    task.get(key)
        .and_then(Value::as_list)
        .map(|l| l.to_vec())
        .ok_or_else(|| Error::Type(format!("field '{key}' must be a list")))
}

/// A `tasks` field: a list whose members are all task mappings.
pub fn field_tasks(task: &Task, key: &str) -> Result<Vec<Task>> {
    let list = task
        .get(key)
        .and_then(Value::as_list)
        .ok_or_else(|| Error::Type(format!("field '{key}' must be a list")))?;
    let mut out = Vec::with_capacity(list.len());
    for value in list {
        match value {
            Value::Map(map) => out.push(map.clone()),
            _ => return Err(Error::Type("tasks must be mappings".into())),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_from_empty_map_takes_defaults() {
        let state = State::from_value(&ValueMap::new()).unwrap();
        assert_eq!(state.order_index, 1);
        assert_eq!(state.output, "");
        assert!(state.inserts.is_empty());
        assert!(state.cursors.is_empty());
    }

    #[test]
    fn state_roundtrips_through_value() {
        let mut state = State::new();
        state.order_index = 4;
        state.output = "hello".into();
        state.inserts.set("name", Value::String("tom".into()));
        state.cursors.insert("root/serial:3".into(), 2);

        let Value::Map(map) = state.to_value() else {
            panic!("expected map");
        };
        let restored = State::from_value(&map).unwrap();
        assert_eq!(restored.order_index, 4);
        assert_eq!(restored.output, "hello");
        assert_eq!(
            restored.inserts.get("name").unwrap(),
            Value::String("tom".into())
        );
        assert_eq!(restored.cursors.get("root/serial:3"), Some(&2));
    }

    #[test]
    fn state_rejects_bad_shapes() {
        let mut map = ValueMap::new();
        map.insert("order_index".into(), Value::String("x".into()));
        assert!(State::from_value(&map).is_err());

        let mut map = ValueMap::new();
        map.insert("inserts".into(), Value::List(vec![]));
        assert!(State::from_value(&map).is_err());
    }

    #[test]
    fn field_accessors_enforce_shape() {
        let mut task = Task::new();
        task.insert("cmd".into(), Value::String("print".into()));
        task.insert("text".into(), Value::String("hi".into()));
        task.insert("items".into(), Value::List(vec![Value::Int(1)]));

        assert_eq!(task_cmd(&task), Some("print"));
        assert_eq!(field_str(&task, "text").unwrap(), "hi");
        assert!(field_str(&task, "items").is_err());
        assert_eq!(field_list(&task, "items").unwrap().len(), 1);
        assert!(field_list(&task, "text").is_err());
    }
}
