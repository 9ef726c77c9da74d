//! The interpolation engine.
//!
//! Every string field of every task is expanded against the insert store
//! before use. `{key}` inserts the displayed value of `key`; the key region
//! itself may contain nested `{...}` groups, which resolve first (so
//! `{question-{i}}` with `i = 3` looks up `question-3`). The escapes `\{`
//! and `\}` survive interpolation *unchanged* — only [`unescape_once`] (and
//! the `unescape` command built on it) strips them.
//!
//! A lookup miss surfaces as the recoverable [`Error::MissingKey`]; callers
//! decide whether that is fatal or a branch condition.

use skein_types::{Error, Result, Value, ValueMap};

use crate::program::Task;
use crate::store::InsertStore;

pub const OPEN: char = '{';
pub const CLOSE: char = '}';
pub const ESCAPE: char = '\\';

/// Escape every delimiter: `{` becomes `\{`, `}` becomes `\}`.
///
/// Applied to raw user input and startup arguments before they enter the
/// store, so stored text never interpolates.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if ch == OPEN || ch == CLOSE {
            out.push(ESCAPE);
        }
        out.push(ch);
    }
    out
}

/// Strip one level of escaping: `\{` becomes `{`, `\}` becomes `}`.
pub fn unescape_once(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == ESCAPE && i + 1 < chars.len() && (chars[i + 1] == OPEN || chars[i + 1] == CLOSE)
        {
            out.push(chars[i + 1]);
            i += 2;
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}

/// Recursively escape every string in a value (mapping keys included).
pub fn escape_value(value: Value) -> Value {
    map_strings(value, &escape)
}

/// Recursively strip one level of escaping from every string in a value.
pub fn unescape_value(value: Value) -> Value {
    map_strings(value, &unescape_once)
}

fn map_strings(value: Value, f: &dyn Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(&s)),
        Value::List(items) => Value::List(items.into_iter().map(|v| map_strings(v, f)).collect()),
        Value::Map(map) => Value::Map(
            map.into_iter()
                .map(|(k, v)| (f(&k), map_strings(v, f)))
                .collect(),
        ),
        v => v,
    }
}

/// If the whole string is exactly one `{...}` group, return the raw key
/// region (which may itself contain nested groups).
///
/// Used where a field like `list: '{xs}'` should resolve to the *structural*
/// stored value instead of its display string.
pub fn simple_key(s: &str) -> Option<String> {
    let chars: Vec<char> = s.chars().collect();
    if chars.first() != Some(&OPEN) {
        return None;
    }
    let close = find_matching(&chars, 0).ok()?;
    if close != chars.len() - 1 {
        return None;
    }
    Some(chars[1..close].iter().collect())
}

/// Expand a string against the store.
///
/// Single left-to-right pass: literal runs are copied, escaped delimiters
/// pass through verbatim, each `{key}` group resolves (inner groups first)
/// and the value's display form is inserted. Inserted text is *not*
/// re-scanned.
pub fn interpolate(store: &InsertStore, input: &str) -> Result<String> {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        if ch == ESCAPE && i + 1 < chars.len() && (chars[i + 1] == OPEN || chars[i + 1] == CLOSE) {
            out.push(ESCAPE);
            out.push(chars[i + 1]);
            i += 2;
            continue;
        }
        if ch == OPEN {
            let close = find_matching(&chars, i)?;
            let inner: String = chars[i + 1..close].iter().collect();
            let key = interpolate(store, &inner)?;
            let value = store.get(&key)?;
            out.push_str(&value.to_display());
            i = close + 1;
            continue;
        }
        // A stray unescaped '}' with no opener passes through literally.
        out.push(ch);
        i += 1;
    }
    Ok(out)
}

/// Find the `}` matching the `{` at `open`, honoring nesting and escapes.
fn find_matching(chars: &[char], open: usize) -> Result<usize> {
    let mut depth = 0;
    let mut i = open;
    while i < chars.len() {
        let ch = chars[i];
        if ch == ESCAPE && i + 1 < chars.len() && (chars[i + 1] == OPEN || chars[i + 1] == CLOSE) {
            i += 2;
            continue;
        }
        if ch == OPEN {
            depth += 1;
        } else if ch == CLOSE {
            depth -= 1;
            if depth == 0 {
                return Ok(i);
            }
        }
        i += 1;
    }
    let tail: String = chars[open..].iter().collect();
    Err(Error::Parse(format!("unbalanced '{{' in: {tail}")))
}

/// Resolve a string field: a lone `{key}` yields the stored value
/// structurally, anything else interpolates to a string.
pub fn resolve(store: &InsertStore, input: &str) -> Result<Value> {
    if let Some(inner) = simple_key(input) {
        let key = interpolate(store, &inner)?;
        return store.get(&key);
    }
    Ok(Value::String(interpolate(store, input)?))
}

/// Recursively resolve every string inside a value, with the task-shaped
/// exceptions:
///
/// - `goto_map` / `replace_map` tasks are left untouched — they manage
///   interpolation failure themselves (the `NULL` sentinel).
/// - Container tasks (`serial`, `for`, `parallel_wait`, `parallel_race`)
///   only have a string-valued `tasks` field (or string entries of it)
///   resolved from the store; sub-tasks interpolate when they execute.
pub fn resolve_deep(store: &InsertStore, value: Value) -> Result<Value> {
    match value {
        Value::String(s) => resolve(store, &s),
        Value::List(items) => Ok(Value::List(
            items
                .into_iter()
                .map(|v| resolve_deep(store, v))
                .collect::<Result<Vec<_>>>()?,
        )),
        Value::Map(map) => {
            let cmd = map.get("cmd").and_then(Value::as_str).map(str::to_string);
            if let Some(cmd) = cmd.as_deref() {
                if cmd == "goto_map" || cmd == "replace_map" {
                    return Ok(Value::Map(map));
                }
                if matches!(cmd, "for" | "serial" | "parallel_wait" | "parallel_race") {
                    let mut map = map;
                    if let Some(tasks) = map.get_mut("tasks") {
                        resolve_task_refs(store, tasks)?;
                    }
                    return Ok(Value::Map(map));
                }
            }
            let mut out = ValueMap::new();
            for (k, v) in map {
                let new_k = interpolate(store, &k)?;
                out.insert(new_k, resolve_deep(store, v)?);
            }
            Ok(Value::Map(out))
        }
        v => Ok(v),
    }
}

/// Resolve `tasks: '{name}'` (or string entries inside a tasks list) to the
/// stored task list without touching the sub-task mappings themselves.
fn resolve_task_refs(store: &InsertStore, tasks: &mut Value) -> Result<()> {
    match tasks {
        Value::String(s) => {
            if let Some(inner) = simple_key(s) {
                let key = interpolate(store, &inner)?;
                *tasks = store.get(&key)?;
            }
        }
        Value::List(items) => {
            for item in items {
                if let Value::String(s) = item {
                    if let Some(inner) = simple_key(s) {
                        let key = interpolate(store, &inner)?;
                        *item = store.get(&key)?;
                    }
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Interpolate a whole task mapping before dispatch.
pub fn interpolate_task(store: &InsertStore, task: &Task) -> Result<Task> {
    match resolve_deep(store, Value::Map(task.clone()))? {
        Value::Map(map) => Ok(map),
        _ => Err(Error::Type("task must remain a mapping after interpolation".into())),
    }
}

/// Collect the top-level `{key}` references in a value, for static analysis.
///
/// Keys that contain nested groups are returned with the braces intact
/// (e.g. `question-{i}`); the analyzer treats those as dynamic.
pub fn extract_insert_keys(value: &Value) -> Vec<String> {
    let mut keys = Vec::new();
    collect_keys(value, &mut keys);
    keys
}

fn collect_keys(value: &Value, keys: &mut Vec<String>) {
    match value {
        Value::String(s) => keys_from_str(s, keys),
        Value::List(items) => {
            for v in items {
                collect_keys(v, keys);
            }
        }
        Value::Map(map) => {
            for (k, v) in map {
                keys_from_str(k, keys);
                collect_keys(v, keys);
            }
        }
        _ => {}
    }
}

fn keys_from_str(s: &str, keys: &mut Vec<String>) {
    let mut depth = 0;
    let mut current = String::new();
    let mut escaped = false;
    for ch in s.chars() {
        if escaped {
            escaped = false;
            if depth > 0 {
                current.push(ch);
            }
            continue;
        }
        if ch == ESCAPE {
            escaped = true;
            continue;
        }
        if ch == OPEN {
            depth += 1;
            if depth == 1 {
                current.clear();
                continue;
            }
        }
        if ch == CLOSE && depth > 0 {
            depth -= 1;
            if depth == 0 {
                keys.push(current.clone());
                continue;
            }
        }
        if depth > 0 {
            current.push(ch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(pairs: &[(&str, Value)]) -> InsertStore {
        let mut store = InsertStore::new();
        for (k, v) in pairs {
            store.set(*k, v.clone());
        }
        store
    }

    #[test]
    fn plain_text_passes_through() {
        let store = InsertStore::new();
        assert_eq!(interpolate(&store, "no inserts here").unwrap(), "no inserts here");
        assert_eq!(interpolate(&store, "").unwrap(), "");
    }

    #[test]
    fn single_key_expands() {
        let store = store_with(&[("name", Value::String("tom".into()))]);
        assert_eq!(interpolate(&store, "hi {name}").unwrap(), "hi tom");
    }

    #[test]
    fn nested_key_resolves_inner_first() {
        let store = store_with(&[
            ("i", Value::Int(3)),
            ("question-3", Value::String("color?".into())),
        ]);
        assert_eq!(interpolate(&store, "{question-{i}}").unwrap(), "color?");
    }

    #[test]
    fn list_value_is_empty_joined() {
        let store = store_with(&[(
            "xs",
            Value::List(vec![Value::Int(1), Value::String("-two".into())]),
        )]);
        assert_eq!(interpolate(&store, "<{xs}>").unwrap(), "<1-two>");
    }

    #[test]
    fn miss_is_recoverable_missing_key() {
        let store = InsertStore::new();
        let err = interpolate(&store, "hi {name}").unwrap_err();
        assert!(err.is_missing_key());
    }

    #[test]
    fn escaped_delimiters_survive_unchanged() {
        let store = store_with(&[("name", Value::String("tom".into()))]);
        assert_eq!(
            interpolate(&store, r"literal \{name\} and {name}").unwrap(),
            r"literal \{name\} and tom"
        );
    }

    #[test]
    fn inserted_text_is_not_rescanned() {
        let store = store_with(&[("a", Value::String("{b}".into()))]);
        assert_eq!(interpolate(&store, "{a}").unwrap(), "{b}");
    }

    #[test]
    fn unbalanced_open_is_parse_error() {
        let store = InsertStore::new();
        let err = interpolate(&store, "oops {key").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn stray_close_passes_through() {
        let store = InsertStore::new();
        assert_eq!(interpolate(&store, "a } b").unwrap(), "a } b");
    }

    #[test]
    fn interpolation_is_idempotent_on_expanded_strings() {
        let store = store_with(&[("name", Value::String("tom".into()))]);
        let once = interpolate(&store, "hi {name}, bye").unwrap();
        assert_eq!(interpolate(&store, &once).unwrap(), once);
    }

    #[test]
    fn escaped_strings_interpolate_to_themselves() {
        let store = InsertStore::new();
        for s in ["{key}", "nested {a{b}c}", "}{", r"already \{ escaped"] {
            assert_eq!(interpolate(&store, &escape(s)).unwrap(), escape(s));
        }
    }

    #[test]
    fn unescape_after_escape_is_identity() {
        for s in ["plain", "{key}", "a{b}c}d{", r"pre \{ escaped"] {
            assert_eq!(unescape_once(&escape(s)), s);
        }
    }

    #[test]
    fn simple_key_detection() {
        assert_eq!(simple_key("{name}"), Some("name".into()));
        assert_eq!(simple_key("{question-{i}}"), Some("question-{i}".into()));
        assert_eq!(simple_key("hi {name}"), None);
        assert_eq!(simple_key("{a}{b}"), None);
        assert_eq!(simple_key(r"\{name\}"), None);
        assert_eq!(simple_key("plain"), None);
    }

    #[test]
    fn resolve_keeps_structural_values() {
        let xs = Value::List(vec![Value::Int(1), Value::Int(2)]);
        let store = store_with(&[("xs", xs.clone())]);
        assert_eq!(resolve(&store, "{xs}").unwrap(), xs);
        assert_eq!(
            resolve(&store, "xs: {xs}").unwrap(),
            Value::String("xs: 12".into())
        );
    }

    #[test]
    fn resolve_deep_skips_match_commands() {
        let store = InsertStore::new();
        let mut task = ValueMap::new();
        task.insert("cmd".into(), Value::String("goto_map".into()));
        task.insert("text".into(), Value::String("{missing}".into()));
        // Untouched even though the key does not exist.
        let out = resolve_deep(&store, Value::Map(task.clone())).unwrap();
        assert_eq!(out, Value::Map(task));
    }

    #[test]
    fn resolve_deep_resolves_container_task_refs() {
        let mut subtask = ValueMap::new();
        subtask.insert("cmd".into(), Value::String("print".into()));
        subtask.insert("text".into(), Value::String("{later}".into()));
        let store = store_with(&[("body", Value::List(vec![Value::Map(subtask.clone())]))]);

        let mut task = ValueMap::new();
        task.insert("cmd".into(), Value::String("serial".into()));
        task.insert("tasks".into(), Value::String("{body}".into()));
        let out = resolve_deep(&store, Value::Map(task)).unwrap();
        let tasks = out.as_map().unwrap().get("tasks").unwrap();
        // The list resolved structurally; the sub-task's own fields did not
        // interpolate yet.
        assert_eq!(tasks, &Value::List(vec![Value::Map(subtask)]));
    }

    #[test]
    fn interpolate_task_expands_fields() {
        let store = store_with(&[("name", Value::String("tom".into()))]);
        let mut task = ValueMap::new();
        task.insert("cmd".into(), Value::String("print".into()));
        task.insert("text".into(), Value::String("hi {name}".into()));
        let out = interpolate_task(&store, &task).unwrap();
        assert_eq!(out.get("text").unwrap(), &Value::String("hi tom".into()));
    }

    #[test]
    fn extract_keys_sees_top_level_references() {
        let value = Value::String("a {x} b {q-{i}} c \\{not\\}".into());
        assert_eq!(extract_insert_keys(&value), vec!["x", "q-{i}"]);
    }
}
