//! Static program validation.
//!
//! Runs after parsing and before execution. Collects every issue instead of
//! stopping at the first, then fails with a joined report. Checks:
//!
//! - every task has a known `cmd` and its required fields
//! - literal `goto` / `goto_map` targets resolve to a label
//! - `goto` / `goto_map` do not appear under `parallel_wait` / `parallel_race`
//! - `run_task` references an existing named task
//! - interpolation keys have at least one possible writer (default inserts,
//!   some task's `output_name`, a `for` binding, fallback files, startup
//!   arguments, or time keys)

use std::collections::HashSet;
use std::fs;

use skein_glob::wildcard_match;
use skein_types::{Error, Result, Value};

use crate::interp::extract_insert_keys;
use crate::program::{task_cmd, task_line, LoadContext, Program, Task};

#[derive(Debug)]
struct Diagnostic {
    message: String,
    line: Option<i64>,
}

pub fn analyze_program(program: &Program, ctx: &LoadContext) -> Result<()> {
    let mut diags = Vec::new();

    let insert_keys = collect_possible_insert_keys(program, ctx);
    let labels = collect_labels(program);
    let named: HashSet<&str> = program.named_tasks.keys().map(String::as_str).collect();

    for task in &program.order {
        check_task(task, &named, &insert_keys, &labels, false, &mut diags);
    }
    for task in program.named_tasks.values() {
        check_task(task, &named, &insert_keys, &labels, false, &mut diags);
    }

    if diags.is_empty() {
        Ok(())
    } else {
        let mut msg = String::new();
        for d in diags {
            let line = d.line.map(|l| format!("line {l}: ")).unwrap_or_default();
            msg.push_str(&format!(" - {line}{}\n", d.message));
        }
        Err(Error::Analyze(msg.trim_end().to_string()))
    }
}

fn check_task(
    task: &Task,
    named: &HashSet<&str>,
    insert_keys: &HashSet<String>,
    labels: &HashSet<String>,
    in_parallel: bool,
    diags: &mut Vec<Diagnostic>,
) {
    let Some(cmd) = task_cmd(task) else {
        diags.push(diag(task, "task is missing a 'cmd' string".into()));
        return;
    };

    match cmd {
        "print" => require_fields(task, &["text"], diags),
        "clear" => {}
        "sleep" => require_fields(task, &["seconds"], diags),
        "set" => require_fields(task, &["item", "output_name"], diags),
        "unescape" => require_fields(task, &["item", "output_name"], diags),
        "write" => require_fields(task, &["item", "path"], diags),
        "show_inserts" => {}
        "random_choice" => require_fields(task, &["list", "output_name"], diags),
        "join_list" => {
            require_fields(task, &["list", "before", "between", "after", "output_name"], diags)
        }
        "list_concat" => require_fields(task, &["lists", "output_name"], diags),
        "list_append" => require_fields(task, &["list", "item", "output_name"], diags),
        "list_remove" => require_fields(task, &["list", "item", "output_name"], diags),
        "list_index" => require_fields(task, &["list", "index", "output_name"], diags),
        "list_slice" => {
            require_fields(task, &["list", "from_index", "to_index", "output_name"], diags)
        }
        "user_input" => require_fields(task, &["prompt", "output_name"], diags),
        "user_choice" => require_fields(task, &["list", "description", "output_name"], diags),
        "await_insert" => require_fields(task, &["name"], diags),
        "label" => require_fields(task, &["name"], diags),
        "goto" => {
            require_fields(task, &["name"], diags);
            if in_parallel {
                diags.push(diag(task, "'goto' is not allowed inside parallel tasks".into()));
            }
            if let Some(target) = task.get("name").and_then(Value::as_str) {
                if target != "CONTINUE" && !target.contains('{') && !labels.contains(target) {
                    diags.push(diag(task, format!("goto target '{target}' not found")));
                }
            }
        }
        "goto_map" => {
            require_fields(task, &["text", "target_maps"], diags);
            if in_parallel {
                diags.push(diag(task, "'goto_map' is not allowed inside parallel tasks".into()));
            }
            check_target_maps(task, labels, diags);
        }
        "replace_map" => {
            require_fields(task, &["item", "output_name", "wildcard_maps"], diags);
            if let Some(maps) = task.get("wildcard_maps").and_then(Value::as_list) {
                for entry in maps {
                    check_single_entry(task, entry, "wildcard_maps", diags);
                }
            }
        }
        "for" => require_fields(task, &["name_list_map", "tasks"], diags),
        "serial" | "parallel_wait" | "parallel_race" => require_fields(task, &["tasks"], diags),
        "run_task" => {
            require_fields(task, &["task_name"], diags);
            if let Some(name) = task.get("task_name").and_then(Value::as_str) {
                if !name.contains('{') && !named.contains(name) {
                    diags.push(diag(task, format!("run_task references unknown task '{name}'")));
                }
            }
        }
        "delete" | "delete_except" => require_fields(task, &["wildcards"], diags),
        "math" => require_fields(task, &["input", "output_name"], diags),
        "chat" => require_fields(task, &["messages", "output_name"], diags),
        _ => diags.push(diag(task, format!("unknown cmd '{cmd}'"))),
    }

    check_insert_references(task, cmd, insert_keys, diags);

    // Recurse into sub-task lists; parallel poisons every level beneath it.
    let child_parallel = in_parallel || cmd.starts_with("parallel_");
    if let Some(Value::List(subtasks)) = task.get("tasks") {
        for sub in subtasks {
            if let Value::Map(sub) = sub {
                check_task(sub, named, insert_keys, labels, child_parallel, diags);
            }
        }
    }
}

fn check_target_maps(task: &Task, labels: &HashSet<String>, diags: &mut Vec<Diagnostic>) {
    let Some(maps) = task.get("target_maps").and_then(Value::as_list) else {
        return;
    };
    for entry in maps {
        let Some(obj) = check_single_entry(task, entry, "target_maps", diags) else {
            continue;
        };
        let (_, target) = obj.iter().next().unwrap();
        if let Some(target) = target.as_str() {
            if !target.contains('{') && target != "CONTINUE" && !labels.contains(target) {
                diags.push(diag(task, format!("goto_map target '{target}' not found")));
            }
        }
    }
}

fn check_single_entry<'a>(
    task: &Task,
    entry: &'a Value,
    field: &str,
    diags: &mut Vec<Diagnostic>,
) -> Option<&'a skein_types::ValueMap> {
    let Some(obj) = entry.as_map() else {
        diags.push(diag(task, format!("{field} entries must be mappings")));
        return None;
    };
    if obj.len() != 1 {
        diags.push(diag(task, format!("{field} entries must have exactly one key")));
        return None;
    }
    Some(obj)
}

/// Flag interpolation keys that no writer can ever define.
fn check_insert_references(
    task: &Task,
    cmd: &str,
    insert_keys: &HashSet<String>,
    diags: &mut Vec<Diagnostic>,
) {
    for (field, value) in task {
        if field == "tasks" {
            continue;
        }
        // Task-shaped data interpolates when it executes, not here.
        if value
            .as_list()
            .is_some_and(|items| items.iter().all(|v| v.as_map().is_some()))
        {
            continue;
        }
        if value
            .as_map()
            .is_some_and(|m| m.get("cmd").and_then(Value::as_str).is_some())
        {
            continue;
        }
        for key in extract_insert_keys(value) {
            let is_capture_ref =
                cmd == "replace_map" && !key.is_empty() && key.chars().all(|c| c.is_ascii_digit());
            if !is_possible_insert(&key, insert_keys) && !is_argument_key(&key) && !is_capture_ref {
                diags.push(diag(
                    task,
                    format!("interpolation key '{key}' will never be defined"),
                ));
            }
        }
    }
}

fn is_argument_key(key: &str) -> bool {
    key.starts_with("ARG") && key[3..].chars().all(|c| c.is_ascii_digit())
}

fn is_possible_insert(key: &str, insert_keys: &HashSet<String>) -> bool {
    if insert_keys.contains(key) {
        return true;
    }
    // Keys with nested groups are dynamic; give them the benefit of the doubt.
    if key.contains('{') {
        return true;
    }
    if key.contains('*') {
        return insert_keys
            .iter()
            .any(|k| wildcard_match(key, k) || wildcard_match(k, key));
    }
    false
}

/// Every key some part of the program can write: default-state inserts, time
/// keys, fallback files, every `output_name`, and every `for` binding.
fn collect_possible_insert_keys(program: &Program, ctx: &LoadContext) -> HashSet<String> {
    let mut keys = HashSet::new();
    for key in program.default_state.inserts.keys() {
        keys.insert(key);
    }
    keys.insert("HH:MM".to_string());
    keys.insert("HH:MM:SS".to_string());

    if let Some(dir) = ctx.inserts_dir.as_ref() {
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                keys.insert(name.trim_end_matches(".json5").to_string());
                keys.insert(name);
            }
        }
    }

    let mut stack: Vec<Task> = Vec::new();
    stack.extend(program.order.iter().cloned());
    stack.extend(program.named_tasks.values().cloned());
    while let Some(task) = stack.pop() {
        if let Some(output_name) = task.get("output_name").and_then(Value::as_str) {
            keys.insert(output_name.to_string());
        }
        if task_cmd(&task) == Some("for") {
            if let Some(Value::Map(map)) = task.get("name_list_map") {
                for name in map.keys() {
                    keys.insert(name.clone());
                }
            }
        }
        if let Some(Value::List(subtasks)) = task.get("tasks") {
            for sub in subtasks {
                if let Value::Map(sub) = sub {
                    stack.push(sub.clone());
                }
            }
        }
        if let Some(Value::Map(item)) = task.get("item") {
            stack.push(item.clone());
        }
    }

    keys
}

fn collect_labels(program: &Program) -> HashSet<String> {
    let mut labels = HashSet::new();
    let mut stack: Vec<Task> = Vec::new();
    stack.extend(program.order.iter().cloned());
    stack.extend(program.named_tasks.values().cloned());
    while let Some(task) = stack.pop() {
        if task_cmd(&task) == Some("label") {
            if let Some(name) = task.get("name").and_then(Value::as_str) {
                labels.insert(name.to_string());
            }
        }
        if let Some(Value::List(subtasks)) = task.get("tasks") {
            for sub in subtasks {
                if let Value::Map(sub) = sub {
                    stack.push(sub.clone());
                }
            }
        }
    }
    labels
}

fn require_fields(task: &Task, fields: &[&str], diags: &mut Vec<Diagnostic>) {
    for f in fields {
        if !task.contains_key(*f) {
            diags.push(diag(task, format!("missing required field '{f}'")));
        }
    }
}

fn diag(task: &Task, message: String) -> Diagnostic {
    Diagnostic {
        message,
        line: task_line(task),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_program;
    use std::path::PathBuf;

    fn ctx() -> LoadContext {
        LoadContext {
            program_path: PathBuf::from("/tmp/program.json5"),
            program_dir: PathBuf::from("/tmp"),
            inserts_dir: None,
        }
    }

    fn analyze(src: &str) -> Result<()> {
        let program = parse_program(src).unwrap();
        analyze_program(&program, &ctx())
    }

    #[test]
    fn accepts_well_formed_program() {
        analyze(
            r#"{
                default_state: { inserts: { name: 'tom' } },
                order: [
                    { cmd: 'label', name: '@top' },
                    { cmd: 'set', item: 1, output_name: 'n' },
                    { cmd: 'print', text: 'hi {name} {n}' },
                    { cmd: 'goto', name: '@top' },
                ],
            }"#,
        )
        .unwrap();
    }

    #[test]
    fn rejects_unknown_cmd() {
        let err = analyze(r#"{ order: [ { cmd: 'frobnicate' } ] }"#).unwrap_err();
        assert!(err.to_string().contains("unknown cmd"));
    }

    #[test]
    fn rejects_missing_required_field() {
        let err = analyze(r#"{ order: [ { cmd: 'print' } ] }"#).unwrap_err();
        assert!(err.to_string().contains("missing required field 'text'"));
    }

    #[test]
    fn rejects_unknown_goto_target_with_line() {
        let err = analyze("{\n  order: [\n    { cmd: 'goto', name: '@nowhere' },\n  ],\n}")
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("goto target '@nowhere' not found"));
        assert!(msg.contains("line 3"));
    }

    #[test]
    fn rejects_goto_under_parallel() {
        let err = analyze(
            r#"{
                order: [
                    { cmd: 'label', name: '@x' },
                    { cmd: 'parallel_wait', tasks: [
                        { cmd: 'serial', tasks: [
                            { cmd: 'goto', name: '@x' },
                        ] },
                    ] },
                ],
            }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("not allowed inside parallel"));
    }

    #[test]
    fn rejects_undefined_interpolation_key() {
        let err = analyze(r#"{ order: [ { cmd: 'print', text: '{never}' } ] }"#).unwrap_err();
        assert!(err.to_string().contains("'never' will never be defined"));
    }

    #[test]
    fn accepts_output_name_defined_keys_and_dynamic_keys() {
        analyze(
            r#"{
                default_state: { inserts: { i: 1, 'q-1': 'why?' } },
                order: [
                    { cmd: 'set', item: 'x', output_name: 'later' },
                    { cmd: 'print', text: '{later} {q-{i}} {HH:MM} {ARG1}' },
                ],
            }"#,
        )
        .unwrap();
    }

    #[test]
    fn accepts_replace_map_capture_refs() {
        analyze(
            r#"{
                default_state: { inserts: { x: 'Age 41' } },
                order: [
                    { cmd: 'replace_map', item: '{x}', output_name: 'age',
                      wildcard_maps: [ { 'Age *': '{1}' } ] },
                ],
            }"#,
        )
        .unwrap();
    }

    #[test]
    fn rejects_unknown_run_task() {
        let err = analyze(r#"{ order: [ { cmd: 'run_task', task_name: 'ghost' } ] }"#).unwrap_err();
        assert!(err.to_string().contains("unknown task 'ghost'"));
    }

    #[test]
    fn rejects_multi_key_target_map_entries() {
        let err = analyze(
            r#"{
                order: [
                    { cmd: 'label', name: '@a' },
                    { cmd: 'goto_map', text: 'x', target_maps: [ { a: '@a', b: '@a' } ] },
                ],
            }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("exactly one key"));
    }
}
