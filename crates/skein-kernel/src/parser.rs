//! JSON5 program loading.
//!
//! Programs are JSON5 documents (comments, trailing commas, unquoted keys,
//! single- or double-quoted strings). Before parsing, a line-number pre-pass
//! injects a `line:` field next to every `cmd:` key so runtime diagnostics
//! can point at the offending source line. Escaped braces in string
//! literals pass through into in-memory strings unchanged.

use std::collections::HashMap;
use std::fs;

use regex::Regex;
use skein_types::{json_to_value, Error, Result, Value};

use crate::program::{LoadContext, Program, State, Task};

/// Load and shape a program file.
pub fn load_program(ctx: &LoadContext) -> Result<Program> {
    let raw = fs::read_to_string(&ctx.program_path)?;
    parse_program(&raw)
}

/// Parse program source text.
pub fn parse_program(raw: &str) -> Result<Program> {
    let annotated = annotate_lines(raw)?;
    let json: serde_json::Value =
        json5::from_str(&annotated).map_err(|e| Error::Parse(e.to_string()))?;
    let root = match json_to_value(json) {
        Value::Map(map) => map,
        _ => return Err(Error::Parse("program root must be a mapping".into())),
    };

    let order = match root.get("order") {
        Some(Value::List(items)) => items
            .iter()
            .map(as_task)
            .collect::<Result<Vec<_>>>()?,
        Some(_) => return Err(Error::Parse("program 'order' must be a list".into())),
        None => return Err(Error::Parse("program is missing the 'order' list".into())),
    };

    // `tasks` is accepted as an alias for `named_tasks`.
    let named_source = root.get("named_tasks").or_else(|| root.get("tasks"));
    let named_tasks = match named_source {
        Some(Value::Map(map)) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), as_task(v)?)))
            .collect::<Result<HashMap<_, _>>>()?,
        Some(_) => return Err(Error::Parse("program 'named_tasks' must be a mapping".into())),
        None => HashMap::new(),
    };

    let default_state = match root.get("default_state") {
        Some(Value::Map(map)) => State::from_value(map)?,
        Some(_) => return Err(Error::Parse("program 'default_state' must be a mapping".into())),
        None => State::new(),
    };

    let save_states = match root.get("save_states") {
        Some(Value::Map(map)) => map.clone(),
        Some(_) => return Err(Error::Parse("program 'save_states' must be a mapping".into())),
        None => Default::default(),
    };

    let completion_args = match root.get("completion_args") {
        Some(Value::Map(map)) => map.clone(),
        Some(_) => {
            return Err(Error::Parse("program 'completion_args' must be a mapping".into()))
        }
        None => Default::default(),
    };

    Ok(Program {
        order,
        named_tasks,
        default_state,
        save_states,
        completion_args,
    })
}

fn as_task(value: &Value) -> Result<Task> {
    value
        .as_map()
        .cloned()
        .ok_or_else(|| Error::Parse(format!("task must be a mapping, got {}", value.to_display())))
}

/// Inject `line:N` after every `cmd: "..."` pair, line by line.
///
/// Operating on source text keeps the JSON5 parser oblivious to the
/// annotation; a task authored with an explicit `line` key would be
/// clobbered, which is acceptable (the key is reserved).
fn annotate_lines(input: &str) -> Result<String> {
    let re = Regex::new(
        r#"(?P<key>\bcmd\b|"cmd"|'cmd')\s*:\s*(?P<val>"([^"\\]|\\.)*"|'([^'\\]|\\.)*')(?P<trail>\s*(?:,|\}))"#,
    )
    .map_err(|e| Error::Parse(e.to_string()))?;
    let mut out = String::with_capacity(input.len());
    for (i, line) in input.lines().enumerate() {
        let line_no = i + 1;
        let replaced = re.replace_all(line, |caps: &regex::Captures| {
            format!(
                "{}:{}, line:{}{}",
                &caps["key"], &caps["val"], line_no, &caps["trail"]
            )
        });
        out.push_str(&replaced);
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{task_cmd, task_line};

    #[test]
    fn parses_minimal_program() {
        let program = parse_program(
            r#"{
                // a comment survives json5
                default_state: { order_index: 1, inserts: { name: 'tom' } },
                order: [
                    { cmd: 'print', text: 'hi {name}' },
                ],
            }"#,
        )
        .unwrap();
        assert_eq!(program.order.len(), 1);
        assert_eq!(task_cmd(&program.order[0]), Some("print"));
        assert_eq!(
            program.default_state.inserts.get("name").unwrap(),
            Value::String("tom".into())
        );
    }

    #[test]
    fn tasks_are_annotated_with_source_lines() {
        let program = parse_program(
            "{\n  order: [\n    { cmd: 'clear' },\n    { cmd: 'print', text: 'x' },\n  ],\n}\n",
        )
        .unwrap();
        assert_eq!(task_line(&program.order[0]), Some(3));
        assert_eq!(task_line(&program.order[1]), Some(4));
    }

    #[test]
    fn tasks_key_aliases_named_tasks() {
        let program = parse_program(
            r#"{
                order: [],
                tasks: { greet: { cmd: 'print', text: 'hi' } },
            }"#,
        )
        .unwrap();
        assert!(program.named_tasks.contains_key("greet"));
    }

    #[test]
    fn escaped_braces_pass_through() {
        let program = parse_program(
            r#"{ order: [ { cmd: 'print', text: 'a \\{literal\\} brace' } ] }"#,
        )
        .unwrap();
        let text = program.order[0].get("text").unwrap().as_str().unwrap();
        assert_eq!(text, r"a \{literal\} brace");
    }

    #[test]
    fn missing_order_is_a_parse_error() {
        let err = parse_program("{ default_state: {} }").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn malformed_json5_is_a_parse_error() {
        assert!(matches!(parse_program("{ order: [ oops "), Err(Error::Parse(_))));
    }
}
