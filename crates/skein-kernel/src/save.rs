//! Save-slot persistence by textual splicing.
//!
//! Save slots live at `save_states` in the program file itself. Persisting
//! re-reads the original JSON5 source and splices the serialized slot table
//! into the existing `save_states: { ... }` region (created before the final
//! closing brace when absent). Round-tripping the whole document through a
//! serializer would lose comments and formatting, so it is done as text.

use std::fs;
use std::path::Path;

use skein_types::{value_to_json, Error, Result, Value, ValueMap};

/// Replace (or create) the object value of `key` in a JSON5 document.
pub fn splice_object(content: &str, key: &str, new_value: &serde_json::Value) -> Result<String> {
    let pattern = format!(r#"(['"]?{key}['"]?)\s*:\s*\{{"#);
    let re = regex::Regex::new(&pattern).map_err(|e| Error::Parse(e.to_string()))?;
    let Some(mat) = re.find(content) else {
        return insert_object(content, key, new_value);
    };

    // The match ends on the opening brace; find its partner.
    let start_pos = mat.end() - 1;
    let mut brace_level = 1;
    let mut end_pos = None;
    for (i, ch) in content[start_pos + 1..].char_indices() {
        match ch {
            '{' => brace_level += 1,
            '}' => brace_level -= 1,
            _ => {}
        }
        if brace_level == 0 {
            end_pos = Some(start_pos + 1 + i);
            break;
        }
    }
    let end_pos =
        end_pos.ok_or_else(|| Error::Parse(format!("no closing brace for '{key}'")))?;

    let line_start = content[..mat.start()].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let key_indent = &content[line_start..mat.start()];

    let replacement = indented_object_body(new_value, key_indent)?;

    let mut out = String::with_capacity(content.len());
    out.push_str(&content[..start_pos + 1]);
    out.push_str(&replacement);
    out.push_str(&content[end_pos..]);
    Ok(out)
}

/// Create a `key: { ... }` entry before the document's final closing brace.
fn insert_object(content: &str, key: &str, new_value: &serde_json::Value) -> Result<String> {
    let close = content
        .rfind('}')
        .ok_or_else(|| Error::Parse("document has no closing brace".into()))?;
    let before = content[..close].trim_end();
    let needs_comma = !before.ends_with('{') && !before.ends_with(',');

    let indent = "  ";
    let body = indented_object_body(new_value, indent)?;
    let mut out = String::with_capacity(content.len());
    out.push_str(before);
    if needs_comma {
        out.push(',');
    }
    out.push_str(&format!("\n{indent}{key}: {{{body}}},\n"));
    out.push_str(&content[close..]);
    Ok(out)
}

/// Pretty-print the object's inner lines at the key's indentation, so the
/// spliced region reads like hand-written source.
fn indented_object_body(value: &serde_json::Value, key_indent: &str) -> Result<String> {
    let dumped = serde_json::to_string_pretty(value)?;
    let line_count = dumped.lines().count();
    if line_count <= 2 {
        // "{}" — an empty table.
        return Ok(String::new());
    }
    let inner_lines: Vec<&str> = dumped.lines().skip(1).take(line_count - 2).collect();
    let formatted: Vec<String> = inner_lines
        .into_iter()
        .map(|line| format!("{key_indent}{line}"))
        .collect();
    Ok(format!("\n{}\n{key_indent}", formatted.join("\n")))
}

/// Persist a slot table into the program file on disk.
pub fn write_save_states(program_path: &Path, save_states: &ValueMap) -> Result<()> {
    let raw = fs::read_to_string(program_path)?;
    let spliced = splice_object(
        &raw,
        "save_states",
        &value_to_json(&Value::Map(save_states.clone())),
    )?;
    fs::write(program_path, spliced)?;
    Ok(())
}
