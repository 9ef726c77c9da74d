//! End-to-end interpreter tests: parse a program source, analyze it, run it
//! against a scripted prompt channel, and check the final output.

use std::path::PathBuf;
use std::sync::Arc;

use skein_kernel::{
    analyze_program, parse_program, LoadContext, Runner, ScriptedChannel,
};
use skein_types::{Error, Value};

fn test_ctx() -> LoadContext {
    LoadContext {
        program_path: PathBuf::from("/tmp/test-program.json5"),
        program_dir: PathBuf::from("/tmp"),
        inserts_dir: None,
    }
}

fn runner_for(src: &str, replies: &[&str], args: &[&str]) -> (Runner, Arc<ScriptedChannel>) {
    let ctx = test_ctx();
    let program = parse_program(src).expect("program should parse");
    analyze_program(&program, &ctx).expect("program should analyze");
    let channel = Arc::new(ScriptedChannel::new(replies.iter().copied()));
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    let runner = Runner::new(program, &ctx, channel.clone(), &args);
    (runner, channel)
}

async fn run_program(src: &str) -> String {
    let (runner, _) = runner_for(src, &[], &[]);
    runner.run().await.expect("program should succeed")
}

async fn run_with_replies(src: &str, replies: &[&str]) -> String {
    let (runner, _) = runner_for(src, replies, &[]);
    runner.run().await.expect("program should succeed")
}

async fn run_expecting_error(src: &str) -> Error {
    let (runner, _) = runner_for(src, &[], &[]);
    runner.run().await.expect_err("program should fail")
}

#[tokio::test]
async fn set_then_print_interpolates() {
    let out = run_program(
        r#"{
            order: [
                { cmd: 'set', item: 'tom', output_name: 'name' },
                { cmd: 'print', text: 'hi {name}' },
            ],
        }"#,
    )
    .await;
    assert_eq!(out, "hi tom");
}

#[tokio::test]
async fn nested_interpolation_resolves_inner_key_first() {
    let out = run_program(
        r#"{
            default_state: { inserts: { i: 3, 'q-3': 'color?' } },
            order: [
                { cmd: 'print', text: '{q-{i}}' },
            ],
        }"#,
    )
    .await;
    assert_eq!(out, "color?");
}

#[tokio::test]
async fn replace_map_back_references_captures() {
    let out = run_program(
        r#"{
            order: [
                { cmd: 'set', item: 'Age 41', output_name: 'x' },
                { cmd: 'replace_map', item: '{x}', output_name: 'age',
                  wildcard_maps: [ { 'Age *': '{1}' } ] },
                { cmd: 'print', text: '{age}' },
            ],
        }"#,
    )
    .await;
    assert_eq!(out, "41");
}

#[tokio::test]
async fn goto_map_jumps_to_matching_label() {
    let out = run_program(
        r#"{
            order: [
                { cmd: 'label', name: '@l' },
                { cmd: 'set', item: 1, output_name: 'n' },
                { cmd: 'goto_map', text: '{n}', target_maps: [ { '1': '@end' } ] },
                { cmd: 'label', name: '@end' },
                { cmd: 'print', text: 'done' },
            ],
        }"#,
    )
    .await;
    assert_eq!(out, "done");
}

#[tokio::test]
async fn goto_map_missing_key_takes_null_branch() {
    let out = run_program(
        r#"{
            order: [
                { cmd: 'goto_map', text: '{ARG7}', target_maps: [
                    { '1': '@one' },
                    { 'NULL': '@fallback' },
                ] },
                { cmd: 'label', name: '@one' },
                { cmd: 'label', name: '@fallback' },
                { cmd: 'print', text: 'fell back' },
            ],
        }"#,
    )
    .await;
    assert_eq!(out, "fell back");
}

#[tokio::test]
async fn math_command_evaluates_functions() {
    let out = run_program(
        r#"{
            default_state: { inserts: { xs: [10, 20] } },
            order: [
                { cmd: 'math', input: 'max(1,2,3)+length(xs)', output_name: 'r' },
                { cmd: 'print', text: '{r}' },
            ],
        }"#,
    )
    .await;
    assert_eq!(out, "5");
}

#[tokio::test]
async fn goto_within_serial_frame() {
    let out = run_program(
        r#"{
            order: [
                { cmd: 'serial', tasks: [
                    { cmd: 'goto', name: '@skip' },
                    { cmd: 'print', text: 'no ' },
                    { cmd: 'label', name: '@skip' },
                    { cmd: 'print', text: 'yes' },
                ] },
            ],
        }"#,
    )
    .await;
    assert_eq!(out, "yes");
}

#[tokio::test]
async fn goto_propagates_to_enclosing_frame() {
    let out = run_program(
        r#"{
            order: [
                { cmd: 'serial', tasks: [
                    { cmd: 'print', text: 'in ' },
                    { cmd: 'goto', name: '@out' },
                    { cmd: 'print', text: 'skipped ' },
                ] },
                { cmd: 'print', text: 'also skipped ' },
                { cmd: 'label', name: '@out' },
                { cmd: 'print', text: 'out' },
            ],
        }"#,
    )
    .await;
    assert_eq!(out, "in out");
}

#[tokio::test]
async fn goto_continue_falls_through() {
    let out = run_program(
        r#"{
            order: [
                { cmd: 'goto', name: 'CONTINUE' },
                { cmd: 'print', text: 'reached' },
            ],
        }"#,
    )
    .await;
    assert_eq!(out, "reached");
}

#[tokio::test]
async fn for_iterates_lists_in_lockstep() {
    let out = run_program(
        r#"{
            order: [
                { cmd: 'for',
                  name_list_map: { animal: ['cat', 'dog'], sound: ['meow', 'woof'] },
                  tasks: [
                    { cmd: 'print', text: '{animal} says {sound}. ' },
                  ] },
            ],
        }"#,
    )
    .await;
    assert_eq!(out, "cat says meow. dog says woof.");
}

#[tokio::test]
async fn for_rejects_unequal_lists() {
    let err = run_expecting_error(
        r#"{
            order: [
                { cmd: 'for',
                  name_list_map: { a: [1, 2], b: [1] },
                  tasks: [ { cmd: 'print', text: '{a}{b}' } ] },
            ],
        }"#,
    )
    .await;
    assert!(err.to_string().contains("differing lengths"));
}

#[tokio::test]
async fn run_task_merges_extra_fields() {
    let out = run_program(
        r#"{
            named_tasks: {
                announce: { cmd: 'print', text: 'default' },
            },
            order: [
                { cmd: 'run_task', task_name: 'announce', text: 'overridden' },
            ],
        }"#,
    )
    .await;
    assert_eq!(out, "overridden");
}

#[tokio::test]
async fn list_commands_compose() {
    let out = run_program(
        r#"{
            default_state: { inserts: { xs: [1, 2], ys: [3, 4, 5] } },
            order: [
                { cmd: 'list_concat', lists: ['{xs}', '{ys}'], output_name: 'all' },
                { cmd: 'list_append', list: '{all}', item: 6, output_name: 'all' },
                { cmd: 'list_remove', list: '{all}', item: 1, output_name: 'all' },
                { cmd: 'list_index', list: '{all}', index: -1, output_name: 'last' },
                { cmd: 'list_slice', list: '{all}', from_index: 1, to_index: 2, output_name: 'front' },
                { cmd: 'join_list', list: '{front}', before: '[', between: ',', after: ']', output_name: 'shown' },
                { cmd: 'print', text: '{shown} last={last}' },
            ],
        }"#,
    )
    .await;
    assert_eq!(out, "[2,3] last=6");
}

#[tokio::test]
async fn list_slice_empty_when_to_is_zero_or_inverted() {
    let out = run_program(
        r#"{
            default_state: { inserts: { xs: [1, 2, 3] } },
            order: [
                { cmd: 'list_slice', list: '{xs}', from_index: 1, to_index: 0, output_name: 'a' },
                { cmd: 'list_slice', list: '{xs}', from_index: 3, to_index: 2, output_name: 'b' },
                { cmd: 'list_slice', list: '{xs}', from_index: '1+1', to_index: '-1', output_name: 'c' },
                { cmd: 'print', text: 'a=({a}) b=({b}) c=({c})' },
            ],
        }"#,
    )
    .await;
    assert_eq!(out, "a=() b=() c=(23)");
}

#[tokio::test]
async fn list_index_out_of_range_is_index_error() {
    let err = run_expecting_error(
        r#"{
            default_state: { inserts: { xs: [1] } },
            order: [
                { cmd: 'list_index', list: '{xs}', index: 5, output_name: 'x' },
            ],
        }"#,
    )
    .await;
    let Error::Task { source, .. } = err else {
        panic!("expected a line-annotated failure");
    };
    assert!(matches!(*source, Error::Index(_)));
}

#[tokio::test]
async fn list_append_to_non_list_is_type_error() {
    let err = run_expecting_error(
        r#"{
            default_state: { inserts: { s: 'not a list' } },
            order: [
                { cmd: 'list_append', list: '{s}', item: 1, output_name: 'x' },
            ],
        }"#,
    )
    .await;
    let Error::Task { source, .. } = err else {
        panic!("expected a line-annotated failure");
    };
    assert!(matches!(*source, Error::Type(_)));
}

#[tokio::test]
async fn user_input_is_escaped_then_displays_unescaped() {
    let out = run_with_replies(
        r#"{
            order: [
                { cmd: 'user_input', prompt: 'say: ', output_name: 'reply' },
                { cmd: 'print', text: '{reply}' },
            ],
        }"#,
        &["curly {brace}"],
    )
    .await;
    // Stored escaped (so it never re-interpolates), shown unescaped.
    assert_eq!(out, "curly {brace}");
}

#[tokio::test]
async fn user_choice_stores_selected_element() {
    let out = run_with_replies(
        r#"{
            order: [
                { cmd: 'user_choice', list: ['red', 'green', 'blue'],
                  description: 'pick one', output_name: 'color' },
                { cmd: 'user_choice', list: ['red', 'green', 'blue'],
                  description: 'again', output_name: 'second' },
                { cmd: 'print', text: '{color}/{second}' },
            ],
        }"#,
        &["2", "blue"],
    )
    .await;
    assert_eq!(out, "green/blue");
}

#[tokio::test]
async fn unescape_command_reinterpolates() {
    let out = run_program(
        r#"{
            default_state: { inserts: { name: 'tom' } },
            order: [
                { cmd: 'set', item: '\\{name\\}', output_name: 'tpl' },
                { cmd: 'unescape', item: '{tpl}', output_name: 'expanded' },
                { cmd: 'print', text: '{expanded}' },
            ],
        }"#,
    )
    .await;
    assert_eq!(out, "tom");
}

#[tokio::test]
async fn delete_and_delete_except_respect_patterns() {
    let (runner, _) = runner_for(
        r#"{
            default_state: { inserts: {
                'chapter/1': 'a', 'chapter/2': 'b', name: 'tom', mood: 'calm',
            } },
            order: [
                { cmd: 'delete', wildcards: ['chapter/*'] },
                { cmd: 'delete_except', wildcards: ['na*'] },
            ],
        }"#,
        &[],
        &[],
    );
    runner.run().await.unwrap();
    let state = runner.snapshot().await;
    let keys = state.inserts.keys();
    assert_eq!(keys, vec!["name"]);
}

#[tokio::test]
async fn startup_arguments_are_escaped_inserts() {
    let (runner, _) = runner_for(
        r#"{
            order: [
                { cmd: 'print', text: 'got {ARG1} and {ARG2}' },
            ],
        }"#,
        &[],
        &["plain", "with {braces}"],
    );
    let out = runner.run().await.unwrap();
    assert_eq!(out, "got plain and with {braces}");
}

#[tokio::test]
async fn clear_resets_output() {
    let out = run_program(
        r#"{
            order: [
                { cmd: 'print', text: 'gone' },
                { cmd: 'clear' },
                { cmd: 'print', text: 'kept' },
            ],
        }"#,
    )
    .await;
    assert_eq!(out, "kept");
}

#[tokio::test]
async fn random_choice_picks_a_member() {
    let out = run_program(
        r#"{
            order: [
                { cmd: 'random_choice', list: ['x'], output_name: 'pick' },
                { cmd: 'print', text: '{pick}' },
            ],
        }"#,
    )
    .await;
    assert_eq!(out, "x");
}

#[tokio::test]
async fn order_index_lands_past_the_end() {
    let (runner, _) = runner_for(
        r#"{
            order: [
                { cmd: 'set', item: 1, output_name: 'a' },
                { cmd: 'set', item: 2, output_name: 'b' },
            ],
        }"#,
        &[],
        &[],
    );
    runner.run().await.unwrap();
    let state = runner.snapshot().await;
    assert_eq!(state.order_index, 3);
    assert!(state.cursors.is_empty());
}

#[tokio::test]
async fn failures_carry_the_source_line() {
    let err = run_expecting_error(
        "{\n  order: [\n    { cmd: 'set', item: 1, output_name: 'n' },\n    { cmd: 'math', input: '{n} / 0', output_name: 'r' },\n  ],\n}",
    )
    .await;
    let msg = err.to_string();
    assert!(msg.contains("Error at line 4"), "got: {msg}");
    assert!(msg.contains("division by zero"), "got: {msg}");
}

#[tokio::test]
async fn screen_tracks_printed_output() {
    let (runner, channel) = runner_for(
        r#"{
            order: [
                { cmd: 'print', text: 'one ' },
                { cmd: 'print', text: 'two' },
            ],
        }"#,
        &[],
        &[],
    );
    runner.run().await.unwrap();
    assert_eq!(channel.screen(), "one two");
}

#[tokio::test]
async fn set_keeps_structural_values() {
    let (runner, _) = runner_for(
        r#"{
            default_state: { inserts: { xs: [1, 2] } },
            order: [
                { cmd: 'set', item: '{xs}', output_name: 'copy' },
                { cmd: 'set', item: { nested: true }, output_name: 'obj' },
            ],
        }"#,
        &[],
        &[],
    );
    runner.run().await.unwrap();
    let state = runner.snapshot().await;
    assert_eq!(
        state.inserts.get("copy").unwrap(),
        Value::List(vec![Value::Int(1), Value::Int(2)])
    );
    assert!(matches!(state.inserts.get("obj").unwrap(), Value::Map(_)));
}
