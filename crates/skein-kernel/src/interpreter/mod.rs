//! The task interpreter.
//!
//! A [`Runner`] owns a parsed program and drives its `order` list to
//! completion. Each task list runs as a *frame*: a precomputed label map
//! plus a cursor persisted in `state.cursors` under the frame's path, so a
//! saved state can resume mid-frame. Composite commands (`serial`, `for`,
//! `run_task`, `parallel_wait`, `parallel_race`) open sub-frames.
//!
//! Jump scoping: a `goto` that misses the current frame's label map
//! propagates outward until some enclosing frame resolves it. Parallel
//! combinators never resolve jumps — `goto`/`goto_map` anywhere beneath one
//! is a fatal error — and an unresolved jump at the top frame is a name
//! error.
//!
//! Concurrency is cooperative: tasks suspend at `sleep`, prompts,
//! `await_insert`, `chat`, and sibling boundaries inside `parallel_*`.
//! Cancellation flows down a [`CancellationToken`] tree: `parallel_race`
//! cancels losers, `parallel_wait` cancels siblings on first failure, and a
//! cancelled task surfaces the dedicated `Cancelled` error at its next
//! suspension point.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_recursion::async_recursion;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use skein_glob::{wildcard_captures, wildcard_match};
use skein_types::{value_to_json, Error, Result, Value, ValueMap};
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::{self, ChatArgs, DEFAULT_API_KEY, DEFAULT_API_URL};
use crate::interp::{
    escape, interpolate, interpolate_task, resolve_deep, simple_key, unescape_once, unescape_value,
};
use crate::math::eval_math;
use crate::program::{
    field_list, field_str, field_tasks, task_cmd, task_line, LoadContext, Program, State, Task,
};
use crate::prompt::PromptChannel;
use crate::save::write_save_states;
use crate::store::InsertStore;

/// Retries for a chat call that returned fewer outputs than requested.
const CHAT_RETRY_LIMIT: i64 = 5;

/// Passes before `replace_map { repeat_until_done: true }` gives up.
const REPLACE_MAP_PASS_CAP: usize = 1000;

const AWAIT_INSERT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug)]
enum Outcome {
    Advance,
    Jump(String),
}

/// Executes one program against one prompt channel.
pub struct Runner {
    order: Arc<Vec<Task>>,
    named_tasks: Arc<HashMap<String, Task>>,
    completion_args: ValueMap,
    save_states: StdMutex<ValueMap>,
    program_path: PathBuf,
    program_dir: PathBuf,
    state: Arc<Mutex<State>>,
    io: Arc<dyn PromptChannel>,
    root_token: CancellationToken,
    pause: Arc<watch::Sender<bool>>,
    paused: watch::Receiver<bool>,
}

/// Pause/resume/terminate surface for an embedding UI.
///
/// Pausing takes effect at the next task boundary; save and load are only
/// meaningful while paused.
#[derive(Clone)]
pub struct ControlHandle {
    pause: Arc<watch::Sender<bool>>,
    token: CancellationToken,
}

impl ControlHandle {
    pub fn pause(&self) {
        let _ = self.pause.send(true);
    }

    pub fn resume(&self) {
        let _ = self.pause.send(false);
    }

    /// Terminate the run; the runner returns its output so far.
    pub fn terminate(&self) {
        self.token.cancel();
    }
}

impl Runner {
    /// Build a runner. `args` become the escaped `ARG1`, `ARG2`, ...
    /// inserts.
    pub fn new(
        program: Program,
        ctx: &LoadContext,
        io: Arc<dyn PromptChannel>,
        args: &[String],
    ) -> Self {
        let mut state = program.default_state;
        state.inserts.set_fallback_dir(ctx.inserts_dir.clone());
        if state.order_index < 1 {
            state.order_index = 1;
        }
        for (i, arg) in args.iter().enumerate() {
            state
                .inserts
                .set(format!("ARG{}", i + 1), Value::String(escape(arg)));
        }
        let (pause, paused) = watch::channel(false);
        Self {
            order: Arc::new(program.order),
            named_tasks: Arc::new(program.named_tasks),
            completion_args: program.completion_args,
            save_states: StdMutex::new(program.save_states),
            program_path: ctx.program_path.clone(),
            program_dir: ctx.program_dir.clone(),
            state: Arc::new(Mutex::new(state)),
            io,
            root_token: CancellationToken::new(),
            pause: Arc::new(pause),
            paused,
        }
    }

    pub fn control(&self) -> ControlHandle {
        ControlHandle {
            pause: self.pause.clone(),
            token: self.root_token.clone(),
        }
    }

    /// A deep copy of the current state (take while paused to save).
    pub async fn snapshot(&self) -> State {
        self.state.lock().await.clone()
    }

    /// Record the current state into a save slot and persist it into the
    /// program file. Slots are `1..=10`.
    pub async fn save_slot(&self, slot: usize, label: &str) -> Result<()> {
        if !(1..=10).contains(&slot) {
            return Err(Error::Name(format!("save slot {slot} is out of range")));
        }
        let state = self.snapshot().await;
        let Value::Map(mut slot_value) = state.to_value() else {
            unreachable!("state serializes to a mapping");
        };
        slot_value.insert("label".into(), Value::String(label.to_string()));
        let slots = {
            let mut slots = self.save_states.lock().unwrap();
            slots.insert(slot.to_string(), Value::Map(slot_value));
            slots.clone()
        };
        write_save_states(&self.program_path, &slots)?;
        info!(slot, label, "saved state");
        Ok(())
    }

    /// Restore a save slot into the live state.
    pub async fn load_slot(&self, slot: usize) -> Result<()> {
        let stored = {
            let slots = self.save_states.lock().unwrap();
            slots.get(&slot.to_string()).cloned()
        };
        let Some(Value::Map(map)) = stored else {
            return Err(Error::Name(format!("save slot {slot} is empty")));
        };
        let mut restored = State::from_value(&map)?;
        let fallback = {
            let st = self.state.lock().await;
            st.inserts.fallback_dir().map(Path::to_path_buf)
        };
        restored.inserts.set_fallback_dir(fallback);
        let output = restored.output.clone();
        *self.state.lock().await = restored;
        self.io.set_screen(&output).await;
        info!(slot, "loaded state");
        Ok(())
    }

    /// Drive the top frame to completion and return the final output
    /// buffer (trimmed). A user-initiated termination is a normal return.
    pub async fn run(&self) -> Result<String> {
        let labels = label_map(&self.order);
        let output = self.state.lock().await.output.clone();
        self.io.set_screen(&output).await;

        loop {
            self.wait_if_paused().await;
            if self.root_token.is_cancelled() {
                break;
            }
            let index = self.state.lock().await.order_index.max(1);
            if index > self.order.len() as i64 {
                break;
            }
            let task = self.order[(index - 1) as usize].clone();
            let line = task_line(&task);
            let path = format!("order/{}", frame_label(&task, index as usize));

            let outcome = self
                .execute_task(task, path, self.root_token.child_token(), false)
                .await;
            match outcome {
                Ok(Outcome::Advance) => {
                    self.state.lock().await.order_index = index + 1;
                }
                Ok(Outcome::Jump(name)) => match labels.get(&name) {
                    Some(&idx) => {
                        self.state.lock().await.order_index = idx as i64 + 2;
                    }
                    None => {
                        return Err(
                            Error::Name(format!("label '{name}' not found")).at_line(line)
                        )
                    }
                },
                Err(e) if e.is_cancelled() && self.root_token.is_cancelled() => {
                    info!("terminated by user");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let output = self.state.lock().await.output.trim().to_string();
        Ok(output)
    }

    async fn wait_if_paused(&self) {
        let mut rx = self.paused.clone();
        let _ = rx.wait_for(|paused| !*paused).await;
    }

    async fn set_insert(&self, name: &str, value: Value) {
        self.state.lock().await.inserts.set(name, value);
    }

    async fn cursor(&self, key: &str) -> i64 {
        self.state.lock().await.cursors.get(key).copied().unwrap_or(1)
    }

    async fn set_cursor(&self, key: &str, value: i64) {
        self.state.lock().await.cursors.insert(key.to_string(), value);
    }

    async fn remove_cursor(&self, key: &str) {
        self.state.lock().await.cursors.shift_remove(key);
    }

    /// Drop every cursor at or beneath `prefix` (losers of a race must not
    /// leave mid-frame positions behind).
    async fn clear_cursors_under(&self, prefix: &str) {
        let nested = format!("{prefix}/");
        let mut st = self.state.lock().await;
        st.cursors
            .retain(|k, _| k != prefix && !k.starts_with(&nested));
    }

    /// Race a prompt (or other suspension) against cancellation.
    async fn cancellable<T>(
        &self,
        token: &CancellationToken,
        fut: impl std::future::Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        tokio::select! {
            res = fut => res,
            _ = token.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Run one task list as a frame.
    #[async_recursion]
    async fn run_list(
        &self,
        tasks: &[Task],
        path: &str,
        token: &CancellationToken,
        in_parallel: bool,
    ) -> Result<Outcome> {
        let labels = label_map(tasks);
        let mut cursor = self.cursor(path).await.max(1);
        while cursor <= tasks.len() as i64 {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let subtask = tasks[(cursor - 1) as usize].clone();
            let child_path = format!("{path}/{}", frame_label(&subtask, cursor as usize));
            let outcome = self
                .execute_task(subtask, child_path, token.child_token(), in_parallel)
                .await?;
            match outcome {
                Outcome::Advance => cursor += 1,
                Outcome::Jump(name) => match labels.get(&name) {
                    Some(&idx) => cursor = idx as i64 + 2,
                    None => {
                        // Not ours; the enclosing frame gets a shot.
                        self.remove_cursor(path).await;
                        return Ok(Outcome::Jump(name));
                    }
                },
            }
            self.set_cursor(path, cursor).await;
        }
        self.remove_cursor(path).await;
        Ok(Outcome::Advance)
    }

    #[async_recursion]
    async fn execute_task(
        &self,
        task: Task,
        path: String,
        token: CancellationToken,
        in_parallel: bool,
    ) -> Result<Outcome> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.wait_if_paused().await;

        let line = task_line(&task);
        let snapshot = self.state.lock().await.inserts.clone();
        self.dispatch(task, &snapshot, &path, &token, in_parallel)
            .await
            .map_err(|e| e.at_line(line))
    }

    async fn dispatch(
        &self,
        task: Task,
        snapshot: &InsertStore,
        path: &str,
        token: &CancellationToken,
        in_parallel: bool,
    ) -> Result<Outcome> {
        let task = interpolate_task(snapshot, &task)?;
        let cmd = task_cmd(&task)
            .ok_or_else(|| Error::Type("task is missing a 'cmd' string".into()))?
            .to_string();
        debug!(cmd = %cmd, path = %path, "task start");

        match cmd.as_str() {
            "print" => {
                let text = field_str(&task, "text")?;
                let shown = unescape_once(&text);
                self.state.lock().await.output.push_str(&shown);
                self.io.write(&shown).await;
            }
            "clear" => {
                self.state.lock().await.output.clear();
                self.io.clear().await;
            }
            "sleep" => {
                let seconds = match task.get("seconds") {
                    Some(Value::String(s)) => eval_math(snapshot, s)? as f64,
                    Some(v) => v.as_f64().ok_or_else(|| {
                        Error::Type("sleep seconds must be a number or a math expression".into())
                    })?,
                    None => return Err(Error::Type("sleep is missing 'seconds'".into())),
                };
                tokio::select! {
                    _ = sleep(Duration::from_secs_f64(seconds.max(0.0))) => {}
                    _ = token.cancelled() => return Err(Error::Cancelled),
                }
            }
            "set" => {
                let item = task.get("item").cloned().unwrap_or(Value::Null);
                let output_name = field_str(&task, "output_name")?;
                self.set_insert(&output_name, item).await;
            }
            "unescape" => {
                let item = task.get("item").cloned().unwrap_or(Value::Null);
                let output_name = field_str(&task, "output_name")?;
                // One level of escaping comes off, then the uncovered
                // groups interpolate.
                let result = resolve_deep(snapshot, unescape_value(item))?;
                self.set_insert(&output_name, result).await;
            }
            "show_inserts" => {
                let entries = self.state.lock().await.inserts.entries().clone();
                let text = serde_json::to_string_pretty(&value_to_json(&Value::Map(entries)))?;
                let dismiss = vec!["Dismiss".to_string()];
                let _ = self
                    .cancellable(token, self.io.user_choice(&text, &dismiss))
                    .await?;
            }
            "random_choice" => {
                let list = field_list(&task, "list")?;
                let output_name = field_str(&task, "output_name")?;
                if list.is_empty() {
                    return Err(Error::Type("random_choice list is empty".into()));
                }
                let idx = rand::thread_rng().gen_range(0..list.len());
                info!(output_name = %output_name, index = idx, "random choice");
                self.set_insert(&output_name, list[idx].clone()).await;
            }
            "join_list" => {
                let list = field_list(&task, "list")?;
                let before = field_str(&task, "before")?;
                let between = field_str(&task, "between")?;
                let after = field_str(&task, "after")?;
                let output_name = field_str(&task, "output_name")?;
                let joined = format!(
                    "{before}{}{after}",
                    list.iter()
                        .map(Value::to_display)
                        .collect::<Vec<_>>()
                        .join(&between)
                );
                self.set_insert(&output_name, Value::String(joined)).await;
            }
            "list_concat" => {
                let lists = field_list(&task, "lists")?;
                let output_name = field_str(&task, "output_name")?;
                let mut out = Vec::new();
                for list in lists {
                    let items = list
                        .as_list()
                        .ok_or_else(|| Error::Type("list_concat expects a list of lists".into()))?;
                    out.extend(items.to_vec());
                }
                self.set_insert(&output_name, Value::List(out)).await;
            }
            "list_append" => {
                let mut list = field_list(&task, "list")?;
                let item = task.get("item").cloned().unwrap_or(Value::Null);
                let output_name = field_str(&task, "output_name")?;
                list.push(item);
                self.set_insert(&output_name, Value::List(list)).await;
            }
            "list_remove" => {
                let mut list = field_list(&task, "list")?;
                let item = task.get("item").cloned().unwrap_or(Value::Null);
                let output_name = field_str(&task, "output_name")?;
                if let Some(pos) = list.iter().position(|v| *v == item) {
                    list.remove(pos);
                }
                self.set_insert(&output_name, Value::List(list)).await;
            }
            "list_index" => {
                let list = field_list(&task, "list")?;
                let output_name = field_str(&task, "output_name")?;
                let pos = resolve_index(task.get("index"), snapshot, list.len())?;
                self.set_insert(&output_name, list[pos].clone()).await;
            }
            "list_slice" => {
                let list = field_list(&task, "list")?;
                let output_name = field_str(&task, "output_name")?;
                let from = slice_bound(task.get("from_index"), snapshot)?;
                let to = slice_bound(task.get("to_index"), snapshot)?;
                let slice = slice_list(&list, from, to);
                self.set_insert(&output_name, Value::List(slice)).await;
            }
            "user_input" => {
                let prompt = field_str(&task, "prompt")?;
                let output_name = field_str(&task, "output_name")?;
                let input = self
                    .cancellable(token, self.io.user_input(&prompt))
                    .await?;
                info!(output_name = %output_name, "user input stored");
                self.set_insert(&output_name, Value::String(escape(&input)))
                    .await;
            }
            "user_choice" => {
                let list = field_list(&task, "list")?;
                let description = field_str(&task, "description")?;
                let output_name = field_str(&task, "output_name")?;
                let options: Vec<String> = list.iter().map(Value::to_display).collect();
                // An empty option list never resolves; only cancellation
                // ends it.
                let idx = self
                    .cancellable(token, self.io.user_choice(&description, &options))
                    .await?;
                let choice = list
                    .get(idx)
                    .cloned()
                    .ok_or_else(|| Error::Index("choice index out of bounds".into()))?;
                info!(output_name = %output_name, index = idx, "user choice stored");
                self.set_insert(&output_name, choice).await;
            }
            "await_insert" => {
                let name = field_str(&task, "name")?;
                loop {
                    if token.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    if self.state.lock().await.inserts.contains(&name) {
                        break;
                    }
                    sleep(AWAIT_INSERT_POLL).await;
                }
            }
            "label" => {}
            "goto" => {
                let target = field_str(&task, "name")?;
                if target != "CONTINUE" {
                    if in_parallel {
                        return Err(Error::Name(
                            "'goto' is not allowed inside parallel tasks".into(),
                        ));
                    }
                    info!(label = %target, "goto");
                    return Ok(Outcome::Jump(target));
                }
            }
            "goto_map" => {
                // This task arrives uninterpolated so the subject's failure
                // can become the NULL sentinel.
                return self.goto_map(&task, snapshot, in_parallel).await;
            }
            "replace_map" => {
                let item = task.get("item").cloned().unwrap_or(Value::Null);
                let output_name = field_str(&task, "output_name")?;
                let maps = field_list(&task, "wildcard_maps")?;
                let repeat = match task.get("repeat_until_done") {
                    Some(Value::Bool(b)) => *b,
                    Some(Value::String(s)) => s == "true",
                    _ => false,
                };
                let result = replace_map_value(snapshot, item, &maps, repeat)?;
                self.set_insert(&output_name, result).await;
            }
            "for" => {
                return self.for_loop(&task, snapshot, path, token, in_parallel).await;
            }
            "serial" => {
                let tasks = field_tasks(&task, "tasks")?;
                return self.run_list(&tasks, path, token, in_parallel).await;
            }
            "parallel_wait" => {
                let tasks = field_tasks(&task, "tasks")?;
                let group = token.child_token();
                let mut children = FuturesUnordered::new();
                for (i, t) in tasks.into_iter().enumerate() {
                    let child_path = format!("{path}/{}", frame_label(&t, i + 1));
                    children.push(self.execute_task(t, child_path, group.child_token(), true));
                }
                let mut first_err: Option<Error> = None;
                while let Some(res) = children.next().await {
                    if let Err(e) = res {
                        if first_err.is_none() {
                            // First failure wins; the rest get cancelled.
                            group.cancel();
                            first_err = Some(e);
                        }
                    }
                }
                if let Some(e) = first_err {
                    return Err(e);
                }
            }
            "parallel_race" => {
                let tasks = field_tasks(&task, "tasks")?;
                let group = token.child_token();
                let mut children = FuturesUnordered::new();
                for (i, t) in tasks.into_iter().enumerate() {
                    let child_path = format!("{path}/{}", frame_label(&t, i + 1));
                    children.push(self.execute_task(t, child_path, group.child_token(), true));
                }
                let winner = children.next().await;
                group.cancel();
                while children.next().await.is_some() {}
                // Interrupted frames must not resume mid-task later.
                self.clear_cursors_under(path).await;
                if let Some(Err(e)) = winner {
                    return Err(e);
                }
            }
            "run_task" => {
                let name = field_str(&task, "task_name")?;
                let mut subtask = self
                    .named_tasks
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| Error::Name(format!("unknown task '{name}'")))?;
                // Extra fields on the invocation shallow-merge into the
                // invoked task.
                for (k, v) in &task {
                    if matches!(k.as_str(), "cmd" | "task_name" | "line" | "traceback_label") {
                        continue;
                    }
                    subtask.insert(k.clone(), v.clone());
                }
                return self
                    .execute_task(
                        subtask,
                        format!("{path}/{name}"),
                        token.child_token(),
                        in_parallel,
                    )
                    .await;
            }
            "delete" => {
                let patterns = pattern_list(&task)?;
                let removed = self.state.lock().await.inserts.delete_matching(&patterns);
                info!(count = removed.len(), "delete");
            }
            "delete_except" => {
                let patterns = pattern_list(&task)?;
                let removed = self.state.lock().await.inserts.retain_matching(&patterns);
                info!(count = removed.len(), "delete_except");
            }
            "math" => {
                let input = field_str(&task, "input")?;
                let output_name = field_str(&task, "output_name")?;
                let result = eval_math(snapshot, &input)?;
                info!(input = %input, result, "math");
                self.set_insert(&output_name, Value::Int(result)).await;
            }
            "write" => {
                let item = task.get("item").cloned().unwrap_or(Value::Null);
                let path_str = field_str(&task, "path")?;
                let resolved = resolve_program_path(&self.program_dir, &path_str);
                let parent = resolved.parent().unwrap_or_else(|| Path::new("."));
                if !parent.is_dir() {
                    return Err(Error::Type(format!(
                        "write path '{}' is not inside an existing directory",
                        resolved.display()
                    )));
                }
                if resolved.is_dir() {
                    return Err(Error::Type(format!(
                        "write path '{}' is a directory",
                        resolved.display()
                    )));
                }
                let content = match unescape_value(item) {
                    Value::String(s) => s,
                    v @ (Value::List(_) | Value::Map(_) | Value::Null) => {
                        serde_json::to_string(&value_to_json(&v))?
                    }
                    v => v.to_display(),
                };
                let bytes = content.len();
                fs::write(&resolved, &content)?;
                info!(path = %resolved.display(), bytes, "write");
            }
            "chat" => {
                return self.chat(&task, snapshot, token).await;
            }
            other => return Err(Error::Name(format!("unknown cmd '{other}'"))),
        }

        Ok(Outcome::Advance)
    }

    async fn goto_map(
        &self,
        task: &Task,
        snapshot: &InsertStore,
        in_parallel: bool,
    ) -> Result<Outcome> {
        let raw_text = field_str(task, "text")?;
        let target_maps = field_list(task, "target_maps")?;

        // A lookup miss becomes the NULL sentinel (distinct from the string
        // "NULL": the sentinel matches only the literal pattern NULL).
        let subject = match interpolate(snapshot, &raw_text) {
            Ok(text) => Some(text),
            Err(e) if e.is_missing_key() => None,
            Err(e) => return Err(e),
        };

        let mut target = None;
        for entry in &target_maps {
            let obj = entry
                .as_map()
                .ok_or_else(|| Error::Type("target_maps entries must be mappings".into()))?;
            let (key, value) = obj
                .iter()
                .next()
                .ok_or_else(|| Error::Type("target_maps entries must not be empty".into()))?;
            let template = value
                .as_str()
                .ok_or_else(|| Error::Type("goto_map targets must be strings".into()))?;
            let pattern = interpolate(snapshot, key)?;
            let matched = match &subject {
                Some(text) => wildcard_match(&pattern, text),
                None => pattern == "NULL",
            };
            if matched {
                target = Some(interpolate(snapshot, template)?);
                break;
            }
        }

        let shown = subject.as_deref().unwrap_or("NULL");
        let target = target
            .ok_or_else(|| Error::Name(format!("goto_map has no match for '{shown}'")))?;
        info!(value = %shown, label = %target, "goto_map");
        if target != "CONTINUE" {
            if in_parallel {
                return Err(Error::Name(
                    "'goto_map' is not allowed inside parallel tasks".into(),
                ));
            }
            return Ok(Outcome::Jump(target));
        }
        Ok(Outcome::Advance)
    }

    async fn for_loop(
        &self,
        task: &Task,
        snapshot: &InsertStore,
        path: &str,
        token: &CancellationToken,
        in_parallel: bool,
    ) -> Result<Outcome> {
        let name_map = task
            .get("name_list_map")
            .and_then(Value::as_map)
            .cloned()
            .ok_or_else(|| Error::Type("for name_list_map must be a mapping".into()))?;
        let tasks = field_tasks(task, "tasks")?;

        let mut names = Vec::new();
        let mut lists = Vec::new();
        for (name, value) in &name_map {
            let resolved = resolve_deep(snapshot, value.clone())?;
            let list = resolved
                .as_list()
                .ok_or_else(|| Error::Type(format!("for binding '{name}' must be a list")))?
                .to_vec();
            names.push(name.clone());
            lists.push(list);
        }
        let len = lists.first().map(|l| l.len()).unwrap_or(0);
        if lists.iter().any(|l| l.len() != len) {
            return Err(Error::Type("for lists have differing lengths".into()));
        }

        let counter_key = format!("{path}#counter");
        let body_path = format!("{path}/body");
        let mut counter = self.cursor(&counter_key).await;
        while counter <= len as i64 {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            for (name, list) in names.iter().zip(&lists) {
                self.set_insert(name, list[(counter - 1) as usize].clone())
                    .await;
            }
            debug!(iteration = counter, "for iteration");
            match self.run_list(&tasks, &body_path, token, in_parallel).await? {
                Outcome::Advance => {}
                Outcome::Jump(name) => {
                    // Jumping out of the body ends the loop.
                    self.remove_cursor(&counter_key).await;
                    return Ok(Outcome::Jump(name));
                }
            }
            counter += 1;
            self.set_cursor(&counter_key, counter).await;
        }
        self.remove_cursor(&counter_key).await;
        Ok(Outcome::Advance)
    }

    async fn chat(
        &self,
        task: &Task,
        snapshot: &InsertStore,
        token: &CancellationToken,
    ) -> Result<Outcome> {
        let output_name = field_str(task, "output_name")?;
        let messages_value = task.get("messages").cloned().unwrap_or(Value::Null);

        // Program-level completion args, task fields on top.
        let mut completion = self.completion_args.clone();
        let mut extra_body = completion
            .get("extra_body")
            .and_then(Value::as_map)
            .cloned()
            .unwrap_or_default();
        if let Some(Value::Map(task_extra)) = task.get("extra_body") {
            for (k, v) in task_extra {
                extra_body.insert(k.clone(), v.clone());
            }
        }
        for (k, v) in task {
            if matches!(
                k.as_str(),
                "cmd" | "messages" | "output_name" | "extra_body" | "line" | "traceback_label"
            ) {
                continue;
            }
            completion.insert(k.clone(), v.clone());
        }
        completion.shift_remove("extra_body");
        completion.shift_remove("line");
        completion.shift_remove("traceback_label");

        let start_str = take_string(&mut completion, "start_str");
        let stop_str = take_string(&mut completion, "stop_str");
        let hide_start_str = take_string(&mut completion, "hide_start_str");
        let hide_stop_str = take_string(&mut completion, "hide_stop_str");
        let n_outputs = match completion.shift_remove("n_outputs") {
            Some(Value::Int(i)) => i,
            Some(Value::String(s)) => s.parse().unwrap_or(1),
            _ => 1,
        };
        let shown = match completion.shift_remove("shown") {
            Some(Value::Bool(b)) => b,
            Some(Value::String(s)) if s == "false" => false,
            Some(Value::String(s)) if s == "true" => true,
            _ => true,
        };
        let api_url = match completion.shift_remove("api_url") {
            Some(Value::String(s)) if !s.is_empty() => s,
            _ => DEFAULT_API_URL.to_string(),
        };
        let api_key = match completion.shift_remove("api_key") {
            Some(Value::String(s)) if !s.is_empty() => s,
            _ => DEFAULT_API_KEY.to_string(),
        };

        let messages = chat_messages(snapshot, messages_value)?;
        let args = ChatArgs {
            messages,
            completion_args: completion,
            start_str,
            stop_str,
            hide_start_str,
            hide_stop_str,
            n_outputs,
            shown,
            extra_body,
            api_url,
            api_key,
        };

        info!(output_name = %output_name, messages = args.messages.len(), "chat start");

        let mut attempts = 0;
        let result = loop {
            attempts += 1;
            let io = self.io.clone();
            let mut on_text = move |text: &str| {
                let io = io.clone();
                let text = text.to_string();
                tokio::spawn(async move {
                    io.write(&text).await;
                });
            };
            let result = self
                .cancellable(token, chat::run_chat(&args, Some(&mut on_text)))
                .await;
            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    warn!(output_name = %output_name, error = %e, "chat failed");
                    return Err(e);
                }
            };
            if (result.outputs.len() as i64) < args.n_outputs {
                if attempts >= CHAT_RETRY_LIMIT {
                    return Err(Error::Transport(format!(
                        "expected {} chat outputs, got {} after {attempts} attempts",
                        args.n_outputs,
                        result.outputs.len()
                    )));
                }
                self.io
                    .write(&format!(
                        "\n(Expected {} outputs, got {}. Retrying.)\n",
                        args.n_outputs,
                        result.outputs.len()
                    ))
                    .await;
                tokio::select! {
                    _ = sleep(Duration::from_secs(2)) => {}
                    _ = token.cancelled() => return Err(Error::Cancelled),
                }
                continue;
            }
            break result;
        };

        info!(
            output_name = %output_name,
            outputs = result.outputs.len(),
            visual_len = result.visual_output.len(),
            "chat done"
        );
        if !result.visual_output.is_empty() {
            self.state.lock().await.output.push_str(&result.visual_output);
        }
        let mut outputs = result.outputs;
        if outputs.len() == 1 {
            self.set_insert(&output_name, Value::String(outputs.remove(0)))
                .await;
        } else {
            self.set_insert(
                &output_name,
                Value::List(outputs.into_iter().map(Value::String).collect()),
            )
            .await;
        }
        Ok(Outcome::Advance)
    }
}

/// `chat.messages` may be a literal list or a `{key}` reference to a stored
/// one; each entry contributes `(role, content)` with the content
/// interpolated and trimmed.
fn chat_messages(store: &InsertStore, messages: Value) -> Result<Vec<(String, String)>> {
    if let Value::String(s) = &messages {
        if let Some(inner) = simple_key(s) {
            let key = interpolate(store, &inner)?;
            return chat_messages(store, store.get(&key)?);
        }
    }
    let list = messages
        .as_list()
        .ok_or_else(|| Error::Type("chat messages must be a list".into()))?;
    let mut out = Vec::with_capacity(list.len());
    for entry in list {
        let Some(obj) = entry.as_map() else {
            return Err(Error::Type("chat messages must be mappings".into()));
        };
        let role = obj
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or("user")
            .to_string();
        let content = obj.get("content").and_then(Value::as_str).unwrap_or("");
        let content = interpolate(store, content)?.trim().to_string();
        out.push((role, content));
    }
    Ok(out)
}

fn take_string(map: &mut ValueMap, key: &str) -> String {
    match map.shift_remove(key) {
        Some(Value::String(s)) => s,
        _ => String::new(),
    }
}

fn pattern_list(task: &Task) -> Result<Vec<String>> {
    Ok(field_list(task, "wildcards")?
        .iter()
        .map(Value::to_display)
        .collect())
}

/// 1-based index resolution for `list_index`: `-1` is the last element,
/// 0 and out-of-range are index errors.
fn resolve_index(value: Option<&Value>, store: &InsertStore, len: usize) -> Result<usize> {
    let idx = index_value(value, store)?;
    if idx == 0 {
        return Err(Error::Index("index 0 is invalid (indices are 1-based)".into()));
    }
    let pos = if idx > 0 { idx - 1 } else { len as i64 + idx };
    if pos < 0 || pos >= len as i64 {
        return Err(Error::Index(format!(
            "index {idx} out of bounds for list of length {len}"
        )));
    }
    Ok(pos as usize)
}

fn index_value(value: Option<&Value>, store: &InsertStore) -> Result<i64> {
    match value {
        Some(Value::String(s)) => eval_math(store, s),
        Some(Value::Int(i)) => Ok(*i),
        _ => Err(Error::Type("index must be an integer or a math expression".into())),
    }
}

fn slice_bound(value: Option<&Value>, store: &InsertStore) -> Result<i64> {
    index_value(value, store)
}

/// `list_slice` semantics: 1-based, right-inclusive, negatives from the
/// end. `to == 0` and inverted ranges yield `[]`; anything out of range
/// clamps rather than erroring.
fn slice_list(list: &[Value], from: i64, to: i64) -> Vec<Value> {
    if to == 0 {
        return Vec::new();
    }
    let len = list.len() as i64;
    let start = match from.signum() {
        1 => from - 1,
        0 => 0,
        _ => len + from,
    };
    let end = if to > 0 { to - 1 } else { len + to };
    if end < start {
        return Vec::new();
    }
    let start = start.max(0);
    let end = end.min(len - 1);
    if start >= len || end < 0 || start > end {
        return Vec::new();
    }
    list[start as usize..=end as usize].to_vec()
}

/// First match wins for duplicate labels, like every other lookup here.
fn label_map(tasks: &[Task]) -> HashMap<String, usize> {
    let mut labels = HashMap::new();
    for (i, task) in tasks.iter().enumerate() {
        if task_cmd(task) == Some("label") {
            if let Some(name) = task.get("name").and_then(Value::as_str) {
                labels.entry(name.to_string()).or_insert(i);
            }
        }
    }
    labels
}

/// Stable path segment for a task: `cmd:line`, falling back to the task's
/// position when the parser supplied no line.
fn frame_label(task: &Task, fallback_index: usize) -> String {
    let cmd = task_cmd(task).unwrap_or("task");
    match task_line(task) {
        Some(line) => format!("{cmd}:{line}"),
        None => format!("{cmd}:{fallback_index}"),
    }
}

fn resolve_program_path(program_dir: &Path, path: &str) -> PathBuf {
    let expanded = shellexpand::tilde(path).to_string();
    let p = PathBuf::from(expanded);
    if p.is_absolute() {
        p
    } else {
        program_dir.join(p)
    }
}

/// Apply `wildcard_maps` to a value, strings rewritten in place, lists and
/// mappings rewritten recursively. An interpolation miss anywhere falls
/// back to the `NULL`-mapped replacement when one exists.
fn replace_map_value(
    store: &InsertStore,
    item: Value,
    maps: &[Value],
    repeat: bool,
) -> Result<Value> {
    let null_value = null_map_value(store, maps);
    match apply_replace(store, item, maps, repeat) {
        Ok(v) => Ok(v),
        Err(e) if e.is_missing_key() => null_value.ok_or(e),
        Err(e) => Err(e),
    }
}

fn apply_replace(store: &InsertStore, item: Value, maps: &[Value], repeat: bool) -> Result<Value> {
    match item {
        Value::String(s) => Ok(Value::String(replace_str(store, s, maps, repeat)?)),
        Value::List(items) => Ok(Value::List(
            items
                .into_iter()
                .map(|v| apply_replace(store, v, maps, repeat))
                .collect::<Result<Vec<_>>>()?,
        )),
        Value::Map(map) => {
            let mut out = ValueMap::new();
            for (k, v) in map {
                let new_k = replace_str(store, k, maps, repeat)?;
                out.insert(new_k, apply_replace(store, v, maps, repeat)?);
            }
            Ok(Value::Map(out))
        }
        v => Ok(v),
    }
}

fn replace_str(store: &InsertStore, mut text: String, maps: &[Value], repeat: bool) -> Result<String> {
    let mut passes = 0;
    loop {
        passes += 1;
        if passes > REPLACE_MAP_PASS_CAP {
            return Err(Error::Type(format!(
                "replace_map did not reach a fixed point within {REPLACE_MAP_PASS_CAP} passes"
            )));
        }
        let current = interpolate(store, &text)?;
        let mut replaced = None;
        for map in maps {
            let obj = map
                .as_map()
                .ok_or_else(|| Error::Type("wildcard_maps entries must be mappings".into()))?;
            let (key, value) = obj
                .iter()
                .next()
                .ok_or_else(|| Error::Type("wildcard_maps entries must not be empty".into()))?;
            let pattern = interpolate(store, key)?;
            if let Some(captures) = wildcard_captures(&pattern, &current) {
                let template = value
                    .as_str()
                    .ok_or_else(|| Error::Type("replacements must be strings".into()))?;
                // Captures shadow inserts during replacement only.
                let mut shadowed = store.clone();
                for (i, cap) in captures.iter().enumerate() {
                    shadowed.set((i + 1).to_string(), Value::String(cap.clone()));
                }
                replaced = Some(interpolate(&shadowed, template)?);
                break;
            }
        }
        let new_text = replaced.unwrap_or_else(|| current.clone());
        if !repeat || new_text == text {
            // The final templating pass strips one level of escaping.
            return Ok(unescape_once(&new_text));
        }
        text = new_text;
    }
}

/// The replacement mapped to `NULL`, if any (the key may itself be an
/// interpolation that resolves to `NULL`).
fn null_map_value(store: &InsertStore, maps: &[Value]) -> Option<Value> {
    for map in maps {
        let obj = map.as_map()?;
        for (key, value) in obj {
            if key == "NULL" {
                return Some(value.clone());
            }
            if key.contains('{') {
                if let Ok(resolved) = interpolate(store, key) {
                    if resolved == "NULL" {
                        return Some(value.clone());
                    }
                }
            }
        }
    }
    None
}
