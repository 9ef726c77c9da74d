//! The prompt channel: the seam between the interpreter and whatever UI
//! fulfills its blocking prompts.
//!
//! The interpreter never talks to a terminal directly. It emits prompts and
//! output through a [`PromptChannel`], and an embedding UI (or the agent
//! file driver, or a test double) answers them. Both prompt calls are
//! cancellable from the outside: the interpreter races them against its
//! cancellation token, so an implementation may simply never return.

use std::collections::VecDeque;
use std::io::Write as _;
use std::sync::Mutex;

use async_trait::async_trait;
use skein_types::{Error, Result};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

/// The interpreter's view of the user.
#[async_trait]
pub trait PromptChannel: Send + Sync {
    /// Ask for free text. Returns the raw reply; the interpreter escapes it
    /// before storing.
    async fn user_input(&self, prompt: &str) -> Result<String>;

    /// Ask the user to pick one of `options`; returns the chosen index.
    /// With no options this blocks until cancelled.
    async fn user_choice(&self, description: &str, options: &[String]) -> Result<usize>;

    /// Append text to the output surface.
    async fn write(&self, text: &str);

    /// Clear the output surface.
    async fn clear(&self);

    /// Replace the output surface wholesale (startup, state load).
    async fn set_screen(&self, text: &str);
}

/// The short positional keys offered for a choice list: `1`..`9`, then
/// `a`..`z`, cycling to `aa`, `ab`, ... past 26.
pub fn choice_keys(n: usize) -> Vec<String> {
    if n <= 9 {
        (1..=n).map(|i| i.to_string()).collect()
    } else {
        (0..n).map(letter_key).collect()
    }
}

fn letter_key(i: usize) -> String {
    if i < 26 {
        ((b'a' + i as u8) as char).to_string()
    } else {
        let i = i - 26;
        let first = (b'a' + (i / 26) as u8) as char;
        let second = (b'a' + (i % 26) as u8) as char;
        format!("{first}{second}")
    }
}

/// Resolve a reply against a choice list: a positional key wins, the exact
/// option text also counts.
pub fn resolve_choice(reply: &str, keys: &[String], options: &[String]) -> Option<usize> {
    let reply = reply.trim();
    if let Some(idx) = keys.iter().position(|k| k == reply) {
        return Some(idx);
    }
    options.iter().position(|o| o == reply)
}

/// Line-oriented console channel over stdin/stdout.
///
/// This is the plain fallback UI: prompts print, replies are read one line
/// at a time. EOF on stdin counts as cancellation.
pub struct ConsoleChannel {
    reader: tokio::sync::Mutex<Lines<BufReader<Stdin>>>,
}

impl ConsoleChannel {
    pub fn new() -> Self {
        Self {
            reader: tokio::sync::Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }

    async fn read_line(&self) -> Result<String> {
        let mut reader = self.reader.lock().await;
        match reader.next_line().await? {
            Some(line) => Ok(line),
            None => Err(Error::Cancelled),
        }
    }

    fn print(&self, text: &str) {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }
}

impl Default for ConsoleChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PromptChannel for ConsoleChannel {
    async fn user_input(&self, prompt: &str) -> Result<String> {
        self.print(prompt);
        self.read_line().await
    }

    async fn user_choice(&self, description: &str, options: &[String]) -> Result<usize> {
        if !description.is_empty() {
            self.print(&format!("\n{description}\n"));
        }
        if options.is_empty() {
            // An empty choice list blocks until the interpreter cancels it.
            std::future::pending::<()>().await;
            unreachable!();
        }
        let keys = choice_keys(options.len());
        for (key, option) in keys.iter().zip(options) {
            self.print(&format!("  [{key}] {option}\n"));
        }
        loop {
            self.print("> ");
            let reply = self.read_line().await?;
            if let Some(idx) = resolve_choice(&reply, &keys, options) {
                return Ok(idx);
            }
            self.print("Invalid choice.\n");
        }
    }

    async fn write(&self, text: &str) {
        self.print(text);
    }

    async fn clear(&self) {
        // ANSI clear-and-home; harmless when not a terminal.
        self.print("\x1b[2J\x1b[1;1H");
    }

    async fn set_screen(&self, text: &str) {
        self.clear().await;
        self.print(text);
    }
}

/// Scripted in-memory channel for tests and embedding.
///
/// Replies are served in order; when the script runs dry, prompts block
/// forever (so cancellation paths can be exercised). The output surface is
/// inspectable.
#[derive(Default)]
pub struct ScriptedChannel {
    replies: Mutex<VecDeque<String>>,
    screen: Mutex<String>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedChannel {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            screen: Mutex::new(String::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Current contents of the output surface.
    pub fn screen(&self) -> String {
        self.screen.lock().unwrap().clone()
    }

    /// Every prompt/description the interpreter asked so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn next_reply(&self) -> Option<String> {
        self.replies.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl PromptChannel for ScriptedChannel {
    async fn user_input(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match self.next_reply() {
            Some(reply) => Ok(reply),
            None => {
                std::future::pending::<()>().await;
                unreachable!();
            }
        }
    }

    async fn user_choice(&self, description: &str, options: &[String]) -> Result<usize> {
        self.prompts.lock().unwrap().push(description.to_string());
        if options.is_empty() {
            std::future::pending::<()>().await;
            unreachable!();
        }
        let Some(reply) = self.next_reply() else {
            std::future::pending::<()>().await;
            unreachable!();
        };
        let keys = choice_keys(options.len());
        resolve_choice(&reply, &keys, options)
            .ok_or_else(|| Error::Type(format!("invalid scripted choice '{reply}'")))
    }

    async fn write(&self, text: &str) {
        self.screen.lock().unwrap().push_str(text);
    }

    async fn clear(&self) {
        self.screen.lock().unwrap().clear();
    }

    async fn set_screen(&self, text: &str) {
        *self.screen.lock().unwrap() = text.to_string();
    }
}
