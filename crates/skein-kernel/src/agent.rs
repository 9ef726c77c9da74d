//! The agent-mode prompt driver.
//!
//! An alternative [`PromptChannel`] for driving programs from another
//! process: each prompt writes a JSON payload to a well-known output path
//! and polls a well-known input path for the reply. The payload carries the
//! current screen text so the agent has full context:
//!
//! ```json
//! {
//!   "type": "user_choice",
//!   "output": "<current screen text>",
//!   "prompt": "Pick a door:",
//!   "choices": { "1": "left", "2": "right" }
//! }
//! ```
//!
//! The reply is the first line of the input file; the file is consumed
//! (deleted) once read.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use skein_types::{Error, Result};
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::prompt::{choice_keys, resolve_choice, PromptChannel};

pub const DEFAULT_AGENT_OUTPUT: &str = "/tmp/agent_output";
pub const DEFAULT_AGENT_INPUT: &str = "/tmp/agent_input";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct AgentChannel {
    output: Mutex<String>,
    input_path: PathBuf,
    output_path: PathBuf,
}

impl AgentChannel {
    pub fn new(input_path: PathBuf, output_path: PathBuf) -> Self {
        Self {
            output: Mutex::new(String::new()),
            input_path,
            output_path,
        }
    }

    fn post(&self, payload: &serde_json::Value) -> Result<()> {
        let _ = fs::remove_file(&self.input_path);
        fs::write(&self.output_path, serde_json::to_string_pretty(payload)?)?;
        Ok(())
    }

    /// Poll the input path until a reply file appears; consume its first
    /// line. Cancellation happens from outside: the interpreter races this
    /// future against its token.
    async fn await_reply(&self) -> Result<String> {
        loop {
            if self.input_path.exists() {
                let data = fs::read_to_string(&self.input_path)?;
                let _ = fs::remove_file(&self.input_path);
                let first_line = data.lines().next().unwrap_or("").to_string();
                return Ok(first_line);
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl PromptChannel for AgentChannel {
    async fn user_input(&self, prompt: &str) -> Result<String> {
        let payload = serde_json::json!({
            "type": "user_input",
            "output": self.output.lock().await.clone(),
            "prompt": prompt,
        });
        self.post(&payload)?;
        self.await_reply().await
    }

    async fn user_choice(&self, description: &str, options: &[String]) -> Result<usize> {
        if options.is_empty() {
            let payload = serde_json::json!({
                "type": "user_choice",
                "output": self.output.lock().await.clone(),
                "prompt": description,
                "choices": HashMap::<String, String>::new(),
            });
            self.post(&payload)?;
            // Nothing to choose; block until the interpreter cancels.
            std::future::pending::<()>().await;
            unreachable!();
        }

        let keys = choice_keys(options.len());
        let choices: serde_json::Map<String, serde_json::Value> = keys
            .iter()
            .zip(options)
            .map(|(k, o)| (k.clone(), serde_json::Value::String(o.clone())))
            .collect();
        let payload = serde_json::json!({
            "type": "user_choice",
            "output": self.output.lock().await.clone(),
            "prompt": description,
            "choices": choices,
        });
        self.post(&payload)?;

        let reply = self.await_reply().await?;
        resolve_choice(&reply, &keys, options)
            .ok_or_else(|| Error::Type(format!("invalid agent choice '{reply}'")))
    }

    async fn write(&self, text: &str) {
        self.output.lock().await.push_str(text);
    }

    async fn clear(&self) {
        self.output.lock().await.clear();
    }

    async fn set_screen(&self, text: &str) {
        *self.output.lock().await = text.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_in(dir: &std::path::Path) -> AgentChannel {
        AgentChannel::new(dir.join("agent_input"), dir.join("agent_output"))
    }

    #[tokio::test]
    async fn user_input_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let channel = channel_in(dir.path());
        channel.write("screen so far").await;

        let input_path = dir.path().join("agent_input");
        let output_path = dir.path().join("agent_output");
        let ask = channel.user_input("name? ");
        let reply = async {
            // Wait for the payload, then answer.
            loop {
                if output_path.exists() {
                    break;
                }
                sleep(Duration::from_millis(5)).await;
            }
            let payload: serde_json::Value =
                serde_json::from_str(&fs::read_to_string(&output_path).unwrap()).unwrap();
            assert_eq!(payload["type"], "user_input");
            assert_eq!(payload["output"], "screen so far");
            assert_eq!(payload["prompt"], "name? ");
            fs::write(&input_path, "tom\nignored second line\n").unwrap();
        };
        let (answer, _) = tokio::join!(ask, reply);
        // Only the first line is consumed, and the file is gone.
        assert_eq!(answer.unwrap(), "tom");
        assert!(!input_path.exists());
    }

    #[tokio::test]
    async fn user_choice_resolves_keys_and_exact_text() {
        let dir = tempfile::tempdir().unwrap();
        let channel = channel_in(dir.path());
        let options = vec!["left".to_string(), "right".to_string()];

        let input_path = dir.path().join("agent_input");
        let output_path = dir.path().join("agent_output");
        let ask = channel.user_choice("pick a door", &options);
        let reply = async {
            loop {
                if output_path.exists() {
                    break;
                }
                sleep(Duration::from_millis(5)).await;
            }
            let payload: serde_json::Value =
                serde_json::from_str(&fs::read_to_string(&output_path).unwrap()).unwrap();
            assert_eq!(payload["type"], "user_choice");
            assert_eq!(payload["choices"]["2"], "right");
            fs::write(&input_path, "2\n").unwrap();
        };
        let (answer, _) = tokio::join!(ask, reply);
        assert_eq!(answer.unwrap(), 1);
    }
}
