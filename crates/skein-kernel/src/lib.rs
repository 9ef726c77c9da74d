//! skein-kernel: the core of skein.
//!
//! This crate provides:
//!
//! - **Parser**: JSON5 program loading with source-line annotation
//! - **Analyzer**: static validation before anything runs
//! - **Store**: the keyed insert store with file fallback
//! - **Interp**: the `{key}` interpolation engine and escape primitives
//! - **Math**: the integer expression sub-language
//! - **Interpreter**: the task runner — frames, labels, iteration, the
//!   parallel combinators, and cooperative cancellation
//! - **Prompt**: the prompt-channel seam (console, scripted) and the
//!   agent-mode file driver
//! - **Chat**: the OpenAI-compatible completions client with stream filters
//! - **Save**: save-slot persistence by textual splicing

pub mod agent;
pub mod analyzer;
pub mod chat;
pub mod filter;
pub mod interp;
pub mod interpreter;
pub mod math;
pub mod parser;
pub mod program;
pub mod prompt;
pub mod save;
pub mod store;

pub use agent::{AgentChannel, DEFAULT_AGENT_INPUT, DEFAULT_AGENT_OUTPUT};
pub use analyzer::analyze_program;
pub use interpreter::{ControlHandle, Runner};
pub use parser::{load_program, parse_program};
pub use program::{LoadContext, Program, State, Task};
pub use prompt::{ConsoleChannel, PromptChannel, ScriptedChannel};
pub use store::InsertStore;

// Re-export the leaf crates so embedders need only one dependency.
pub use skein_glob as glob;
pub use skein_types as types;
