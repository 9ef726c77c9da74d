//! skein CLI binary entry point.
//!
//! Initializes the tracing subscriber, parses command-line arguments with
//! clap, loads and validates the program, then runs it against either the
//! console prompt channel or the file-based agent driver. The final output
//! buffer prints to stdout on normal termination; fatal errors print a
//! diagnostic carrying the offending task's source line and exit non-zero.

mod logging;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use skein_kernel::{
    analyze_program, load_program, AgentChannel, ConsoleChannel, LoadContext, PromptChannel,
    Runner, DEFAULT_AGENT_INPUT, DEFAULT_AGENT_OUTPUT,
};

#[derive(Parser, Debug)]
#[command(name = "skein")]
#[command(about = "Run a skein task program.", long_about = None)]
struct Args {
    /// Path to the .json5 program file.
    program: PathBuf,

    /// Positional arguments passed to the program, readable as '{ARG1}',
    /// '{ARG2}', ...
    #[arg(last = true)]
    program_arguments: Vec<String>,

    /// Append a log of runtime events to this file.
    #[arg(long)]
    log: Option<PathBuf>,

    /// Directory to read inserts from when a key is missing from the store.
    #[arg(long = "inserts-dir")]
    inserts_dir: Option<PathBuf>,

    /// Drive prompts through the file-based agent channel instead of the
    /// console.
    #[arg(long = "agent-mode")]
    agent_mode: bool,

    /// Agent payload path (prompts are written here).
    #[arg(long = "agent-output", default_value = DEFAULT_AGENT_OUTPUT)]
    agent_output: PathBuf,

    /// Agent reply path (the first line is consumed).
    #[arg(long = "agent-input", default_value = DEFAULT_AGENT_INPUT)]
    agent_input: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let _guard = match logging::init_tracing(args.log.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(args).await {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            // Task failures already read "Error at line L: ..."; don't
            // double the prefix.
            match e.downcast_ref::<skein_types::Error>() {
                Some(err @ skein_types::Error::Task { .. }) => eprintln!("{err}"),
                _ => eprintln!("Error: {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<String> {
    let ctx = LoadContext::new(args.program.clone(), args.inserts_dir.clone())?;
    let program = load_program(&ctx)?;
    analyze_program(&program, &ctx)?;

    let io: Arc<dyn PromptChannel> = if args.agent_mode {
        Arc::new(AgentChannel::new(args.agent_input, args.agent_output))
    } else {
        Arc::new(ConsoleChannel::new())
    };

    let runner = Runner::new(program, &ctx, io, &args.program_arguments);

    // Ctrl-C terminates cooperatively: the runner stops at the next
    // suspension point and returns the output so far.
    let control = runner.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            control.terminate();
        }
    });

    Ok(runner.run().await?)
}
