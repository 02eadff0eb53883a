//! CLI argument definitions for taskbridge.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use clap::{Parser, Subcommand};

/// taskbridge -- run code-generation tasks requested over Feishu chat.
#[derive(Parser)]
#[command(
    name = "taskbridge",
    version,
    about = "taskbridge -- chat-driven code-generation task runner",
    long_about = "Polls a Feishu chat for instructions from allow-listed users, runs the \
                  code-generation tool against a configured local repository, runs the \
                  tests and reports the result back to the chat."
)]
pub struct Cli {
    /// Emit logs as JSON lines instead of the compact text format.
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Poll the chat until interrupted (the default).
    Run,

    /// Run a single poll cycle and exit.
    Once,

    /// Validate configuration, repositories and the allow list, then exit.
    Check,
}
