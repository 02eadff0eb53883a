//! Side-effecting collaborators for taskbridge: the Feishu chat gateway,
//! the repository guard and the code-generation tool runner.
//!
//! The orchestrator reaches the chat service through the [`ChatGateway`]
//! trait defined in [`traits`]; everything else is concrete.  All external
//! programs run through [`process::run_captured`].

pub mod codex;
pub mod error;
pub mod feishu;
pub mod process;
pub mod repo;
pub mod traits;

pub use codex::{CodexRunner, DEFAULT_MAX_OUTPUT, RunResult, TestRun, build_prompt};
pub use error::{AdapterError, Result};
pub use feishu::FeishuGateway;
pub use process::{CapturedOutput, ProcessOutcome, run_captured, truncate_output};
pub use repo::{RepoConfig, RepoManager, diff_snippet, diff_stat, ensure_clean_and_checkout};
pub use traits::{ChatGateway, MessagePage};
