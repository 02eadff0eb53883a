//! Task parser -- transforms a chat message into a structured [`Task`].
//!
//! Two syntaxes are understood, tried in order:
//!
//! 1. **JSON envelope**: text starting with `{` is decoded as an object with
//!    optional string fields `repo`, `branch`, `test_cmd`, `mode`, `task` and
//!    `instruction` (`instruction` wins over `task`).
//! 2. **Flag syntax**: `#key=value` tokens anywhere in the text, where the
//!    value is either a double-quoted string or a run of non-whitespace.
//!    Recognised keys are `repo`, `branch`, `test`/`test_cmd` and `mode`
//!    (case-insensitive).  The text left after removing every token is the
//!    instruction.
//!
//! A JSON envelope that fails to decode falls back to flag syntax on the
//! original text.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::error::{IntentError, Result};
use crate::model::{DEFAULT_MODE, FALLBACK_TEST_CMD, Message, Task};

/// `#key=value` or `#key="quoted value"`.
static FLAG_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"#([a-zA-Z_]+)=(("[^"]+")|([^\s]+))"#).expect("flag pattern is a valid regex")
});

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Defaults applied before the message's own fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseOptions {
    /// Repository used when the message does not name one.
    pub default_repo: String,
    /// Test command used when the message does not name one.
    pub default_test_cmd: String,
}

/// Which syntax produced a task.  Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Syntax {
    Json,
    Flags,
}

/// Shape of the JSON envelope.  Absent and empty fields leave defaults alone.
#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    repo: Option<String>,
    #[serde(default)]
    branch: Option<String>,
    #[serde(default)]
    test_cmd: Option<String>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    task: Option<String>,
    #[serde(default)]
    instruction: Option<String>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a chat message into a task.
///
/// Pure: the same message and options always produce the same result.  The
/// returned task has an empty id; see [`Task::with_id`].
pub fn parse_message(msg: &Message, opts: &ParseOptions) -> Result<Task> {
    let text = msg.text.trim();
    if text.is_empty() {
        return Err(IntentError::EmptyMessage);
    }

    let mut task = Task {
        id: String::new(),
        repo: opts.default_repo.clone(),
        branch: String::new(),
        test_cmd: opts.default_test_cmd.clone(),
        mode: DEFAULT_MODE.to_string(),
        instruction: text.to_string(),
        requester_id: msg.sender_id.clone(),
        chat_id: msg.chat_id.clone(),
        message_id: msg.message_id.clone(),
        received_at: msg.create_time,
        raw_text: msg.text.clone(),
    };

    let syntax = if text.starts_with('{') && apply_envelope(text, &mut task) {
        Syntax::Json
    } else {
        apply_flags(text, &mut task);
        Syntax::Flags
    };

    let task = finalize(task)?;
    debug!(
        message_id = %task.message_id,
        repo = %task.repo,
        branch = %task.branch,
        mode = %task.mode,
        syntax = ?syntax,
        "message parsed into task"
    );
    Ok(task)
}

/// Apply a JSON envelope to `task`.  Returns `false` if `text` does not
/// decode, leaving `task` untouched.
fn apply_envelope(text: &str, task: &mut Task) -> bool {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(error = %e, "json envelope did not decode, trying flag syntax");
            return false;
        }
    };

    let set = |target: &mut String, value: Option<String>| {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            *target = value;
        }
    };
    set(&mut task.repo, envelope.repo);
    set(&mut task.branch, envelope.branch);
    set(&mut task.test_cmd, envelope.test_cmd);
    set(&mut task.mode, envelope.mode);
    set(&mut task.instruction, envelope.task);
    set(&mut task.instruction, envelope.instruction);
    true
}

/// Apply every `#key=value` token in `text` to `task` and use the residue as
/// the instruction.
fn apply_flags(text: &str, task: &mut Task) {
    for caps in FLAG_PATTERN.captures_iter(text) {
        let key = caps[1].to_ascii_lowercase();
        let value = caps[2].trim_matches('"').to_string();
        match key.as_str() {
            "repo" => task.repo = value,
            "branch" => task.branch = value,
            "test" | "test_cmd" => task.test_cmd = value,
            "mode" => task.mode = value,
            _ => {}
        }
    }
    task.instruction = FLAG_PATTERN.replace_all(text, "").trim().to_string();
}

fn finalize(mut task: Task) -> Result<Task> {
    if task.repo.is_empty() {
        return Err(IntentError::MissingRepo);
    }
    if task.test_cmd.is_empty() {
        task.test_cmd = FALLBACK_TEST_CMD.to_string();
    }
    if task.mode.is_empty() {
        task.mode = DEFAULT_MODE.to_string();
    }
    if task.instruction.is_empty() {
        return Err(IntentError::MissingInstruction);
    }
    Ok(task)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
