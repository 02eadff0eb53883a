//! Core data types shared by every taskbridge crate.
//!
//! A [`Message`] is what the chat gateway hands over; a [`Task`] is what the
//! parser turns it into.  Both are plain values and never mutated after
//! construction, apart from the task id which the orchestrator assigns.

use chrono::{DateTime, Utc};
use ring::digest;
use serde::{Deserialize, Serialize};

/// Mode used when a message does not name one.
pub const DEFAULT_MODE: &str = "implement";

/// Test command used when neither the message nor the configuration has one.
pub const FALLBACK_TEST_CMD: &str = "go test ./...";

/// Number of hex characters in a task id.
const TASK_ID_LEN: usize = 12;

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A chat message already reduced to plain text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Globally unique id assigned by the chat service.
    pub message_id: String,
    /// Chat the message was posted in; replies go back here.
    pub chat_id: String,
    /// Opaque principal id of the sender.
    pub sender_id: String,
    /// Human text extracted from the rich message body.
    pub text: String,
    /// When the chat service recorded the message.
    pub create_time: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A parsed instruction ready for execution against a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// 12 hex chars; empty until [`Task::with_id`] is applied.
    pub id: String,
    pub repo: String,
    /// Empty means "use the repository's default branch".
    pub branch: String,
    pub test_cmd: String,
    pub mode: String,
    pub instruction: String,
    pub requester_id: String,
    pub chat_id: String,
    pub message_id: String,
    pub received_at: DateTime<Utc>,
    pub raw_text: String,
}

impl Task {
    /// Return the task with its id derived from the source message and `at`.
    pub fn with_id(mut self, at: DateTime<Utc>) -> Self {
        self.id = task_id(&self.message_id, at);
        self
    }

    /// Branch label for chat output.
    pub fn branch_label(&self) -> &str {
        if self.branch.trim().is_empty() {
            "(default)"
        } else {
            &self.branch
        }
    }
}

/// Derive a task id from a message id and a nanosecond-precision instant.
///
/// The same `(message_id, at)` pair always yields the same id.
pub fn task_id(message_id: &str, at: DateTime<Utc>) -> String {
    let nanos = at
        .timestamp_nanos_opt()
        .unwrap_or_else(|| at.timestamp().saturating_mul(1_000_000_000));
    let seed = format!("{message_id}:{nanos}");
    let hash = digest::digest(&digest::SHA256, seed.as_bytes());

    hash.as_ref()[..TASK_ID_LEN / 2]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn task_id_is_twelve_hex_chars() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let id = task_id("om_123", at);
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn task_id_is_deterministic_per_pair() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(task_id("om_123", at), task_id("om_123", at));
        assert_ne!(task_id("om_123", at), task_id("om_124", at));
        let later = at + chrono::Duration::nanoseconds(1);
        assert_ne!(task_id("om_123", at), task_id("om_123", later));
    }

    #[test]
    fn branch_label_falls_back_to_default() {
        let task = Task {
            id: String::new(),
            repo: "aoi".into(),
            branch: "  ".into(),
            test_cmd: FALLBACK_TEST_CMD.into(),
            mode: DEFAULT_MODE.into(),
            instruction: "x".into(),
            requester_id: String::new(),
            chat_id: String::new(),
            message_id: "m1".into(),
            received_at: Utc::now(),
            raw_text: "x".into(),
        };
        assert_eq!(task.branch_label(), "(default)");
    }
}
