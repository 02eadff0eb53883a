//! Chat gateway trait and supporting types.
//!
//! The orchestrator talks to the chat service only through [`ChatGateway`],
//! so the poll loop can be driven by an in-memory fake in tests and by
//! [`FeishuGateway`](crate::feishu::FeishuGateway) in production.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskbridge_intent::Message;

use crate::error::Result;

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// One page of chat messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePage {
    /// Messages in ascending create-time order, empty-text items removed.
    pub messages: Vec<Message>,
    /// Cursor for the next page; empty when the server has no more.
    pub next_cursor: String,
}

// ---------------------------------------------------------------------------
// Gateway trait
// ---------------------------------------------------------------------------

/// Pull-based access to a chat service.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// Fetch one page of messages created at or after `start`.  An empty
    /// `page_token` requests the first page.
    async fn fetch_messages(&self, start: DateTime<Utc>, page_token: &str) -> Result<MessagePage>;

    /// Post a plain-text reply into `chat_id`.
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<()>;
}
