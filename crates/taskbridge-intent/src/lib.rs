//! Task model and chat instruction handling for taskbridge.
//!
//! This crate provides:
//!
//! - **Data model**: [`Message`] as delivered by the chat gateway and the
//!   [`Task`] derived from it.
//! - **Task parsing**: JSON envelope and `#key=value` flag syntax via
//!   [`parser::parse_message`].
//! - **Safety filter**: rejection of dangerous shell fragments via
//!   [`safety::validate_safety`].

pub mod error;
pub mod model;
pub mod parser;
pub mod safety;

pub use error::{IntentError, Result};
pub use model::{DEFAULT_MODE, FALLBACK_TEST_CMD, Message, Task, task_id};
pub use parser::{ParseOptions, parse_message};
pub use safety::{BLOCKED_KEYWORDS, validate_safety};
