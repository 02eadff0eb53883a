//! Intent error types.
//!
//! Parsing and safety checks surface errors through [`IntentError`].  The
//! `Display` text of each variant is sent back to the chat verbatim, so the
//! messages are kept short and user-facing.

/// Unified error type for the intent crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntentError {
    // -- Parser errors -------------------------------------------------------
    /// The message text was empty after trimming.
    #[error("empty message")]
    EmptyMessage,

    /// No repository was named by the message or the parse defaults.
    #[error("repo is required")]
    MissingRepo,

    /// Nothing was left to use as the instruction after flag extraction.
    #[error("instruction is required")]
    MissingInstruction,

    // -- Safety errors -------------------------------------------------------
    /// The instruction or test command contains a blocked shell fragment.
    #[error("instruction rejected due to dangerous keyword: {keyword}")]
    Unsafe { keyword: String },
}

/// Convenience alias used throughout the intent crate.
pub type Result<T> = std::result::Result<T, IntentError>;
