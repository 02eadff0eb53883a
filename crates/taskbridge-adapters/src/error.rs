//! Adapter error types.
//!
//! All adapter subsystems surface errors through [`AdapterError`].  Each
//! variant carries enough context for callers to decide how to handle the
//! failure without inspecting opaque strings.

/// Unified error type for taskbridge adapters.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// An I/O operation failed within the adapter.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// The HTTP request could not be sent or its body could not be read.
    #[error("{operation}: {source}")]
    Http {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The remote service answered with a non-success HTTP status.
    #[error("{operation} status={status} body={body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },

    /// The Feishu API answered with a non-zero `code`.
    #[error("{operation} api error code={code} msg={msg}")]
    Api {
        operation: &'static str,
        code: i64,
        msg: String,
    },

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// A subprocess could not be started.
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A subprocess exited unsuccessfully.  `output` is its combined
    /// stdout/stderr.
    #[error("{command}: {reason}: {output}")]
    CommandFailed {
        command: String,
        reason: String,
        output: String,
    },

    /// An operation exceeded its time limit.
    #[error("timeout after {seconds}s: {reason}")]
    Timeout { seconds: u64, reason: String },

    /// The operation was abandoned because shutdown was requested.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The named repository is not configured.
    #[error("repo {0} not found")]
    RepoNotFound(String),

    /// The named repository is configured but not allowed.
    #[error("repo {0} not allowed")]
    RepoNotAllowed(String),

    /// The repository's working tree has uncommitted changes.
    #[error("repository has uncommitted changes; refusing to run")]
    DirtyWorkingTree,
}

/// Convenience alias used throughout the adapters crate.
pub type Result<T> = std::result::Result<T, AdapterError>;
