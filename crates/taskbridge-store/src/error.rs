//! Error types for the taskbridge-store crate.
//!
//! All storage operations return [`StoreError`] via [`StoreResult`].

use std::path::PathBuf;

use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while loading or saving poll state.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading, writing or renaming the state file failed.
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The state file exists but is not valid state JSON.
    #[error("parse state {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
