//! # taskbridge-store
//!
//! Durable state for the taskbridge poll loop.
//!
//! One JSON file per runner holds everything that must survive a restart:
//!
//! ```text
//! {
//!   "cursor": "<chat pagination token>",
//!   "last_poll_unix": 1700000000,
//!   "processed": { "<message id>": <unix seconds>, ... }
//! }
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use taskbridge_store::StateStore;
//!
//! let store = StateStore::new("runner-data/state.json");
//! let mut state = store.load()?;
//! state.mark_processed("om_123", chrono::Utc::now());
//! store.save(&mut state)?;
//! ```

pub mod error;
pub mod state;

// ── re-exports ───────────────────────────────────────────────────────

pub use error::{StoreError, StoreResult};
pub use state::{PROCESSED_TTL_SECS, State, StateStore};
