//! JSON-file persistence for the poll loop's state.
//!
//! The state file holds the chat pagination cursor, the last poll time and
//! the set of processed message ids.  Saves prune ids older than
//! [`PROCESSED_TTL_SECS`] and go through `<path>.tmp` plus a rename so a
//! reader never observes a half-written file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, instrument};

use crate::error::{StoreError, StoreResult};

/// How long a processed message id is remembered (7 days).
pub const PROCESSED_TTL_SECS: i64 = 7 * 24 * 60 * 60;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Durable poll state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// Opaque pagination token from the chat service; empty when exhausted.
    #[serde(default)]
    pub cursor: String,
    /// Unix seconds of the last completed poll; zero before the first one.
    #[serde(default)]
    pub last_poll_unix: i64,
    /// Message id -> Unix seconds at which it was processed.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub processed: BTreeMap<String, i64>,
}

impl State {
    /// Whether `message_id` has already been dispatched.
    pub fn is_processed(&self, message_id: &str) -> bool {
        self.processed.contains_key(message_id)
    }

    /// Record `message_id` as dispatched at `at`.
    pub fn mark_processed(&mut self, message_id: &str, at: DateTime<Utc>) {
        self.processed
            .insert(message_id.to_string(), at.timestamp());
    }

    /// Drop processed entries older than the TTL relative to `now`.
    /// Returns how many were removed.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let threshold = now.timestamp() - PROCESSED_TTL_SECS;
        let before = self.processed.len();
        self.processed.retain(|_, ts| *ts >= threshold);
        before - self.processed.len()
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<BTreeMap<String, i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<BTreeMap<String, i64>>::deserialize(deserializer)?.unwrap_or_default())
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Single-file JSON store for [`State`].
///
/// Loads and saves are serialised by an internal mutex, so one store may be
/// shared between tasks.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StateStore {
    /// Create a store backed by the file at `path`.  Nothing is touched on
    /// disk until the first [`load`](Self::load) or [`save`](Self::save).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// The backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load state; a missing file yields a fresh, empty state.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn load(&self) -> StoreResult<State> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());

        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no state file yet, starting fresh");
                return Ok(State::default());
            }
            Err(source) => {
                return Err(StoreError::Io {
                    action: "read state",
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let state: State = serde_json::from_slice(&raw).map_err(|source| StoreError::Json {
            path: self.path.clone(),
            source,
        })?;
        debug!(
            processed = state.processed.len(),
            last_poll_unix = state.last_poll_unix,
            "state loaded"
        );
        Ok(state)
    }

    /// Prune `state` and atomically replace the state file with it.
    pub fn save(&self, state: &mut State) -> StoreResult<()> {
        self.save_at(state, Utc::now())
    }

    /// [`save`](Self::save) with an explicit notion of "now" for pruning.
    #[instrument(skip(self, state), fields(path = %self.path.display()))]
    pub fn save_at(&self, state: &mut State, now: DateTime<Utc>) -> StoreResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());

        let pruned = state.prune(now);
        let data = serde_json::to_vec_pretty(state).map_err(|source| StoreError::Json {
            path: self.path.clone(),
            source,
        })?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                action: "create state directory",
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let tmp = tmp_path(&self.path);
        std::fs::write(&tmp, &data).map_err(|source| StoreError::Io {
            action: "write state",
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| StoreError::Io {
            action: "replace state",
            path: self.path.clone(),
            source,
        })?;

        debug!(processed = state.processed.len(), pruned, "state saved");
        Ok(())
    }
}

/// `<path>.tmp`, next to the target so the rename stays on one filesystem.
fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn load_missing_file_returns_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let state = store.load().unwrap();
        assert_eq!(state, State::default());
        assert!(state.processed.is_empty());
    }

    #[test]
    fn load_null_processed_substitutes_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"cursor":"c1","last_poll_unix":5,"processed":null}"#).unwrap();
        let state = StateStore::new(&path).load().unwrap();
        assert_eq!(state.cursor, "c1");
        assert_eq!(state.last_poll_unix, 5);
        assert!(state.processed.is_empty());
    }

    #[test]
    fn load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "not json").unwrap();
        let err = StateStore::new(&path).load().unwrap_err();
        assert!(matches!(err, StoreError::Json { .. }));
        assert!(err.to_string().contains("state.json"));
    }

    #[test]
    fn prune_drops_only_expired_entries() {
        let now = at(1_700_000_000);
        let mut state = State::default();
        state.mark_processed("fresh", now);
        state.mark_processed("edge", at(now.timestamp() - PROCESSED_TTL_SECS));
        state.mark_processed("stale", at(now.timestamp() - PROCESSED_TTL_SECS - 1));

        assert_eq!(state.prune(now), 1);
        assert!(state.is_processed("fresh"));
        assert!(state.is_processed("edge"));
        assert!(!state.is_processed("stale"));
    }

    #[test]
    fn save_writes_pretty_json_and_removes_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let store = StateStore::new(&path);

        let now = Utc::now();
        let mut state = State {
            cursor: "page-2".into(),
            last_poll_unix: now.timestamp(),
            processed: BTreeMap::new(),
        };
        state.mark_processed("om_1", now);
        store.save(&mut state).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\n  \"cursor\": \"page-2\""));
        assert!(raw.contains("\"om_1\""));
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn tmp_path_appends_suffix() {
        assert_eq!(
            tmp_path(Path::new("/work/state.json")),
            PathBuf::from("/work/state.json.tmp")
        );
    }
}
