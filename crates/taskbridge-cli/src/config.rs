//! Runtime configuration.
//!
//! Settings come from environment variables (optionally seeded from a
//! `.env` file by `main`).  The repository list and the sender allow list
//! live in two small YAML files read with [`parse_simple_yaml`], which
//! understands only the subset those files use: top-level keys holding a
//! list of scalars or a list of flat `key: value` objects.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use taskbridge_adapters::RepoConfig;
use taskbridge_adapters::feishu::DEFAULT_BASE_URL;
use taskbridge_intent::FALLBACK_TEST_CMD;
use tracing::warn;

use crate::helpers::env_non_empty;

const DEFAULT_POLL_INTERVAL_SECS: u64 = 8;
const DEFAULT_EXEC_TIMEOUT_MIN: u64 = 30;

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Process-wide settings resolved at startup.
#[derive(Clone)]
pub struct RuntimeConfig {
    pub feishu_app_id: String,
    pub feishu_app_secret: String,
    pub feishu_api_base: String,
    pub codex_bin: String,
    pub poll_interval: Duration,
    pub exec_timeout: Duration,
    /// Absolute once [`prepare_work_dir`](Self::prepare_work_dir) has run.
    pub work_dir: PathBuf,
    pub repos_file: PathBuf,
    pub allowlist_file: PathBuf,
    pub default_test_cmd: String,
    pub default_repo: String,
}

impl std::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("feishu_app_id", &self.feishu_app_id)
            .field("feishu_app_secret", &"<redacted>")
            .field("feishu_api_base", &self.feishu_api_base)
            .field("codex_bin", &self.codex_bin)
            .field("poll_interval", &self.poll_interval)
            .field("exec_timeout", &self.exec_timeout)
            .field("work_dir", &self.work_dir)
            .field("repos_file", &self.repos_file)
            .field("allowlist_file", &self.allowlist_file)
            .field("default_test_cmd", &self.default_test_cmd)
            .field("default_repo", &self.default_repo)
            .finish()
    }
}

impl RuntimeConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(env_non_empty)
    }

    /// Read the configuration through `lookup`, which returns `None` for
    /// unset or empty variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let (Some(feishu_app_id), Some(feishu_app_secret)) =
            (lookup("FEISHU_APP_ID"), lookup("FEISHU_APP_SECRET"))
        else {
            bail!("FEISHU_APP_ID and FEISHU_APP_SECRET must be set");
        };

        let or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let poll_secs = read_positive(&lookup, "RUNNER_POLL_INTERVAL_SEC", DEFAULT_POLL_INTERVAL_SECS);
        let timeout_min = read_positive(&lookup, "RUNNER_EXEC_TIMEOUT_MIN", DEFAULT_EXEC_TIMEOUT_MIN);

        Ok(Self {
            feishu_app_id,
            feishu_app_secret,
            feishu_api_base: or("FEISHU_API_BASE", DEFAULT_BASE_URL),
            codex_bin: or("CODEX_BIN", "codex"),
            poll_interval: Duration::from_secs(poll_secs),
            exec_timeout: Duration::from_secs(timeout_min * 60),
            work_dir: PathBuf::from(or("RUNNER_WORK_DIR", "./runner-data")),
            repos_file: PathBuf::from(or("RUNNER_REPOS_FILE", "./repos.yaml")),
            allowlist_file: PathBuf::from(or("RUNNER_ALLOWLIST_FILE", "./allowlist.yaml")),
            default_test_cmd: or("RUNNER_DEFAULT_TEST_CMD", FALLBACK_TEST_CMD),
            default_repo: or("RUNNER_DEFAULT_REPO", ""),
        })
    }

    /// Create the work directory and make its path absolute.
    pub fn prepare_work_dir(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.work_dir)
            .with_context(|| format!("create work dir {}", self.work_dir.display()))?;
        self.work_dir = self
            .work_dir
            .canonicalize()
            .with_context(|| format!("resolve work dir {}", self.work_dir.display()))?;
        Ok(())
    }

    /// Where per-task tool logs go.
    pub fn log_dir(&self) -> PathBuf {
        self.work_dir.join("logs")
    }

    pub fn state_path(&self) -> PathBuf {
        self.work_dir.join("state.json")
    }
}

/// Parse a positive integer variable, falling back to `default` (with a
/// warning) when it is malformed or zero.
fn read_positive(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => n,
        _ => {
            warn!(key, value = %raw, default, "invalid integer setting, using default");
            default
        }
    }
}

// ---------------------------------------------------------------------------
// YAML files
// ---------------------------------------------------------------------------

/// A top-level list in the simple YAML subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum YamlList {
    Scalars(Vec<String>),
    Objects(Vec<BTreeMap<String, String>>),
}

/// Parse the YAML subset used by `repos.yaml` and `allowlist.yaml`.
///
/// Blank lines and `#` comments are skipped.  `key:` opens a top-level
/// list; `- k: v` starts an object in it, `- v` appends a scalar, and
/// `k: v` adds a field to the object opened last.  Values are trimmed and
/// lose surrounding double quotes.  Anything else is ignored.
pub fn parse_simple_yaml(text: &str) -> BTreeMap<String, YamlList> {
    let mut root: BTreeMap<String, YamlList> = BTreeMap::new();
    let mut current_key = String::new();
    let mut in_object = false;

    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(key) = line.strip_suffix(':')
            && !line.starts_with('-')
        {
            current_key = key.to_string();
            in_object = false;
            continue;
        }

        if let Some(item) = line.strip_prefix("- ") {
            let item = item.trim();
            if let Some((k, v)) = item.split_once(':') {
                let obj = BTreeMap::from([(k.trim().to_string(), trim_value(v))]);
                match root.get_mut(&current_key) {
                    Some(YamlList::Objects(list)) => list.push(obj),
                    _ => {
                        root.insert(current_key.clone(), YamlList::Objects(vec![obj]));
                    }
                }
                in_object = true;
            } else {
                let value = trim_value(item);
                match root.get_mut(&current_key) {
                    Some(YamlList::Scalars(list)) => list.push(value),
                    _ => {
                        root.insert(current_key.clone(), YamlList::Scalars(vec![value]));
                    }
                }
            }
            continue;
        }

        if in_object
            && let Some((k, v)) = line.split_once(':')
            && let Some(YamlList::Objects(list)) = root.get_mut(&current_key)
            && let Some(obj) = list.last_mut()
        {
            obj.insert(k.trim().to_string(), trim_value(v));
        }
    }

    root
}

fn trim_value(v: &str) -> String {
    v.trim().trim_matches('"').to_string()
}

fn read_yaml(path: &Path) -> Result<BTreeMap<String, YamlList>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("open {}", path.display()))?;
    Ok(parse_simple_yaml(&text))
}

/// Load the `repos` list.
pub fn load_repos(path: &Path) -> Result<Vec<RepoConfig>> {
    let Some(YamlList::Objects(items)) = read_yaml(path)?.remove("repos") else {
        bail!("{} must contain a repos list", path.display());
    };

    let field = |item: &BTreeMap<String, String>, key: &str| {
        item.get(key).cloned().unwrap_or_default()
    };
    Ok(items
        .iter()
        .map(|item| RepoConfig {
            name: field(item, "name"),
            local_path: PathBuf::from(field(item, "local_path")),
            allowed: field(item, "allowed").eq_ignore_ascii_case("true"),
            default_branch: field(item, "default_branch"),
        })
        .collect())
}

/// Load the `open_ids` allow list, dropping blank entries.
pub fn load_allow_list(path: &Path) -> Result<HashSet<String>> {
    let Some(YamlList::Scalars(ids)) = read_yaml(path)?.remove("open_ids") else {
        bail!("{} must contain an open_ids list", path.display());
    };

    Ok(ids
        .into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
