//! Repository registry and working-tree guard.
//!
//! Repositories are pre-provisioned on local paths and described by
//! [`RepoConfig`].  Before a task touches one, the guard checks the working
//! tree is clean and switches to the requested branch, creating it locally
//! when it does not exist yet.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AdapterError, Result};
use crate::process::{ProcessOutcome, TRUNCATED_MARKER, run_captured};

/// Time limit for each git invocation.
pub const GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// One configured repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoConfig {
    pub name: String,
    pub local_path: PathBuf,
    /// Tasks against a repository with `allowed == false` are refused.
    pub allowed: bool,
    /// Branch to check out when a task names none; may be empty.
    pub default_branch: String,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Name-keyed view of the configured repositories.  Read-only after startup.
#[derive(Debug, Clone, Default)]
pub struct RepoManager {
    repos: BTreeMap<String, RepoConfig>,
}

impl RepoManager {
    /// Build the registry.  A later entry with a duplicate name replaces an
    /// earlier one.
    pub fn new(repos: impl IntoIterator<Item = RepoConfig>) -> Self {
        let repos = repos
            .into_iter()
            .map(|repo| (repo.name.clone(), repo))
            .collect();
        Self { repos }
    }

    /// Look up `name`, refusing unknown and disallowed repositories.
    pub fn resolve(&self, name: &str) -> Result<&RepoConfig> {
        let repo = self
            .repos
            .get(name)
            .ok_or_else(|| AdapterError::RepoNotFound(name.to_string()))?;
        if !repo.allowed {
            return Err(AdapterError::RepoNotAllowed(name.to_string()));
        }
        Ok(repo)
    }

    /// All repositories, ordered by name.
    pub fn repos(&self) -> impl Iterator<Item = &RepoConfig> {
        self.repos.values()
    }

    pub fn len(&self) -> usize {
        self.repos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Working-tree guard
// ---------------------------------------------------------------------------

/// Refuse a dirty working tree, then switch to `branch` (or the repo's
/// default branch when `branch` is blank).  When both are blank the current
/// branch is kept.
pub async fn ensure_clean_and_checkout(
    repo: &RepoConfig,
    branch: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let path = repo.local_path.as_path();

    let status = git(path, &["status", "--porcelain"], cancel).await?;
    if !status.trim().is_empty() {
        warn!(repo = %repo.name, "working tree is dirty");
        return Err(AdapterError::DirtyWorkingTree);
    }

    let target = match branch.trim() {
        "" => repo.default_branch.trim(),
        named => named,
    };
    if target.is_empty() {
        debug!(repo = %repo.name, "no branch requested, staying on current branch");
        return Ok(());
    }

    match git(path, &["checkout", target], cancel).await {
        Ok(_) => {
            info!(repo = %repo.name, branch = target, "checked out branch");
            Ok(())
        }
        Err(e) if is_unknown_branch(&e) => {
            git(path, &["checkout", "-b", target], cancel).await?;
            info!(repo = %repo.name, branch = target, "created local branch");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// `git diff --stat`, `(no changes)` when the tree matches HEAD.
pub async fn diff_stat(path: &Path, cancel: &CancellationToken) -> String {
    match git(path, &["diff", "--stat"], cancel).await {
        Ok(out) if out.trim().is_empty() => "(no changes)".to_string(),
        Ok(out) => out,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "diff --stat failed");
            "(failed to gather diff stat)".to_string()
        }
    }
}

/// `git diff`, cut to the first `max_lines` lines.
pub async fn diff_snippet(path: &Path, max_lines: usize, cancel: &CancellationToken) -> String {
    match git(path, &["diff"], cancel).await {
        Ok(out) => head_lines(&out, max_lines),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "diff failed");
            "(failed to gather diff)".to_string()
        }
    }
}

fn head_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.split('\n').collect();
    if lines.len() <= max_lines {
        return text.to_string();
    }
    let mut out = lines[..max_lines].join("\n");
    out.push_str(TRUNCATED_MARKER);
    out
}

fn is_unknown_branch(err: &AdapterError) -> bool {
    matches!(
        err,
        AdapterError::CommandFailed { output, .. }
            if output.contains("did not match") || output.contains("pathspec")
    )
}

/// Run one git command in `path` and return its combined output.
async fn git(path: &Path, args: &[&str], cancel: &CancellationToken) -> Result<String> {
    let out = run_captured("git", args, path, None, GIT_TIMEOUT, cancel).await?;
    let command = format!("git {}", args.join(" "));
    match out.outcome {
        ProcessOutcome::Exited(status) if status.success() => Ok(out.text()),
        ProcessOutcome::Exited(status) => Err(AdapterError::CommandFailed {
            command,
            reason: status.to_string(),
            output: out.text(),
        }),
        ProcessOutcome::TimedOut(limit) => Err(AdapterError::Timeout {
            seconds: limit.as_secs(),
            reason: command,
        }),
        ProcessOutcome::Cancelled => Err(AdapterError::Cancelled(command)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
