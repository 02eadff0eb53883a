//! The poll loop: fetch chat messages, turn each into a task and run it.
//!
//! Tasks run one at a time in the order the chat service returns them.  A
//! message is marked processed before its task starts, so a crash mid-task
//! never replays it; the requester has to send it again.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use taskbridge_adapters::{
    AdapterError, ChatGateway, CodexRunner, MessagePage, RepoManager, diff_snippet, diff_stat,
    ensure_clean_and_checkout,
};
use taskbridge_intent::{Message, ParseOptions, parse_message, validate_safety};
use taskbridge_store::{State, StateStore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::report;

/// How far back the very first poll looks.
const INITIAL_LOOKBACK_SECS: i64 = 30 * 60;

/// Lines of `git diff` kept for the report.
const DIFF_SNIPPET_LINES: usize = 120;

/// Counters for one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub pages: usize,
    pub fetched: usize,
    pub dispatched: usize,
    pub skipped: usize,
}

/// Owns the poll state and drives every other component.
pub struct Orchestrator {
    gateway: Arc<dyn ChatGateway>,
    repos: RepoManager,
    allow_list: HashSet<String>,
    store: StateStore,
    state: State,
    codex: CodexRunner,
    parse_opts: ParseOptions,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Create an orchestrator, loading the persisted state from `store`.
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        store: StateStore,
        codex: CodexRunner,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let state = store.load().context("load state")?;
        Ok(Self {
            gateway,
            repos: RepoManager::default(),
            allow_list: HashSet::new(),
            store,
            state,
            codex,
            parse_opts: ParseOptions::default(),
            poll_interval: Duration::from_secs(8),
            cancel,
        })
    }

    pub fn with_repos(mut self, repos: RepoManager) -> Self {
        self.repos = repos;
        self
    }

    /// Principal ids allowed to trigger tasks.
    pub fn with_allow_list(mut self, allow_list: HashSet<String>) -> Self {
        self.allow_list = allow_list;
        self
    }

    pub fn with_parse_options(mut self, opts: ParseOptions) -> Self {
        self.parse_opts = opts;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The in-memory state (mirrors the state file after each cycle).
    pub fn state(&self) -> &State {
        &self.state
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    /// Poll immediately, then on every tick, until cancelled.  Cycle errors
    /// are logged and the loop carries on.
    pub async fn run(&mut self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "runner started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.poll_once().await {
                Ok(stats) if stats.dispatched > 0 => info!(?stats, "poll cycle complete"),
                Ok(stats) => debug!(?stats, "poll cycle complete"),
                Err(e) if self.cancel.is_cancelled() => {
                    debug!(error = %e, "poll cycle interrupted by shutdown");
                }
                Err(e) => error!(error = %format_args!("{e:#}"), "poll cycle failed"),
            }
        }

        info!("runner stopped");
    }

    /// Run one poll cycle: page through new messages, dispatch each unseen
    /// one and persist the state.
    ///
    /// On a fetch error the cursor and last-poll time stay put, but the
    /// processed set gathered so far is still saved.  On cancellation the
    /// cycle stops before the next message and saves likewise.
    pub async fn poll_once(&mut self) -> Result<PollStats> {
        let start = self.window_start(Utc::now());
        let mut cursor = self.state.cursor.clone();
        let mut stats = PollStats::default();

        let completed = 'pages: loop {
            let page = match self.fetch(start, &cursor).await {
                Ok(page) => page,
                Err(e) => {
                    self.persist_after_abort();
                    return Err(e).context("fetch messages");
                }
            };
            stats.pages += 1;

            for msg in page.messages {
                stats.fetched += 1;
                if self.state.is_processed(&msg.message_id) {
                    stats.skipped += 1;
                    continue;
                }
                if self.cancel.is_cancelled() {
                    break 'pages false;
                }

                self.state.mark_processed(&msg.message_id, Utc::now());
                stats.dispatched += 1;
                if let Err(e) = self.handle_message(&msg).await {
                    warn!(message_id = %msg.message_id, error = %e, "message handling failed");
                }
            }

            cursor = page.next_cursor;
            if cursor.is_empty() {
                break true;
            }
        };

        if completed {
            self.state.cursor = cursor;
            self.state.last_poll_unix = Utc::now().timestamp();
        }
        self.store.save(&mut self.state).context("save state")?;
        Ok(stats)
    }

    fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let lookback = now - chrono::Duration::seconds(INITIAL_LOOKBACK_SECS);
        if self.state.last_poll_unix == 0 {
            return lookback;
        }
        DateTime::from_timestamp(self.state.last_poll_unix, 0).unwrap_or(lookback)
    }

    fn persist_after_abort(&mut self) {
        if let Err(e) = self.store.save(&mut self.state) {
            error!(error = %e, "failed to save state after aborted poll");
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Carry one message from parsing to the final report.  Problems with
    /// the request are answered in the chat; only reply failures surface
    /// as errors.
    #[instrument(skip_all, fields(message_id = %msg.message_id, chat_id = %msg.chat_id))]
    async fn handle_message(&self, msg: &Message) -> std::result::Result<(), AdapterError> {
        let chat = msg.chat_id.as_str();

        if !self.allow_list.contains(&msg.sender_id) {
            warn!(sender_id = %msg.sender_id, "sender not in allow list");
            return self.reply(chat, report::UNAUTHORIZED).await;
        }

        let task = match parse_message(msg, &self.parse_opts) {
            Ok(task) => task.with_id(Utc::now()),
            Err(e) => {
                info!(error = %e, "unparseable instruction");
                return self.reply(chat, &report::parse_failed(&e)).await;
            }
        };

        if let Err(e) = validate_safety(&[&task.instruction, &task.test_cmd]) {
            return self.reply(chat, &report::rejected(&e)).await;
        }

        info!(task_id = %task.id, repo = %task.repo, branch = %task.branch_label(), "task accepted");
        self.reply(chat, &report::accepted(&task)).await?;

        let repo = match self.repos.resolve(&task.repo) {
            Ok(repo) => repo,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "repository rejected");
                return self.reply(chat, &report::repo_invalid(&e)).await;
            }
        };

        if let Err(e) = ensure_clean_and_checkout(repo, &task.branch, &self.cancel).await {
            warn!(task_id = %task.id, error = %e, "repository not ready");
            return self.reply(chat, &report::repo_not_ready(&e)).await;
        }

        let mut run = self.codex.execute(&task, &repo.local_path, &self.cancel).await;
        if run.should_run_tests() {
            let tests = self.codex.run_tests(&task, &repo.local_path, &self.cancel).await;
            run.test_output = tests.output;
            run.test_error = tests.error;
        }

        let stat = diff_stat(&repo.local_path, &self.cancel).await;
        let snippet = diff_snippet(&repo.local_path, DIFF_SNIPPET_LINES, &self.cancel).await;

        info!(
            task_id = %task.id,
            succeeded = run.succeeded(),
            timed_out = run.timed_out,
            elapsed_secs = run.duration.as_secs(),
            "task finished"
        );
        self.reply(chat, &report::final_report(&task, &run, &stat, &snippet))
            .await
    }

    // -----------------------------------------------------------------------
    // Gateway calls, raced against shutdown
    // -----------------------------------------------------------------------

    async fn fetch(
        &self,
        start: DateTime<Utc>,
        cursor: &str,
    ) -> std::result::Result<MessagePage, AdapterError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AdapterError::Cancelled("fetch messages".into())),
            page = self.gateway.fetch_messages(start, cursor) => page,
        }
    }

    async fn reply(&self, chat_id: &str, text: &str) -> std::result::Result<(), AdapterError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AdapterError::Cancelled("send reply".into())),
            sent = self.gateway.send_text(chat_id, text) => sent,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
