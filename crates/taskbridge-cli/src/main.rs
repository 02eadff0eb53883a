//! CLI entry point for taskbridge.
//!
//! This binary provides the `taskbridge` command: the long-running poll
//! loop, a single poll cycle, and a configuration check.

mod cli;
mod config;
mod helpers;
mod orchestrator;
mod report;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use taskbridge_adapters::{CodexRunner, DEFAULT_MAX_OUTPUT, FeishuGateway, RepoConfig, RepoManager};
use taskbridge_intent::ParseOptions;
use taskbridge_store::StateStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::{Cli, Commands};
use crate::config::{RuntimeConfig, load_allow_list, load_repos};
use crate::helpers::init_tracing;
use crate::orchestrator::Orchestrator;

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // A missing .env file is fine; the environment may be set directly.
    let dotenv = dotenvy::dotenv();
    init_tracing("info", cli.json_logs);
    if let Ok(path) = dotenv {
        info!(path = %path.display(), "loaded .env");
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd_run().await,
        Commands::Once => cmd_once().await,
        Commands::Check => cmd_check(),
    }
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

/// Everything read from the environment and config files at startup.
struct Startup {
    config: RuntimeConfig,
    repos: Vec<RepoConfig>,
    allow_list: HashSet<String>,
}

fn load_startup() -> Result<Startup> {
    let mut config = RuntimeConfig::from_env().context("load runtime config")?;
    config.prepare_work_dir()?;
    let repos = load_repos(&config.repos_file).context("load repos")?;
    let allow_list = load_allow_list(&config.allowlist_file).context("load allow list")?;
    Ok(Startup {
        config,
        repos,
        allow_list,
    })
}

fn build_orchestrator(startup: Startup, cancel: CancellationToken) -> Result<Orchestrator> {
    let Startup {
        config,
        repos,
        allow_list,
    } = startup;

    let gateway = FeishuGateway::new(&config.feishu_app_id, &config.feishu_app_secret)
        .context("create feishu gateway")?
        .with_base_url(&config.feishu_api_base);
    let codex = CodexRunner::new(
        &config.codex_bin,
        config.log_dir(),
        config.exec_timeout,
        DEFAULT_MAX_OUTPUT,
    );

    info!(
        work_dir = %config.work_dir.display(),
        repos = repos.len(),
        allowed_senders = allow_list.len(),
        codex_bin = %config.codex_bin,
        "configuration loaded"
    );

    Ok(Orchestrator::new(
        Arc::new(gateway),
        StateStore::new(config.state_path()),
        codex,
        cancel,
    )?
    .with_repos(RepoManager::new(repos))
    .with_allow_list(allow_list)
    .with_parse_options(ParseOptions {
        default_repo: config.default_repo.clone(),
        default_test_cmd: config.default_test_cmd.clone(),
    })
    .with_poll_interval(config.poll_interval))
}

/// Cancel `cancel` on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "cannot listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
        info!("shutdown requested");
        cancel.cancel();
    });
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

async fn cmd_run() -> Result<()> {
    let startup = load_startup()?;
    let cancel = CancellationToken::new();
    let mut orchestrator = build_orchestrator(startup, cancel.clone())?;

    spawn_signal_handler(cancel);
    orchestrator.run().await;
    info!("runner exited");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: once
// ---------------------------------------------------------------------------

async fn cmd_once() -> Result<()> {
    let startup = load_startup()?;
    let cancel = CancellationToken::new();
    let mut orchestrator = build_orchestrator(startup, cancel.clone())?;

    spawn_signal_handler(cancel);
    let stats = orchestrator.poll_once().await?;
    info!(
        pages = stats.pages,
        fetched = stats.fetched,
        dispatched = stats.dispatched,
        skipped = stats.skipped,
        processed_total = orchestrator.state().processed.len(),
        "poll cycle complete"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: check
// ---------------------------------------------------------------------------

fn cmd_check() -> Result<()> {
    let startup = load_startup()?;
    let config = &startup.config;

    println!();
    println!("  taskbridge configuration");
    println!("  ========================");
    println!();
    println!("  Work directory:   {}", config.work_dir.display());
    println!("  State file:       {}", config.state_path().display());
    println!("  Tool binary:      {}", config.codex_bin);
    println!("  Poll interval:    {}s", config.poll_interval.as_secs());
    println!("  Tool timeout:     {}m", config.exec_timeout.as_secs() / 60);
    println!("  Default test cmd: {}", config.default_test_cmd);
    if !config.default_repo.is_empty() {
        println!("  Default repo:     {}", config.default_repo);
    }
    println!("  Allowed senders:  {}", startup.allow_list.len());
    println!();

    let manager = RepoManager::new(startup.repos.iter().cloned());
    println!("  Repositories ({}):", manager.len());
    for repo in manager.repos() {
        let path = if repo.local_path.join(".git").exists() {
            "OK"
        } else if repo.local_path.is_dir() {
            "NOT A GIT CHECKOUT"
        } else {
            "MISSING"
        };
        println!(
            "    {:<20} allowed={:<5} branch={:<12} path={} ({path})",
            repo.name,
            repo.allowed,
            if repo.default_branch.is_empty() {
                "(current)"
            } else {
                repo.default_branch.as_str()
            },
            repo.local_path.display(),
        );
    }
    println!();

    if startup.allow_list.is_empty() {
        warn!("allow list is empty; every sender will be refused");
    }
    Ok(())
}
