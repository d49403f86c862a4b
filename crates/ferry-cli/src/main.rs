//! Command-line adapter over the ferry core engine.
//!
//! The production deployment embeds ferry-core in an event-consuming
//! service; this binary covers the operational surface: feeding a single
//! event through the router, firing the landing and cleanup triggers,
//! listing persisted try pushes, and posting ad-hoc tracker comments.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use ferry_config::{Config, load_config};
use ferry_core::{
    CodeHost, DownstreamActions, LandingActions, Router, SyncStore, TryPush, UpstreamActions,
    WorktreePool,
};
use ferry_git::GitRepo;
use ferry_tracker::RestTracker;
use ferry_types::{Ctx, PullRequestPayload, StatusPayload, SyncRef};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "ferry", version, about = "wpt ↔ gecko sync engine")]
struct Cli {
    /// Directory holding .ferry.toml
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Route one event body (JSON) through the dispatcher
    Dispatch {
        /// File with the event body; stdin when omitted
        file: Option<PathBuf>,
    },
    /// Trigger landing of pending downstream work
    Landing,
    /// Remove worktrees no live operation holds
    Cleanup,
    /// List persisted try pushes
    List,
    /// Post a comment to the defect tracker
    Comment {
        bug: u64,
        text: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.dir)?;

    match cli.command {
        Command::Dispatch { file } => {
            let body = read_body(file.as_deref())?;
            dispatch(&config, &body)
        }
        Command::Landing => dispatch(&config, &serde_json::json!({"event": "landing"})),
        Command::Cleanup => dispatch(&config, &serde_json::json!({"event": "cleanup"})),
        Command::List => list(&config),
        Command::Comment { bug, text } => {
            let tracker = RestTracker::from_config(config.tracker())?;
            tracker.comment(bug, &text)
        }
    }
}

/// Read an event body from a file or stdin.
fn read_body(file: Option<&Path>) -> Result<serde_json::Value> {
    let text = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read event file {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("failed to read event body from stdin")?;
            buffer
        }
    };
    serde_json::from_str(&text).context("event body is not valid JSON")
}

fn dispatch(config: &Config, body: &serde_json::Value) -> Result<()> {
    let Some(wpt_path) = config.wpt_repo() else {
        bail!("repos.wpt is not configured");
    };
    let git_wpt = GitRepo::open(wpt_path)?;

    let unwired = Unwired;
    let router = Router::new(
        config, &git_wpt, &unwired, &unwired, &unwired, &unwired, &unwired, &unwired,
    );
    router.dispatch(&Ctx::background(), body)
}

fn list(config: &Config) -> Result<()> {
    let Some(gecko_path) = config.gecko_repo() else {
        bail!("repos.gecko is not configured");
    };
    let repo = GitRepo::open(gecko_path)?;

    for push in TryPush::load_all(&repo)? {
        println!(
            "{}\t{}\t{}\t{}",
            push.name(),
            push.status(),
            push.try_rev().unwrap_or("-"),
            push.taskgroup_id().unwrap_or("-"),
        );
    }
    Ok(())
}

/// Collaborators that are not wired into this process.
///
/// The landing layers run inside the sync service; from the CLI they only
/// announce what would have been invoked.
struct Unwired;

impl SyncStore for Unwired {
    fn get(&self, _pr_id: u64) -> Result<Option<SyncRef>> {
        Ok(None)
    }
}

impl CodeHost for Unwired {
    fn cache_pull(&self, _pull: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    fn get_pull(&self, pr_id: u64) -> Result<serde_json::Value> {
        bail!("code host is not wired in this process (PR {pr_id})")
    }
}

impl DownstreamActions for Unwired {
    fn new_pr(&self, _ctx: &Ctx, pull: &serde_json::Value) -> Result<Option<SyncRef>> {
        info!(pr = %pull["number"], "downstream.new_pr is not wired in this process");
        Ok(None)
    }

    fn pr_updated(
        &self,
        _ctx: &Ctx,
        sync: &SyncRef,
        _payload: &PullRequestPayload,
    ) -> Result<()> {
        info!(pr = sync.pr_id, "downstream.pr_updated is not wired in this process");
        Ok(())
    }

    fn status_changed(&self, _ctx: &Ctx, sync: &SyncRef, _payload: &StatusPayload) -> Result<()> {
        info!(pr = sync.pr_id, "downstream.status_changed is not wired in this process");
        Ok(())
    }

    fn update_taskgroup(&self, _ctx: &Ctx, _payload: &serde_json::Value) -> Result<()> {
        info!("downstream.update_taskgroup is not wired in this process");
        Ok(())
    }

    fn taskgroup_resolved(&self, _ctx: &Ctx, taskgroup_id: &str) -> Result<()> {
        info!(taskgroup_id, "downstream.taskgroup_resolved is not wired in this process");
        Ok(())
    }
}

impl UpstreamActions for Unwired {
    fn status_changed(
        &self,
        _ctx: &Ctx,
        sync: &SyncRef,
        _context: &str,
        _status: &str,
        _url: &str,
    ) -> Result<()> {
        info!(pr = sync.pr_id, "upstream.status_changed is not wired in this process");
        Ok(())
    }

    fn integration_commit(&self, _ctx: &Ctx, rev: &str, repo_name: &str) -> Result<()> {
        info!(rev, repo = repo_name, "upstream.integration_commit is not wired in this process");
        Ok(())
    }

    fn landing_commit(&self, _ctx: &Ctx, rev: &str) -> Result<()> {
        info!(rev, "upstream.landing_commit is not wired in this process");
        Ok(())
    }
}

impl LandingActions for Unwired {
    fn push_commits(&self, _ctx: &Ctx, commit_ids: &[String]) -> Result<()> {
        info!(count = commit_ids.len(), "landing.push_commits is not wired in this process");
        Ok(())
    }

    fn land(&self, _ctx: &Ctx) -> Result<()> {
        info!("landing.land is not wired in this process");
        Ok(())
    }
}

impl WorktreePool for Unwired {
    fn acquire(&self, sync: &SyncRef) -> Result<ferry_git::Worktree> {
        bail!("worktree pool is not wired in this process (PR {})", sync.pr_id)
    }

    fn cleanup(&self) -> Result<()> {
        info!("worktree cleanup is not wired in this process");
        Ok(())
    }
}
