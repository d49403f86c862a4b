//! Inbound event routing.
//!
//! A single entry point, [`Router::dispatch`], takes a raw webhook body,
//! parses it into the [`Event`] sum type, and hands it to the right
//! direction-specific handler. Every handler runs under a guard that logs
//! failures with the full error chain before re-raising them, so an
//! operator can reconstruct what broke without the transport swallowing
//! anything.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use ferry_config::{Config, normalize_repo_url};
use ferry_git::GitRepo;
use ferry_types::{
    Ctx, Event, FerryError, PullRequestPayload, PushPayload, StatusPayload, SyncDirection,
};
use tracing::{debug, error, info};

use crate::external::{
    CodeHost, DownstreamActions, LandingActions, SyncStore, UpstreamActions, WorktreePool,
};

/// Demultiplexer for inbound webhook events.
pub struct Router<'a> {
    config: &'a Config,
    /// Normalized integration-repo URL → repo name.
    integration_repos: BTreeMap<String, String>,
    landing_repo: Option<String>,
    git_wpt: &'a GitRepo,
    syncs: &'a dyn SyncStore,
    host: &'a dyn CodeHost,
    downstream: &'a dyn DownstreamActions,
    upstream: &'a dyn UpstreamActions,
    landing: &'a dyn LandingActions,
    worktrees: &'a dyn WorktreePool,
}

impl<'a> Router<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &'a Config,
        git_wpt: &'a GitRepo,
        syncs: &'a dyn SyncStore,
        host: &'a dyn CodeHost,
        downstream: &'a dyn DownstreamActions,
        upstream: &'a dyn UpstreamActions,
        landing: &'a dyn LandingActions,
        worktrees: &'a dyn WorktreePool,
    ) -> Self {
        Self {
            config,
            integration_repos: config.integration_repos(),
            landing_repo: config
                .landing_repo()
                .map(|u| normalize_repo_url(u).unwrap_or_else(|_| u.to_string())),
            git_wpt,
            syncs,
            host,
            downstream,
            upstream,
            landing,
            worktrees,
        }
    }

    /// Route one webhook body to its handler.
    ///
    /// A body whose `event` kind is not recognized fails parsing: the kind
    /// set is closed, so that is a bug in the producer, not data.
    pub fn dispatch(&self, ctx: &Ctx, body: &serde_json::Value) -> Result<()> {
        let event: Event =
            serde_json::from_value(body.clone()).context("failed to parse event body")?;
        let kind = event.kind();
        debug!(kind, "dispatching event");

        self.guarded(kind, || match event {
            Event::PullRequest(payload) => self.handle_pull_request(ctx, &payload),
            Event::Status(payload) => self.handle_status(ctx, &payload),
            Event::Push(payload) => self.handle_push(ctx, &payload),
            Event::Task(payload) => self.downstream.update_taskgroup(ctx, &payload),
            Event::Taskgroup(payload) => self
                .downstream
                .taskgroup_resolved(ctx, &payload.task_group_id),
            Event::Landing => self.landing.land(ctx),
            Event::Cleanup => self.worktrees.cleanup(),
        })
    }

    /// Log handler failures with the full chain, then re-raise.
    fn guarded(&self, name: &str, f: impl FnOnce() -> Result<()>) -> Result<()> {
        match f() {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(handler = name, "{name} failed with error: {err:?}");
                Err(err)
            }
        }
    }

    fn handle_pull_request(&self, ctx: &Ctx, payload: &PullRequestPayload) -> Result<()> {
        self.host.cache_pull(&payload.pull_request)?;

        let Some(sync) = self.syncs.get(payload.number)? else {
            // An unknown PR is a new thing we should set up state for.
            if payload.action == "opened" {
                self.downstream.new_pr(ctx, &payload.pull_request)?;
            }
            return Ok(());
        };

        match sync.direction {
            SyncDirection::Upstream => {
                // A PR we created; nothing to route back to ourselves.
                debug!(pr = payload.number, "ignoring event for our own PR");
                Ok(())
            }
            SyncDirection::Downstream => self.downstream.pr_updated(ctx, &sync, payload),
        }
    }

    fn handle_status(&self, ctx: &Ctx, payload: &StatusPayload) -> Result<()> {
        if payload.context == self.config.status_context() {
            // Never handle changes to our own status.
            debug!(sha = %payload.sha, "ignoring our own status context");
            return Ok(());
        }

        let rev = &payload.sha;
        let Some(pr_id) = self.git_wpt.pr_for_commit(rev, ctx)? else {
            if !self.git_wpt.is_ancestor(rev, "origin/master")? {
                debug!(?payload, "unroutable status event");
                error!("Got status for commit {rev}, but that isn't the head of any PR");
            }
            return Ok(());
        };
        info!("Got status for commit {rev} from PR {pr_id}");

        let sync = match self.syncs.get(pr_id)? {
            Some(sync) => sync,
            None => {
                // Presumably something we ought to be downstreaming but
                // missed the opened event for.
                info!(pr = pr_id, "Got a status update for an unknown PR");
                let pull = self.host.get_pull(pr_id)?;
                match self.downstream.new_pr(ctx, &pull)? {
                    Some(sync) => sync,
                    None => return Ok(()),
                }
            }
        };

        match sync.direction {
            SyncDirection::Upstream => self.upstream.status_changed(
                ctx,
                &sync,
                &payload.context,
                &payload.status,
                &payload.url,
            ),
            SyncDirection::Downstream => self.downstream.status_changed(ctx, &sync, payload),
        }
    }

    fn handle_push(&self, ctx: &Ctx, payload: &PushPayload) -> Result<()> {
        match payload {
            PushPayload::Commits { commits } => {
                let ids: Vec<String> = commits.iter().map(|c| c.id.clone()).collect();
                self.landing.push_commits(ctx, &ids)
            }
            PushPayload::Repo { data } => {
                let rev = data.heads.first().ok_or_else(|| {
                    FerryError::Value("push event with no heads".to_string())
                })?;
                let repo_url = normalize_repo_url(&data.repo_url)
                    .unwrap_or_else(|_| data.repo_url.clone());
                debug!(repo = %repo_url, "commit landed in repo");

                if let Some(repo_name) = self.integration_repos.get(&repo_url) {
                    self.upstream.integration_commit(ctx, rev, repo_name)
                } else if self.landing_repo.as_deref() == Some(repo_url.as_str()) {
                    self.upstream.landing_commit(ctx, rev)
                } else {
                    debug!(repo = %repo_url, "push for unrelated repo");
                    Ok(())
                }
            }
        }
    }
}
