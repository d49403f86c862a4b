//! Interfaces to the systems ferry coordinates but does not own.
//!
//! The try-push engine and the router talk to the defect tracker, the CI
//! cluster, the code host, the sync store, and the direction-specific
//! landing layers exclusively through these traits. Implementations live
//! elsewhere; tests substitute recorders.

use std::path::Path;

use anyhow::Result;
use ferry_git::Worktree;
use ferry_types::{Ctx, PullRequestPayload, StatusPayload, SyncRef, TaskRecord};

/// Defect tracker (Bugzilla-style). Comments are the engine's only
/// user-visible surface.
pub trait Tracker {
    fn comment(&self, bug: u64, text: &str) -> Result<()>;
}

/// CI tree status service.
pub trait TreeStatus {
    /// Whether `tree` currently accepts pushes.
    fn is_open(&self, tree: &str) -> Result<bool>;
}

/// The CI cluster running try task groups.
pub trait CiCluster {
    /// Canonical form of a task-group id (the scheduler sometimes hands
    /// out an alias of the decision task's id).
    fn normalize_taskgroup_id(&self, id: &str) -> Result<String>;

    /// All tasks currently known for a task group.
    fn taskgroup_tasks(&self, taskgroup_id: &str) -> Result<Vec<TaskRecord>>;

    /// Request `count` additional runs of a task, returning created job ids.
    fn retrigger(&self, task_id: &str, count: u32) -> Result<Vec<String>>;

    /// Fetch one artifact of a task into `dest`.
    fn download_log(&self, task_id: &str, file_name: &str, dest: &Path) -> Result<()>;
}

/// The code-review platform hosting the upstream test repository.
pub trait CodeHost {
    /// Refresh the local cache of PR metadata from a delivered PR object.
    fn cache_pull(&self, pull: &serde_json::Value) -> Result<()>;

    /// Fetch the PR object for an id we have no cached state for.
    fn get_pull(&self, pr_id: u64) -> Result<serde_json::Value>;
}

/// Lookup of sync entities. Syncs are owned by the landing layers.
pub trait SyncStore {
    fn get(&self, pr_id: u64) -> Result<Option<SyncRef>>;
}

/// Downstreaming: bringing upstream PRs into gecko.
pub trait DownstreamActions {
    /// Set up state for an upstream PR we have not seen before.
    fn new_pr(&self, ctx: &Ctx, pull: &serde_json::Value) -> Result<Option<SyncRef>>;

    /// An already-tracked downstream PR changed (closed, synchronized, ...).
    fn pr_updated(&self, ctx: &Ctx, sync: &SyncRef, payload: &PullRequestPayload) -> Result<()>;

    /// A commit status changed on a downstream sync's PR.
    fn status_changed(&self, ctx: &Ctx, sync: &SyncRef, payload: &StatusPayload) -> Result<()>;

    /// Partial task data arrived for a try push's task group.
    fn update_taskgroup(&self, ctx: &Ctx, payload: &serde_json::Value) -> Result<()>;

    /// A task group resolved; analyze the try push's results.
    fn taskgroup_resolved(&self, ctx: &Ctx, taskgroup_id: &str) -> Result<()>;
}

/// Upstreaming: pushing gecko changes out to the test repository.
pub trait UpstreamActions {
    /// A commit status changed on one of our own upstream PRs.
    fn status_changed(
        &self,
        ctx: &Ctx,
        sync: &SyncRef,
        context: &str,
        status: &str,
        url: &str,
    ) -> Result<()>;

    /// A commit landed in an integration repo.
    fn integration_commit(&self, ctx: &Ctx, rev: &str, repo_name: &str) -> Result<()>;

    /// A commit landed in the landing repo.
    fn landing_commit(&self, ctx: &Ctx, rev: &str) -> Result<()>;
}

/// Landing gecko-ward: recording upstream pushes and applying pending work.
pub trait LandingActions {
    /// Commits landed on the upstream default branch.
    fn push_commits(&self, ctx: &Ctx, commit_ids: &[String]) -> Result<()>;

    /// Land pending downstream work into gecko.
    fn land(&self, ctx: &Ctx) -> Result<()>;
}

/// Provider of per-operation worktrees for the local gecko repository.
pub trait WorktreePool {
    /// An exclusive worktree for this sync, held until dropped.
    fn acquire(&self, sync: &SyncRef) -> Result<Worktree>;

    /// Remove worktrees no live operation holds.
    fn cleanup(&self) -> Result<()>;
}
