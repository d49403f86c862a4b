//! Durable try push records.
//!
//! A try push is persisted as a JSON payload under
//! `refs/syncs/try/<sync-type>/<pr-id>/<seq>` in the gecko repository,
//! with `<seq>` counting pushes per PR. The record owns its status
//! machine, the two secondary indices that make it reachable by try
//! revision and task group, and the derived log operations.
//!
//! Every mutation requires the [`SyncLease`] covering the record's
//! `(sync-type, pr-id)` pair; creation additionally allocates the next
//! sequence id under that lease, which is what keeps it monotonic.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use ferry_config::Config;
use ferry_git::{GitRepo, RefStore};
use ferry_index::{TaskGroupIndex, TryCommitIndex};
use ferry_lock::SyncLease;
use ferry_types::{Ctx, FerryError, ProcessName, SyncRef, TryPushStatus};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::external::{CiCluster, Tracker, TreeStatus, WorktreePool};
use crate::tasks::TryPushTasks;
use crate::trycommit::{FuzzyConfig, TryCommit};

/// CI tree whose open/closed state gates submissions.
pub const TRY_TREE: &str = "try";

/// Artifacts fetched per included task when downloading logs.
const LOG_FILE_NAMES: &[&str] = &["wptreport.json"];

/// Persisted payload of a try push record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TryPushData {
    pub try_rev: Option<String>,
    pub taskgroup_id: Option<String>,
    pub status: TryPushStatus,
    pub stability: bool,
    pub gecko_head: String,
    pub wpt_head: String,
    pub bug: Option<u64>,
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub infra_fail: bool,
    #[serde(default)]
    pub accept_failures: bool,
}

/// Options for creating a try push.
#[derive(Debug, Clone)]
pub struct TryPushSpec<'a> {
    pub sync: &'a SyncRef,
    /// Affected test paths grouped by test type; restricts the selection.
    pub affected_tests: Option<&'a BTreeMap<String, Vec<String>>>,
    /// Multi-iteration run for flake detection.
    pub stability: bool,
    /// Apply the scheduling hacks before pushing.
    pub hacks: bool,
    /// Explicit repeat count, overriding the stability configuration.
    pub rebuild_count: Option<u32>,
    /// Verify the try tree is open first. Operational overrides skip it.
    pub check_open: bool,
    pub fuzzy: FuzzyConfig,
}

impl<'a> TryPushSpec<'a> {
    pub fn new(sync: &'a SyncRef) -> Self {
        Self {
            sync,
            affected_tests: None,
            stability: false,
            hacks: true,
            rebuild_count: None,
            check_open: true,
            fuzzy: FuzzyConfig::default(),
        }
    }
}

/// A durable try push record.
#[derive(Debug, Clone)]
pub struct TryPush {
    name: ProcessName,
    data: TryPushData,
}

impl PartialEq for TryPush {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for TryPush {}

impl TryPush {
    /// Create a try push for a sync: submit the speculative build, persist
    /// the record, index it, and announce it on the sync's bug.
    pub fn create(
        lease: &SyncLease,
        repo: &GitRepo,
        config: &Config,
        trees: &dyn TreeStatus,
        tracker: &dyn Tracker,
        worktrees: &dyn WorktreePool,
        spec: TryPushSpec<'_>,
        ctx: &Ctx,
    ) -> Result<TryPush> {
        let sync = spec.sync;
        lease.check(&sync.lock_key())?;
        info!(pr = sync.pr_id, "Creating try push");

        if spec.check_open && !trees.is_open(TRY_TREE)? {
            info!("try is closed");
            return Err(FerryError::retryable_abort("try is closed").into());
        }

        TaskGroupIndex::get_or_create(repo)?;
        let try_idx = TryCommitIndex::get_or_create(repo)?;

        let worktree = worktrees.acquire(sync)?;

        let rebuild_count = spec
            .rebuild_count
            .unwrap_or_else(|| if spec.stability { config.stability_count() } else { 0 });

        let try_rev = {
            let commit = TryCommit::stage(
                repo,
                &worktree,
                spec.affected_tests,
                rebuild_count,
                spec.hacks,
                spec.fuzzy.clone(),
                config.max_tests(),
            )?;
            commit.push(ctx)?
        };

        let store = RefStore::new(repo);
        let seq = store.next_seq(&format!("try/{}/{}", sync.sync_type, sync.pr_id))?;
        let name = ProcessName::new(sync.sync_type.clone(), sync.pr_id, seq);

        let push = TryPush {
            name: name.clone(),
            data: TryPushData {
                try_rev: try_rev.clone(),
                taskgroup_id: None,
                status: TryPushStatus::Open,
                stability: spec.stability,
                gecko_head: sync.gecko_head.clone(),
                wpt_head: sync.wpt_head.clone(),
                bug: sync.bug,
                created: Some(Utc::now()),
                infra_fail: false,
                accept_failures: false,
            },
        };
        store.save(&name.to_string(), &push.data)?;
        if let Some(rev) = &try_rev {
            try_idx.insert(rev, &name)?;
        }

        if let Some(bug) = sync.bug {
            let text = format!(
                "Pushed to try{} {}",
                if spec.stability { " (stability)" } else { "" },
                push.treeherder_url(config.treeherder_base())
            );
            if let Err(err) = tracker.comment(bug, &text) {
                warn!(bug, error = %err, "failed to announce try push on bug");
            }
        }

        Ok(push)
    }

    /// Load one record by name.
    pub fn load(repo: &GitRepo, name: &ProcessName) -> Result<Option<TryPush>> {
        let store = RefStore::new(repo);
        let Some(data) = store.load::<TryPushData>(&name.to_string())? else {
            return Ok(None);
        };
        Ok(Some(TryPush {
            name: name.clone(),
            data,
        }))
    }

    /// All persisted try pushes.
    pub fn load_all(repo: &GitRepo) -> Result<Vec<TryPush>> {
        let store = RefStore::new(repo);
        let mut pushes = Vec::new();
        for raw in store.list("try")? {
            let name = ProcessName::parse(&raw)
                .map_err(|e| anyhow::anyhow!("unparseable try push ref {raw}: {e}"))?;
            if let Some(push) = Self::load(repo, &name)? {
                pushes.push(push);
            }
        }
        Ok(pushes)
    }

    /// The try push whose speculative build is `rev`, if any.
    pub fn for_commit(repo: &GitRepo, rev: &str) -> Result<Option<TryPush>> {
        let idx = TryCommitIndex::new(repo);
        match idx.get(rev)? {
            Some(name) => {
                info!(rev, push = %name, "Found try push for rev");
                Self::load(repo, &name)
            }
            None => {
                info!(rev, "No try push for rev");
                Ok(None)
            }
        }
    }

    /// The try push owning a task group, if any.
    pub fn for_taskgroup(repo: &GitRepo, taskgroup_id: &str) -> Result<Option<TryPush>> {
        let idx = TaskGroupIndex::new(repo);
        match idx.get(taskgroup_id)? {
            Some(name) => Self::load(repo, &name),
            None => Ok(None),
        }
    }

    pub fn name(&self) -> &ProcessName {
        &self.name
    }

    pub fn status(&self) -> TryPushStatus {
        self.data.status
    }

    pub fn try_rev(&self) -> Option<&str> {
        self.data.try_rev.as_deref()
    }

    pub fn taskgroup_id(&self) -> Option<&str> {
        self.data.taskgroup_id.as_deref()
    }

    /// Whether this push is a stability (flake detection) run.
    pub fn stability(&self) -> bool {
        self.data.stability
    }

    pub fn bug(&self) -> Option<u64> {
        self.data.bug
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.data.created
    }

    /// Whether this push saw infrastructure failures. Sticky.
    pub fn infra_fail(&self) -> bool {
        self.data.infra_fail
    }

    /// Whether downstream landing tolerates non-success for this push.
    pub fn accept_failures(&self) -> bool {
        self.data.accept_failures
    }

    pub fn gecko_head(&self) -> &str {
        &self.data.gecko_head
    }

    pub fn wpt_head(&self) -> &str {
        &self.data.wpt_head
    }

    /// Dashboard URL for this push.
    pub fn treeherder_url(&self, base: &str) -> String {
        format!(
            "{base}/#/jobs?repo=try&revision={}",
            self.try_rev().unwrap_or("unknown")
        )
    }

    fn save(&self, repo: &GitRepo) -> Result<()> {
        RefStore::new(repo).save(&self.name.to_string(), &self.data)
    }

    fn check_lease(&self, lease: &SyncLease) -> Result<(), FerryError> {
        lease.check(&self.name.lock_key())
    }

    pub fn set_created(
        &mut self,
        lease: &SyncLease,
        repo: &GitRepo,
        when: DateTime<Utc>,
    ) -> Result<()> {
        self.check_lease(lease)?;
        self.data.created = Some(when);
        self.save(repo)
    }

    /// Record the remote revision, keeping the commit index consistent.
    pub fn set_try_rev(&mut self, lease: &SyncLease, repo: &GitRepo, rev: String) -> Result<()> {
        self.check_lease(lease)?;
        let old = self.data.try_rev.replace(rev.clone());
        self.save(repo)?;

        let idx = TryCommitIndex::new(repo);
        if let Some(old) = old {
            if old != rev {
                idx.delete(&old, &self.name)?;
            }
        }
        idx.insert(&rev, &self.name)
    }

    /// Record the task group, keeping the task-group index consistent.
    pub fn set_taskgroup_id(
        &mut self,
        lease: &SyncLease,
        repo: &GitRepo,
        taskgroup_id: String,
    ) -> Result<()> {
        self.check_lease(lease)?;
        let old = self.data.taskgroup_id.replace(taskgroup_id.clone());
        self.save(repo)?;

        let idx = TaskGroupIndex::new(repo);
        if let Some(old) = old {
            if old != taskgroup_id {
                idx.delete(&old, &self.name)?;
            }
        }
        idx.insert(&taskgroup_id, &self.name)
    }

    /// Move the push along the declared status machine.
    pub fn set_status(
        &mut self,
        lease: &SyncLease,
        repo: &GitRepo,
        status: TryPushStatus,
    ) -> Result<()> {
        self.check_lease(lease)?;
        if self.data.status == status {
            return Ok(());
        }
        TryPushStatus::check_transition(self.data.status, status)?;
        self.data.status = status;
        self.save(repo)
    }

    pub fn set_accept_failures(
        &mut self,
        lease: &SyncLease,
        repo: &GitRepo,
        value: bool,
    ) -> Result<()> {
        self.check_lease(lease)?;
        self.data.accept_failures = value;
        self.save(repo)
    }

    /// Mark infrastructure failure. The flag is sticky: attempts to clear
    /// it are ignored. On the rising edge the failed builds are reported
    /// to the bug.
    pub fn set_infra_fail(
        &mut self,
        lease: &SyncLease,
        repo: &GitRepo,
        value: bool,
        treeherder_base: &str,
        ci: &dyn CiCluster,
        tracker: &dyn Tracker,
    ) -> Result<()> {
        self.check_lease(lease)?;
        if value == self.data.infra_fail {
            return Ok(());
        }
        if !value {
            info!(push = %self.name, "infra-fail is sticky, ignoring clear");
            return Ok(());
        }
        self.data.infra_fail = true;
        self.save(repo)?;
        self.notify_failed_builds(treeherder_base, ci, tracker);
        Ok(())
    }

    /// Fold an `infra-fail` status back into `complete` + sticky flag.
    ///
    /// Returns whether a normalization happened.
    pub fn normalize_infra_status(
        &mut self,
        lease: &SyncLease,
        repo: &GitRepo,
        treeherder_base: &str,
        ci: &dyn CiCluster,
        tracker: &dyn Tracker,
    ) -> Result<bool> {
        if self.data.status != TryPushStatus::InfraFail {
            return Ok(false);
        }
        self.set_status(lease, repo, TryPushStatus::Complete)?;
        self.set_infra_fail(lease, repo, true, treeherder_base, ci, tracker)?;
        Ok(true)
    }

    /// Report the failed builds on the sync's bug. Best effort.
    fn notify_failed_builds(
        &self,
        treeherder_base: &str,
        ci: &dyn CiCluster,
        tracker: &dyn Tracker,
    ) {
        let Some(taskgroup_id) = self.data.taskgroup_id.clone() else {
            error!(push = %self.name, "No task group to report failed builds from");
            return;
        };
        let tasks = match ci.taskgroup_tasks(&taskgroup_id) {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(push = %self.name, error = %err, "failed to fetch task group");
                return;
            }
        };
        let view = TryPushTasks::new(taskgroup_id, tasks);
        let failed = view.failed_builds();
        if failed.is_empty() {
            error!(push = %self.name, "No failed builds to report for try push");
            return;
        }
        let Some(bug) = self.data.bug else {
            error!(push = %self.name, "No associated bug found for try push");
            return;
        };

        let mut msg = format!(
            "There were infrastructure failures for the Try push ({}):\n",
            self.treeherder_url(treeherder_base)
        );
        msg.push_str(
            &failed
                .iter()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        );
        if let Err(err) = tracker.comment(bug, &msg) {
            warn!(bug, error = %err, "failed to post infra-failure comment");
        }
    }

    /// Fetch and wrap this push's task group.
    ///
    /// The stored task-group id is normalized through the CI client first
    /// and written back when it differs.
    pub fn tasks(
        &mut self,
        lease: &SyncLease,
        repo: &GitRepo,
        ci: &dyn CiCluster,
    ) -> Result<TryPushTasks> {
        let taskgroup_id = self.data.taskgroup_id.clone().ok_or_else(|| {
            FerryError::Value(format!("no taskgroup for try push {}", self.name))
        })?;
        let normalized = ci.normalize_taskgroup_id(&taskgroup_id)?;
        if normalized != taskgroup_id {
            self.set_taskgroup_id(lease, repo, normalized.clone())?;
        }
        let tasks = ci.taskgroup_tasks(&normalized)?;
        Ok(TryPushTasks::new(normalized, tasks))
    }

    /// Deterministic log location under the configured root.
    pub fn log_path(&self, config: &Config) -> Result<PathBuf, FerryError> {
        let rev = self.try_rev().ok_or_else(|| {
            FerryError::Value(format!("unknown try rev for {}", self.name))
        })?;
        Ok(config
            .root()
            .join(config.try_logs())
            .join("try")
            .join(rev))
    }

    /// Download report logs for the push's wpt tasks.
    ///
    /// With `first_only`, each task name downloads once, except that later
    /// successful runs of an already-seen name are still taken (a
    /// stability rerun that went green is the interesting artifact).
    /// Returns the tasks whose logs were fetched.
    pub fn download_logs(
        &mut self,
        lease: &SyncLease,
        repo: &GitRepo,
        config: &Config,
        ci: &dyn CiCluster,
        wpt_tasks: &TryPushTasks,
        first_only: bool,
    ) -> Result<Vec<ferry_types::TaskRecord>> {
        if self.data.try_rev.is_none() {
            if let Some(first) = wpt_tasks.tasks().first() {
                info!("Got try push with no rev; setting it from a task");
                if let Some(rev) = first.gecko_head_rev.clone() {
                    self.set_try_rev(lease, repo, rev)?;
                }
            }
        }
        if self.data.try_rev.is_none() {
            return Err(
                FerryError::Value(format!("unknown try rev for {}", self.name)).into(),
            );
        }

        let dest = self.log_path(config)?;
        std::fs::create_dir_all(&dest)
            .map_err(|e| anyhow::anyhow!("failed to create log dir {}: {e}", dest.display()))?;

        info!(rev = self.try_rev().unwrap_or_default(), "Downloading logs for try revision");

        let mut exclude: HashSet<String> = HashSet::new();
        let mut included = Vec::new();
        for task in wpt_tasks.tasks() {
            let keep = !exclude.contains(&task.name)
                || task.state == ferry_types::TaskState::Completed;
            if first_only {
                exclude.insert(task.name.clone());
            }
            if !keep {
                continue;
            }
            for file_name in LOG_FILE_NAMES.iter().copied() {
                if let Err(err) = ci.download_log(&task.task_id, file_name, &dest) {
                    warn!(task = %task.name, file = file_name, error = %err, "failed to download log");
                }
            }
            included.push(task.clone());
        }
        Ok(included)
    }

    /// Remove this push's downloaded logs. Best effort.
    pub fn cleanup_logs(&self, config: &Config) {
        let Ok(path) = self.log_path(config) else {
            return;
        };
        info!(push = %self.name, "Removing downloaded logs for try push");
        if let Err(err) = std::fs::remove_dir_all(&path) {
            warn!(path = %path.display(), error = %err, "failed to remove logs");
        }
    }

    /// Delete the record and purge both indices of its keys.
    pub fn delete(self, lease: &SyncLease, repo: &GitRepo) -> Result<()> {
        self.check_lease(lease)?;
        RefStore::new(repo).delete(&self.name.to_string())?;

        if let Some(taskgroup_id) = &self.data.taskgroup_id {
            TaskGroupIndex::new(repo).delete(taskgroup_id, &self.name)?;
        }
        if let Some(rev) = &self.data.try_rev {
            TryCommitIndex::new(repo).delete(rev, &self.name)?;
        }
        Ok(())
    }
}
