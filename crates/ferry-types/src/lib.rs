//! # Types
//!
//! Core domain types for ferry, the wpt ↔ gecko synchronization engine:
//! - [`ProcessName`] - Structured identifier for a try push record
//! - [`TryPushStatus`] - Try push lifecycle states and the transition table
//! - [`SyncRef`] - The core's read view of an externally owned sync
//! - [`TaskRecord`] / [`TaskState`] - CI task-group entries
//! - [`Event`] - Typed inbound webhook bodies
//! - [`FerryError`] - Retryable / abort / value error kinds
//! - [`Ctx`] - Cancellation and deadline token for blocking operations
//!
//! ## Serialization
//!
//! Persisted types use kebab-case keys (`try-rev`, `gecko-head`) so records
//! written by earlier deployments of the sync service load unchanged.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error kinds surfaced by ferry operations.
///
/// Three classes, matching how the orchestrator reacts:
/// - [`FerryError::Retryable`] - transient (CI tree closed, submission tool
///   exited non-zero); reschedule with backoff.
/// - [`FerryError::Abort`] - a structural precondition failed; surfaced
///   directly.
/// - [`FerryError::Value`] - a programming error in state (invalid status,
///   undeclared transition); not recovered.
#[derive(Debug, Error)]
pub enum FerryError {
    /// Transient failure wrapping the underlying abort reason.
    #[error("retryable: {source}")]
    Retryable {
        #[source]
        source: Box<FerryError>,
    },
    /// Structural precondition violated.
    #[error("abort: {0}")]
    Abort(String),
    /// Invalid in-memory or persisted state.
    #[error("{0}")]
    Value(String),
}

impl FerryError {
    /// Wrap an error as retryable.
    pub fn retryable(source: FerryError) -> Self {
        Self::Retryable {
            source: Box::new(source),
        }
    }

    /// Shorthand for a retryable abort, the common "try is closed" shape.
    pub fn retryable_abort(msg: impl Into<String>) -> Self {
        Self::retryable(Self::Abort(msg.into()))
    }

    /// Whether an error chain bottoms out in a retryable ferry error.
    pub fn is_retryable(err: &anyhow::Error) -> bool {
        err.downcast_ref::<FerryError>()
            .map(|e| matches!(e, FerryError::Retryable { .. }))
            .unwrap_or(false)
    }
}

/// Direction of a sync relative to the upstream test repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    /// Changes we push upstream (the PR is ours).
    Upstream,
    /// Upstream changes we bring into gecko.
    Downstream,
}

/// The core's read view of a sync entity.
///
/// Syncs are owned by the downstream/upstream landing layers; the try push
/// engine only consumes the attributes captured here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRef {
    /// Upstream pull request id.
    pub pr_id: u64,
    /// Sync subtype, e.g. "downstream" or "landing".
    pub sync_type: String,
    pub direction: SyncDirection,
    /// Sync lifecycle status ("open", ...). Owned by the landing layers.
    pub status: String,
    /// Defect-tracker ticket, when one has been filed.
    pub bug: Option<u64>,
    /// Head commit of the gecko side at sync creation.
    pub gecko_head: String,
    /// Head commit of the wpt side at sync creation.
    pub wpt_head: String,
}

impl SyncRef {
    /// Lock key serializing all mutations for this sync.
    pub fn lock_key(&self) -> SyncKey {
        SyncKey {
            sync_type: self.sync_type.clone(),
            pr_id: self.pr_id,
        }
    }
}

/// Key identifying the serialization domain for a sync's mutations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncKey {
    pub sync_type: String,
    pub pr_id: u64,
}

impl fmt::Display for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sync_type, self.pr_id)
    }
}

/// Structured identifier for a try push: `try/<sync-type>/<pr-id>/<seq>`.
///
/// `seq` is a monotonic counter per `(sync-type, pr-id)`, so the name of
/// the Nth try push for a PR is stable and enumerable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProcessName {
    sync_type: String,
    pr_id: u64,
    seq: u64,
}

impl ProcessName {
    pub fn new(sync_type: impl Into<String>, pr_id: u64, seq: u64) -> Self {
        Self {
            sync_type: sync_type.into(),
            pr_id,
            seq,
        }
    }

    pub fn sync_type(&self) -> &str {
        &self.sync_type
    }

    pub fn pr_id(&self) -> u64 {
        self.pr_id
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Lock key shared with the owning sync.
    pub fn lock_key(&self) -> SyncKey {
        SyncKey {
            sync_type: self.sync_type.clone(),
            pr_id: self.pr_id,
        }
    }

    /// Parse `try/<sync-type>/<pr-id>/<seq>`.
    pub fn parse(s: &str) -> Result<Self, FerryError> {
        let mut parts = s.split('/');
        let err = || FerryError::Value(format!("malformed process name {s:?}"));
        let kind = parts.next().ok_or_else(err)?;
        if kind != "try" {
            return Err(err());
        }
        let sync_type = parts.next().ok_or_else(err)?;
        if sync_type.is_empty() {
            return Err(err());
        }
        let pr_id = parts
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(err)?;
        let seq = parts
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(err)?;
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(Self {
            sync_type: sync_type.to_string(),
            pr_id,
            seq,
        })
    }
}

impl fmt::Display for ProcessName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "try/{}/{}/{}", self.sync_type, self.pr_id, self.seq)
    }
}

impl TryFrom<String> for ProcessName {
    type Error = FerryError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ProcessName> for String {
    fn from(name: ProcessName) -> Self {
        name.to_string()
    }
}

/// Try push lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TryPushStatus {
    Open,
    Complete,
    InfraFail,
}

/// Declared status edges. Anything else is a value error.
///
/// complete → open exists so "failed" landing try pushes can be reopened.
pub const STATUS_TRANSITIONS: &[(TryPushStatus, TryPushStatus)] = &[
    (TryPushStatus::Open, TryPushStatus::Complete),
    (TryPushStatus::Complete, TryPushStatus::Open),
    (TryPushStatus::InfraFail, TryPushStatus::Complete),
];

impl TryPushStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Complete => "complete",
            Self::InfraFail => "infra-fail",
        }
    }

    pub fn parse(s: &str) -> Result<Self, FerryError> {
        match s {
            "open" => Ok(Self::Open),
            "complete" => Ok(Self::Complete),
            "infra-fail" => Ok(Self::InfraFail),
            other => Err(FerryError::Value(format!("unrecognised status {other:?}"))),
        }
    }

    /// Validate a transition against the declared table.
    ///
    /// A self-transition is a permitted no-op.
    pub fn check_transition(from: Self, to: Self) -> Result<(), FerryError> {
        if from == to {
            return Ok(());
        }
        if STATUS_TRANSITIONS.contains(&(from, to)) {
            Ok(())
        } else {
            Err(FerryError::Value(format!(
                "tried to change status from {} to {}",
                from.as_str(),
                to.as_str()
            )))
        }
    }
}

impl fmt::Display for TryPushStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CI task state.
///
/// `Completed` is the success state; `Failed` and `Exception` are the two
/// failure shapes (test failure vs. infrastructure breakage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Unscheduled,
    Pending,
    Running,
    Completed,
    Failed,
    Exception,
}

impl TaskState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unscheduled" => Some(Self::Unscheduled),
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "exception" => Some(Self::Exception),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unscheduled => "unscheduled",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Exception => "exception",
        }
    }

    /// Whether the task has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Exception)
    }
}

/// One task from a CI task group, reduced to the fields the try push
/// engine consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    /// Task name from `task.metadata.name`.
    pub name: String,
    pub state: TaskState,
    /// Suite name from `task.extra.suite.name`, when present.
    pub suite: Option<String>,
    /// The gecko revision the task ran against, from
    /// `task.payload.env.GECKO_HEAD_REV`.
    pub gecko_head_rev: Option<String>,
}

impl TaskRecord {
    /// Extract a task record from one raw task-group entry.
    ///
    /// Entries without a task id or name are dropped: they cannot be
    /// retriggered or grouped, so nothing downstream can use them.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let task_id = value
            .pointer("/status/taskId")
            .and_then(|v| v.as_str())?
            .to_string();
        let name = value
            .pointer("/task/metadata/name")
            .and_then(|v| v.as_str())?
            .to_string();
        let state = value
            .pointer("/status/state")
            .and_then(|v| v.as_str())
            .and_then(TaskState::parse)
            .unwrap_or(TaskState::Unscheduled);
        let suite = value
            .pointer("/task/extra/suite/name")
            .or_else(|| value.pointer("/task/extra/suite"))
            .and_then(|v| v.as_str())
            .map(String::from);
        let gecko_head_rev = value
            .pointer("/task/payload/env/GECKO_HEAD_REV")
            .and_then(|v| v.as_str())
            .map(String::from);
        Some(Self {
            task_id,
            name,
            state,
            suite,
            gecko_head_rev,
        })
    }

    pub fn is_suite(&self, suite: &str) -> bool {
        self.suite
            .as_deref()
            .is_some_and(|s| s.starts_with(suite))
    }

    pub fn is_build(&self) -> bool {
        self.name.starts_with("build-")
    }

    pub fn is_test(&self) -> bool {
        self.name.starts_with("test-")
    }
}

/// Typed inbound webhook body: `{"event": <kind>, "payload": <object>}`.
///
/// An unrecognized kind fails deserialization; the dispatch table is a
/// closed set, so that is a programming error in the producer, not data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum Event {
    PullRequest(PullRequestPayload),
    Status(StatusPayload),
    Push(PushPayload),
    /// Partial task information for a task group; passed through opaque.
    Task(serde_json::Value),
    Taskgroup(TaskGroupPayload),
    /// Operational trigger, no payload.
    Landing,
    /// Operational trigger, no payload.
    Cleanup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestPayload {
    pub action: String,
    pub number: u64,
    /// Raw PR object as delivered by the code host.
    pub pull_request: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    pub sha: String,
    /// Status context, e.g. "continuous-integration/travis-ci/pr".
    pub context: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub url: String,
}

/// Push events arrive in two shapes: the code host's commit list, and the
/// downstream VCS bridge's `{data: {repo_url, heads}}` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PushPayload {
    Commits { commits: Vec<PushCommit> },
    Repo { data: RepoPush },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushCommit {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoPush {
    pub repo_url: String,
    pub heads: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGroupPayload {
    #[serde(rename = "taskGroupId")]
    pub task_group_id: String,
}

impl Event {
    /// Stable kind tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PullRequest(_) => "pull_request",
            Self::Status(_) => "status",
            Self::Push(_) => "push",
            Self::Task(_) => "task",
            Self::Taskgroup(_) => "taskgroup",
            Self::Landing => "landing",
            Self::Cleanup => "cleanup",
        }
    }
}

/// Cancellation and deadline token threaded through blocking operations.
///
/// Handlers block on external HTTP, subprocess invocation, and repository
/// I/O; each such suspension point calls [`Ctx::checkpoint`] or derives a
/// timeout from [`Ctx::remaining`].
#[derive(Debug, Clone)]
pub struct Ctx {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl Ctx {
    /// A context that never expires.
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation. Clones observe it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail fast at a suspension point when the operation was cancelled.
    pub fn checkpoint(&self) -> Result<(), FerryError> {
        if self.is_cancelled() {
            Err(FerryError::Abort("operation cancelled".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for Ctx {
    fn default() -> Self {
        Self::background()
    }
}
