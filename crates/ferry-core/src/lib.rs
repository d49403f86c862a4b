//! Core engine behind ferry.
//!
//! ferry keeps an upstream web-platform-tests repository and the
//! downstream gecko tree in sync. This crate owns the try-push subsystem
//! and the event-dispatch layer that feeds it:
//!
//! - [`router::Router`] - normalizes inbound webhook bodies into typed
//!   events and routes them by sync direction
//! - [`trycommit::TryCommit`] - stages a worktree and submits speculative
//!   builds to the try server
//! - [`trypush::TryPush`] - the durable try push record, its status
//!   machine, and the secondary indices that make it reachable
//! - [`tasks::TryPushTasks`] - result analysis and retrigger policy over
//!   a push's task group
//! - [`external`] - traits for the systems ferry coordinates but does not
//!   own (defect tracker, CI cluster, code host, landing layers)

pub mod external;
pub mod router;
pub mod tasks;
pub mod trycommit;
pub mod trypush;

pub use external::{
    CiCluster, CodeHost, DownstreamActions, LandingActions, SyncStore, Tracker, TreeStatus,
    UpstreamActions, WorktreePool,
};
pub use router::Router;
pub use tasks::{MIN_SUCCESS, RETRIGGER_COUNT, TryPushTasks, WPT_SUITE};
pub use trycommit::{DEFAULT_QUERY, FuzzyConfig, TryCommit};
pub use trypush::{TRY_TREE, TryPush, TryPushData, TryPushSpec};
