//! Result analysis over a try push's task group.
//!
//! [`TryPushTasks`] wraps the task group's tasks filtered to the
//! web-platform-tests suite and implements the sync-specific policy:
//! completion checks, the success-rate gate for metadata updates, and
//! which failures are worth retriggering.

use std::collections::BTreeMap;

use ferry_types::{TaskRecord, TaskState};
use tracing::{error, warn};

use crate::external::CiCluster;

/// Suite tag identifying the tasks this engine cares about.
pub const WPT_SUITE: &str = "web-platform-tests";

/// Extra runs requested per retriggered task.
pub const RETRIGGER_COUNT: u32 = 6;

/// Minimum rate of job success to proceed with metadata updates.
pub const MIN_SUCCESS: f64 = 0.7;

/// State counts for one task name, plus a representative task id used for
/// retriggering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskNameStates {
    pub task_id: String,
    pub states: BTreeMap<TaskState, u32>,
}

impl TaskNameStates {
    fn count(&self, state: TaskState) -> u32 {
        self.states.get(&state).copied().unwrap_or(0)
    }

    fn total(&self) -> u32 {
        self.states.values().sum()
    }
}

/// View over a task group's web-platform-tests tasks.
#[derive(Debug, Clone)]
pub struct TryPushTasks {
    taskgroup_id: String,
    wpt_tasks: Vec<TaskRecord>,
}

impl TryPushTasks {
    /// Wrap a task group, keeping only tasks in the wpt suite.
    pub fn new(taskgroup_id: impl Into<String>, tasks: Vec<TaskRecord>) -> Self {
        Self {
            taskgroup_id: taskgroup_id.into(),
            wpt_tasks: tasks
                .into_iter()
                .filter(|t| t.is_suite(WPT_SUITE))
                .collect(),
        }
    }

    pub fn taskgroup_id(&self) -> &str {
        &self.taskgroup_id
    }

    pub fn len(&self) -> usize {
        self.wpt_tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wpt_tasks.is_empty()
    }

    pub fn tasks(&self) -> &[TaskRecord] {
        &self.wpt_tasks
    }

    /// Whether every task reached a terminal state.
    ///
    /// Unscheduled tasks count as terminal only when `allow_unscheduled`
    /// is set (the decision task may legitimately skip platforms).
    pub fn complete(&self, allow_unscheduled: bool) -> bool {
        self.wpt_tasks.iter().all(|t| {
            t.state.is_terminal() || (allow_unscheduled && t.state == TaskState::Unscheduled)
        })
    }

    /// Sanity-check the task set before acting on its results.
    ///
    /// False when no wpt tasks were scheduled at all, or when the
    /// exception rate is too high to trust the run.
    pub fn validate(&self) -> bool {
        if self.wpt_tasks.is_empty() {
            error!(
                taskgroup = %self.taskgroup_id,
                "No wpt tests found. Check decision task"
            );
            return false;
        }
        let exceptions = self
            .wpt_tasks
            .iter()
            .filter(|t| t.state == TaskState::Exception)
            .count();
        if exceptions as f64 / self.wpt_tasks.len() as f64 > 1.0 - MIN_SUCCESS {
            error!(
                taskgroup = %self.taskgroup_id,
                exceptions,
                total = self.wpt_tasks.len(),
                "Too many exceptions found among wpt tests. Check decision task"
            );
            return false;
        }
        true
    }

    /// State counts grouped by task name.
    pub fn wpt_states(&self) -> BTreeMap<String, TaskNameStates> {
        let mut by_name: BTreeMap<String, TaskNameStates> = BTreeMap::new();
        for task in &self.wpt_tasks {
            let entry = by_name
                .entry(task.name.clone())
                .or_insert_with(|| TaskNameStates {
                    task_id: task.task_id.clone(),
                    states: BTreeMap::new(),
                });
            *entry.states.entry(task.state).or_insert(0) += 1;
            // One representative id per name is enough for retriggering.
            entry.task_id = task.task_id.clone();
        }
        by_name
    }

    /// Retrigger every failing task name, `count` extra runs each.
    ///
    /// aarch64 jobs are excluded: their failures are platform noise we do
    /// not gate on. Returns the number of jobs actually created.
    pub fn retrigger_failures(&self, ci: &dyn CiCluster, count: u32) -> u32 {
        let mut retriggered = 0;
        for (name, data) in self.wpt_states() {
            let failing =
                data.count(TaskState::Failed) > 0 || data.count(TaskState::Exception) > 0;
            if !failing || name.contains("-aarch64") {
                continue;
            }
            match ci.retrigger(&data.task_id, count) {
                Ok(jobs) => retriggered += jobs.len() as u32,
                Err(err) => {
                    warn!(task = %name, error = %err, "failed to retrigger task");
                }
            }
        }
        retriggered
    }

    /// Task names whose run count suggests we retriggered them, with their
    /// state counts. Ignores names with too few runs so manual one-off
    /// retriggers from outside the sync do not skew stability analysis.
    pub fn retriggered_wpt_states(&self) -> BTreeMap<String, TaskNameStates> {
        let threshold = std::cmp::max(1, RETRIGGER_COUNT / 2);
        self.wpt_states()
            .into_iter()
            .filter(|(_, data)| data.total() > threshold)
            .collect()
    }

    /// All wpt tasks succeeded (and there is at least one).
    pub fn success(&self) -> bool {
        !self.wpt_tasks.is_empty()
            && self
                .wpt_tasks
                .iter()
                .all(|t| t.state == TaskState::Completed)
    }

    /// Any wpt task ended in test failure.
    pub fn has_failures(&self) -> bool {
        self.wpt_tasks.iter().any(|t| t.state == TaskState::Failed)
    }

    /// Any test task (builds excluded) reached a result.
    pub fn has_completed_tests(&self) -> bool {
        self.wpt_tasks
            .iter()
            .filter(|t| t.is_test())
            .any(|t| matches!(t.state, TaskState::Completed | TaskState::Failed))
    }

    /// Ratio of succeeded wpt tasks; 0 when the set is empty.
    pub fn success_rate(&self) -> f64 {
        if self.wpt_tasks.is_empty() {
            return 0.0;
        }
        let success = self
            .wpt_tasks
            .iter()
            .filter(|t| t.state == TaskState::Completed)
            .count();
        success as f64 / self.wpt_tasks.len() as f64
    }

    /// Whether the success rate fell below `target_rate`.
    pub fn failure_limit_exceeded(&self, target_rate: f64) -> bool {
        self.success_rate() < target_rate
    }

    /// Build tasks that broke (test failure or infrastructure exception).
    pub fn failed_builds(&self) -> Vec<&TaskRecord> {
        self.wpt_tasks
            .iter()
            .filter(|t| {
                t.is_build() && matches!(t.state, TaskState::Failed | TaskState::Exception)
            })
            .collect()
    }

    /// Build tasks that completed successfully.
    pub fn successful_builds(&self) -> Vec<&TaskRecord> {
        self.wpt_tasks
            .iter()
            .filter(|t| t.is_build() && t.state == TaskState::Completed)
            .collect()
    }
}
