//! Task results and terminal states

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::handler::TaskOutput;
use crate::task::TaskKey;

/// Why a task was not executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// A (transitive) dependency failed; holds the key that failed
    UpstreamFailed(TaskKey),
    /// The run was cancelled before the task could start
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpstreamFailed(key) => write!(f, "dependency {} failed", key),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Terminal status of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Task executed successfully
    Succeeded,
    /// A result for the same version was already cached
    CacheHit,
    /// Task executed and failed
    Failed(String),
    /// Task was never executed
    Skipped(SkipReason),
}

impl TaskStatus {
    /// Check if this status represents success
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::CacheHit)
    }

    /// Failed, or skipped because something upstream failed
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Failed(_) | Self::Skipped(SkipReason::UpstreamFailed(_))
        )
    }
}

/// Immutable outcome of one task in a graph run
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub key: TaskKey,
    pub version: String,
    pub status: TaskStatus,
    /// Handler output, also present on cache hits
    pub output: Option<TaskOutput>,
    /// When execution started; `None` if the task never ran
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub duration: Duration,
    /// Results of the tasks this one depended on
    pub dependency_results: BTreeMap<TaskKey, Arc<TaskResult>>,
}

impl TaskResult {
    /// Result for a task that never ran
    pub(crate) fn skipped(
        key: TaskKey,
        version: impl Into<String>,
        reason: SkipReason,
        dependency_results: BTreeMap<TaskKey, Arc<TaskResult>>,
    ) -> Self {
        Self {
            key,
            version: version.into(),
            status: TaskStatus::Skipped(reason),
            output: None,
            started_at: None,
            completed_at: Utc::now(),
            duration: Duration::ZERO,
            dependency_results,
        }
    }

    /// Error message for failed tasks
    pub fn error(&self) -> Option<&str> {
        match &self.status {
            TaskStatus::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Results of one `process` call, keyed by task key
#[derive(Debug, Clone, Default)]
pub struct GraphResults {
    results: BTreeMap<TaskKey, Arc<TaskResult>>,
}

impl GraphResults {
    pub fn new(results: BTreeMap<TaskKey, Arc<TaskResult>>) -> Self {
        Self { results }
    }

    pub fn get(&self, key: &TaskKey) -> Option<&Arc<TaskResult>> {
        self.results.get(key)
    }

    /// Tasks that executed and failed
    pub fn failed(&self) -> Vec<&Arc<TaskResult>> {
        self.results
            .values()
            .filter(|r| matches!(r.status, TaskStatus::Failed(_)))
            .collect()
    }

    /// Tasks that never executed
    pub fn skipped(&self) -> Vec<&Arc<TaskResult>> {
        self.results
            .values()
            .filter(|r| matches!(r.status, TaskStatus::Skipped(_)))
            .collect()
    }

    /// Count of cache hits
    pub fn cached(&self) -> usize {
        self.results
            .values()
            .filter(|r| r.status == TaskStatus::CacheHit)
            .count()
    }

    /// Whether any task failed or was skipped because of a failure
    pub fn has_errors(&self) -> bool {
        self.results.values().any(|r| r.status.is_failure())
    }

    /// Whether the run was cut short by cancellation
    pub fn was_cancelled(&self) -> bool {
        self.results
            .values()
            .any(|r| r.status == TaskStatus::Skipped(SkipReason::Cancelled))
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TaskKey, &Arc<TaskResult>)> {
        self.results.iter()
    }

    pub fn into_inner(self) -> BTreeMap<TaskKey, Arc<TaskResult>> {
        self.results
    }
}

impl IntoIterator for GraphResults {
    type Item = (TaskKey, Arc<TaskResult>);
    type IntoIter = std::collections::btree_map::IntoIter<TaskKey, Arc<TaskResult>>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}
