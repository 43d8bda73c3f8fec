//! Task handler capability interface and registry

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use rigging_core::{ConfigGraph, EntityNode};

use crate::reporter::{TaskEvent, TaskReporter};
use crate::state::TaskResult;
use crate::task::{Task, TaskKey, TaskKind};

/// Structured outcome of a successful task execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Captured log output
    pub log: String,
    /// Handler-specific payload
    #[serde(default)]
    pub data: serde_json::Value,
}

impl TaskOutput {
    pub fn new(log: impl Into<String>) -> Self {
        Self {
            log: log.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Failure of a task body
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("Command exited with code {code}: {message}")]
    CommandFailed { code: i32, message: String },

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TaskError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Everything a handler gets to execute one task
#[derive(Clone)]
pub struct TaskContext {
    pub task: Task,
    pub graph: Arc<ConfigGraph>,
    pub dependency_results: BTreeMap<TaskKey, Arc<TaskResult>>,
    reporter: Arc<dyn TaskReporter>,
}

impl TaskContext {
    pub(crate) fn new(
        task: Task,
        graph: Arc<ConfigGraph>,
        dependency_results: BTreeMap<TaskKey, Arc<TaskResult>>,
        reporter: Arc<dyn TaskReporter>,
    ) -> Self {
        Self {
            task,
            graph,
            dependency_results,
            reporter,
        }
    }

    /// Config graph node of the entity this task operates on
    pub fn node(&self) -> Result<&EntityNode, TaskError> {
        self.graph
            .entity(&self.task.entity())
            .map_err(|e| TaskError::Internal(e.to_string()))
    }

    /// Emit a line of task output
    pub fn output(&self, line: impl Into<String>, is_stderr: bool) {
        self.reporter.report(&TaskEvent::Output {
            key: self.task.key(),
            line: line.into(),
            is_stderr,
        });
    }
}

/// Executes tasks of one kind
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Kind of task this handler executes
    fn kind(&self) -> TaskKind;

    /// Tasks that must reach a terminal state before `task` may start
    fn resolve_dependencies(
        &self,
        task: &Task,
        graph: &ConfigGraph,
    ) -> rigging_core::Result<Vec<Task>> {
        task.kind.default_dependencies(task, graph)
    }

    /// Perform the work
    async fn execute(&self, ctx: TaskContext) -> Result<TaskOutput, TaskError>;
}

/// Lookup table of handlers by task kind, filled at startup
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same kind
    pub fn register<H: TaskHandler + 'static>(&mut self, handler: H) {
        self.register_arc(Arc::new(handler));
    }

    pub fn register_arc(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn with<H: TaskHandler + 'static>(mut self, handler: H) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn contains(&self, kind: TaskKind) -> bool {
        self.handlers.contains_key(&kind)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().collect();
        kinds.sort();
        f.debug_struct("HandlerRegistry").field("kinds", &kinds).finish()
    }
}
