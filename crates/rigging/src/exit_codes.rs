//! Exit codes for the CLI

use rigging_core::RiggingError;
use rigging_tasks::DagError;

/// Success
pub const SUCCESS: i32 = 0;

/// General error
pub const ERROR: i32 = 1;

/// Configuration error (invalid config, unknown entity, dependency cycle)
pub const CONFIG_ERROR: i32 = 2;

/// At least one task failed or was skipped because of a failure
pub const TASK_FAILED: i32 = 3;

/// User cancelled
pub const CANCELLED: i32 = 130;

/// Tasks of a one-shot run failed
#[derive(Debug, thiserror::Error)]
#[error("{failed} {} failed", tasks_noun(.failed))]
pub struct TasksFailed {
    pub failed: usize,
}

fn tasks_noun(count: &usize) -> &'static str {
    if *count == 1 {
        "task"
    } else {
        "tasks"
    }
}

/// The run was interrupted before every task could start
#[derive(Debug, thiserror::Error)]
#[error("interrupted")]
pub struct Interrupted;

/// Map an error returned by a command to the process exit code
pub fn for_error(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.is::<TasksFailed>() {
            return TASK_FAILED;
        }
        if cause.is::<Interrupted>() {
            return CANCELLED;
        }
        if let Some(e) = cause.downcast_ref::<RiggingError>() {
            if e.is_configuration() {
                return CONFIG_ERROR;
            }
        }
        if let Some(e) = cause.downcast_ref::<DagError>() {
            return match e {
                DagError::Graph(inner) if !inner.is_configuration() => ERROR,
                _ => CONFIG_ERROR,
            };
        }
    }
    ERROR
}
