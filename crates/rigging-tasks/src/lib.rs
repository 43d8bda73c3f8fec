//! Rigging Tasks - Task graph engine
//!
//! This crate turns requested operations (build, deploy, test, run, delete)
//! into a deduplicated task DAG, executes it with bounded concurrency and a
//! content-addressed result cache, and re-submits work in watch mode.

pub mod cache;
pub mod dag;
pub mod handler;
pub mod reporter;
pub mod scheduler;
pub mod state;
pub mod task;
pub mod watch;

pub use cache::{CacheEntry, CacheError, CacheOutcome, CacheStats, CacheStatus, ResultCache};
pub use dag::{DagError, TaskDag, TaskNode};
pub use handler::{HandlerRegistry, TaskContext, TaskError, TaskHandler, TaskOutput};
pub use reporter::{
    ChannelReporter, CollectingReporter, TaskEvent, TaskReporter, TaskReporterRegistry,
    TracingReporter,
};
pub use scheduler::{SchedulerOptions, TaskGraph};
pub use state::{GraphResults, SkipReason, TaskResult, TaskStatus};
pub use task::{Task, TaskKey, TaskKind};
pub use watch::{
    ChangeHandler, DevChangeHandler, GraphSource, ProcessOrchestrator, WatchEvent, WatchSummary,
};
