//! Task execution reporting

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::state::SkipReason;
use crate::task::TaskKey;

/// Events emitted during graph processing and watching
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A graph run is starting
    GraphStarted {
        task_count: usize,
    },
    /// A task is starting execution
    Started {
        key: TaskKey,
        version: String,
    },
    /// A task produced output
    Output {
        key: TaskKey,
        line: String,
        is_stderr: bool,
    },
    /// A task completed successfully
    Completed {
        key: TaskKey,
        duration: Duration,
        cached: bool,
    },
    /// A task failed
    Failed {
        key: TaskKey,
        duration: Duration,
        error: String,
    },
    /// A task was not executed
    Skipped {
        key: TaskKey,
        reason: SkipReason,
    },
    /// All tasks of a graph run reached a terminal state
    AllCompleted {
        total: usize,
        succeeded: usize,
        failed: usize,
        skipped: usize,
        cached: usize,
        duration: Duration,
    },
    /// Watch mode submitted a batch of tasks
    BatchSubmitted {
        batch: u64,
        task_count: usize,
        trigger: String,
    },
    /// A watch batch finished
    BatchCompleted {
        batch: u64,
        total: usize,
        failed: usize,
        duration: Duration,
    },
    /// Watch mode could not process a change
    WatchError {
        message: String,
    },
}

/// Trait for reporting task execution progress
pub trait TaskReporter: Send + Sync {
    /// Handle a task event
    fn report(&self, event: &TaskEvent);
}

/// Simple reporter that logs to tracing
#[derive(Debug, Default)]
pub struct TracingReporter;

impl TaskReporter for TracingReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::GraphStarted { task_count } => {
                tracing::info!(task_count, "processing task graph");
            }
            TaskEvent::Started { key, version } => {
                tracing::info!(task = %key, %version, "task started");
            }
            TaskEvent::Output { key, line, is_stderr } => {
                if *is_stderr {
                    tracing::warn!("[{}] {}", key, line);
                } else {
                    tracing::debug!("[{}] {}", key, line);
                }
            }
            TaskEvent::Completed { key, duration, cached } => {
                if *cached {
                    tracing::info!("{} completed (cached)", key);
                } else {
                    tracing::info!("{} completed in {:.1}s", key, duration.as_secs_f64());
                }
            }
            TaskEvent::Failed { key, duration, error } => {
                tracing::error!("{} failed after {:.1}s: {}", key, duration.as_secs_f64(), error);
            }
            TaskEvent::Skipped { key, reason } => {
                tracing::info!("{} skipped: {}", key, reason);
            }
            TaskEvent::AllCompleted {
                total,
                succeeded,
                failed,
                skipped,
                cached,
                duration,
            } => {
                tracing::info!(
                    "All tasks complete: {}/{} succeeded, {} failed, {} skipped, {} cached ({:.1}s)",
                    succeeded,
                    total,
                    failed,
                    skipped,
                    cached,
                    duration.as_secs_f64()
                );
            }
            TaskEvent::BatchSubmitted {
                batch,
                task_count,
                trigger,
            } => {
                tracing::info!(batch, task_count, %trigger, "batch submitted");
            }
            TaskEvent::BatchCompleted {
                batch,
                total,
                failed,
                duration,
            } => {
                if *failed > 0 {
                    tracing::warn!(batch, total, failed, "batch finished with failures");
                } else {
                    tracing::info!(batch, total, elapsed_ms = duration.as_millis() as u64, "batch finished");
                }
            }
            TaskEvent::WatchError { message } => {
                tracing::error!("watch error: {}", message);
            }
        }
    }
}

/// Reporter that collects events for later inspection (useful for testing)
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<TaskEvent>>,
}

impl CollectingReporter {
    /// Get all collected events
    pub fn events(&self) -> Vec<TaskEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TaskReporter for CollectingReporter {
    fn report(&self, event: &TaskEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Forwards events into a channel the caller subscribes to
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<TaskEvent>,
}

impl ChannelReporter {
    /// Create a reporter and the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TaskReporter for ChannelReporter {
    fn report(&self, event: &TaskEvent) {
        // A dropped receiver just means nobody is listening anymore
        let _ = self.tx.send(event.clone());
    }
}

/// Registry of task reporters
pub struct TaskReporterRegistry {
    reporters: Vec<Arc<dyn TaskReporter>>,
}

impl TaskReporterRegistry {
    pub fn new() -> Self {
        Self {
            reporters: vec![Arc::new(TracingReporter)],
        }
    }

    pub fn empty() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn register<R: TaskReporter + 'static>(&mut self, reporter: R) {
        self.reporters.push(Arc::new(reporter));
    }

    pub fn register_arc(&mut self, reporter: Arc<dyn TaskReporter>) {
        self.reporters.push(reporter);
    }

    pub fn all(&self) -> &[Arc<dyn TaskReporter>] {
        &self.reporters
    }

    /// Broadcast an event to all registered reporters
    pub fn broadcast(&self, event: &TaskEvent) {
        for reporter in &self.reporters {
            reporter.report(event);
        }
    }
}

impl TaskReporter for TaskReporterRegistry {
    fn report(&self, event: &TaskEvent) {
        self.broadcast(event);
    }
}

impl Default for TaskReporterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskKind;

    #[test]
    fn test_collecting_reporter() {
        let reporter = CollectingReporter::default();
        let key = TaskKey::new(TaskKind::Build, "core");

        reporter.report(&TaskEvent::Started {
            key: key.clone(),
            version: "v-1".to_string(),
        });
        reporter.report(&TaskEvent::Completed {
            key,
            duration: Duration::from_secs(5),
            cached: false,
        });

        let events = reporter.events();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_tracing_reporter() {
        let reporter = TracingReporter;
        let key = TaskKey::new(TaskKind::Deploy, "api");
        // Should not panic
        reporter.report(&TaskEvent::Skipped {
            key,
            reason: SkipReason::Cancelled,
        });
    }

    #[tokio::test]
    async fn test_channel_reporter() {
        let (reporter, mut rx) = ChannelReporter::new();
        reporter.report(&TaskEvent::WatchError {
            message: "bad config".to_string(),
        });

        match rx.recv().await {
            Some(TaskEvent::WatchError { message }) => assert_eq!(message, "bad config"),
            other => panic!("unexpected event: {other:?}"),
        }

        drop(rx);
        // Sending into a closed channel is ignored
        reporter.report(&TaskEvent::GraphStarted { task_count: 0 });
    }

    #[test]
    fn test_registry_broadcast() {
        let collector = Arc::new(CollectingReporter::default());
        let mut registry = TaskReporterRegistry::empty();
        registry.register_arc(collector.clone());
        registry.register(TracingReporter);

        registry.broadcast(&TaskEvent::GraphStarted { task_count: 3 });
        assert_eq!(collector.events().len(), 1);
        assert_eq!(registry.all().len(), 2);
    }
}
