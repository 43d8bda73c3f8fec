//! Watch mode: re-derive and submit task batches as changes arrive

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use rigging_core::{ConfigGraph, Result};

use crate::dag::DagError;
use crate::reporter::{TaskEvent, TaskReporter};
use crate::scheduler::TaskGraph;
use crate::state::GraphResults;
use crate::task::{Task, TaskKind};

/// A change observed while watching
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A file inside a module changed
    ModuleChanged { module: String, path: PathBuf },
    /// The project configuration changed
    ConfigChanged,
}

impl WatchEvent {
    fn describe(&self) -> String {
        match self {
            Self::ModuleChanged { module, path } => {
                format!("module {} changed ({})", module, path.display())
            }
            Self::ConfigChanged => "configuration changed".to_string(),
        }
    }
}

/// Produces a fresh config graph for every change
pub trait GraphSource: Send + Sync {
    fn load(&self) -> Result<ConfigGraph>;
}

/// Maps a change to the tasks that must run because of it
pub trait ChangeHandler: Send + Sync {
    fn tasks_for_change(&self, graph: &ConfigGraph, event: &WatchEvent) -> Result<Vec<Task>>;
}

/// Change handler for the `dev` command.
///
/// A changed module is rebuilt together with every module that depends on
/// it; watched services in those modules are redeployed and their tests rerun.
#[derive(Debug, Clone, Default)]
pub struct DevChangeHandler {
    /// Services to keep deployed; `None` watches all of them
    services: Option<Vec<String>>,
    run_tests: bool,
}

impl DevChangeHandler {
    pub fn new(services: Option<Vec<String>>, run_tests: bool) -> Self {
        Self {
            services,
            run_tests,
        }
    }

    fn watches(&self, service: &str) -> bool {
        self.services
            .as_ref()
            .map_or(true, |names| names.iter().any(|n| n == service))
    }

    /// Tasks that bring the watched environment up: deploys plus tests
    pub fn initial_tasks(&self, graph: &ConfigGraph) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for service in graph.services(self.services.as_deref())? {
            tasks.push(Task::for_entity(graph, TaskKind::Deploy, &service.entity.name)?);
        }
        if self.run_tests {
            let modules: BTreeSet<String> = tasks
                .iter()
                .filter_map(|t| graph.service(&t.name).ok().map(|n| n.module.clone()))
                .collect();
            let modules: Vec<String> = modules.into_iter().collect();
            for test in graph.tests(Some(modules.as_slice()))? {
                tasks.push(Task::for_entity(graph, TaskKind::Test, &test.entity.name)?);
            }
        }
        Ok(tasks)
    }
}

impl ChangeHandler for DevChangeHandler {
    fn tasks_for_change(&self, graph: &ConfigGraph, event: &WatchEvent) -> Result<Vec<Task>> {
        let WatchEvent::ModuleChanged { module, .. } = event else {
            return Ok(Vec::new());
        };

        let affected = graph.with_dependant_modules(std::slice::from_ref(module))?;
        let names: Vec<String> = affected.iter().map(|m| m.name.clone()).collect();

        let mut tasks = Vec::new();
        for name in &names {
            tasks.push(Task::for_entity(graph, TaskKind::Build, name)?);
        }
        for service in graph.services(None)? {
            if names.contains(&service.module) && self.watches(&service.entity.name) {
                tasks.push(Task::for_entity(graph, TaskKind::Deploy, &service.entity.name)?);
            }
        }
        if self.run_tests {
            for test in graph.tests(Some(names.as_slice()))? {
                tasks.push(Task::for_entity(graph, TaskKind::Test, &test.entity.name)?);
            }
        }
        Ok(tasks)
    }
}

/// Outcome of a watch session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchSummary {
    /// Batches submitted, including the initial one
    pub batches: usize,
    /// Batches with at least one failed task, or that could not be planned
    pub failed_batches: usize,
}

struct BatchOutcome {
    batch: u64,
    started: Instant,
    results: std::result::Result<GraphResults, DagError>,
}

/// Drives a [`TaskGraph`] from a stream of watch events
pub struct ProcessOrchestrator {
    scheduler: TaskGraph,
    source: Arc<dyn GraphSource>,
    reporter: Arc<dyn TaskReporter>,
}

impl ProcessOrchestrator {
    pub fn new(
        scheduler: TaskGraph,
        source: Arc<dyn GraphSource>,
        reporter: Arc<dyn TaskReporter>,
    ) -> Self {
        Self {
            scheduler,
            source,
            reporter,
        }
    }

    /// Run until `shutdown` turns true or the event stream ends.
    ///
    /// Each event becomes a batch submitted without waiting for earlier
    /// batches; batches share the scheduler so a key still running in one
    /// batch is waited on, never executed twice. Failing batches and graph
    /// errors are reported and watching continues. On shutdown, running
    /// batches stop admitting tasks and are drained before returning.
    pub async fn run(
        &self,
        initial_tasks: Vec<Task>,
        handler: Arc<dyn ChangeHandler>,
        mut events: mpsc::UnboundedReceiver<WatchEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<WatchSummary> {
        // `changed` only fires on transitions, so look at the current value first
        if *shutdown.borrow_and_update() {
            info!("exit requested before watching started");
            return Ok(WatchSummary::default());
        }

        let graph = Arc::new(self.source.load()?);
        let mut summary = WatchSummary::default();
        let mut batches: JoinSet<BatchOutcome> = JoinSet::new();
        let mut next_batch = 0u64;

        let initial = refresh_all(&initial_tasks, &graph)?;
        if !initial.is_empty() {
            self.submit(&mut batches, &mut next_batch, &shutdown, graph, initial, "initial");
            summary.batches += 1;
        }

        info!("watching for changes");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("exit requested, draining running batches");
                        break;
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        debug!("watch event stream closed");
                        break;
                    };

                    // Coalesce events that piled up while we were busy
                    let mut pending = vec![event];
                    while let Ok(more) = events.try_recv() {
                        if !pending.contains(&more) {
                            pending.push(more);
                        }
                    }

                    match self.plan_batch(&initial_tasks, handler.as_ref(), &pending) {
                        Ok(Some((graph, tasks, trigger))) => {
                            self.submit(&mut batches, &mut next_batch, &shutdown, graph, tasks, &trigger);
                            summary.batches += 1;
                        }
                        Ok(None) => debug!("change requires no work"),
                        Err(e) => {
                            warn!(error = %e, "could not process change");
                            self.reporter.report(&TaskEvent::WatchError {
                                message: e.to_string(),
                            });
                        }
                    }
                }
                Some(joined) = batches.join_next(), if !batches.is_empty() => {
                    if !self.finish(joined) {
                        summary.failed_batches += 1;
                    }
                }
            }
        }

        while let Some(joined) = batches.join_next().await {
            if !self.finish(joined) {
                summary.failed_batches += 1;
            }
        }

        info!(
            batches = summary.batches,
            failed = summary.failed_batches,
            "watch stopped"
        );
        Ok(summary)
    }

    /// Load a fresh graph and derive the tasks for a set of changes
    fn plan_batch(
        &self,
        initial_tasks: &[Task],
        handler: &dyn ChangeHandler,
        events: &[WatchEvent],
    ) -> Result<Option<(Arc<ConfigGraph>, Vec<Task>, String)>> {
        let graph = self.source.load()?;
        let mut tasks = Vec::new();

        for event in events {
            if *event == WatchEvent::ConfigChanged {
                tasks.extend(refresh_all(initial_tasks, &graph)?);
            }
            tasks.extend(handler.tasks_for_change(&graph, event)?);
        }

        if tasks.is_empty() {
            return Ok(None);
        }
        let trigger = events
            .iter()
            .map(WatchEvent::describe)
            .collect::<Vec<_>>()
            .join(", ");
        Ok(Some((Arc::new(graph), tasks, trigger)))
    }

    fn submit(
        &self,
        batches: &mut JoinSet<BatchOutcome>,
        next_batch: &mut u64,
        shutdown: &watch::Receiver<bool>,
        graph: Arc<ConfigGraph>,
        tasks: Vec<Task>,
        trigger: &str,
    ) {
        let batch = *next_batch;
        *next_batch += 1;

        self.reporter.report(&TaskEvent::BatchSubmitted {
            batch,
            task_count: tasks.len(),
            trigger: trigger.to_string(),
        });

        let scheduler = self.scheduler.clone();
        let shutdown = shutdown.clone();
        batches.spawn(async move {
            let started = Instant::now();
            let results = scheduler.process_until(graph, tasks, shutdown).await;
            BatchOutcome {
                batch,
                started,
                results,
            }
        });
    }

    /// Report a finished batch; returns false if it failed
    fn finish(
        &self,
        joined: std::result::Result<BatchOutcome, tokio::task::JoinError>,
    ) -> bool {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "batch aborted");
                self.reporter.report(&TaskEvent::WatchError {
                    message: format!("batch aborted: {}", e),
                });
                return false;
            }
        };

        let duration = elapsed(outcome.started);
        match outcome.results {
            Ok(results) => {
                let failed = results.iter().filter(|(_, r)| r.status.is_failure()).count();
                self.reporter.report(&TaskEvent::BatchCompleted {
                    batch: outcome.batch,
                    total: results.len(),
                    failed,
                    duration,
                });
                failed == 0
            }
            Err(e) => {
                self.reporter.report(&TaskEvent::WatchError {
                    message: format!("batch {}: {}", outcome.batch, e),
                });
                false
            }
        }
    }
}

fn refresh_all(tasks: &[Task], graph: &ConfigGraph) -> Result<Vec<Task>> {
    tasks.iter().map(|t| t.refreshed(graph)).collect()
}

fn elapsed(since: Instant) -> Duration {
    Instant::now().saturating_duration_since(since)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResultCache;
    use crate::handler::{HandlerRegistry, TaskContext, TaskError, TaskHandler, TaskOutput};
    use crate::reporter::CollectingReporter;
    use crate::scheduler::SchedulerOptions;
    use crate::task::TaskKey;
    use async_trait::async_trait;
    use rigging_core::config::{ModuleConfig, ProjectConfig, ServiceConfig, TestConfig};
    use rigging_core::{FixedHasher, RiggingError};
    use std::sync::Mutex;

    fn create_config() -> ProjectConfig {
        ProjectConfig {
            modules: vec![
                ModuleConfig::new("lib"),
                ModuleConfig::new("api")
                    .with_dependency("lib")
                    .with_service(ServiceConfig::new("api"))
                    .with_test(TestConfig::new("unit")),
                ModuleConfig::new("web")
                    .with_service(ServiceConfig::new("web").with_dependency("api")),
                ModuleConfig::new("docs"),
                ModuleConfig::new("tools"),
            ],
            ..Default::default()
        }
    }

    /// Graph source whose content hash can be bumped between loads
    struct Source {
        hasher: Mutex<FixedHasher>,
        broken: Mutex<bool>,
    }

    impl Source {
        fn new() -> Self {
            Self {
                hasher: Mutex::new(FixedHasher::new()),
                broken: Mutex::new(false),
            }
        }

        fn touch(&self, module: &str, hash: &str) {
            let mut hasher = self.hasher.lock().unwrap();
            *hasher = hasher.clone().with(module, hash);
        }
    }

    impl GraphSource for Source {
        fn load(&self) -> Result<ConfigGraph> {
            if *self.broken.lock().unwrap() {
                return Err(RiggingError::other("config is broken"));
            }
            ConfigGraph::build(&create_config(), &*self.hasher.lock().unwrap())
        }
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<TaskKey>>,
        log: Mutex<Vec<String>>,
        slow: Option<TaskKey>,
    }

    impl Recorder {
        fn slow(key: TaskKey) -> Self {
            Self {
                slow: Some(key),
                ..Default::default()
            }
        }

        fn position(&self, entry: &str) -> usize {
            let log = self.log.lock().unwrap();
            log.iter()
                .position(|e| e == entry)
                .unwrap_or_else(|| panic!("{} not in {:?}", entry, log))
        }

        fn runs(&self, key: &TaskKey) -> usize {
            self.calls.lock().unwrap().iter().filter(|k| *k == key).count()
        }
    }

    struct Handler(Arc<Recorder>, TaskKind);

    #[async_trait]
    impl TaskHandler for Handler {
        fn kind(&self) -> TaskKind {
            self.1
        }

        async fn execute(&self, ctx: TaskContext) -> std::result::Result<TaskOutput, TaskError> {
            let key = ctx.task.key();
            self.0.calls.lock().unwrap().push(key.clone());
            self.0.log.lock().unwrap().push(format!("start {}", key));
            let delay = if self.0.slow.as_ref() == Some(&key) { 300 } else { 5 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.0.log.lock().unwrap().push(format!("end {}", key));
            if ctx.task.key() == TaskKey::new(TaskKind::Build, "docs") {
                return Err(TaskError::failed("docs do not build"));
            }
            Ok(TaskOutput::default())
        }
    }

    fn orchestrator(
        source: Arc<Source>,
        recorder: &Arc<Recorder>,
        reporter: Arc<CollectingReporter>,
    ) -> ProcessOrchestrator {
        let mut registry = HandlerRegistry::new();
        for kind in TaskKind::ALL {
            registry.register(Handler(recorder.clone(), kind));
        }
        let scheduler = TaskGraph::new(
            registry,
            Arc::new(ResultCache::in_memory()),
            reporter.clone(),
            SchedulerOptions::default(),
        );
        ProcessOrchestrator::new(scheduler, source, reporter)
    }

    fn names(tasks: &[Task]) -> Vec<String> {
        tasks.iter().map(|t| t.key().to_string()).collect()
    }

    #[test]
    fn test_dev_handler_rebuilds_dependants() {
        let graph = ConfigGraph::build(&create_config(), &FixedHasher::new()).unwrap();
        let handler = DevChangeHandler::new(None, true);
        let event = WatchEvent::ModuleChanged {
            module: "lib".to_string(),
            path: PathBuf::from("lib/src/lib.rs"),
        };

        let tasks = handler.tasks_for_change(&graph, &event).unwrap();
        let keys = names(&tasks);
        assert!(keys.contains(&"build.lib".to_string()));
        assert!(keys.contains(&"build.api".to_string()));
        assert!(keys.contains(&"build.web".to_string()));
        assert!(keys.contains(&"deploy.api".to_string()));
        assert!(keys.contains(&"deploy.web".to_string()));
        assert!(keys.contains(&"test.api.unit".to_string()));
        assert!(!keys.contains(&"build.docs".to_string()));
    }

    #[test]
    fn test_dev_handler_respects_watched_services() {
        let graph = ConfigGraph::build(&create_config(), &FixedHasher::new()).unwrap();
        let handler = DevChangeHandler::new(Some(vec!["api".to_string()]), false);
        let event = WatchEvent::ModuleChanged {
            module: "lib".to_string(),
            path: PathBuf::from("lib/a.rs"),
        };

        let keys = names(&handler.tasks_for_change(&graph, &event).unwrap());
        assert!(keys.contains(&"deploy.api".to_string()));
        assert!(!keys.contains(&"deploy.web".to_string()));
        assert!(!keys.iter().any(|k| k.starts_with("test.")));

        assert!(handler
            .tasks_for_change(&graph, &WatchEvent::ConfigChanged)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_dev_initial_tasks() {
        let graph = ConfigGraph::build(&create_config(), &FixedHasher::new()).unwrap();
        let handler = DevChangeHandler::new(Some(vec!["api".to_string()]), true);
        let keys = names(&handler.initial_tasks(&graph).unwrap());
        assert_eq!(keys, vec!["deploy.api", "test.api.unit"]);
    }

    #[tokio::test]
    async fn test_batches_run_and_failures_keep_watching() {
        let source = Arc::new(Source::new());
        let recorder = Arc::new(Recorder::default());
        let reporter = Arc::new(CollectingReporter::default());
        let orchestrator = orchestrator(source.clone(), &recorder, reporter.clone());

        let graph = source.load().unwrap();
        let handler = Arc::new(DevChangeHandler::new(Some(vec!["api".to_string()]), false));
        let initial = handler.initial_tasks(&graph).unwrap();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            source.touch("lib", "changed");
            events_tx
                .send(WatchEvent::ModuleChanged {
                    module: "lib".to_string(),
                    path: PathBuf::from("lib/src/lib.rs"),
                })
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            // A batch that fails must not stop the watcher
            events_tx
                .send(WatchEvent::ModuleChanged {
                    module: "docs".to_string(),
                    path: PathBuf::from("docs/index.md"),
                })
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            shutdown_tx.send(true).unwrap();
        };

        let (summary, _) = tokio::join!(
            orchestrator.run(initial, handler, events_rx, shutdown_rx),
            driver
        );
        let summary = summary.unwrap();

        assert_eq!(summary.batches, 3);
        assert_eq!(summary.failed_batches, 1);

        // lib was built initially and again after its sources changed
        let calls = recorder.calls.lock().unwrap().clone();
        let lib_builds = calls
            .iter()
            .filter(|k| **k == TaskKey::new(TaskKind::Build, "lib"))
            .count();
        assert_eq!(lib_builds, 2);

        let completed = reporter
            .events()
            .iter()
            .filter(|e| matches!(e, TaskEvent::BatchCompleted { .. }))
            .count();
        assert_eq!(completed, 3);
    }

    #[tokio::test]
    async fn test_graph_errors_are_reported_not_fatal() {
        let source = Arc::new(Source::new());
        let recorder = Arc::new(Recorder::default());
        let reporter = Arc::new(CollectingReporter::default());
        let orchestrator = orchestrator(source.clone(), &recorder, reporter.clone());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            *source.broken.lock().unwrap() = true;
            events_tx.send(WatchEvent::ConfigChanged).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            // Closing the event stream ends the session
            drop(events_tx);
        };

        let (summary, _) = tokio::join!(
            orchestrator.run(Vec::new(), Arc::new(DevChangeHandler::default()), events_rx, shutdown_rx),
            driver
        );
        let summary = summary.unwrap();

        // nothing was requested up front and the only change failed to load
        assert_eq!(summary.batches, 0);
        assert!(recorder.calls.lock().unwrap().is_empty());
        assert!(reporter
            .events()
            .iter()
            .any(|e| matches!(e, TaskEvent::WatchError { message } if message.contains("broken"))));
    }

    fn completed_batches(reporter: &CollectingReporter) -> usize {
        reporter
            .events()
            .iter()
            .filter(|e| matches!(e, TaskEvent::BatchCompleted { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_new_batch_starts_while_earlier_batch_runs() {
        let source = Arc::new(Source::new());
        let slow = TaskKey::new(TaskKind::Build, "tools");
        let recorder = Arc::new(Recorder::slow(slow.clone()));
        let reporter = Arc::new(CollectingReporter::default());
        let orchestrator = orchestrator(source.clone(), &recorder, reporter.clone());

        let graph = source.load().unwrap();
        let initial = vec![Task::for_entity(&graph, TaskKind::Build, "tools").unwrap()];
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            source.touch("lib", "changed");
            events_tx
                .send(WatchEvent::ModuleChanged {
                    module: "lib".to_string(),
                    path: PathBuf::from("lib/src/lib.rs"),
                })
                .unwrap();
            tokio::time::sleep(Duration::from_millis(370)).await;
            shutdown_tx.send(true).unwrap();
        };

        let (summary, _) = tokio::join!(
            orchestrator.run(initial, Arc::new(DevChangeHandler::default()), events_rx, shutdown_rx),
            driver
        );
        let summary = summary.unwrap();

        assert_eq!(summary.batches, 2);
        assert_eq!(summary.failed_batches, 0);
        assert!(recorder.position("start build.lib") < recorder.position("end build.tools"));
        assert!(recorder.position("end build.lib") < recorder.position("end build.tools"));
        assert_eq!(completed_batches(&reporter), 2);
    }

    #[tokio::test]
    async fn test_overlapping_batches_share_in_flight_key() {
        let source = Arc::new(Source::new());
        let slow = TaskKey::new(TaskKind::Build, "tools");
        let recorder = Arc::new(Recorder::slow(slow.clone()));
        let reporter = Arc::new(CollectingReporter::default());
        let orchestrator = orchestrator(source.clone(), &recorder, reporter.clone());

        let graph = source.load().unwrap();
        let initial = vec![Task::for_entity(&graph, TaskKind::Build, "tools").unwrap()];
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            // Same content version, so the second batch needs the very same key
            events_tx
                .send(WatchEvent::ModuleChanged {
                    module: "tools".to_string(),
                    path: PathBuf::from("tools/run.sh"),
                })
                .unwrap();
            tokio::time::sleep(Duration::from_millis(370)).await;
            shutdown_tx.send(true).unwrap();
        };

        let (summary, _) = tokio::join!(
            orchestrator.run(initial, Arc::new(DevChangeHandler::default()), events_rx, shutdown_rx),
            driver
        );
        let summary = summary.unwrap();

        assert_eq!(summary.batches, 2);
        assert_eq!(summary.failed_batches, 0);
        assert_eq!(recorder.runs(&slow), 1);
        assert_eq!(completed_batches(&reporter), 2);
    }

    #[tokio::test]
    async fn test_exit_requested_before_run_returns_immediately() {
        let source = Arc::new(Source::new());
        let recorder = Arc::new(Recorder::default());
        let reporter = Arc::new(CollectingReporter::default());
        let orchestrator = orchestrator(source.clone(), &recorder, reporter);

        let graph = source.load().unwrap();
        let initial = vec![Task::for_entity(&graph, TaskKind::Build, "lib").unwrap()];
        // The event sender stays open, so only the exit signal can end the run
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(true);

        let summary = tokio::time::timeout(
            Duration::from_secs(1),
            orchestrator.run(initial, Arc::new(DevChangeHandler::default()), events_rx, shutdown_rx),
        )
        .await
        .expect("run should return without waiting for events")
        .unwrap();

        assert_eq!(summary, WatchSummary::default());
        assert!(recorder.calls.lock().unwrap().is_empty());
    }
}
