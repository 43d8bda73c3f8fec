//! Task scheduler: runs a task DAG on tokio with bounded concurrency

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};

use rigging_core::config::DEFAULT_CONCURRENCY;
use rigging_core::ConfigGraph;

use crate::cache::{CacheEntry, CacheError, CacheOutcome, ResultCache};
use crate::dag::{DagError, TaskDag};
use crate::handler::{HandlerRegistry, TaskContext, TaskError, TaskHandler, TaskOutput};
use crate::reporter::{TaskEvent, TaskReporter};
use crate::state::{GraphResults, SkipReason, TaskResult, TaskStatus};
use crate::task::{Task, TaskKey, TaskKind};

/// Options for the task scheduler
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Maximum concurrent task executions, shared by every `process` call
    pub concurrency: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

type KeyLock = Arc<tokio::sync::Mutex<()>>;
type DependencyResults = BTreeMap<TaskKey, Arc<TaskResult>>;

/// The task graph processor.
///
/// Cheap to clone; clones share the worker pool, the result cache and the
/// in-flight registry, so concurrent `process` calls never execute the same
/// key at the same time.
#[derive(Clone)]
pub struct TaskGraph {
    handlers: Arc<HandlerRegistry>,
    cache: Arc<ResultCache>,
    reporter: Arc<dyn TaskReporter>,
    options: SchedulerOptions,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashMap<TaskKey, KeyLock>>>,
}

/// Entry of the run queue: higher priority first, then earlier discovery
#[derive(Debug, PartialEq, Eq)]
struct Ready {
    priority: usize,
    order: usize,
    key: TaskKey,
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.order.cmp(&self.order))
    }
}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Message from spawned work back to the admission loop
enum Message {
    /// A job finished, successfully or not
    Done(TaskResult),
    /// A disk cache lookup finished
    Probed {
        key: TaskKey,
        entry: Option<CacheEntry>,
    },
}

/// Bookkeeping of one `process` call. Only the admission loop touches it.
struct RunState {
    remaining: HashMap<TaskKey, usize>,
    /// Keys whose dependencies are all terminal, not yet triaged
    eligible: Vec<TaskKey>,
    /// Keys that need a worker, in admission order
    runnable: BinaryHeap<Ready>,
    results: BTreeMap<TaskKey, Arc<TaskResult>>,
}

impl RunState {
    fn new(dag: &TaskDag) -> Self {
        let mut state = Self {
            remaining: HashMap::new(),
            eligible: Vec::new(),
            runnable: BinaryHeap::new(),
            results: BTreeMap::new(),
        };
        for (key, node) in dag.nodes() {
            state.remaining.insert(key.clone(), node.dependencies.len());
            if node.dependencies.is_empty() {
                state.eligible.push(key.clone());
            }
        }
        state
    }

    fn push_runnable(&mut self, dag: &TaskDag, key: &TaskKey) {
        if let Some(node) = dag.get(key) {
            self.runnable.push(Ready {
                priority: node.priority,
                order: node.order,
                key: key.clone(),
            });
        }
    }

    fn dependency_results(&self, dag: &TaskDag, key: &TaskKey) -> DependencyResults {
        dag.get(key)
            .map(|node| {
                node.dependencies
                    .iter()
                    .filter_map(|d| self.results.get(d).map(|r| (d.clone(), r.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Store a terminal result and release dependents whose dependencies are all done
    fn complete(&mut self, dag: &TaskDag, result: TaskResult) {
        let key = result.key.clone();
        self.results.insert(key.clone(), Arc::new(result));

        let Some(node) = dag.get(&key) else {
            return;
        };
        for dependent in &node.dependents {
            if let Some(count) = self.remaining.get_mut(dependent) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.eligible.push(dependent.clone());
                }
            }
        }
    }
}

impl TaskGraph {
    /// Create a new scheduler
    pub fn new(
        handlers: HandlerRegistry,
        cache: Arc<ResultCache>,
        reporter: Arc<dyn TaskReporter>,
        options: SchedulerOptions,
    ) -> Self {
        let concurrency = options.concurrency.max(1);
        Self {
            handlers: Arc::new(handlers),
            cache,
            reporter,
            options,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// Build the dependency closure of `tasks` without executing anything
    pub fn plan(&self, graph: &ConfigGraph, tasks: Vec<Task>) -> Result<TaskDag, DagError> {
        TaskDag::build(tasks, graph, &self.handlers)
    }

    /// Execute `tasks` and their dependencies, returning a result for every key.
    ///
    /// Fails only for configuration problems detected before anything runs;
    /// task failures are part of the returned results.
    pub async fn process(
        &self,
        graph: Arc<ConfigGraph>,
        tasks: Vec<Task>,
    ) -> Result<GraphResults, DagError> {
        let (_never, shutdown) = watch::channel(false);
        self.process_until(graph, tasks, shutdown).await
    }

    /// Like [`process`](Self::process), but stops admitting tasks once
    /// `shutdown` turns true. Tasks that never started end up
    /// `Skipped(Cancelled)`.
    pub async fn process_until(
        &self,
        graph: Arc<ConfigGraph>,
        tasks: Vec<Task>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<GraphResults, DagError> {
        let dag = TaskDag::build(tasks, &graph, &self.handlers)?;
        Ok(self.execute(graph, &dag, shutdown).await)
    }

    /// Admission loop.
    ///
    /// Eligible tasks are triaged first: upstream failures and cache hits
    /// complete without a worker. The rest wait in the run queue, and one is
    /// popped only after a worker permit is held, so the highest-priority
    /// runnable task always gets the next free slot.
    #[instrument(skip_all, fields(tasks = dag.len()))]
    async fn execute(
        &self,
        graph: Arc<ConfigGraph>,
        dag: &TaskDag,
        shutdown: watch::Receiver<bool>,
    ) -> GraphResults {
        let start = Instant::now();
        let mut state = RunState::new(dag);
        let cancelled = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let mut running = 0usize;
        let mut probing = 0usize;

        self.reporter.report(&TaskEvent::GraphStarted {
            task_count: dag.len(),
        });

        let shutdown_signal = wait_for_shutdown(shutdown);
        tokio::pin!(shutdown_signal);

        loop {
            let stopping = cancelled.load(AtomicOrdering::SeqCst);
            if !stopping {
                probing += self.triage(dag, &mut state, &tx);
            }

            if running == 0 && probing == 0 && (stopping || state.runnable.is_empty()) {
                break;
            }

            // Pending probes may still add higher-priority work to the queue
            let admitting = !stopping && probing == 0 && !state.runnable.is_empty();

            tokio::select! {
                biased;

                Some(message) = rx.recv() => match message {
                    Message::Done(result) => {
                        running -= 1;
                        state.complete(dag, result);
                    }
                    Message::Probed { key, entry } => {
                        probing -= 1;
                        let dependency_results = state.dependency_results(dag, &key);
                        let hit = dag.get(&key).and_then(|node| {
                            self.hit_result(&node.task, entry?, &dependency_results)
                        });
                        match hit {
                            Some(hit) => state.complete(dag, hit),
                            None => state.push_runnable(dag, &key),
                        }
                    }
                },
                _ = &mut shutdown_signal, if !stopping => {
                    info!(running, "cancellation requested, draining running tasks");
                    cancelled.store(true, AtomicOrdering::SeqCst);
                }
                permit = self.semaphore.clone().acquire_owned(), if admitting => {
                    let Ok(permit) = permit else {
                        warn!("worker pool closed, cancelling");
                        cancelled.store(true, AtomicOrdering::SeqCst);
                        continue;
                    };
                    let Some(ready) = state.runnable.pop() else {
                        continue;
                    };
                    match self.job(dag, &graph, &state, &ready.key) {
                        Some(job) => {
                            running += 1;
                            let this = self.clone();
                            let tx = tx.clone();
                            let cancelled = cancelled.clone();
                            tokio::spawn(async move {
                                let (result, permit) = this.run_job(job, permit, cancelled).await;
                                // Free the slot only once dependents can be released
                                let _ = tx.send(Message::Done(result));
                                drop(permit);
                            });
                        }
                        None => {
                            let version = dag
                                .get(&ready.key)
                                .map(|n| n.task.version.clone())
                                .unwrap_or_default();
                            state.complete(dag, missing_handler(&ready.key, version));
                        }
                    }
                }
            }
        }

        // Anything never admitted was cut off by cancellation
        for key in dag.sorted() {
            if state.results.contains_key(key) {
                continue;
            }
            let version = dag.get(key).map(|n| n.task.version.clone()).unwrap_or_default();
            self.reporter.report(&TaskEvent::Skipped {
                key: key.clone(),
                reason: SkipReason::Cancelled,
            });
            state.results.insert(
                key.clone(),
                Arc::new(TaskResult::skipped(
                    key.clone(),
                    version,
                    SkipReason::Cancelled,
                    BTreeMap::new(),
                )),
            );
        }

        let results = GraphResults::new(state.results);
        self.reporter.report(&TaskEvent::AllCompleted {
            total: results.len(),
            succeeded: results.iter().filter(|(_, r)| r.status.is_success()).count(),
            failed: results.failed().len(),
            skipped: results.skipped().len(),
            cached: results.cached(),
            duration: start.elapsed(),
        });
        results
    }

    /// Decide what to do with every eligible task.
    ///
    /// Upstream failures and indexed cache hits complete on the spot, which
    /// may make more tasks eligible. Keys that could still be on disk get a
    /// probe; the rest go to the run queue. Returns the number of probes
    /// started.
    fn triage(
        &self,
        dag: &TaskDag,
        state: &mut RunState,
        tx: &mpsc::UnboundedSender<Message>,
    ) -> usize {
        let mut probes = 0;

        while let Some(key) = state.eligible.pop() {
            let Some(node) = dag.get(&key) else {
                continue;
            };
            let task = &node.task;
            let dependency_results = state.dependency_results(dag, &key);

            let upstream = dependency_results.values().find_map(|r| match &r.status {
                TaskStatus::Failed(_) => Some(r.key.clone()),
                TaskStatus::Skipped(SkipReason::UpstreamFailed(root)) => Some(root.clone()),
                _ => None,
            });
            if let Some(failed) = upstream {
                debug!(task = %key, upstream = %failed, "skipping, dependency failed");
                let reason = SkipReason::UpstreamFailed(failed);
                self.reporter.report(&TaskEvent::Skipped {
                    key: key.clone(),
                    reason: reason.clone(),
                });
                state.complete(
                    dag,
                    TaskResult::skipped(key, task.version.clone(), reason, dependency_results),
                );
                continue;
            }

            if task.force || !task.kind.is_cacheable() {
                state.push_runnable(dag, &key);
                continue;
            }

            if let Some(entry) = self.cache.lookup_indexed(&key, &task.version) {
                match self.hit_result(task, entry, &dependency_results) {
                    Some(hit) => state.complete(dag, hit),
                    None => state.push_runnable(dag, &key),
                }
                continue;
            }

            if !self.cache.is_persistent() {
                state.push_runnable(dag, &key);
                continue;
            }

            probes += 1;
            let this = self.clone();
            let tx = tx.clone();
            let version = task.version.clone();
            tokio::spawn(async move {
                let entry = match this.with_cache(|c, k, v| c.lookup(k, v), &key, &version).await {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(task = %key, error = %e, "cache lookup failed, executing");
                        None
                    }
                };
                let _ = tx.send(Message::Probed { key, entry });
            });
        }

        probes
    }

    /// Result for a cached success of the task's exact version
    fn hit_result(
        &self,
        task: &Task,
        entry: CacheEntry,
        dependency_results: &DependencyResults,
    ) -> Option<TaskResult> {
        if task.force || entry.version != task.version {
            return None;
        }
        let output = entry.output()?.clone();
        let key = task.key();

        self.reporter.report(&TaskEvent::Completed {
            key: key.clone(),
            duration: Duration::ZERO,
            cached: true,
        });
        Some(TaskResult {
            key,
            version: task.version.clone(),
            status: TaskStatus::CacheHit,
            output: Some(output),
            started_at: None,
            completed_at: Utc::now(),
            duration: Duration::ZERO,
            dependency_results: dependency_results.clone(),
        })
    }

    fn job(
        &self,
        dag: &TaskDag,
        graph: &Arc<ConfigGraph>,
        state: &RunState,
        key: &TaskKey,
    ) -> Option<Job> {
        let node = dag.get(key)?;
        let handler = self.handlers.get(node.task.kind)?;
        Some(Job {
            task: node.task.clone(),
            handler,
            graph: graph.clone(),
            dependency_results: state.dependency_results(dag, key),
        })
    }

    /// Run a cache operation, moving it to the blocking pool when it may touch disk
    async fn with_cache<T, F>(&self, op: F, key: &TaskKey, version: &str) -> Result<T, CacheError>
    where
        F: FnOnce(&ResultCache, &TaskKey, &str) -> Result<T, CacheError> + Send + 'static,
        T: Send + 'static,
    {
        if !self.cache.is_persistent() {
            return op(self.cache.as_ref(), key, version);
        }

        let cache = self.cache.clone();
        let key = key.clone();
        let version = version.to_string();
        tokio::task::spawn_blocking(move || op(cache.as_ref(), &key, &version))
            .await
            .map_err(|e| CacheError::Worker(e.to_string()))?
    }

    fn key_lock(&self, key: &TaskKey) -> KeyLock {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.entry(key.clone()).or_default().clone()
    }

    fn release_key(&self, key: &TaskKey, lock: KeyLock) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        drop(lock);
        if in_flight.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            in_flight.remove(key);
        }
    }

    /// Returns the result together with the worker permit still held, if any
    async fn run_job(
        &self,
        job: Job,
        permit: OwnedSemaphorePermit,
        cancelled: Arc<AtomicBool>,
    ) -> (TaskResult, Option<OwnedSemaphorePermit>) {
        let key = job.task.key();
        let lock = self.key_lock(&key);
        let mut permit = Some(permit);

        let guard = match lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                // Another run is executing this key; wait without a worker slot
                permit = None;
                debug!(task = %key, "waiting for in-flight execution");
                lock.clone().lock_owned().await
            }
        };

        let result = self.run_exclusive(job, &mut permit, &cancelled).await;

        drop(guard);
        self.release_key(&key, lock);
        (result, permit)
    }

    /// Runs while holding the key's in-flight lock
    async fn run_exclusive(
        &self,
        job: Job,
        permit: &mut Option<OwnedSemaphorePermit>,
        cancelled: &AtomicBool,
    ) -> TaskResult {
        let Job {
            task,
            handler,
            graph,
            dependency_results,
        } = job;
        let key = task.key();

        // Another run may have produced this version while we waited
        if task.kind.is_cacheable() {
            if let Some(hit) = self
                .cache
                .lookup_indexed(&key, &task.version)
                .and_then(|entry| self.hit_result(&task, entry, &dependency_results))
            {
                return hit;
            }
        }

        if permit.is_none() {
            *permit = self.semaphore.clone().acquire_owned().await.ok();
        }
        if permit.is_none() || cancelled.load(AtomicOrdering::SeqCst) {
            self.reporter.report(&TaskEvent::Skipped {
                key: key.clone(),
                reason: SkipReason::Cancelled,
            });
            return TaskResult::skipped(key, task.version, SkipReason::Cancelled, dependency_results);
        }

        let started_at = Utc::now();
        let start = Instant::now();
        self.reporter.report(&TaskEvent::Started {
            key: key.clone(),
            version: task.version.clone(),
        });

        let outcome = execute_isolated(
            handler,
            TaskContext::new(
                task.clone(),
                graph,
                dependency_results.clone(),
                self.reporter.clone(),
            ),
        )
        .await;

        let duration = start.elapsed();

        if task.kind.is_cacheable() {
            let recorded = match &outcome {
                Ok(output) => CacheOutcome::Succeeded {
                    output: output.clone(),
                },
                Err(e) => CacheOutcome::Failed {
                    error: e.to_string(),
                },
            };
            let stored = self
                .with_cache(move |c, k, v| c.record(k, v, recorded), &key, &task.version)
                .await;
            if let Err(e) = stored {
                warn!(task = %key, error = %e, "failed to record result");
            }
        }

        let (status, output) = match outcome {
            Ok(output) => {
                if task.kind == TaskKind::Delete {
                    self.invalidate_deploy(&task.name).await;
                }
                self.reporter.report(&TaskEvent::Completed {
                    key: key.clone(),
                    duration,
                    cached: false,
                });
                (TaskStatus::Succeeded, Some(output))
            }
            Err(e) => {
                self.reporter.report(&TaskEvent::Failed {
                    key: key.clone(),
                    duration,
                    error: e.to_string(),
                });
                (TaskStatus::Failed(e.to_string()), None)
            }
        };

        TaskResult {
            key,
            version: task.version,
            status,
            output,
            started_at: Some(started_at),
            completed_at: Utc::now(),
            duration,
            dependency_results,
        }
    }

    /// A deleted service must be deployed again even if its version is unchanged
    async fn invalidate_deploy(&self, service: &str) {
        let deploy = TaskKey::new(TaskKind::Deploy, service);
        if let Err(e) = self.with_cache(|c, k, _| c.forget(k), &deploy, "").await {
            warn!(task = %deploy, error = %e, "failed to invalidate cached deploy");
        }
    }
}

/// A task admitted for execution
struct Job {
    task: Task,
    handler: Arc<dyn TaskHandler>,
    graph: Arc<ConfigGraph>,
    dependency_results: DependencyResults,
}

fn missing_handler(key: &TaskKey, version: String) -> TaskResult {
    TaskResult {
        key: key.clone(),
        version,
        status: TaskStatus::Failed(format!("No handler registered for {} tasks", key.kind)),
        output: None,
        started_at: None,
        completed_at: Utc::now(),
        duration: Duration::ZERO,
        dependency_results: BTreeMap::new(),
    }
}

/// Run the handler on its own tokio task so a panic becomes a task failure
async fn execute_isolated(
    handler: Arc<dyn TaskHandler>,
    ctx: TaskContext,
) -> Result<TaskOutput, TaskError> {
    let handle = tokio::spawn(async move { handler.execute(ctx).await });
    match handle.await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => Err(TaskError::Panicked(panic_message(e.into_panic()))),
        Err(e) => Err(TaskError::Internal(e.to_string())),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Resolves once the exit signal is set; never resolves if the sender is gone
async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
