//! Wiring shared by every task-running command

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use console::style;
use tokio::sync::watch;
use tracing::{debug, info};

use rigging_core::config::{find_config, project_root};
use rigging_core::{ConfigError, ConfigGraph, RiggingError};
use rigging_tasks::{
    GraphResults, ResultCache, SchedulerOptions, Task, TaskGraph, TaskKind, TaskReporter,
    TaskReporterRegistry, TaskStatus,
};

use crate::cli::output::{self, ConsoleReporter};
use crate::cli::{Cli, OutputFormat};
use crate::exit_codes::{Interrupted, TasksFailed};
use crate::shell::ShellHandler;
use crate::watcher::ProjectSource;

/// A loaded project ready to run tasks
pub struct Session {
    pub source: Arc<ProjectSource>,
    pub graph: Arc<ConfigGraph>,
    pub scheduler: TaskGraph,
    pub reporter: Arc<dyn TaskReporter>,
}

impl Session {
    /// Locate and load the project around the current directory
    pub fn open(cli: &Cli) -> anyhow::Result<Self> {
        let cwd = std::env::current_dir()?;
        let config_path = find_config(&cwd)
            .ok_or_else(|| RiggingError::from(ConfigError::NotFound(cwd.clone())))?;
        let root = project_root(&config_path);

        let source = ProjectSource::open(root.clone(), config_path.clone())
            .with_context(|| format!("Failed to load {}", config_path.display()))?;
        let graph = source.current();
        let config = graph.config();

        let cache = if cli.no_cache || !config.cache.enabled {
            debug!("result cache is not persisted");
            ResultCache::in_memory()
        } else {
            ResultCache::persistent(root.join(&config.cache.dir))
        };

        let mut reporters = TaskReporterRegistry::new();
        if cli.shows_progress() {
            reporters.register(ConsoleReporter::new(cli.verbose));
        }
        let reporter: Arc<dyn TaskReporter> = Arc::new(reporters);

        let options = SchedulerOptions {
            concurrency: cli.concurrency.unwrap_or(config.scheduler.concurrency),
        };
        info!(
            root = %root.display(),
            config = %source.config_path().display(),
            concurrency = options.concurrency,
            "project loaded"
        );

        let scheduler = TaskGraph::new(
            ShellHandler::registry(&root),
            Arc::new(cache),
            reporter.clone(),
            options,
        );

        Ok(Self {
            source: Arc::new(source),
            graph,
            scheduler,
            reporter,
        })
    }

    pub fn root(&self) -> &Path {
        self.source.root()
    }

    /// Run `tasks` to completion, stopping admissions on Ctrl-C.
    ///
    /// Fails with [`TasksFailed`] when any task failed and with
    /// [`Interrupted`] when the run was cancelled.
    pub fn run(&self, cli: &Cli, tasks: Vec<Task>) -> anyhow::Result<GraphResults> {
        if tasks.is_empty() {
            if cli.shows_progress() {
                output::success("Nothing to do.");
            }
            return Ok(GraphResults::default());
        }

        let runtime = tokio::runtime::Runtime::new()?;
        let results = runtime.block_on(async {
            let shutdown = interrupt_signal();
            self.scheduler
                .process_until(self.graph.clone(), tasks, shutdown)
                .await
        })?;

        report_results(cli, &results)?;

        if results.has_errors() {
            return Err(TasksFailed {
                failed: results.failed().len(),
            }
            .into());
        }
        if results.was_cancelled() {
            return Err(Interrupted.into());
        }
        Ok(results)
    }
}

/// Exit signal that turns true on the first Ctrl-C
pub fn interrupt_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            let _ = tx.send(true);
            // Keep the sender alive so receivers see `true`, not a closed channel
            tx.closed().await;
        }
    });
    rx
}

/// Tasks for `names` of the given kind, or for every entity of that kind
/// when no names are given
pub fn requested_tasks(
    graph: &ConfigGraph,
    kind: TaskKind,
    names: &[String],
) -> rigging_core::Result<Vec<Task>> {
    let names: Vec<String> = if names.is_empty() {
        match kind {
            TaskKind::Build => graph.modules().iter().map(|m| m.name.clone()).collect(),
            TaskKind::Deploy | TaskKind::Delete => entity_names(graph.services(None)?),
            TaskKind::Run => entity_names(graph.tasks(None)?),
            TaskKind::Test => entity_names(graph.tests(None)?),
        }
    } else {
        names.to_vec()
    };

    names
        .iter()
        .map(|name| Task::for_entity(graph, kind, name))
        .collect()
}

fn entity_names(nodes: Vec<&rigging_core::EntityNode>) -> Vec<String> {
    nodes.into_iter().map(|n| n.entity.name.clone()).collect()
}

fn report_results(cli: &Cli, results: &GraphResults) -> anyhow::Result<()> {
    if cli.format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&output::results_json(results))?);
        return Ok(());
    }

    let failed = results.failed();
    if !failed.is_empty() && !cli.quiet {
        println!();
        println!(
            "  {} {}/{} tasks failed:",
            style("✗").red().bold(),
            failed.len(),
            results.len()
        );
        for r in &failed {
            if let TaskStatus::Failed(ref err) = r.status {
                println!("    {} {}: {}", style("✗").red(), r.key, err);
            }
        }
    }
    Ok(())
}

/// Cache directory of the project around the current directory, if any
pub fn cache_dir() -> anyhow::Result<PathBuf> {
    let cwd = std::env::current_dir()?;
    let config_path = find_config(&cwd)
        .ok_or_else(|| RiggingError::from(ConfigError::NotFound(cwd.clone())))?;
    let config = rigging_core::load_config(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    Ok(project_root(&config_path).join(config.cache.dir))
}
