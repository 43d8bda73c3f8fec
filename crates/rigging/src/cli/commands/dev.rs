//! Dev command: deploy services and keep them up to date while watching

use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use console::style;
use tokio::sync::mpsc;

use rigging_tasks::{DevChangeHandler, GraphSource, ProcessOrchestrator};

use crate::cli::output;
use crate::cli::{Cli, OutputFormat};
use crate::session::{interrupt_signal, Session};
use crate::watcher::spawn_watcher;

/// Deploy services and redeploy them as their sources change
#[derive(Debug, Args)]
pub struct DevCommand {
    /// Services to keep deployed (default: all)
    pub services: Vec<String>,

    /// Do not run tests after rebuilding
    #[arg(long)]
    pub skip_tests: bool,
}

impl DevCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.execute_async(cli))
    }

    async fn execute_async(&self, cli: &Cli) -> anyhow::Result<()> {
        let session = Session::open(cli)?;
        let services = (!self.services.is_empty()).then(|| self.services.clone());
        let handler = Arc::new(DevChangeHandler::new(services, !self.skip_tests));
        let initial = handler.initial_tasks(&session.graph)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _watcher = spawn_watcher(session.source.clone(), events_tx)
            .context("Failed to start file watcher")?;

        if cli.shows_progress() {
            output::info(&format!(
                "Watching {} for changes {}",
                output::path_style().apply_to(session.root().display()),
                style("(Ctrl-C to stop)").dim()
            ));
        }

        let source: Arc<dyn GraphSource> = session.source.clone();
        let orchestrator =
            ProcessOrchestrator::new(session.scheduler.clone(), source, session.reporter.clone());
        let summary = orchestrator
            .run(initial, handler, events_rx, interrupt_signal())
            .await?;

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "batches": summary.batches,
                "failed_batches": summary.failed_batches,
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            println!();
            output::info(&format!(
                "Stopped after {}, {} with failures",
                output::plural(summary.batches, "batch"),
                summary.failed_batches
            ));
        }

        Ok(())
    }
}
