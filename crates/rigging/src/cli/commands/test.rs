//! Test command

use clap::Args;

use rigging_tasks::{Task, TaskKind};

use crate::cli::output;
use crate::cli::Cli;
use crate::session::Session;

/// Run tests, building (and deploying) what they need first
#[derive(Debug, Args)]
pub struct TestCommand {
    /// Modules whose tests to run (default: all)
    pub modules: Vec<String>,

    /// Only run tests with this name
    #[arg(short, long)]
    pub name: Option<String>,

    /// Rerun tests even if the same version already passed
    #[arg(short, long)]
    pub force: bool,

    /// Rebuild the modules the tests need even if cached
    #[arg(long)]
    pub force_build: bool,
}

impl TestCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let session = Session::open(cli)?;
        let filter = (!self.modules.is_empty()).then_some(self.modules.as_slice());

        let mut tasks = Vec::new();
        for test in session.graph.tests(filter)? {
            if self.name.as_deref().is_some_and(|n| n != test.short_name()) {
                continue;
            }
            tasks.push(
                Task::for_entity(&session.graph, TaskKind::Test, &test.entity.name)?
                    .with_force(self.force)
                    .with_force_build(self.force_build),
            );
        }

        if tasks.is_empty() {
            if !cli.quiet {
                output::warning("No tests found.");
            }
            return Ok(());
        }

        if cli.shows_progress() {
            output::info(&format!("Running {}", output::plural(tasks.len(), "test suite")));
            println!();
        }

        session.run(cli, tasks)?;
        Ok(())
    }
}
