//! Build command

use clap::Args;

use rigging_tasks::TaskKind;

use crate::cli::output;
use crate::cli::Cli;
use crate::session::{requested_tasks, Session};

/// Build modules and their dependencies
#[derive(Debug, Args)]
pub struct BuildCommand {
    /// Modules to build (default: all)
    pub modules: Vec<String>,

    /// Rebuild the requested modules and their dependencies even if cached
    #[arg(short, long)]
    pub force: bool,
}

impl BuildCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let session = Session::open(cli)?;
        let tasks: Vec<_> = requested_tasks(&session.graph, TaskKind::Build, &self.modules)?
            .into_iter()
            .map(|t| t.with_force(self.force))
            .collect();

        if cli.shows_progress() {
            output::info(&format!(
                "Building {}",
                output::plural(tasks.len(), "module")
            ));
            println!();
        }

        session.run(cli, tasks)?;
        Ok(())
    }
}
