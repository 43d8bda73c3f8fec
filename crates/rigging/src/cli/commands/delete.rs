//! Delete command

use clap::{Args, Subcommand};
use console::style;

use rigging_tasks::TaskKind;

use crate::cli::output;
use crate::cli::Cli;
use crate::session::{requested_tasks, Session};

/// Remove deployed entities
#[derive(Debug, Args)]
pub struct DeleteCommand {
    #[command(subcommand)]
    pub target: DeleteTarget,
}

/// What to delete
#[derive(Debug, Subcommand)]
pub enum DeleteTarget {
    /// Delete services; services depending on them are deleted first
    Service(DeleteServiceCommand),
}

/// Delete services
#[derive(Debug, Args)]
pub struct DeleteServiceCommand {
    /// Services to delete
    #[arg(required = true)]
    pub names: Vec<String>,
}

impl DeleteCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        match &self.target {
            DeleteTarget::Service(cmd) => cmd.execute(cli),
        }
    }
}

impl DeleteServiceCommand {
    fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let session = Session::open(cli)?;
        let tasks = requested_tasks(&session.graph, TaskKind::Delete, &self.names)?;

        if cli.shows_progress() {
            output::info(&format!(
                "Deleting {}",
                self.names
                    .iter()
                    .map(|n| style(n).cyan().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
            println!();
        }

        session.run(cli, tasks)?;
        Ok(())
    }
}
