//! Deploy command

use clap::Args;

use rigging_tasks::TaskKind;

use crate::cli::output;
use crate::cli::Cli;
use crate::session::{requested_tasks, Session};

/// Deploy services, building what they need first
#[derive(Debug, Args)]
pub struct DeployCommand {
    /// Services to deploy (default: all)
    pub services: Vec<String>,

    /// Redeploy even if the same version was already deployed
    #[arg(short, long)]
    pub force: bool,

    /// Rebuild the modules the services need even if cached
    #[arg(long)]
    pub force_build: bool,
}

impl DeployCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let session = Session::open(cli)?;
        let tasks: Vec<_> = requested_tasks(&session.graph, TaskKind::Deploy, &self.services)?
            .into_iter()
            .map(|t| t.with_force(self.force).with_force_build(self.force_build))
            .collect();

        if cli.shows_progress() {
            output::info(&format!(
                "Deploying {}",
                output::plural(tasks.len(), "service")
            ));
            println!();
        }

        session.run(cli, tasks)?;
        Ok(())
    }
}
