//! Run command: execute a one-off runtime task

use clap::Args;

use rigging_tasks::{Task, TaskKind};

use crate::cli::output;
use crate::cli::Cli;
use crate::session::Session;

/// Run a one-off task such as a migration
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Name of the task
    pub task: String,

    /// Run even if the same version already ran successfully
    #[arg(short, long)]
    pub force: bool,
}

impl RunCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let session = Session::open(cli)?;
        let task = Task::for_entity(&session.graph, TaskKind::Run, &self.task)?.with_force(self.force);

        if cli.shows_progress() {
            output::info(&format!("Running {}", task.key()));
            println!();
        }

        let results = session.run(cli, vec![task.clone()])?;

        if cli.verbose && cli.shows_progress() {
            if let Some(out) = results.get(&task.key()).and_then(|r| r.output.as_ref()) {
                if !out.log.is_empty() {
                    println!();
                    println!("{}", output::header("Output"));
                    println!("{}", out.log);
                }
            }
        }
        Ok(())
    }
}
