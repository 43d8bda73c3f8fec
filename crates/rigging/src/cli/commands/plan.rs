//! Plan command: show what would run without running it

use clap::Args;
use console::style;

use rigging_tasks::{CacheStatus, TaskKind};

use crate::cli::output;
use crate::cli::{Cli, OutputFormat};
use crate::session::{requested_tasks, Session};

/// Show the execution plan without running anything
#[derive(Debug, Args)]
pub struct PlanCommand {
    /// Kind of task (build, deploy, test, run, delete)
    #[arg(value_parser = parse_kind)]
    pub kind: TaskKind,

    /// Entity names (default: all of that kind)
    pub names: Vec<String>,

    /// Plan as if --force was given
    #[arg(short, long)]
    pub force: bool,

    /// Plan as if --force-build was given
    #[arg(long)]
    pub force_build: bool,
}

fn parse_kind(s: &str) -> Result<TaskKind, String> {
    TaskKind::parse(s).ok_or_else(|| {
        let kinds: Vec<&str> = TaskKind::ALL.iter().map(|k| k.as_str()).collect();
        format!("unknown task kind '{}' (expected one of: {})", s, kinds.join(", "))
    })
}

impl PlanCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let session = Session::open(cli)?;
        let tasks: Vec<_> = requested_tasks(&session.graph, self.kind, &self.names)?
            .into_iter()
            .map(|t| t.with_force(self.force).with_force_build(self.force_build))
            .collect();

        let dag = session.scheduler.plan(&session.graph, tasks)?;
        let cache = session.scheduler.cache();

        if cli.format == OutputFormat::Json {
            let plan: Vec<serde_json::Value> = dag
                .waves()
                .iter()
                .enumerate()
                .map(|(i, wave)| {
                    serde_json::json!({
                        "wave": i,
                        "tasks": wave.iter().filter_map(|key| dag.get(key)).map(|node| {
                            serde_json::json!({
                                "key": node.task.key().to_string(),
                                "version": node.task.version,
                                "force": node.task.force,
                                "cache": format!("{:?}", cache.get(&node.task.key(), &node.task.version)),
                                "after": node.dependencies.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
                            })
                        }).collect::<Vec<_>>(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&plan)?);
            return Ok(());
        }

        if dag.is_empty() {
            if !cli.quiet {
                output::success("Nothing to do.");
            }
            return Ok(());
        }

        let cached = dag
            .nodes()
            .values()
            .filter(|n| {
                !n.task.force
                    && n.task.kind.is_cacheable()
                    && cache.get(&n.task.key(), &n.task.version) == CacheStatus::Succeeded
            })
            .count();

        println!(
            "{} {} in {}, {} up to date",
            style("→").blue(),
            output::plural(dag.len(), "task"),
            output::plural(dag.waves().len(), "wave"),
            cached
        );
        println!();
        print!("{}", dag.execution_plan());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kind() {
        assert_eq!(parse_kind("deploy").unwrap(), TaskKind::Deploy);
        assert!(parse_kind("launch").unwrap_err().contains("build, deploy, test, run, delete"));
    }
}
