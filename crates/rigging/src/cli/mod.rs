//! CLI definition and command handling

pub mod commands;
pub mod output;

use anyhow::Context;
use clap::{Parser, Subcommand};

use commands::{
    BuildCommand, CacheCommand, DeleteCommand, DeployCommand, DevCommand, PlanCommand, RunCommand,
    TestCommand,
};

/// Rigging - dependency-aware build, deploy and test runner
#[derive(Debug, Parser)]
#[command(name = "rigging")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Working directory
    #[arg(short = 'C', long, global = true)]
    pub directory: Option<std::path::PathBuf>,

    /// Maximum concurrent tasks (overrides the project setting)
    #[arg(long, global = true, env = "RIGGING_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Do not read or persist cached task results
    #[arg(long, global = true)]
    pub no_cache: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// JSON output
    Json,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Build modules and their dependencies
    Build(BuildCommand),

    /// Deploy services, building what they need first
    Deploy(DeployCommand),

    /// Run tests
    Test(TestCommand),

    /// Run a one-off task
    Run(RunCommand),

    /// Remove deployed entities
    Delete(DeleteCommand),

    /// Deploy services and keep them up to date as sources change
    Dev(DevCommand),

    /// Show the execution plan without running anything
    Plan(PlanCommand),

    /// Manage the result cache
    Cache(CacheCommand),
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(&self) -> anyhow::Result<()> {
        // Change to specified directory if provided
        if let Some(dir) = &self.directory {
            std::env::set_current_dir(dir)
                .with_context(|| format!("Failed to change directory to {}", dir.display()))?;
        }

        match &self.command {
            Commands::Build(cmd) => cmd.execute(self),
            Commands::Deploy(cmd) => cmd.execute(self),
            Commands::Test(cmd) => cmd.execute(self),
            Commands::Run(cmd) => cmd.execute(self),
            Commands::Delete(cmd) => cmd.execute(self),
            Commands::Dev(cmd) => cmd.execute(self),
            Commands::Plan(cmd) => cmd.execute(self),
            Commands::Cache(cmd) => cmd.execute(self),
        }
    }

    /// Whether human-readable progress should be printed
    pub fn shows_progress(&self) -> bool {
        !self.quiet && self.format == OutputFormat::Text
    }
}
