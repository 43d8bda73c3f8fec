//! CLI commands

mod build;
mod cache;
mod delete;
mod deploy;
mod dev;
mod plan;
mod run;
mod test;

pub use build::BuildCommand;
pub use cache::CacheCommand;
pub use delete::DeleteCommand;
pub use deploy::DeployCommand;
pub use dev::DevCommand;
pub use plan::PlanCommand;
pub use run::RunCommand;
pub use test::TestCommand;
