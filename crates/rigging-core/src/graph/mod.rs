//! Config graph: modules, services, tasks and tests with their dependency edges

mod config_graph;
mod entity;
mod version;

pub use config_graph::ConfigGraph;
pub use entity::{EntityKind, EntityNode, EntityRef};
pub use version::{FileHasher, FixedHasher, SourceHasher};
