//! Entities of the config graph

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Kind of configured entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// Buildable source module
    Module,
    /// Deployable service
    Service,
    /// One-off runtime task
    Task,
    /// Test suite
    Test,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Module => "module",
            Self::Service => "service",
            Self::Task => "task",
            Self::Test => "test",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "module" => Some(Self::Module),
            "service" => Some(Self::Service),
            "task" => Some(Self::Task),
            "test" => Some(Self::Test),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to an entity in the config graph, e.g. `service:api`
///
/// Test names are qualified by their module: `test:api.unit`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub name: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn module(name: impl Into<String>) -> Self {
        Self::new(EntityKind::Module, name)
    }

    pub fn service(name: impl Into<String>) -> Self {
        Self::new(EntityKind::Service, name)
    }

    pub fn task(name: impl Into<String>) -> Self {
        Self::new(EntityKind::Task, name)
    }

    /// Reference to test `test` of module `module`
    pub fn test(module: &str, test: &str) -> Self {
        Self::new(EntityKind::Test, format!("{}.{}", module, test))
    }

    /// Parse a `kind:name` reference
    pub fn parse(s: &str) -> Option<Self> {
        let (kind, name) = s.split_once(':')?;
        if name.is_empty() {
            return None;
        }
        Some(Self::new(EntityKind::parse(kind)?, name))
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// A resolved node of the config graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityNode {
    /// Which entity this node describes
    pub entity: EntityRef,
    /// Owning module (a module owns itself)
    pub module: String,
    /// Directory of the owning module, relative to the project root
    pub path: PathBuf,
    /// Command performing the entity's main operation (build, deploy, run, test)
    pub command: Option<String>,
    /// Command removing a service
    pub delete_command: Option<String>,
    /// Environment passed to commands
    pub env: BTreeMap<String, String>,
    /// Entities that must be ready before this one
    pub dependencies: BTreeSet<EntityRef>,
    /// Entities that depend on this one
    pub dependants: BTreeSet<EntityRef>,
    /// Content version of this entity and everything it depends on
    pub version: String,
}

impl EntityNode {
    /// Short name without the module qualifier (tests only differ)
    pub fn short_name(&self) -> &str {
        match self.entity.kind {
            EntityKind::Test => self
                .entity
                .name
                .strip_prefix(&self.module)
                .and_then(|s| s.strip_prefix('.'))
                .unwrap_or(&self.entity.name),
            _ => &self.entity.name,
        }
    }
}
