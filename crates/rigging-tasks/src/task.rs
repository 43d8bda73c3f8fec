//! Task types and dependency rules

use std::fmt;

use serde::{Deserialize, Serialize};

use rigging_core::{ConfigGraph, EntityKind, EntityRef, Result};

/// Kind of operation a task performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Build a module
    Build,
    /// Deploy a service
    Deploy,
    /// Run a test suite
    Test,
    /// Run a one-off runtime task
    Run,
    /// Remove a deployed service
    Delete,
}

impl TaskKind {
    /// All task kinds
    pub const ALL: [TaskKind; 5] = [
        TaskKind::Build,
        TaskKind::Deploy,
        TaskKind::Test,
        TaskKind::Run,
        TaskKind::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Deploy => "deploy",
            Self::Test => "test",
            Self::Run => "run",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "build" => Some(Self::Build),
            "deploy" => Some(Self::Deploy),
            "test" => Some(Self::Test),
            "run" => Some(Self::Run),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    /// Kind of config entity this task operates on
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            Self::Build => EntityKind::Module,
            Self::Deploy | Self::Delete => EntityKind::Service,
            Self::Test => EntityKind::Test,
            Self::Run => EntityKind::Task,
        }
    }

    /// Whether results of this kind may be served from the result cache
    pub fn is_cacheable(&self) -> bool {
        !matches!(self, Self::Delete)
    }

    /// Dependencies every task of this kind needs, derived from the config graph.
    ///
    /// - build: builds of the module's dependency modules
    /// - deploy/test/run: build of the owning module, deploys of service
    ///   dependencies and runs of task dependencies
    /// - delete: deletes of every service that depends on this one, so
    ///   dependants are removed first
    pub fn default_dependencies(&self, task: &Task, graph: &ConfigGraph) -> Result<Vec<Task>> {
        let node = graph.entity(&task.entity())?;
        let mut deps = Vec::new();

        match self {
            Self::Build => {
                for dep in &node.dependencies {
                    deps.push(Task::for_entity(graph, Self::Build, &dep.name)?.with_force(task.force));
                }
            }
            Self::Deploy | Self::Test | Self::Run => {
                deps.push(
                    Task::for_entity(graph, Self::Build, &node.module)?.with_force(task.force_build),
                );
                for dep in &node.dependencies {
                    let kind = match dep.kind {
                        EntityKind::Service => Self::Deploy,
                        EntityKind::Task => Self::Run,
                        EntityKind::Module | EntityKind::Test => continue,
                    };
                    deps.push(
                        Task::for_entity(graph, kind, &dep.name)?.with_force_build(task.force_build),
                    );
                }
            }
            Self::Delete => {
                for dependant in graph.dependants(&node.entity, false)? {
                    if dependant.kind == EntityKind::Service {
                        deps.push(Task::for_entity(graph, Self::Delete, &dependant.name)?);
                    }
                }
            }
        }

        Ok(deps)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of a unit of work, e.g. `build.api` or `test.api.unit`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub kind: TaskKind,
    pub name: String,
}

impl TaskKey {
    pub fn new(kind: TaskKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// Parse a key from `kind.name` format
    pub fn parse(s: &str) -> Option<Self> {
        let (kind, name) = s.split_once('.')?;
        if name.is_empty() {
            return None;
        }
        Some(Self::new(TaskKind::parse(kind)?, name))
    }

    /// Config entity this key refers to
    pub fn entity(&self) -> EntityRef {
        EntityRef::new(self.kind.entity_kind(), self.name.clone())
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

/// A single schedulable unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Operation to perform
    pub kind: TaskKind,
    /// Entity name (tests are qualified: `module.test`)
    pub name: String,
    /// Content version of the entity and its dependencies
    pub version: String,
    /// Bypass the result cache
    pub force: bool,
    /// Bypass the result cache for builds this task depends on
    pub force_build: bool,
}

impl Task {
    /// Create a task with an explicit version
    pub fn new(kind: TaskKind, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            version: version.into(),
            force: false,
            force_build: false,
        }
    }

    /// Create a task for a config entity, taking the version from the graph
    pub fn for_entity(graph: &ConfigGraph, kind: TaskKind, name: &str) -> Result<Self> {
        let entity = EntityRef::new(kind.entity_kind(), name);
        let version = graph.version(&entity)?;
        Ok(Self::new(kind, name, version))
    }

    /// Same task re-resolved against a (newer) graph, keeping its flags
    pub fn refreshed(&self, graph: &ConfigGraph) -> Result<Self> {
        Ok(Self {
            version: graph.version(&self.entity())?.to_string(),
            ..self.clone()
        })
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_force_build(mut self, force_build: bool) -> Self {
        self.force_build = force_build;
        self
    }

    /// Deduplication key
    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.kind, self.name.clone())
    }

    /// Config entity this task operates on
    pub fn entity(&self) -> EntityRef {
        EntityRef::new(self.kind.entity_kind(), self.name.clone())
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.key(), self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rigging_core::config::{ModuleConfig, ProjectConfig, ServiceConfig, TestConfig};
    use rigging_core::FixedHasher;

    fn create_graph() -> ConfigGraph {
        let config = ProjectConfig {
            modules: vec![
                ModuleConfig::new("common"),
                ModuleConfig::new("api")
                    .with_dependency("common")
                    .with_service(ServiceConfig::new("db"))
                    .with_service(ServiceConfig::new("api").with_dependency("db"))
                    .with_test(TestConfig::new("unit").with_dependency("api")),
            ],
            ..Default::default()
        };
        ConfigGraph::build(&config, &FixedHasher::new()).unwrap()
    }

    fn keys(tasks: &[Task]) -> Vec<String> {
        tasks.iter().map(|t| t.key().to_string()).collect()
    }

    #[test]
    fn test_task_key_display_and_parse() {
        let key = TaskKey::new(TaskKind::Test, "api.unit");
        assert_eq!(key.to_string(), "test.api.unit");
        assert_eq!(TaskKey::parse("test.api.unit"), Some(key));
        assert!(TaskKey::parse("frobnicate.api").is_none());
        assert!(TaskKey::parse("build").is_none());
    }

    #[test]
    fn test_for_entity_uses_graph_version() {
        let graph = create_graph();
        let task = Task::for_entity(&graph, TaskKind::Deploy, "api").unwrap();
        assert_eq!(task.version, graph.service("api").unwrap().version);
        assert!(Task::for_entity(&graph, TaskKind::Deploy, "ghost").is_err());
    }

    #[test]
    fn test_build_dependencies_inherit_force() {
        let graph = create_graph();
        let task = Task::for_entity(&graph, TaskKind::Build, "api").unwrap().with_force(true);
        let deps = TaskKind::Build.default_dependencies(&task, &graph).unwrap();
        assert_eq!(keys(&deps), vec!["build.common"]);
        assert!(deps[0].force);
    }

    #[test]
    fn test_deploy_dependencies() {
        let graph = create_graph();
        let task = Task::for_entity(&graph, TaskKind::Deploy, "api")
            .unwrap()
            .with_force_build(true);
        let deps = TaskKind::Deploy.default_dependencies(&task, &graph).unwrap();
        assert_eq!(keys(&deps), vec!["build.api", "deploy.db"]);
        assert!(deps[0].force);
        assert!(!deps[1].force);
        assert!(deps[1].force_build);
    }

    #[test]
    fn test_test_dependencies() {
        let graph = create_graph();
        let task = Task::for_entity(&graph, TaskKind::Test, "api.unit").unwrap();
        let deps = TaskKind::Test.default_dependencies(&task, &graph).unwrap();
        assert_eq!(keys(&deps), vec!["build.api", "deploy.api"]);
    }

    #[test]
    fn test_delete_dependants_first() {
        let graph = create_graph();
        let task = Task::for_entity(&graph, TaskKind::Delete, "db").unwrap();
        let deps = TaskKind::Delete.default_dependencies(&task, &graph).unwrap();
        assert_eq!(keys(&deps), vec!["delete.api"]);
    }

    #[test]
    fn test_cacheable_kinds() {
        assert!(TaskKind::Build.is_cacheable());
        assert!(!TaskKind::Delete.is_cacheable());
    }
}
