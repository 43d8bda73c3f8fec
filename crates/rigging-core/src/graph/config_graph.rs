//! Static dependency graph of configured entities

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;

use tracing::{info, instrument};

use crate::config::{ModuleConfig, ProjectConfig};
use crate::error::{GraphError, Result, RiggingError};

use super::entity::{EntityKind, EntityNode, EntityRef};
use super::version::{entity_version, normalize_path, SourceHasher};

/// Immutable dependency graph of modules, services, tasks and tests.
///
/// Built once per configuration snapshot. Callers wanting fresh state build a
/// new graph instead of mutating an existing one.
#[derive(Debug, Clone)]
pub struct ConfigGraph {
    config: ProjectConfig,
    nodes: BTreeMap<EntityRef, EntityNode>,
    /// Topologically sorted entities (dependencies first)
    sorted_order: Vec<EntityRef>,
}

impl ConfigGraph {
    /// Resolve the project configuration into a graph.
    ///
    /// Fails on unknown dependency references, duplicate names and cycles.
    #[instrument(skip_all, fields(modules = config.modules.len()))]
    pub fn build(config: &ProjectConfig, hasher: &dyn SourceHasher) -> Result<Self> {
        let mut nodes = Self::create_nodes(config)?;

        // Reverse edges
        let edges: Vec<(EntityRef, EntityRef)> = nodes
            .values()
            .flat_map(|n| n.dependencies.iter().map(move |d| (d.clone(), n.entity.clone())))
            .collect();
        for (dependency, dependant) in edges {
            if let Some(node) = nodes.get_mut(&dependency) {
                node.dependants.insert(dependant);
            }
        }

        if let Some(cycle) = Self::find_cycle(&nodes) {
            return Err(GraphError::CircularDependency {
                cycle: cycle.iter().map(|e| e.to_string()).collect(),
            }
            .into());
        }

        let sorted_order = Self::topological_sort(&nodes);

        // Versions, dependencies first
        let mut versions: HashMap<EntityRef, String> = HashMap::new();
        for entity in &sorted_order {
            let Some(node) = nodes.get(entity) else {
                continue;
            };
            let source_hash = match entity.kind {
                EntityKind::Module => match config.module(&entity.name) {
                    Some(module) => Some(hasher.hash_sources(module)?),
                    None => None,
                },
                _ => None,
            };
            let version = entity_version(node, source_hash.as_deref(), &versions);
            versions.insert(entity.clone(), version.clone());
            if let Some(node) = nodes.get_mut(entity) {
                node.version = version;
            }
        }

        info!(entity_count = nodes.len(), "config graph built");

        Ok(Self {
            config: config.clone(),
            nodes,
            sorted_order,
        })
    }

    fn create_nodes(config: &ProjectConfig) -> Result<BTreeMap<EntityRef, EntityNode>> {
        let mut nodes: BTreeMap<EntityRef, EntityNode> = BTreeMap::new();

        let module_names: BTreeSet<&str> = config.modules.iter().map(|m| m.name.as_str()).collect();

        // Services and tasks share a namespace
        let mut runtime: HashMap<String, EntityRef> = HashMap::new();
        for module in &config.modules {
            let names = module
                .services
                .iter()
                .map(|s| EntityRef::service(&s.name))
                .chain(module.tasks.iter().map(|t| EntityRef::task(&t.name)));
            for entity in names {
                if runtime.insert(entity.name.clone(), entity.clone()).is_some() {
                    return Err(GraphError::DuplicateName {
                        kind: "service or task".to_string(),
                        name: entity.name,
                    }
                    .into());
                }
            }
        }

        let resolve_runtime = |owner: &EntityRef, deps: &[String]| -> Result<BTreeSet<EntityRef>> {
            deps.iter()
                .map(|dep| {
                    runtime.get(dep).cloned().ok_or_else(|| {
                        RiggingError::from(GraphError::UnknownDependency {
                            entity: owner.to_string(),
                            kind: "service or task".to_string(),
                            dependency: dep.clone(),
                        })
                    })
                })
                .collect()
        };

        for module in &config.modules {
            let module_ref = EntityRef::module(&module.name);
            let path = normalize_path(&module.effective_path());

            let mut module_deps = BTreeSet::new();
            for dep in &module.dependencies {
                if !module_names.contains(dep.as_str()) {
                    return Err(GraphError::UnknownDependency {
                        entity: module_ref.to_string(),
                        kind: "module".to_string(),
                        dependency: dep.clone(),
                    }
                    .into());
                }
                module_deps.insert(EntityRef::module(dep));
            }

            let base = EntityNode {
                entity: module_ref.clone(),
                module: module.name.clone(),
                path: path.clone(),
                command: module.build.command.clone(),
                delete_command: None,
                env: module.build.env.clone(),
                dependencies: module_deps,
                dependants: BTreeSet::new(),
                version: String::new(),
            };
            insert_unique(&mut nodes, base.clone())?;

            for service in &module.services {
                let entity = EntityRef::service(&service.name);
                let mut dependencies = resolve_runtime(&entity, &service.dependencies)?;
                dependencies.insert(module_ref.clone());
                insert_unique(
                    &mut nodes,
                    EntityNode {
                        entity,
                        command: service.deploy.clone(),
                        delete_command: service.delete.clone(),
                        env: service.env.clone(),
                        dependencies,
                        ..base.clone()
                    },
                )?;
            }

            for task in &module.tasks {
                let entity = EntityRef::task(&task.name);
                let mut dependencies = resolve_runtime(&entity, &task.dependencies)?;
                dependencies.insert(module_ref.clone());
                insert_unique(
                    &mut nodes,
                    EntityNode {
                        entity,
                        command: task.command.clone(),
                        env: task.env.clone(),
                        dependencies,
                        ..base.clone()
                    },
                )?;
            }

            for test in &module.tests {
                let entity = EntityRef::test(&module.name, &test.name);
                let mut dependencies = resolve_runtime(&entity, &test.dependencies)?;
                dependencies.insert(module_ref.clone());
                insert_unique(
                    &mut nodes,
                    EntityNode {
                        entity,
                        command: test.command.clone(),
                        env: test.env.clone(),
                        dependencies,
                        ..base.clone()
                    },
                )?;
            }
        }

        Ok(nodes)
    }

    /// Depth-first search for a cycle, returned in traversal order
    fn find_cycle(nodes: &BTreeMap<EntityRef, EntityNode>) -> Option<Vec<EntityRef>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn dfs(
            nodes: &BTreeMap<EntityRef, EntityNode>,
            current: &EntityRef,
            marks: &mut HashMap<EntityRef, Mark>,
            path: &mut Vec<EntityRef>,
        ) -> Option<Vec<EntityRef>> {
            match marks.get(current) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|e| e == current).unwrap_or(0);
                    return Some(path[start..].to_vec());
                }
                None => {}
            }

            marks.insert(current.clone(), Mark::Visiting);
            path.push(current.clone());

            if let Some(node) = nodes.get(current) {
                for dep in &node.dependencies {
                    if let Some(cycle) = dfs(nodes, dep, marks, path) {
                        return Some(cycle);
                    }
                }
            }

            path.pop();
            marks.insert(current.clone(), Mark::Done);
            None
        }

        let mut marks = HashMap::new();
        for entity in nodes.keys() {
            let mut path = Vec::new();
            if let Some(cycle) = dfs(nodes, entity, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    /// Kahn's algorithm; the graph is known to be acyclic at this point
    fn topological_sort(nodes: &BTreeMap<EntityRef, EntityNode>) -> Vec<EntityRef> {
        let mut in_degree: HashMap<&EntityRef, usize> = HashMap::new();
        let mut queue: VecDeque<&EntityRef> = VecDeque::new();
        let mut sorted = Vec::with_capacity(nodes.len());

        for (entity, node) in nodes {
            let degree = node.dependencies.len();
            in_degree.insert(entity, degree);
            if degree == 0 {
                queue.push_back(entity);
            }
        }

        while let Some(entity) = queue.pop_front() {
            sorted.push(entity.clone());
            if let Some(node) = nodes.get(entity) {
                for dependant in &node.dependants {
                    if let Some(degree) = in_degree.get_mut(dependant) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            queue.push_back(dependant);
                        }
                    }
                }
            }
        }

        sorted
    }

    /// The configuration this graph was built from
    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    /// All modules, in configuration order
    pub fn modules(&self) -> Vec<&ModuleConfig> {
        self.config.modules.iter().collect()
    }

    /// Get a module config by name
    pub fn module(&self, name: &str) -> Result<&ModuleConfig> {
        self.config.module(name).ok_or_else(|| {
            GraphError::UnknownEntity {
                kind: EntityKind::Module.to_string(),
                name: name.to_string(),
            }
            .into()
        })
    }

    /// Get a node by reference
    pub fn entity(&self, entity: &EntityRef) -> Result<&EntityNode> {
        self.nodes.get(entity).ok_or_else(|| {
            GraphError::UnknownEntity {
                kind: entity.kind.to_string(),
                name: entity.name.clone(),
            }
            .into()
        })
    }

    /// Whether the graph contains an entity
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.nodes.contains_key(entity)
    }

    /// Content version of an entity
    pub fn version(&self, entity: &EntityRef) -> Result<&str> {
        self.entity(entity).map(|n| n.version.as_str())
    }

    /// Services, optionally restricted to the given names
    pub fn services(&self, filter: Option<&[String]>) -> Result<Vec<&EntityNode>> {
        self.of_kind(EntityKind::Service, filter)
    }

    /// Get a service node by name
    pub fn service(&self, name: &str) -> Result<&EntityNode> {
        self.entity(&EntityRef::service(name))
    }

    /// Runtime tasks, optionally restricted to the given names
    pub fn tasks(&self, filter: Option<&[String]>) -> Result<Vec<&EntityNode>> {
        self.of_kind(EntityKind::Task, filter)
    }

    /// Get a runtime task node by name
    pub fn run_task(&self, name: &str) -> Result<&EntityNode> {
        self.entity(&EntityRef::task(name))
    }

    /// Tests, optionally restricted to the given modules
    pub fn tests(&self, modules: Option<&[String]>) -> Result<Vec<&EntityNode>> {
        if let Some(names) = modules {
            for name in names {
                self.module(name)?;
            }
        }
        Ok(self
            .nodes
            .values()
            .filter(|n| n.entity.kind == EntityKind::Test)
            .filter(|n| modules.map_or(true, |names| names.contains(&n.module)))
            .collect())
    }

    /// Get a test node by its qualified name (`module.test`)
    pub fn test(&self, full_name: &str) -> Result<&EntityNode> {
        self.entity(&EntityRef::new(EntityKind::Test, full_name))
    }

    fn of_kind(&self, kind: EntityKind, filter: Option<&[String]>) -> Result<Vec<&EntityNode>> {
        match filter {
            Some(names) => names
                .iter()
                .map(|name| self.entity(&EntityRef::new(kind, name.as_str())))
                .collect(),
            None => Ok(self
                .nodes
                .values()
                .filter(|n| n.entity.kind == kind)
                .collect()),
        }
    }

    /// Dependencies of an entity, direct or transitive
    pub fn dependencies(&self, entity: &EntityRef, recursive: bool) -> Result<BTreeSet<EntityRef>> {
        self.walk(entity, recursive, |n| &n.dependencies)
    }

    /// Dependants of an entity, direct or transitive
    pub fn dependants(&self, entity: &EntityRef, recursive: bool) -> Result<BTreeSet<EntityRef>> {
        self.walk(entity, recursive, |n| &n.dependants)
    }

    fn walk<F>(&self, start: &EntityRef, recursive: bool, edges: F) -> Result<BTreeSet<EntityRef>>
    where
        F: Fn(&EntityNode) -> &BTreeSet<EntityRef>,
    {
        let root = self.entity(start)?;
        if !recursive {
            return Ok(edges(root).clone());
        }

        let mut found = BTreeSet::new();
        let mut queue: VecDeque<&EntityRef> = edges(root).iter().collect();
        while let Some(current) = queue.pop_front() {
            if !found.insert(current.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(current) {
                queue.extend(edges(node).iter().filter(|e| !found.contains(*e)));
            }
        }
        Ok(found)
    }

    /// The changed modules plus every module owning an entity that
    /// transitively depends on something in a changed module.
    ///
    /// Returned in topological order.
    pub fn with_dependant_modules(&self, changed: &[String]) -> Result<Vec<&ModuleConfig>> {
        let mut affected: BTreeSet<String> = BTreeSet::new();

        for name in changed {
            self.module(name)?;
            affected.insert(name.clone());

            let owned = self.nodes.values().filter(|n| &n.module == name);
            for node in owned {
                for dependant in self.dependants(&node.entity, true)? {
                    if let Some(dep_node) = self.nodes.get(&dependant) {
                        affected.insert(dep_node.module.clone());
                    }
                }
            }
        }

        Ok(self
            .sorted_order
            .iter()
            .filter(|e| e.kind == EntityKind::Module && affected.contains(&e.name))
            .filter_map(|e| self.config.module(&e.name))
            .collect())
    }

    /// Module whose directory contains `path` (relative to the project root).
    ///
    /// The most specific module path wins.
    pub fn module_for_path(&self, path: &Path) -> Option<&str> {
        let path = normalize_path(path);
        self.nodes
            .values()
            .filter(|n| n.entity.kind == EntityKind::Module && path.starts_with(&n.path))
            .max_by_key(|n| n.path.components().count())
            .map(|n| n.module.as_str())
    }

    /// Entities in topological order (dependencies first)
    pub fn sorted(&self) -> &[EntityRef] {
        &self.sorted_order
    }

    /// Number of entities in the graph
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no entities
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn insert_unique(nodes: &mut BTreeMap<EntityRef, EntityNode>, node: EntityNode) -> Result<()> {
    if nodes.contains_key(&node.entity) {
        return Err(GraphError::DuplicateName {
            kind: node.entity.kind.to_string(),
            name: node.entity.name.clone(),
        }
        .into());
    }
    nodes.insert(node.entity.clone(), node);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RunTaskConfig, ServiceConfig, TestConfig};
    use crate::graph::FixedHasher;
    use std::path::PathBuf;

    /// common <- api (service api depends on task migrate) ; web depends on api service
    fn create_config() -> ProjectConfig {
        ProjectConfig {
            modules: vec![
                ModuleConfig::new("common").with_build_command("make common"),
                ModuleConfig::new("api")
                    .with_dependency("common")
                    .with_build_command("cargo build")
                    .with_service(
                        ServiceConfig::new("api")
                            .with_dependency("migrate")
                            .with_deploy("./deploy api"),
                    )
                    .with_task(RunTaskConfig::new("migrate"))
                    .with_test(TestConfig::new("unit")),
                ModuleConfig::new("web")
                    .with_service(ServiceConfig::new("web").with_dependency("api"))
                    .with_test(TestConfig::new("e2e").with_dependency("web")),
            ],
            ..Default::default()
        }
    }

    fn build(config: &ProjectConfig) -> ConfigGraph {
        ConfigGraph::build(config, &FixedHasher::new().with("common", "c1").with("api", "a1"))
            .unwrap()
    }

    fn names(nodes: Vec<&EntityNode>) -> Vec<String> {
        nodes.iter().map(|n| n.entity.name.clone()).collect()
    }

    #[test]
    fn test_build_graph() {
        let graph = build(&create_config());
        // 3 modules, 2 services, 1 task, 2 tests
        assert_eq!(graph.len(), 8);
        assert_eq!(graph.sorted().len(), 8);
    }

    #[test]
    fn test_runtime_entities_depend_on_module() {
        let graph = build(&create_config());
        let deps = graph.dependencies(&EntityRef::service("api"), false).unwrap();
        assert!(deps.contains(&EntityRef::module("api")));
        assert!(deps.contains(&EntityRef::task("migrate")));
    }

    #[test]
    fn test_topological_order() {
        let graph = build(&create_config());
        let pos = |e: EntityRef| graph.sorted().iter().position(|s| *s == e).unwrap();

        assert!(pos(EntityRef::module("common")) < pos(EntityRef::module("api")));
        assert!(pos(EntityRef::task("migrate")) < pos(EntityRef::service("api")));
        assert!(pos(EntityRef::service("api")) < pos(EntityRef::service("web")));
        assert!(pos(EntityRef::service("web")) < pos(EntityRef::test("web", "e2e")));
    }

    #[test]
    fn test_cycle_detected_with_order() {
        let config = ProjectConfig {
            modules: vec![
                ModuleConfig::new("a").with_dependency("b"),
                ModuleConfig::new("b").with_dependency("c"),
                ModuleConfig::new("c").with_dependency("a"),
            ],
            ..Default::default()
        };
        let err = ConfigGraph::build(&config, &FixedHasher::new()).unwrap_err();
        match err {
            RiggingError::Graph(GraphError::CircularDependency { cycle }) => {
                assert_eq!(cycle, vec!["module:a", "module:b", "module:c"]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_service_cycle_detected() {
        let config = ProjectConfig {
            modules: vec![ModuleConfig::new("m")
                .with_service(ServiceConfig::new("x").with_dependency("y"))
                .with_service(ServiceConfig::new("y").with_dependency("x"))],
            ..Default::default()
        };
        let err = ConfigGraph::build(&config, &FixedHasher::new()).unwrap_err();
        assert!(err.to_string().contains("service:x -> service:y -> service:x"));
    }

    #[test]
    fn test_unknown_dependency() {
        let config = ProjectConfig {
            modules: vec![ModuleConfig::new("api").with_dependency("nope")],
            ..Default::default()
        };
        let err = ConfigGraph::build(&config, &FixedHasher::new()).unwrap_err();
        assert!(matches!(
            err,
            RiggingError::Graph(GraphError::UnknownDependency { .. })
        ));

        let config = ProjectConfig {
            modules: vec![ModuleConfig::new("api")
                .with_service(ServiceConfig::new("api").with_dependency("redis"))],
            ..Default::default()
        };
        let err = ConfigGraph::build(&config, &FixedHasher::new()).unwrap_err();
        assert!(err.to_string().contains("redis"));
    }

    #[test]
    fn test_duplicate_runtime_name() {
        let config = ProjectConfig {
            modules: vec![
                ModuleConfig::new("a").with_service(ServiceConfig::new("dup")),
                ModuleConfig::new("b").with_task(RunTaskConfig::new("dup")),
            ],
            ..Default::default()
        };
        let err = ConfigGraph::build(&config, &FixedHasher::new()).unwrap_err();
        assert!(matches!(err, RiggingError::Graph(GraphError::DuplicateName { .. })));
    }

    #[test]
    fn test_versions_propagate_downstream() {
        let config = create_config();
        let before = build(&config);
        let after = ConfigGraph::build(
            &config,
            &FixedHasher::new().with("common", "c2").with("api", "a1"),
        )
        .unwrap();

        let changed = |e: EntityRef| before.version(&e).unwrap() != after.version(&e).unwrap();
        assert!(changed(EntityRef::module("common")));
        assert!(changed(EntityRef::module("api")));
        assert!(changed(EntityRef::service("api")));
        assert!(changed(EntityRef::service("web")));
        // web module itself does not depend on common
        assert!(!changed(EntityRef::module("web")));
    }

    #[test]
    fn test_version_format() {
        let graph = build(&create_config());
        let version = graph.version(&EntityRef::module("api")).unwrap();
        assert!(version.starts_with("v-"));
        assert_eq!(version.len(), 12);
    }

    #[test]
    fn test_with_dependant_modules() {
        let graph = build(&create_config());

        let affected: Vec<&str> = graph
            .with_dependant_modules(&["common".to_string()])
            .unwrap()
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        assert_eq!(affected.len(), 3);
        assert_eq!(affected[0], "common");
        assert!(affected.contains(&"api") && affected.contains(&"web"));

        let affected: Vec<&str> = graph
            .with_dependant_modules(&["web".to_string()])
            .unwrap()
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        assert_eq!(affected, vec!["web"]);

        assert!(graph.with_dependant_modules(&["ghost".to_string()]).is_err());
    }

    #[test]
    fn test_query_api() {
        let graph = build(&create_config());
        assert_eq!(names(graph.services(None).unwrap()), vec!["api", "web"]);
        assert_eq!(names(graph.tasks(None).unwrap()), vec!["migrate"]);
        assert_eq!(
            names(graph.tests(Some(&["api".to_string()][..])).unwrap()),
            vec!["api.unit"]
        );
        assert_eq!(graph.test("web.e2e").unwrap().short_name(), "e2e");
        assert!(graph.services(Some(&["ghost".to_string()][..])).is_err());
        assert!(graph.tests(Some(&["ghost".to_string()][..])).is_err());
        assert_eq!(graph.run_task("migrate").unwrap().module, "api");
    }

    #[test]
    fn test_transitive_dependants() {
        let graph = build(&create_config());
        let dependants = graph.dependants(&EntityRef::task("migrate"), true).unwrap();
        assert!(dependants.contains(&EntityRef::service("api")));
        assert!(dependants.contains(&EntityRef::service("web")));
        assert!(dependants.contains(&EntityRef::test("web", "e2e")));
        assert!(!dependants.contains(&EntityRef::test("api", "unit")));
    }

    #[test]
    fn test_module_for_path() {
        let mut config = create_config();
        config.modules.push(ModuleConfig {
            path: Some(PathBuf::from("api/admin")),
            ..ModuleConfig::new("admin")
        });
        let graph = build(&config);

        assert_eq!(graph.module_for_path(Path::new("api/src/main.rs")), Some("api"));
        assert_eq!(graph.module_for_path(Path::new("./api/admin/x.rs")), Some("admin"));
        assert_eq!(graph.module_for_path(Path::new("docs/readme.md")), None);
    }
}
