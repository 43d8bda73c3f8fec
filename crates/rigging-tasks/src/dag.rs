//! Task DAG construction and management

use std::collections::{BTreeSet, HashMap, VecDeque};

use tracing::{debug, info, instrument};

use rigging_core::{ConfigGraph, RiggingError};

use crate::handler::HandlerRegistry;
use crate::task::{Task, TaskKey, TaskKind};

/// A node in the task execution DAG
#[derive(Debug, Clone)]
pub struct TaskNode {
    /// The task, with force flags merged across duplicates
    pub task: Task,
    /// Tasks that must complete before this one
    pub dependencies: BTreeSet<TaskKey>,
    /// Tasks waiting on this one
    pub dependents: BTreeSet<TaskKey>,
    /// Execution wave (tasks in the same wave can run in parallel)
    pub wave: usize,
    /// Number of tasks transitively waiting on this one
    pub priority: usize,
    /// Position in which the task was first discovered
    pub order: usize,
}

/// Directed acyclic graph of tasks to execute
#[derive(Debug, Clone)]
pub struct TaskDag {
    nodes: HashMap<TaskKey, TaskNode>,
    /// Keys of the requested tasks, in request order
    requested: Vec<TaskKey>,
    waves: Vec<Vec<TaskKey>>,
    sorted_order: Vec<TaskKey>,
}

impl TaskDag {
    /// Build the dependency closure of `tasks`.
    ///
    /// Dependencies are resolved through each kind's handler. Tasks sharing a
    /// key collapse into one node; if any duplicate asks for `force` (or
    /// `force_build`) the node keeps it.
    #[instrument(skip_all, fields(requested = tasks.len()))]
    pub fn build(
        tasks: Vec<Task>,
        graph: &ConfigGraph,
        registry: &HandlerRegistry,
    ) -> Result<Self, DagError> {
        let mut nodes: HashMap<TaskKey, TaskNode> = HashMap::new();
        let mut requested: Vec<TaskKey> = Vec::new();
        for task in &tasks {
            let key = task.key();
            if !requested.contains(&key) {
                requested.push(key);
            }
        }

        let mut worklist: VecDeque<Task> = tasks.into();
        let mut next_order = 0;

        while let Some(mut task) = worklist.pop_front() {
            let key = task.key();

            if let Some(node) = nodes.get_mut(&key) {
                let escalates = (task.force && !node.task.force)
                    || (task.force_build && !node.task.force_build);
                if !escalates {
                    continue;
                }
                node.task.force |= task.force;
                node.task.force_build |= task.force_build;
                // Re-resolve so dependencies see the stronger flags
                task = node.task.clone();
                debug!(task = %key, "duplicate task escalated force flags");
            }

            let handler = registry
                .get(task.kind)
                .ok_or(DagError::MissingHandler(task.kind))?;
            let deps = handler.resolve_dependencies(&task, graph)?;
            let dep_keys: BTreeSet<TaskKey> = deps.iter().map(Task::key).collect();

            match nodes.get_mut(&key) {
                Some(node) => node.dependencies = dep_keys,
                None => {
                    nodes.insert(
                        key,
                        TaskNode {
                            task,
                            dependencies: dep_keys,
                            dependents: BTreeSet::new(),
                            wave: 0,
                            priority: 0,
                            order: next_order,
                        },
                    );
                    next_order += 1;
                }
            }

            worklist.extend(deps);
        }

        // Build reverse dependency map (dependents)
        let edges: Vec<(TaskKey, TaskKey)> = nodes
            .values()
            .flat_map(|n| {
                let key = n.task.key();
                n.dependencies.iter().map(move |d| (d.clone(), key.clone()))
            })
            .collect();
        for (dependency, dependent) in edges {
            if let Some(node) = nodes.get_mut(&dependency) {
                node.dependents.insert(dependent);
            }
        }

        if let Some(cycle) = Self::find_cycle(&nodes) {
            return Err(DagError::CircularDependency(cycle));
        }

        let sorted_order = Self::topological_sort(&nodes);
        let waves = Self::compute_waves(&nodes, &sorted_order);

        for (wave_idx, wave_tasks) in waves.iter().enumerate() {
            for key in wave_tasks {
                if let Some(node) = nodes.get_mut(key) {
                    node.wave = wave_idx;
                }
            }
        }

        for (key, priority) in Self::compute_priorities(&nodes, &sorted_order) {
            if let Some(node) = nodes.get_mut(&key) {
                node.priority = priority;
            }
        }

        info!(
            task_count = nodes.len(),
            wave_count = waves.len(),
            "task DAG built"
        );

        Ok(Self {
            nodes,
            requested,
            waves,
            sorted_order,
        })
    }

    /// Depth-first search returning the first cycle found, in dependency order
    fn find_cycle(nodes: &HashMap<TaskKey, TaskNode>) -> Option<Vec<TaskKey>> {
        fn dfs(
            nodes: &HashMap<TaskKey, TaskNode>,
            key: &TaskKey,
            done: &mut BTreeSet<TaskKey>,
            path: &mut Vec<TaskKey>,
        ) -> Option<Vec<TaskKey>> {
            if let Some(start) = path.iter().position(|k| k == key) {
                return Some(path[start..].to_vec());
            }
            if done.contains(key) {
                return None;
            }

            path.push(key.clone());
            if let Some(node) = nodes.get(key) {
                for dep in &node.dependencies {
                    if let Some(cycle) = dfs(nodes, dep, done, path) {
                        return Some(cycle);
                    }
                }
            }
            path.pop();
            done.insert(key.clone());
            None
        }

        let mut roots: Vec<&TaskNode> = nodes.values().collect();
        roots.sort_by_key(|n| n.order);

        let mut done = BTreeSet::new();
        for node in roots {
            let mut path = Vec::new();
            if let Some(cycle) = dfs(nodes, &node.task.key(), &mut done, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    /// Kahn's algorithm, ties broken by discovery order
    fn topological_sort(nodes: &HashMap<TaskKey, TaskNode>) -> Vec<TaskKey> {
        let mut in_degree: HashMap<&TaskKey, usize> = HashMap::new();
        let mut ready: BTreeSet<(usize, &TaskKey)> = BTreeSet::new();
        let mut sorted = Vec::with_capacity(nodes.len());

        for (key, node) in nodes {
            let degree = node.dependencies.len();
            in_degree.insert(key, degree);
            if degree == 0 {
                ready.insert((node.order, key));
            }
        }

        while let Some((order, key)) = ready.iter().next().copied() {
            ready.remove(&(order, key));
            sorted.push(key.clone());

            if let Some(node) = nodes.get(key) {
                for dependent in &node.dependents {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            if let Some((k, n)) = nodes.get_key_value(dependent) {
                                ready.insert((n.order, k));
                            }
                        }
                    }
                }
            }
        }

        sorted
    }

    /// Compute execution waves (groups of tasks that can run in parallel)
    fn compute_waves(nodes: &HashMap<TaskKey, TaskNode>, sorted: &[TaskKey]) -> Vec<Vec<TaskKey>> {
        let mut wave_map: HashMap<&TaskKey, usize> = HashMap::new();

        for key in sorted {
            if let Some(node) = nodes.get(key) {
                let wave = node
                    .dependencies
                    .iter()
                    .filter_map(|dep| wave_map.get(dep))
                    .max()
                    .map(|w| w + 1)
                    .unwrap_or(0);
                wave_map.insert(key, wave);
            }
        }

        let max_wave = wave_map.values().max().copied().unwrap_or(0);
        let mut waves: Vec<Vec<TaskKey>> = vec![Vec::new(); max_wave + 1];

        for key in sorted {
            if let Some(&wave) = wave_map.get(key) {
                waves[wave].push(key.clone());
            }
        }

        waves.retain(|w| !w.is_empty());
        waves
    }

    /// Transitive dependent count per task, walking dependents first
    fn compute_priorities(
        nodes: &HashMap<TaskKey, TaskNode>,
        sorted: &[TaskKey],
    ) -> Vec<(TaskKey, usize)> {
        let mut downstream: HashMap<&TaskKey, BTreeSet<&TaskKey>> = HashMap::new();

        for key in sorted.iter().rev() {
            let mut reach = BTreeSet::new();
            if let Some(node) = nodes.get(key) {
                for dependent in &node.dependents {
                    reach.insert(dependent);
                    if let Some(further) = downstream.get(dependent) {
                        reach.extend(further.iter().copied());
                    }
                }
            }
            downstream.insert(key, reach);
        }

        downstream
            .into_iter()
            .map(|(key, reach)| (key.clone(), reach.len()))
            .collect()
    }

    /// Get all task nodes
    pub fn nodes(&self) -> &HashMap<TaskKey, TaskNode> {
        &self.nodes
    }

    /// Get a specific task node
    pub fn get(&self, key: &TaskKey) -> Option<&TaskNode> {
        self.nodes.get(key)
    }

    /// Keys of the tasks that were asked for (as opposed to pulled in as dependencies)
    pub fn requested(&self) -> &[TaskKey] {
        &self.requested
    }

    /// Get execution waves
    pub fn waves(&self) -> &[Vec<TaskKey>] {
        &self.waves
    }

    /// Get the total number of tasks
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the DAG is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Get topologically sorted order
    pub fn sorted(&self) -> &[TaskKey] {
        &self.sorted_order
    }

    /// Get a human-readable summary of the execution plan
    pub fn execution_plan(&self) -> String {
        let mut plan = String::new();
        for (i, wave) in self.waves.iter().enumerate() {
            plan.push_str(&format!("Wave {} ({} tasks):\n", i, wave.len()));
            for key in wave {
                if let Some(node) = self.nodes.get(key) {
                    let mut line = format!("  {} @ {}", key, node.task.version);
                    if node.task.force {
                        line.push_str(" [force]");
                    }
                    if !node.dependencies.is_empty() {
                        let deps: Vec<String> =
                            node.dependencies.iter().map(|d| d.to_string()).collect();
                        line.push_str(&format!(" (after: {})", deps.join(", ")));
                    }
                    plan.push_str(&line);
                    plan.push('\n');
                }
            }
        }
        plan
    }
}

/// Errors during DAG construction. All of them are configuration errors:
/// nothing has executed when they are returned.
#[derive(Debug, thiserror::Error)]
pub enum DagError {
    /// Task dependencies form a cycle
    #[error("Circular dependency detected among tasks: {}", format_cycle(.0))]
    CircularDependency(Vec<TaskKey>),

    /// No handler registered for a task kind
    #[error("No handler registered for {0} tasks")]
    MissingHandler(TaskKind),

    /// Dependency resolution against the config graph failed
    #[error(transparent)]
    Graph(#[from] RiggingError),
}

fn format_cycle(cycle: &[TaskKey]) -> String {
    let mut keys: Vec<String> = cycle.iter().map(|k| k.to_string()).collect();
    if let Some(first) = keys.first().cloned() {
        keys.push(first);
    }
    keys.join(" -> ")
}
