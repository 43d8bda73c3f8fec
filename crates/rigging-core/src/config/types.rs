//! Configuration types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::defaults::{DEFAULT_CACHE_DIR, DEFAULT_CONCURRENCY};

/// Main configuration for a Rigging project
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Project name
    pub name: Option<String>,

    /// Scheduler configuration
    pub scheduler: SchedulerConfig,

    /// Result cache configuration
    pub cache: CacheConfig,

    /// Module definitions
    pub modules: Vec<ModuleConfig>,
}

impl ProjectConfig {
    /// Find a module by name
    pub fn module(&self, name: &str) -> Option<&ModuleConfig> {
        self.modules.iter().find(|m| m.name == name)
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum concurrent task executions
    pub concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// Result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether results are persisted between runs
    pub enabled: bool,

    /// Cache directory, relative to the project root
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from(DEFAULT_CACHE_DIR),
        }
    }
}

/// A module: a buildable unit of source code owning services, tasks and tests
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Module name
    pub name: String,

    /// Directory of the module relative to the project root (defaults to the name)
    pub path: Option<PathBuf>,

    /// Source globs hashed into the module version
    pub include: Vec<String>,

    /// Globs excluded from hashing
    pub exclude: Vec<String>,

    /// Modules that must be built before this one
    pub dependencies: Vec<String>,

    /// Build step
    pub build: BuildConfig,

    /// Services deployed from this module
    pub services: Vec<ServiceConfig>,

    /// Runtime tasks defined by this module
    pub tasks: Vec<RunTaskConfig>,

    /// Test suites defined by this module
    pub tests: Vec<TestConfig>,
}

impl ModuleConfig {
    /// Create a module with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a module dependency
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.push(dep.into());
        self
    }

    /// Set the build command
    pub fn with_build_command(mut self, command: impl Into<String>) -> Self {
        self.build.command = Some(command.into());
        self
    }

    /// Add a service
    pub fn with_service(mut self, service: ServiceConfig) -> Self {
        self.services.push(service);
        self
    }

    /// Add a runtime task
    pub fn with_task(mut self, task: RunTaskConfig) -> Self {
        self.tasks.push(task);
        self
    }

    /// Add a test suite
    pub fn with_test(mut self, test: TestConfig) -> Self {
        self.tests.push(test);
        self
    }

    /// Effective module directory relative to the project root
    pub fn effective_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.name))
    }

    /// Effective include globs
    pub fn effective_include(&self) -> Vec<String> {
        if self.include.is_empty() {
            vec!["**/*".to_string()]
        } else {
            self.include.clone()
        }
    }
}

/// Build step of a module
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Shell command that builds the module
    pub command: Option<String>,

    /// Environment variables for the build
    pub env: BTreeMap<String, String>,
}

/// A long-running service deployed from a module
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service name (unique across services and tasks)
    pub name: String,

    /// Services or tasks that must be ready first
    pub dependencies: Vec<String>,

    /// Shell command that deploys the service
    pub deploy: Option<String>,

    /// Shell command that removes the service
    pub delete: Option<String>,

    /// Environment variables
    pub env: BTreeMap<String, String>,
}

impl ServiceConfig {
    /// Create a service with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a dependency on a service or task
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.push(dep.into());
        self
    }

    /// Set the deploy command
    pub fn with_deploy(mut self, command: impl Into<String>) -> Self {
        self.deploy = Some(command.into());
        self
    }
}

/// A one-off runtime task, e.g. a database migration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunTaskConfig {
    /// Task name (unique across services and tasks)
    pub name: String,

    /// Services or tasks that must be ready first
    pub dependencies: Vec<String>,

    /// Shell command to run
    pub command: Option<String>,

    /// Environment variables
    pub env: BTreeMap<String, String>,
}

impl RunTaskConfig {
    /// Create a task with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a dependency on a service or task
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.push(dep.into());
        self
    }
}

/// A test suite
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    /// Test name (unique within its module)
    pub name: String,

    /// Services or tasks that must be ready first
    pub dependencies: Vec<String>,

    /// Shell command that runs the suite
    pub command: Option<String>,

    /// Environment variables
    pub env: BTreeMap<String, String>,
}

impl TestConfig {
    /// Create a test suite with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a dependency on a service or task
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.push(dep.into());
        self
    }
}
