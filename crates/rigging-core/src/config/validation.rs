//! Configuration validation

use std::collections::HashSet;

use tracing::debug;

use crate::error::{ConfigError, Result};

use super::types::ProjectConfig;

/// Validate configuration
///
/// Dependency references are resolved later by the config graph; this pass
/// only checks shape and naming.
pub fn validate_config(config: &ProjectConfig) -> Result<()> {
    debug!("validating configuration");
    validate_scheduler(config)?;
    validate_modules(config)?;
    validate_runtime_names(config)?;
    debug!("configuration validation passed");
    Ok(())
}

fn validate_scheduler(config: &ProjectConfig) -> Result<()> {
    if config.scheduler.concurrency == 0 {
        return Err(ConfigError::InvalidValue {
            field: "scheduler.concurrency".to_string(),
            message: "must be at least 1".to_string(),
        }
        .into());
    }
    Ok(())
}

fn validate_modules(config: &ProjectConfig) -> Result<()> {
    let mut seen = HashSet::new();
    for (i, module) in config.modules.iter().enumerate() {
        if module.name.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: format!("modules[{}].name", i),
                message: "module name cannot be empty".to_string(),
            }
            .into());
        }
        if !seen.insert(module.name.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: format!("modules[{}].name", i),
                message: format!("duplicate module name '{}'", module.name),
            }
            .into());
        }

        let mut tests = HashSet::new();
        for (j, test) in module.tests.iter().enumerate() {
            if test.name.is_empty() || !tests.insert(test.name.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: format!("modules[{}].tests[{}].name", i, j),
                    message: "test names must be non-empty and unique within a module".to_string(),
                }
                .into());
            }
        }
    }
    Ok(())
}

/// Services and runtime tasks share one namespace so dependencies can name either
fn validate_runtime_names(config: &ProjectConfig) -> Result<()> {
    let mut seen = HashSet::new();
    for module in &config.modules {
        let names = module
            .services
            .iter()
            .map(|s| ("services", s.name.as_str()))
            .chain(module.tasks.iter().map(|t| ("tasks", t.name.as_str())));

        for (section, name) in names {
            if name.is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "modules.{}.{}.name",
                    module.name, section
                ))
                .into());
            }
            if !seen.insert(name) {
                return Err(ConfigError::InvalidValue {
                    field: format!("modules.{}.{}", module.name, section),
                    message: format!("name '{}' is already used by another service or task", name),
                }
                .into());
            }
        }
    }
    Ok(())
}
