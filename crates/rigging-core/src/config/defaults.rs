//! Default configuration values

/// Default configuration file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "rigging.toml";

/// Default configuration file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "rigging.yaml";

/// Alternative YAML extension
pub const ALT_CONFIG_YAML: &str = "rigging.yml";

/// Directory holding project-local state (cache, alternative config location)
pub const STATE_DIR: &str = ".rigging";

/// Default cache directory, relative to the project root
pub const DEFAULT_CACHE_DIR: &str = ".rigging/cache";

/// Default bound on concurrent task executions
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Get list of config file names to search for, in priority order
pub fn config_file_names() -> Vec<&'static str> {
    vec![DEFAULT_CONFIG_TOML, DEFAULT_CONFIG_YAML, ALT_CONFIG_YAML]
}

/// Starter configuration written by hand or by tooling
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Rigging project configuration
name = "my-project"

[scheduler]
concurrency = 4

[cache]
enabled = true
dir = ".rigging/cache"

[[modules]]
name = "app"

[modules.build]
command = "make build"

[[modules.services]]
name = "app"
deploy = "make deploy"
delete = "make undeploy"

[[modules.tests]]
name = "unit"
command = "make test"
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ProjectConfig;

    #[test]
    fn test_template_parses() {
        let config: ProjectConfig = toml::from_str(DEFAULT_CONFIG_TEMPLATE).unwrap();
        assert_eq!(config.modules.len(), 1);
        assert_eq!(config.modules[0].services[0].name, "app");
    }

    #[test]
    fn test_toml_is_preferred() {
        assert_eq!(config_file_names()[0], DEFAULT_CONFIG_TOML);
    }
}
