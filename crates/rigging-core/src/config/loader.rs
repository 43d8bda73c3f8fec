//! Configuration loading

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{ConfigError, Result};

use super::defaults::{config_file_names, STATE_DIR};
use super::types::ProjectConfig;
use super::validation::validate_config;

/// Load configuration from a file
pub fn load_config(path: &Path) -> Result<ProjectConfig> {
    let format = if path.extension().is_some_and(|e| e == "toml") {
        "TOML"
    } else {
        "YAML"
    };
    info!(path = %path.display(), format, "loading config");

    let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;

    let config: ProjectConfig = if format == "TOML" {
        toml::from_str(&content).map_err(ConfigError::TomlError)?
    } else {
        serde_yaml::from_str(&content).map_err(ConfigError::YamlError)?
    };

    validate_config(&config)?;
    debug!(path = %path.display(), modules = config.modules.len(), "config loaded and validated");
    Ok(config)
}

/// Find configuration file in directory or parent directories.
///
/// At each directory level the search checks:
///   1. `<dir>/<name>`           (e.g. `rigging.toml`)
///   2. `<dir>/.rigging/<name>`  (e.g. `.rigging/rigging.toml`)
///
/// The first match wins. Parents are walked until the filesystem root.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    debug!(start_dir = %start_dir.display(), "searching for config file");
    let mut current = start_dir.to_path_buf();

    loop {
        for name in config_file_names() {
            let config_path = current.join(name);
            if config_path.exists() {
                info!(path = %config_path.display(), "found config file");
                return Some(config_path);
            }

            let state_path = current.join(STATE_DIR).join(name);
            if state_path.exists() {
                info!(path = %state_path.display(), "found config file in {}/", STATE_DIR);
                return Some(state_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    debug!("no config file found");
    None
}

/// Load configuration from directory (searching parent directories)
pub fn load_config_from_dir(dir: &Path) -> Result<(ProjectConfig, PathBuf)> {
    let config_path = find_config(dir).ok_or_else(|| ConfigError::NotFound(dir.to_path_buf()))?;

    let config = load_config(&config_path)?;
    Ok((config, config_path))
}

/// Load configuration or use defaults
pub fn load_config_or_default(dir: &Path) -> (ProjectConfig, Option<PathBuf>) {
    match load_config_from_dir(dir) {
        Ok((config, path)) => (config, Some(path)),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "no usable config found, using defaults");
            (ProjectConfig::default(), None)
        }
    }
}

/// Project root for a config file: the directory holding it, or the parent
/// of `.rigging/` when the file lives there
pub fn project_root(config_path: &Path) -> PathBuf {
    let dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    if dir.file_name().is_some_and(|n| n == STATE_DIR) {
        dir.parent().unwrap_or(dir).to_path_buf()
    } else {
        dir.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINIMAL: &str = "[[modules]]\nname = \"api\"\n";

    #[test]
    fn test_find_config_toml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("rigging.toml");
        std::fs::write(&config_path, MINIMAL).unwrap();

        let found = find_config(temp.path());
        assert_eq!(found, Some(config_path));
    }

    #[test]
    fn test_find_config_prefers_toml_over_yaml() {
        let temp = TempDir::new().unwrap();
        let toml_path = temp.path().join("rigging.toml");
        let yaml_path = temp.path().join("rigging.yaml");
        std::fs::write(&toml_path, MINIMAL).unwrap();
        std::fs::write(&yaml_path, "modules:\n  - name: api\n").unwrap();

        let found = find_config(temp.path()).unwrap();
        assert_eq!(found, toml_path);
    }

    #[test]
    fn test_find_config_in_state_dir() {
        let temp = TempDir::new().unwrap();
        let state_dir = temp.path().join(".rigging");
        std::fs::create_dir_all(&state_dir).unwrap();
        let config_path = state_dir.join("rigging.toml");
        std::fs::write(&config_path, MINIMAL).unwrap();

        let found = find_config(temp.path()).unwrap();
        assert_eq!(found, config_path);
        assert_eq!(project_root(&found), temp.path());
    }

    #[test]
    fn test_find_config_in_parent() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("rigging.toml");
        std::fs::write(&config_path, MINIMAL).unwrap();
        let nested = temp.path().join("api").join("src");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_config(&nested), Some(config_path));
    }

    #[test]
    fn test_load_config_yaml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("rigging.yaml");
        std::fs::write(&config_path, "modules:\n  - name: api\n    dependencies: []\n").unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(config.modules[0].name, "api");
    }

    #[test]
    fn test_load_config_rejects_invalid() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("rigging.toml");
        std::fs::write(&config_path, "[scheduler]\nconcurrency = 0\n").unwrap();

        assert!(load_config(&config_path).is_err());
    }

    #[test]
    fn test_load_config_or_default_without_file() {
        let temp = TempDir::new().unwrap();
        let (config, path) = load_config_or_default(temp.path());
        assert!(path.is_none());
        assert!(config.modules.is_empty());
    }
}
