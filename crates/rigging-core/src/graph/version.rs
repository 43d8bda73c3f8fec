//! Content versions
//!
//! A version is a short SHA-256 fingerprint of an entity's own inputs plus
//! the versions of everything it depends on, so any upstream change yields a
//! new version downstream.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::config::{ModuleConfig, STATE_DIR};
use crate::error::{ConfigError, Result};

use super::entity::EntityNode;

/// Number of hex characters kept in a version string
const VERSION_LENGTH: usize = 10;

/// Produces a fingerprint of a module's source files
pub trait SourceHasher: Send + Sync {
    /// Hash the sources of `module`
    fn hash_sources(&self, module: &ModuleConfig) -> Result<String>;
}

/// Hashes module sources from disk
#[derive(Debug, Clone)]
pub struct FileHasher {
    root: PathBuf,
}

impl FileHasher {
    /// Create a hasher resolving module paths against `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn build_set(field: &str, patterns: &[String]) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern).map_err(|e| ConfigError::InvalidValue {
                field: field.to_string(),
                message: format!("invalid glob '{}': {}", pattern, e),
            })?;
            builder.add(glob);
        }
        builder.build().map_err(|e| {
            ConfigError::InvalidValue {
                field: field.to_string(),
                message: e.to_string(),
            }
            .into()
        })
    }
}

impl SourceHasher for FileHasher {
    fn hash_sources(&self, module: &ModuleConfig) -> Result<String> {
        let module_dir = self.root.join(module.effective_path());
        let include = Self::build_set(
            &format!("modules.{}.include", module.name),
            &module.effective_include(),
        )?;
        let exclude = Self::build_set(&format!("modules.{}.exclude", module.name), &module.exclude)?;

        let mut file_hashes: BTreeMap<String, String> = BTreeMap::new();

        if module_dir.exists() {
            let walker = WalkDir::new(&module_dir).into_iter().filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                !(e.file_type().is_dir() && (name == STATE_DIR || name == ".git"))
            });

            for entry in walker.flatten() {
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = match entry.path().strip_prefix(&module_dir) {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                if !include.is_match(relative) || exclude.is_match(relative) {
                    continue;
                }

                let contents = fs::read(entry.path())?;
                let digest = format!("{:x}", Sha256::digest(&contents));
                trace!(module = %module.name, file = %relative.display(), "hashed source file");
                file_hashes.insert(relative.to_string_lossy().replace('\\', "/"), digest);
            }
        }

        let mut hasher = Sha256::new();
        for (path, hash) in &file_hashes {
            hasher.update(path.as_bytes());
            hasher.update(hash.as_bytes());
        }

        debug!(module = %module.name, files = file_hashes.len(), "module sources hashed");
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Source hasher backed by a fixed table, for callers that track content
/// themselves (and for tests). Unknown modules hash to an empty string.
#[derive(Debug, Clone, Default)]
pub struct FixedHasher {
    hashes: HashMap<String, String>,
}

impl FixedHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the source hash for a module
    pub fn with(mut self, module: impl Into<String>, hash: impl Into<String>) -> Self {
        self.hashes.insert(module.into(), hash.into());
        self
    }
}

impl SourceHasher for FixedHasher {
    fn hash_sources(&self, module: &ModuleConfig) -> Result<String> {
        Ok(self.hashes.get(&module.name).cloned().unwrap_or_default())
    }
}

/// Compute the version of `node` from its own inputs and its dependencies' versions
pub(crate) fn entity_version(
    node: &EntityNode,
    source_hash: Option<&str>,
    versions: &HashMap<crate::graph::EntityRef, String>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(node.entity.to_string().as_bytes());

    if let Some(source) = source_hash {
        hasher.update(b"sources=");
        hasher.update(source.as_bytes());
    }
    if let Some(cmd) = &node.command {
        hasher.update(b"command=");
        hasher.update(cmd.as_bytes());
    }
    if let Some(cmd) = &node.delete_command {
        hasher.update(b"delete=");
        hasher.update(cmd.as_bytes());
    }
    for (k, v) in &node.env {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
    }
    for dep in &node.dependencies {
        hasher.update(dep.to_string().as_bytes());
        if let Some(version) = versions.get(dep) {
            hasher.update(version.as_bytes());
        }
    }

    let digest = format!("{:x}", hasher.finalize());
    format!("v-{}", &digest[..VERSION_LENGTH])
}

/// Normalize a module path for prefix matching (`./api` and `api` are equal, `.` is the root)
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, std::path::Component::CurDir))
        .collect()
}
