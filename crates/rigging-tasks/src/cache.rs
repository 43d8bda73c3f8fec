//! Result cache keyed by task key and content version

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::handler::TaskOutput;
use crate::task::TaskKey;

/// Status of a (key, version) pair in the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Nothing recorded for this key
    NotStarted,
    /// This exact version succeeded
    Succeeded,
    /// This exact version failed
    Failed,
    /// The key was executed, but for a different version
    Outdated,
}

/// Recorded outcome of an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CacheOutcome {
    Succeeded { output: TaskOutput },
    Failed { error: String },
}

/// A cached task result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: TaskKey,
    pub version: String,
    pub outcome: CacheOutcome,
    pub completed_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn status(&self) -> CacheStatus {
        match self.outcome {
            CacheOutcome::Succeeded { .. } => CacheStatus::Succeeded,
            CacheOutcome::Failed { .. } => CacheStatus::Failed,
        }
    }

    /// Output of a successful execution
    pub fn output(&self) -> Option<&TaskOutput> {
        match &self.outcome {
            CacheOutcome::Succeeded { output } => Some(output),
            CacheOutcome::Failed { .. } => None,
        }
    }
}

type Index = HashMap<TaskKey, BTreeMap<String, CacheEntry>>;

/// Maps (task key, version) to the last recorded outcome.
///
/// Always keeps an in-memory index; a persistent cache also writes one JSON
/// file per version under a directory per key. Only exact version matches
/// count as hits, older versions remain available as history.
#[derive(Debug)]
pub struct ResultCache {
    dir: Option<PathBuf>,
    index: Mutex<Index>,
}

impl ResultCache {
    /// Cache living only as long as the process
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            index: Mutex::new(HashMap::new()),
        }
    }

    /// Cache persisted under `dir`
    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            index: Mutex::new(HashMap::new()),
        }
    }

    /// Cache directory, if persistent
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn is_persistent(&self) -> bool {
        self.dir.is_some()
    }

    fn index(&self) -> MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key_dir(&self, key: &TaskKey) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        let digest = format!("{:x}", Sha256::digest(key.to_string().as_bytes()));
        Some(dir.join(&digest[..16]))
    }

    fn entry_path(&self, key: &TaskKey, version: &str) -> Option<PathBuf> {
        self.key_dir(key).map(|d| d.join(format!("{}.json", version)))
    }

    /// Status of `key` at `version`. Read errors are logged and reported as
    /// `NotStarted`.
    pub fn get(&self, key: &TaskKey, version: &str) -> CacheStatus {
        match self.lookup(key, version) {
            Ok(Some(entry)) => return entry.status(),
            Ok(None) => {}
            Err(e) => {
                warn!(task = %key, error = %e, "cache read failed");
                return CacheStatus::NotStarted;
            }
        }

        match self.history(key) {
            Ok(history) if !history.is_empty() => CacheStatus::Outdated,
            Ok(_) => CacheStatus::NotStarted,
            Err(e) => {
                warn!(task = %key, error = %e, "cache read failed");
                CacheStatus::NotStarted
            }
        }
    }

    /// Entry for this exact version if it is already indexed in memory.
    ///
    /// Never touches disk. Every `record` made by this process is indexed, so
    /// a miss here only means the entry may still exist on disk.
    pub fn lookup_indexed(&self, key: &TaskKey, version: &str) -> Option<CacheEntry> {
        self.index().get(key).and_then(|v| v.get(version)).cloned()
    }

    /// Look up the entry for this exact version
    pub fn lookup(&self, key: &TaskKey, version: &str) -> Result<Option<CacheEntry>, CacheError> {
        if let Some(entry) = self.lookup_indexed(key, version) {
            debug!(task = %key, version, "cache hit (memory)");
            return Ok(Some(entry));
        }

        let Some(path) = self.entry_path(key, version) else {
            return Ok(None);
        };
        if !path.exists() {
            debug!(task = %key, version, "cache miss");
            return Ok(None);
        }

        let entry = read_entry(&path)?;
        self.index()
            .entry(key.clone())
            .or_default()
            .insert(version.to_string(), entry.clone());
        debug!(task = %key, version, "cache hit (disk)");
        Ok(Some(entry))
    }

    /// Record the outcome of an execution, replacing any previous outcome for
    /// the same version
    pub fn record(
        &self,
        key: &TaskKey,
        version: &str,
        outcome: CacheOutcome,
    ) -> Result<CacheEntry, CacheError> {
        let entry = CacheEntry {
            key: key.clone(),
            version: version.to_string(),
            outcome,
            completed_at: Utc::now(),
        };

        self.index()
            .entry(key.clone())
            .or_default()
            .insert(version.to_string(), entry.clone());

        if let (Some(dir), Some(path)) = (self.key_dir(key), self.entry_path(key, version)) {
            fs::create_dir_all(&dir).map_err(CacheError::Io)?;
            let json = serde_json::to_string_pretty(&entry).map_err(CacheError::Json)?;
            fs::write(&path, json).map_err(CacheError::Io)?;
        }

        debug!(task = %key, version, "result recorded");
        Ok(entry)
    }

    /// Every recorded version of `key`, oldest first
    pub fn history(&self, key: &TaskKey) -> Result<Vec<CacheEntry>, CacheError> {
        let mut entries: BTreeMap<String, CacheEntry> =
            self.index().get(key).cloned().unwrap_or_default();

        if let Some(dir) = self.key_dir(key) {
            if dir.exists() {
                for file in fs::read_dir(&dir).map_err(CacheError::Io)? {
                    let path = file.map_err(CacheError::Io)?.path();
                    if path.extension().is_some_and(|e| e == "json") {
                        let entry = read_entry(&path)?;
                        entries.entry(entry.version.clone()).or_insert(entry);
                    }
                }
            }
        }

        let mut history: Vec<CacheEntry> = entries.into_values().collect();
        history.sort_by_key(|e| e.completed_at);
        Ok(history)
    }

    /// Drop every recorded version of `key`
    pub fn forget(&self, key: &TaskKey) -> Result<(), CacheError> {
        self.index().remove(key);
        if let Some(dir) = self.key_dir(key) {
            if dir.exists() {
                fs::remove_dir_all(&dir).map_err(CacheError::Io)?;
            }
        }
        debug!(task = %key, "cache entries forgotten");
        Ok(())
    }

    /// Remove everything; returns the number of removed entries
    pub fn clear(&self) -> Result<usize, CacheError> {
        let stats = self.stats()?;
        self.index().clear();
        if let Some(dir) = &self.dir {
            if dir.exists() {
                fs::remove_dir_all(dir).map_err(CacheError::Io)?;
            }
        }
        info!(removed = stats.entries, "cache cleared");
        Ok(stats.entries)
    }

    /// Get cache statistics
    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let mut stats = CacheStats::default();

        let Some(dir) = &self.dir else {
            let index = self.index();
            stats.keys = index.len();
            stats.entries = index.values().map(|v| v.len()).sum();
            return Ok(stats);
        };

        if !dir.exists() {
            return Ok(stats);
        }

        for key_dir in fs::read_dir(dir).map_err(CacheError::Io)? {
            let path = key_dir.map_err(CacheError::Io)?.path();
            if !path.is_dir() {
                continue;
            }
            stats.keys += 1;

            for file in fs::read_dir(&path).map_err(CacheError::Io)?.flatten() {
                stats.entries += 1;
                if let Ok(meta) = file.metadata() {
                    stats.total_size += meta.len();
                }
            }
        }

        Ok(stats)
    }
}

fn read_entry(path: &Path) -> Result<CacheEntry, CacheError> {
    let contents = fs::read_to_string(path).map_err(CacheError::Io)?;
    serde_json::from_str(&contents).map_err(CacheError::Json)
}

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of distinct task keys
    pub keys: usize,
    /// Number of recorded (key, version) entries
    pub entries: usize,
    /// Total size in bytes (persistent caches only)
    pub total_size: u64,
}

impl CacheStats {
    /// Format total size in human-readable form
    pub fn formatted_size(&self) -> String {
        if self.total_size < 1024 {
            format!("{} B", self.total_size)
        } else if self.total_size < 1024 * 1024 {
            format!("{:.1} KB", self.total_size as f64 / 1024.0)
        } else {
            format!("{:.1} MB", self.total_size as f64 / (1024.0 * 1024.0))
        }
    }
}

/// Cache errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// IO error
    #[error("Cache IO error: {0}")]
    Io(std::io::Error),

    /// JSON serialization error
    #[error("Cache JSON error: {0}")]
    Json(serde_json::Error),

    /// The blocking task doing the disk access did not complete
    #[error("Cache worker failed: {0}")]
    Worker(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskKind;
    use tempfile::TempDir;

    fn key() -> TaskKey {
        TaskKey::new(TaskKind::Build, "api")
    }

    fn success(log: &str) -> CacheOutcome {
        CacheOutcome::Succeeded {
            output: TaskOutput::new(log),
        }
    }

    #[test]
    fn test_status_transitions() {
        let cache = ResultCache::in_memory();
        assert_eq!(cache.get(&key(), "v1"), CacheStatus::NotStarted);

        cache.record(&key(), "v1", success("ok")).unwrap();
        assert_eq!(cache.get(&key(), "v1"), CacheStatus::Succeeded);
        assert_eq!(cache.get(&key(), "v2"), CacheStatus::Outdated);

        cache
            .record(&key(), "v2", CacheOutcome::Failed { error: "boom".to_string() })
            .unwrap();
        assert_eq!(cache.get(&key(), "v2"), CacheStatus::Failed);
        // older version is still history, not a hit for v2
        assert_eq!(cache.history(&key()).unwrap().len(), 2);
    }

    #[test]
    fn test_record_is_last_write_wins() {
        let cache = ResultCache::in_memory();
        cache.record(&key(), "v1", success("first")).unwrap();
        cache.record(&key(), "v1", success("second")).unwrap();

        let entry = cache.lookup(&key(), "v1").unwrap().unwrap();
        assert_eq!(entry.output().unwrap().log, "second");
        assert_eq!(cache.stats().unwrap().entries, 1);
    }

    #[test]
    fn test_persistent_survives_restart() {
        let temp = TempDir::new().unwrap();
        {
            let cache = ResultCache::persistent(temp.path());
            cache.record(&key(), "v1", success("built")).unwrap();
        }

        let cache = ResultCache::persistent(temp.path());
        let entry = cache.lookup(&key(), "v1").unwrap().unwrap();
        assert_eq!(entry.output().unwrap().log, "built");
        assert_eq!(cache.get(&key(), "v9"), CacheStatus::Outdated);

        let stats = cache.stats().unwrap();
        assert_eq!(stats.keys, 1);
        assert_eq!(stats.entries, 1);
        assert!(stats.total_size > 0);
    }

    #[test]
    fn test_forget_and_clear() {
        let temp = TempDir::new().unwrap();
        let cache = ResultCache::persistent(temp.path().join("cache"));
        let other = TaskKey::new(TaskKind::Deploy, "api");

        cache.record(&key(), "v1", success("a")).unwrap();
        cache.record(&other, "v1", success("b")).unwrap();

        cache.forget(&other).unwrap();
        assert_eq!(cache.get(&other, "v1"), CacheStatus::NotStarted);
        assert_eq!(cache.get(&key(), "v1"), CacheStatus::Succeeded);

        assert_eq!(cache.clear().unwrap(), 1);
        assert_eq!(cache.get(&key(), "v1"), CacheStatus::NotStarted);
    }

    #[test]
    fn test_corrupt_entry_is_error() {
        let temp = TempDir::new().unwrap();
        let cache = ResultCache::persistent(temp.path());
        cache.record(&key(), "v1", success("ok")).unwrap();

        let fresh = ResultCache::persistent(temp.path());
        let path = fresh.entry_path(&key(), "v1").unwrap();
        fs::write(&path, "not json").unwrap();

        assert!(matches!(fresh.lookup(&key(), "v1"), Err(CacheError::Json(_))));
        assert_eq!(fresh.get(&key(), "v1"), CacheStatus::NotStarted);
    }

    #[test]
    fn test_lookup_indexed_never_reads_disk() {
        let temp = TempDir::new().unwrap();
        let cache = ResultCache::persistent(temp.path());
        assert!(cache.is_persistent());
        cache.record(&key(), "v1", success("ok")).unwrap();
        assert!(cache.lookup_indexed(&key(), "v1").is_some());

        // A fresh cache only knows about the entry once it has been read
        let fresh = ResultCache::persistent(temp.path());
        assert!(fresh.lookup_indexed(&key(), "v1").is_none());
        assert!(fresh.lookup(&key(), "v1").unwrap().is_some());
        assert!(fresh.lookup_indexed(&key(), "v1").is_some());
    }

    #[test]
    fn test_formatted_size() {
        let stats = CacheStats {
            total_size: 2048,
            ..Default::default()
        };
        assert_eq!(stats.formatted_size(), "2.0 KB");
    }
}
