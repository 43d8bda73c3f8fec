//! Project graph source and filesystem watcher for `rigging dev`

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use rigging_core::config::{load_config, STATE_DIR};
use rigging_core::{ConfigGraph, FileHasher};
use rigging_tasks::{GraphSource, WatchEvent};

/// Directories whose contents never affect a module
const IGNORED_DIRS: &[&str] = &[STATE_DIR, ".git", "target", "node_modules"];

/// Loads the project config from disk and hashes module sources.
///
/// Remembers the last graph it produced so file events can be mapped to
/// modules using the current layout.
pub struct ProjectSource {
    root: PathBuf,
    config_path: PathBuf,
    current: RwLock<Arc<ConfigGraph>>,
}

impl ProjectSource {
    /// Load the project once, failing if its configuration is invalid
    pub fn open(root: PathBuf, config_path: PathBuf) -> rigging_core::Result<Self> {
        let graph = build_graph(&root, &config_path)?;
        Ok(Self {
            root,
            config_path,
            current: RwLock::new(Arc::new(graph)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Most recently loaded graph
    pub fn current(&self) -> Arc<ConfigGraph> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Translate a changed path into a watch event
    pub fn classify(&self, path: &Path) -> Option<WatchEvent> {
        if path == self.config_path {
            return Some(WatchEvent::ConfigChanged);
        }

        let relative = path.strip_prefix(&self.root).ok()?;
        if is_ignored(relative) {
            return None;
        }

        let graph = self.current();
        let module = graph.module_for_path(relative)?;
        Some(WatchEvent::ModuleChanged {
            module: module.to_string(),
            path: relative.to_path_buf(),
        })
    }
}

impl GraphSource for ProjectSource {
    fn load(&self) -> rigging_core::Result<ConfigGraph> {
        let graph = build_graph(&self.root, &self.config_path)?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(graph.clone());
        Ok(graph)
    }
}

fn build_graph(root: &Path, config_path: &Path) -> rigging_core::Result<ConfigGraph> {
    let config = load_config(config_path)?;
    ConfigGraph::build(&config, &FileHasher::new(root))
}

fn is_ignored(relative: &Path) -> bool {
    relative.components().any(|c| match c {
        Component::Normal(name) => IGNORED_DIRS.iter().any(|d| name == *d),
        _ => false,
    })
}

/// Handle for the filesystem watcher.
///
/// Dropping it stops file watching.
pub struct WatcherHandle {
    _inner: RecommendedWatcher,
}

impl std::fmt::Debug for WatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherHandle").finish()
    }
}

/// Watch the project root recursively and forward relevant changes
pub fn spawn_watcher(
    source: Arc<ProjectSource>,
    events_tx: mpsc::UnboundedSender<WatchEvent>,
) -> anyhow::Result<WatcherHandle> {
    // Channel from the blocking notify callback into the async world
    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Event>();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let _ = raw_tx.send(event);
            }
            Err(err) => warn!(error = %err, "file watch error"),
        },
        Config::default(),
    )?;

    watcher.watch(source.root(), RecursiveMode::Recursive)?;
    info!(root = %source.root().display(), "file watcher started");

    tokio::spawn(async move {
        while let Some(event) = raw_rx.recv().await {
            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) {
                continue;
            }

            for path in &event.paths {
                let Some(change) = source.classify(path) else {
                    continue;
                };
                debug!(path = %path.display(), ?change, "change detected");
                if events_tx.send(change).is_err() {
                    // Nobody is consuming events anymore
                    return;
                }
            }
        }
        debug!("file watcher loop ended");
    });

    Ok(WatcherHandle { _inner: watcher })
}
