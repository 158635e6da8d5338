//! Source watching
//!
//! File-system events are collected until the directory has been quiet for
//! the debounce window, then the affected functions are marked stale and the
//! registry is rescanned once. An editor saving through a temp file and a
//! rename therefore causes a single rebuild.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::registry::FunctionRegistry;

/// Keeps the watcher alive; watching stops when dropped
pub struct FunctionWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for FunctionWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl FunctionRegistry {
    /// Watch the directories of the last scan and rebuild on change
    pub fn watch(self: &Arc<Self>, debounce: Duration) -> Result<FunctionWatcher, notify::Error> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) if matches!(event.kind, EventKind::Access(_)) => {}
                Ok(event) => {
                    let _ = tx.send(event.paths);
                }
                Err(e) => warn!(error = %e, "File watcher error"),
            }
        })?;

        // Canonical paths, so event paths compare equal to function paths
        for directory in self.directories() {
            if let Ok(directory) = std::fs::canonicalize(&directory) {
                watcher.watch(&directory, RecursiveMode::Recursive)?;
                debug!(directory = %directory.display(), "Watching functions directory");
            }
        }

        let registry = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(mut changed) = rx.recv().await {
                // Collect the rest of the burst
                loop {
                    match tokio::time::timeout(debounce, rx.recv()).await {
                        Ok(Some(more)) => changed.extend(more),
                        Ok(None) | Err(_) => break,
                    }
                }
                changed.sort();
                changed.dedup();

                let affected = registry.mark_changed(&changed);
                debug!(paths = changed.len(), affected, "Function sources changed");

                let summary = registry.rescan().await;
                if !summary.added.is_empty()
                    || !summary.removed.is_empty()
                    || !summary.rebuilt.is_empty()
                {
                    info!(
                        added = ?summary.added,
                        removed = ?summary.removed,
                        rebuilt = ?summary.rebuilt,
                        "Reloaded functions"
                    );
                }
            }
        });

        Ok(FunctionWatcher {
            _watcher: watcher,
            task,
        })
    }
}
