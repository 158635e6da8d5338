//! Function registry
//!
//! Owns every discovered function. All structural changes (insert, replace,
//! remove) go through `scan`, which holds the scan lock, so there is exactly
//! one mutation path. Lookups are lock-free reads of the map.

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::builder::{FunctionBuilder, FunctionSource};
use crate::function::FunctionDescriptor;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Functions directory {path} is not readable: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid function name '{0}': use only letters, digits, '-' and '_'")]
    InvalidName(String),
}

/// Outcome of one scan
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub rebuilt: Vec<String>,
    pub failed: Vec<String>,
}

/// Registry of discovered functions
pub struct FunctionRegistry {
    functions: DashMap<String, Arc<FunctionDescriptor>>,
    routes: DashMap<String, String>,
    builders: Vec<Arc<dyn FunctionBuilder>>,
    directories: RwLock<Vec<PathBuf>>,
    scan_lock: Mutex<()>,
}

impl FunctionRegistry {
    pub fn new(builders: Vec<Arc<dyn FunctionBuilder>>) -> Self {
        Self {
            functions: DashMap::new(),
            routes: DashMap::new(),
            builders,
            directories: RwLock::new(Vec::new()),
            scan_lock: Mutex::new(()),
        }
    }

    /// Directories given to the last scan
    pub fn directories(&self) -> Vec<PathBuf> {
        self.directories.read().clone()
    }

    /// Scan directories in order; a function found in a later directory
    /// replaces one of the same name found earlier.
    pub async fn scan(&self, directories: &[PathBuf]) -> ScanSummary {
        let _guard = self.scan_lock.lock().await;
        *self.directories.write() = directories.to_vec();

        let mut discovered: HashMap<String, (FunctionSource, Arc<dyn FunctionBuilder>)> =
            HashMap::new();
        for directory in directories {
            match self.discover(directory).await {
                Ok(found) => {
                    for (source, builder) in found {
                        if let Some((previous, _)) = discovered.get(&source.name) {
                            debug!(
                                function = %source.name,
                                replaced = %previous.main_file.display(),
                                by = %source.main_file.display(),
                                "Function overridden by later directory"
                            );
                        }
                        discovered.insert(source.name.clone(), (source, builder));
                    }
                }
                Err(e) => warn!(error = %e, "Skipping functions directory"),
            }
        }

        let mut summary = ScanSummary::default();

        let removed: Vec<String> = self
            .functions
            .iter()
            .filter(|entry| !discovered.contains_key(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for name in removed {
            self.functions.remove(&name);
            self.routes.retain(|_, function| function != &name);
            info!(function = %name, "Removed function");
            summary.removed.push(name);
        }

        let mut to_build = Vec::new();
        for (name, (source, builder)) in discovered {
            let unchanged = self
                .functions
                .get(&name)
                .is_some_and(|existing| existing.main_file() == source.main_file);

            if !unchanged {
                let function = Arc::new(FunctionDescriptor::new(source, builder));
                if !function.has_valid_name() {
                    warn!(error = %DiscoveryError::InvalidName(name.clone()), "Function will not be served");
                }
                self.routes.retain(|_, owner| owner != &name);
                self.functions.insert(name.clone(), function);
                info!(function = %name, "Discovered function");
                summary.added.push(name.clone());
            }

            if let Some(function) = self.get(&name) {
                if function.has_valid_name() {
                    to_build.push(function);
                }
            }
        }

        let results = join_all(to_build.iter().map(|function| function.rebuild_if_stale())).await;
        for (function, result) in to_build.iter().zip(results) {
            match result {
                Ok(true) => {
                    self.update_routes(function).await;
                    summary.rebuilt.push(function.name().to_string());
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(function = %function.name(), error = %e, "Function build failed");
                    self.routes.retain(|_, owner| owner != function.name());
                    summary.failed.push(function.name().to_string());
                }
            }
        }

        summary.added.sort();
        summary.rebuilt.sort();
        summary.failed.sort();
        summary.removed.sort();
        summary
    }

    /// Scan the directories of the previous scan again
    pub async fn rescan(&self) -> ScanSummary {
        let directories = self.directories();
        self.scan(&directories).await
    }

    /// Mark every function watching one of the paths as stale.
    /// Returns the number of functions affected.
    pub fn mark_changed(&self, paths: &[PathBuf]) -> usize {
        let mut affected = 0;
        for entry in &self.functions {
            if paths.iter().any(|path| entry.value().watches(path)) {
                entry.value().mark_stale();
                debug!(function = %entry.key(), "Function sources changed");
                affected += 1;
            }
        }
        affected
    }

    /// Get a function by name
    pub fn get(&self, name: &str) -> Option<Arc<FunctionDescriptor>> {
        self.functions.get(name).map(|f| f.clone())
    }

    /// Get the function serving a custom route
    pub fn get_by_route(&self, path: &str) -> Option<Arc<FunctionDescriptor>> {
        let name = self.routes.get(path).map(|name| name.clone())?;
        self.get(&name)
    }

    /// List all functions, sorted by name
    pub fn list(&self) -> Vec<Arc<FunctionDescriptor>> {
        let mut functions: Vec<_> = self.functions.iter().map(|r| r.value().clone()).collect();
        functions.sort_by(|a, b| a.name().cmp(b.name()));
        functions
    }

    async fn update_routes(&self, function: &FunctionDescriptor) {
        self.routes.retain(|_, owner| owner != function.name());
        if let Ok(data) = function.build_data().await {
            for route in &data.routes {
                self.routes
                    .insert(route.clone(), function.name().to_string());
            }
        }
    }

    async fn discover(
        &self,
        directory: &Path,
    ) -> Result<Vec<(FunctionSource, Arc<dyn FunctionBuilder>)>, DiscoveryError> {
        let to_error = |source| DiscoveryError::Directory {
            path: directory.to_path_buf(),
            source,
        };

        let directory = tokio::fs::canonicalize(directory).await.map_err(to_error)?;
        let mut entries = tokio::fs::read_dir(&directory).await.map_err(to_error)?;

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(to_error)? {
            paths.push(entry.path());
        }
        paths.sort();

        let mut found = Vec::new();
        for path in paths {
            let claimed = self
                .builders
                .iter()
                .find_map(|builder| builder.detect(&path).map(|source| (source, builder.clone())));
            if let Some(claimed) = claimed {
                found.push(claimed);
            }
        }
        Ok(found)
    }
}
