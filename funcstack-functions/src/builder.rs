//! Build capability consumed by the registry
//!
//! A builder recognises function sources on disk and turns them into build
//! metadata. The registry never compiles anything itself.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::schedule;

/// Errors from a builder
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Main file not found for {function}: {path}")]
    MissingMainFile { function: String, path: PathBuf },

    #[error("Invalid schedule for {function}: {message}")]
    InvalidSchedule { function: String, message: String },

    #[error("Build of {function} failed: {message}")]
    Failed { function: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A function source as found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSource {
    pub name: String,
    /// Source entry of the function
    pub main_file: PathBuf,
    /// Set when the function lives in its own directory
    pub directory: Option<PathBuf>,
}

/// Result of a successful build
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    pub entry_path: PathBuf,
    pub src_files: BTreeSet<PathBuf>,
    pub schedule: Option<String>,
    /// Unset means the direct (version 1) runtime API
    pub runtime_api_version: Option<u32>,
    /// Custom URL paths served by the function
    pub routes: Vec<String>,
}

/// Turns function sources into build metadata
#[async_trait]
pub trait FunctionBuilder: Send + Sync {
    /// Builder name, for logs
    fn name(&self) -> &'static str;

    /// Inspect a directory entry and claim it if this builder handles it
    fn detect(&self, entry: &Path) -> Option<FunctionSource>;

    async fn build(&self, source: &FunctionSource) -> Result<BuildOutput, BuildError>;
}

/// Per-function settings supplied by configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FunctionSettings {
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub runtime_api_version: Option<u32>,
}

/// Builder for functions that run straight from their source file
///
/// A function is either `<dir>/<name>.<ext>` or a directory `<dir>/<name>/`
/// holding `<name>.<ext>` or `index.<ext>`.
#[derive(Debug, Clone)]
pub struct ScriptBuilder {
    extensions: Vec<String>,
    runtime_api_version: u32,
    settings: HashMap<String, FunctionSettings>,
}

impl Default for ScriptBuilder {
    fn default() -> Self {
        Self::new(default_extensions(), 2)
    }
}

pub fn default_extensions() -> Vec<String> {
    ["js", "mjs", "cjs", "ts", "mts", "sh"]
        .iter()
        .map(|ext| (*ext).to_string())
        .collect()
}

impl ScriptBuilder {
    pub fn new(extensions: Vec<String>, runtime_api_version: u32) -> Self {
        Self {
            extensions,
            runtime_api_version,
            settings: HashMap::new(),
        }
    }

    pub fn with_settings(mut self, settings: HashMap<String, FunctionSettings>) -> Self {
        self.settings = settings;
        self
    }

    fn has_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|e| e == ext))
    }

    fn find_main_file(&self, directory: &Path, name: &str) -> Option<PathBuf> {
        for stem in [name, "index"] {
            for ext in &self.extensions {
                let candidate = directory.join(format!("{stem}.{ext}"));
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
        None
    }
}

#[async_trait]
impl FunctionBuilder for ScriptBuilder {
    fn name(&self) -> &'static str {
        "script"
    }

    fn detect(&self, entry: &Path) -> Option<FunctionSource> {
        let file_name = entry.file_name()?.to_str()?;
        if file_name.starts_with('.') {
            return None;
        }

        if entry.is_dir() {
            let main_file = self.find_main_file(entry, file_name)?;
            return Some(FunctionSource {
                name: file_name.to_string(),
                main_file,
                directory: Some(entry.to_path_buf()),
            });
        }

        if entry.is_file() && self.has_extension(entry) {
            let name = entry.file_stem()?.to_str()?.to_string();
            return Some(FunctionSource {
                name,
                main_file: entry.to_path_buf(),
                directory: None,
            });
        }

        None
    }

    async fn build(&self, source: &FunctionSource) -> Result<BuildOutput, BuildError> {
        if !tokio::fs::try_exists(&source.main_file).await? {
            return Err(BuildError::MissingMainFile {
                function: source.name.clone(),
                path: source.main_file.clone(),
            });
        }

        let settings = self.settings.get(&source.name).cloned().unwrap_or_default();

        if let Some(expression) = &settings.schedule {
            schedule::validate(expression).map_err(|e| BuildError::InvalidSchedule {
                function: source.name.clone(),
                message: e.to_string(),
            })?;
        }

        let src_files = match &source.directory {
            Some(directory) => collect_files(directory).await?,
            None => BTreeSet::from([source.main_file.clone()]),
        };

        debug!(
            function = %source.name,
            files = src_files.len(),
            "Collected function sources"
        );

        Ok(BuildOutput {
            entry_path: source.main_file.clone(),
            src_files,
            schedule: settings.schedule,
            runtime_api_version: Some(
                settings
                    .runtime_api_version
                    .unwrap_or(self.runtime_api_version),
            ),
            routes: settings.path.into_iter().collect(),
        })
    }
}

/// All regular files below a directory, hidden entries skipped
async fn collect_files(root: &Path) -> Result<BTreeSet<PathBuf>, BuildError> {
    let mut files = BTreeSet::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(directory) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.insert(entry.path());
            }
        }
    }

    Ok(files)
}
