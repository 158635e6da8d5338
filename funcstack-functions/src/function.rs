//! Function descriptors

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::builder::{BuildError, FunctionBuilder, FunctionSource};
use crate::schedule::{self, ScheduleError};

/// Name suffix marking a background function
pub const BACKGROUND_SUFFIX: &str = "-background";

static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("function name pattern is valid"));

/// How a function is invoked and how its result reaches the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FunctionKind {
    Synchronous,
    Background,
    Scheduled,
    /// Only known once a result carries builder metadata
    Builder,
}

impl FunctionKind {
    /// Post-invocation refinement: a result flagged as coming from a builder
    /// function turns a synchronous invocation into a builder one.
    pub fn refine(self, builder_function: bool) -> Self {
        match self {
            Self::Synchronous if builder_function => Self::Builder,
            kind => kind,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synchronous => "synchronous",
            Self::Background => "background",
            Self::Scheduled => "scheduled",
            Self::Builder => "builder",
        }
    }
}

/// Build metadata of a function
#[derive(Debug, Clone)]
pub struct BuildData {
    pub entry_path: PathBuf,
    pub src_files: BTreeSet<PathBuf>,
    pub runtime_api_version: u32,
    pub schedule: Option<String>,
    pub routes: Vec<String>,
    pub built_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct BuildState {
    data: Option<Arc<BuildData>>,
    hash: Option<String>,
    error: Option<String>,
}

/// A discovered function
///
/// The build state sits behind an async mutex: a rebuild holds it for its
/// whole duration, so an invocation reading the build data waits for a
/// rebuild in progress instead of racing it. Invocations only keep an
/// `Arc<BuildData>` snapshot, so they never block each other.
pub struct FunctionDescriptor {
    name: String,
    main_file: PathBuf,
    directory: Option<PathBuf>,
    builder: Arc<dyn FunctionBuilder>,
    build: Mutex<BuildState>,
    stale: AtomicBool,
    watched: RwLock<BTreeSet<PathBuf>>,
}

impl std::fmt::Debug for FunctionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionDescriptor")
            .field("name", &self.name)
            .field("main_file", &self.main_file)
            .field("builder", &self.builder.name())
            .finish_non_exhaustive()
    }
}

impl FunctionDescriptor {
    pub fn new(source: FunctionSource, builder: Arc<dyn FunctionBuilder>) -> Self {
        let watched = BTreeSet::from([source.main_file.clone()]);
        Self {
            name: source.name,
            main_file: source.main_file,
            directory: source.directory,
            builder,
            build: Mutex::new(BuildState::default()),
            stale: AtomicBool::new(false),
            watched: RwLock::new(watched),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn main_file(&self) -> &Path {
        &self.main_file
    }

    pub fn source(&self) -> FunctionSource {
        FunctionSource {
            name: self.name.clone(),
            main_file: self.main_file.clone(),
            directory: self.directory.clone(),
        }
    }

    pub fn has_valid_name(&self) -> bool {
        NAME_PATTERN.is_match(&self.name)
    }

    pub fn is_background(&self) -> bool {
        self.name.ends_with(BACKGROUND_SUFFIX)
    }

    pub async fn is_scheduled(&self) -> Result<bool, BuildError> {
        Ok(self.build_data().await?.schedule.is_some())
    }

    /// Pre-invocation classification from the name and the build metadata
    pub async fn kind(&self) -> Result<FunctionKind, BuildError> {
        if self.is_background() {
            return Ok(FunctionKind::Background);
        }
        if self.is_scheduled().await? {
            return Ok(FunctionKind::Scheduled);
        }
        Ok(FunctionKind::Synchronous)
    }

    /// Next fire time of a scheduled function, `None` for other functions
    pub async fn next_run(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, NextRunError> {
        let data = self.build_data().await?;
        match &data.schedule {
            Some(expression) => Ok(Some(schedule::next_run(expression, after)?)),
            None => Ok(None),
        }
    }

    /// Whether a changed path affects this function
    pub fn watches(&self, path: &Path) -> bool {
        if let Some(directory) = &self.directory {
            if path.starts_with(directory) {
                return true;
            }
        }
        self.watched.read().contains(path)
    }

    /// Force a rebuild before the next read of the build data
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    /// Build data, building first if the function was never built
    pub async fn build_data(&self) -> Result<Arc<BuildData>, BuildError> {
        let mut state = self.build.lock().await;
        if let Some(data) = &state.data {
            if !self.stale.load(Ordering::SeqCst) {
                return Ok(data.clone());
            }
        }
        self.build_locked(&mut state).await
    }

    /// Rebuild when never built, marked stale, or when the sources changed
    /// since the last build. Returns whether a build ran.
    pub async fn rebuild_if_stale(&self) -> Result<bool, BuildError> {
        let mut state = self.build.lock().await;

        let needs_build = match &state.data {
            None => true,
            Some(_) if self.stale.load(Ordering::SeqCst) => true,
            Some(data) => {
                let hash = hash_sources(&data.src_files).await;
                state.hash.as_deref() != Some(hash.as_str())
            }
        };

        if !needs_build {
            return Ok(false);
        }

        self.build_locked(&mut state).await.map(|_| true)
    }

    /// Error of the last failed build, if the function is currently unusable
    pub async fn last_error(&self) -> Option<String> {
        self.build.lock().await.error.clone()
    }

    async fn build_locked(&self, state: &mut BuildState) -> Result<Arc<BuildData>, BuildError> {
        self.stale.store(false, Ordering::SeqCst);
        debug!(function = %self.name, builder = self.builder.name(), "Building function");

        let output = match self.builder.build(&self.source()).await {
            Ok(output) => output,
            Err(e) => {
                state.data = None;
                state.hash = None;
                state.error = Some(e.to_string());
                return Err(e);
            }
        };

        let hash = hash_sources(&output.src_files).await;
        let data = Arc::new(BuildData {
            entry_path: output.entry_path,
            src_files: output.src_files,
            runtime_api_version: output.runtime_api_version.unwrap_or(1),
            schedule: output.schedule,
            routes: output.routes,
            built_at: Utc::now(),
        });

        {
            let mut watched = self.watched.write();
            *watched = data.src_files.clone();
            watched.insert(self.main_file.clone());
        }

        info!(
            function = %self.name,
            entry = %data.entry_path.display(),
            runtime_api_version = data.runtime_api_version,
            scheduled = data.schedule.is_some(),
            "Built function"
        );

        state.data = Some(data.clone());
        state.hash = Some(hash);
        state.error = None;
        Ok(data)
    }
}

/// Errors computing the next run of a scheduled function
#[derive(Debug, thiserror::Error)]
pub enum NextRunError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// SHA-256 over the paths and contents of a set of files.
/// Unreadable files contribute a marker so that deletions change the hash.
pub async fn hash_sources(files: &BTreeSet<PathBuf>) -> String {
    let mut hasher = Sha256::new();
    for path in files {
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        match tokio::fs::read(path).await {
            Ok(contents) => hasher.update(&contents),
            Err(_) => hasher.update(b"<missing>"),
        }
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}
