//! Configuration management

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use funcstack_functions::builder::default_extensions;
use funcstack_functions::{FunctionSettings, GeoMode, WorkerConfig};

/// Main configuration structure
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub functions: FunctionsConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub geo: GeoConfig,

    /// Variables passed to every function
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Public URL of the site, used for the identity endpoint
    #[serde(default)]
    pub site_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            site_url: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FunctionsConfig {
    #[serde(default = "default_directories")]
    pub directories: Vec<PathBuf>,

    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    #[serde(default = "default_runtime_api_version")]
    pub runtime_api_version: u32,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_background_timeout_secs")]
    pub background_timeout_secs: u64,

    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    #[serde(default = "default_true")]
    pub watch: bool,

    /// Per-function schedule, custom path and runtime API version
    #[serde(default)]
    pub settings: HashMap<String, FunctionSettings>,
}

impl Default for FunctionsConfig {
    fn default() -> Self {
        Self {
            directories: default_directories(),
            extensions: default_extensions(),
            runtime_api_version: default_runtime_api_version(),
            timeout_secs: default_timeout_secs(),
            background_timeout_secs: default_background_timeout_secs(),
            debounce_ms: default_debounce_ms(),
            max_body_bytes: default_max_body_bytes(),
            watch: true,
            settings: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GeoConfig {
    #[serde(default)]
    pub mode: GeoMode,

    /// Country code reported in mock mode and on lookup failure
    #[serde(default)]
    pub country: Option<String>,

    #[serde(default = "default_geo_endpoint")]
    pub endpoint: String,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            mode: GeoMode::default(),
            country: None,
            endpoint: default_geo_endpoint(),
        }
    }
}

fn default_port() -> u16 {
    8888
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_directories() -> Vec<PathBuf> {
    vec![PathBuf::from("netlify/functions")]
}

fn default_runtime_api_version() -> u32 {
    2
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_background_timeout_secs() -> u64 {
    900
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_max_body_bytes() -> usize {
    6 * 1024 * 1024
}

fn default_geo_endpoint() -> String {
    "https://netlifind.netlify.app".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Without an explicit path, `funcstack.toml` in the working directory is
    /// read when present. `FUNCSTACK_*` variables override file values, with
    /// `__` separating nested keys (`FUNCSTACK_SERVER__PORT`). Variables
    /// without `__` land on top-level keys, which are ignored.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("funcstack").required(false),
        };

        let config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("FUNCSTACK")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        Ok(config.try_deserialize::<Config>()?)
    }
}
