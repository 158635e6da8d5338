//! funcstack - local serverless function emulator
//!
//! Discovers functions in the configured directories, rebuilds them when
//! their sources change and serves them over HTTP.

mod config;
mod router;

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use funcstack_functions::{
    Dispatcher, Executor, FunctionRegistry, FunctionsState, GeoMode, HandlerTable,
    HttpGeoLocator, IdentityProvider, RequestAdapter, ScriptBuilder, Timeouts,
};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "funcstack")]
#[command(about = "Local serverless function emulator")]
#[command(
    long_about = "Local serverless function emulator\n\n\
    Functions run in a worker process per invocation (runtime API version 2). \
    Version 1 functions need an in-process handler, which this binary does not register."
)]
struct Args {
    /// Configuration file (default: funcstack.toml when present)
    #[arg(short, long, env = "FUNCSTACK_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "FUNCSTACK_PORT")]
    port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "FUNCSTACK_HOST")]
    host: Option<String>,

    /// Functions directories, later ones override earlier ones
    #[arg(short, long = "functions", env = "FUNCSTACK_FUNCTIONS_DIRS", value_delimiter = ',')]
    functions: Vec<PathBuf>,

    /// Program used to start isolated workers
    #[arg(long, env = "FUNCSTACK_WORKER_PROGRAM")]
    worker: Option<String>,

    /// Geolocation mode: cache, update or mock
    #[arg(long, env = "FUNCSTACK_GEO_MODE")]
    geo: Option<GeoMode>,

    /// Country code for mock geolocation
    #[arg(long, env = "FUNCSTACK_COUNTRY")]
    country: Option<String>,

    /// Do not rebuild functions when their sources change
    #[arg(long, env = "FUNCSTACK_NO_WATCH")]
    no_watch: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "FUNCSTACK_LOG_LEVEL")]
    log_level: String,
}

impl Args {
    /// Command-line values win over the configuration file
    fn apply(&self, mut config: Config) -> Config {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(host) = &self.host {
            config.server.host.clone_from(host);
        }
        if !self.functions.is_empty() {
            config.functions.directories.clone_from(&self.functions);
        }
        if let Some(worker) = &self.worker {
            config.worker.program.clone_from(worker);
        }
        if let Some(mode) = self.geo {
            config.geo.mode = mode;
        }
        if self.country.is_some() {
            config.geo.country.clone_from(&self.country);
        }
        if self.no_watch {
            config.functions.watch = false;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("funcstack={},tower_http=debug", args.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.apply(Config::load(args.config.as_deref())?);

    info!("Starting funcstack...");
    info!("  Functions: {:?}", config.functions.directories);
    info!(
        "  Worker: {} {}",
        config.worker.program,
        config.worker.args.join(" ")
    );
    info!("  Geolocation: {:?}", config.geo.mode);

    let builder = ScriptBuilder::new(
        config.functions.extensions.clone(),
        config.functions.runtime_api_version,
    )
    .with_settings(config.functions.settings.clone());
    let registry = Arc::new(FunctionRegistry::new(vec![Arc::new(builder)]));

    let summary = registry.scan(&config.functions.directories).await;
    for function in registry.list() {
        info!(function = %function.name(), main_file = %function.main_file().display(), "Loaded function");
    }
    if !summary.failed.is_empty() {
        warn!(failed = ?summary.failed, "Some functions failed to build");
    }

    let _watcher = if config.functions.watch {
        Some(registry.watch(Duration::from_millis(config.functions.debounce_ms))?)
    } else {
        None
    };

    let site_url = config
        .server
        .site_url
        .clone()
        .unwrap_or_else(|| format!("http://localhost:{}", config.server.port));

    // No in-process handlers are linked into the binary
    let executor = Arc::new(Executor::new(
        Arc::new(HandlerTable::new()),
        config.worker.clone(),
        config.environment.clone(),
    ));
    for name in executor.unhandled_functions(&registry.list()).await {
        warn!(
            function = %name,
            "Function uses runtime API version 1 but no in-process handler is registered; \
             set runtime_api_version = 2 to run it in a worker"
        );
    }
    let adapter = RequestAdapter::new(
        IdentityProvider::new(&site_url),
        Arc::new(HttpGeoLocator::new(
            config.geo.endpoint.clone(),
            config.geo.country.clone(),
        )),
        config.geo.mode,
        config.functions.max_body_bytes,
    );
    let dispatcher = Dispatcher::new(
        executor,
        Timeouts {
            synchronous: Duration::from_secs(config.functions.timeout_secs),
            background: Duration::from_secs(config.functions.background_timeout_secs),
        },
    );
    let state = Arc::new(FunctionsState::new(registry, adapter, dispatcher));

    // Create router
    let app = router::create_router(state);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");
    })
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arguments_override_config() {
        let args = Args::parse_from([
            "funcstack",
            "--port",
            "7000",
            "--functions",
            "a,b",
            "--geo",
            "mock",
            "--no-watch",
        ]);
        let config = args.apply(Config::default());

        assert_eq!(config.server.port, 7000);
        assert_eq!(config.functions.directories, vec![PathBuf::from("a"), PathBuf::from("b")]);
        assert_eq!(config.geo.mode, GeoMode::Mock);
        assert!(!config.functions.watch);
        assert_eq!(config.server.host, "127.0.0.1");
    }
}
