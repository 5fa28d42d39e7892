//! ocr-relay - Recognition request broker over local OCR engines
//!
//! A small TCP service fronting multiple OCR backends behind one JSON
//! protocol, with staged detection sessions, per-engine scheduling, and
//! an idle watchdog that shuts the process down when nobody calls.

mod backend;
mod config;
mod dispatch;
mod error;
mod geometry;
mod protocol;
mod server;
mod session;
mod vision;
mod watchdog;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::backend::neural::models::ModelManager;
use crate::backend::neural::NeuralBackend;
use crate::backend::{BackendRegistry, RecognitionBackend};
use crate::config::BrokerConfig;
use crate::dispatch::Dispatcher;
use crate::server::Server;
use crate::session::SessionCache;
use crate::watchdog::{run_watchdog, ActivityMonitor};

/// Recognition request broker over local OCR engines
#[derive(Parser, Debug)]
#[command(name = "ocr-relay")]
#[command(about = "JSON-over-TCP broker fronting local OCR engines")]
struct Args {
    /// Config file path (default: per-user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on; 0 picks an ephemeral port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Default engine id (overrides config)
    #[arg(short, long)]
    engine: Option<String>,

    /// Seconds without requests before automatic shutdown (overrides config)
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    let config = load_configuration(&args)?;
    info!(engine = %config.service.default_engine, "ocr-relay starting");

    let registry = build_registry(&config)?;
    info!(
        engines = ?registry.engine_names(),
        default = registry.default_name(),
        "engines registered"
    );
    let monitor = ActivityMonitor::new(config.idle_timeout());
    let dispatcher = Arc::new(Dispatcher::new(
        registry,
        SessionCache::new(config.service.session_capacity),
        Arc::clone(&monitor),
        config.confined_wait(),
    ));

    let server = Server::bind(
        &config.server.host,
        config.server.port,
        Arc::clone(&dispatcher),
    )
    .await?;
    let address = server.local_addr()?;

    // Parent processes watch stdout for this line to learn the port;
    // everything else logs to stderr.
    let announce = serde_json::json!({ "server_address": address.to_string() });
    println!("[INFO-JSON]:{announce}");
    info!(%address, "listening");

    if let Err(err) = dispatcher.warm_up(None).await {
        warn!(error = %err, "engine warm-up did not finish");
    }

    if config.watchdog.start_enabled {
        tokio::spawn(run_watchdog(Arc::clone(&monitor), config.poll_interval()));
    }

    server.run().await?;
    info!("ocr-relay shutdown complete");
    Ok(())
}

fn init_logging(verbose: bool) -> Result<()> {
    let default_directive = if verbose { "ocr_relay=debug,info" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Load configuration from file, then lay the command line over it.
fn load_configuration(args: &Args) -> Result<BrokerConfig> {
    let path = match &args.config {
        Some(path) => path.clone(),
        None => config::default_config_path()?,
    };
    let mut config = config::load_or_create(&path)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(engine) = &args.engine {
        config.service.default_engine = engine.clone();
    }
    if let Some(secs) = args.idle_timeout {
        config.watchdog.idle_timeout_secs = secs;
    }
    Ok(config)
}

fn build_registry(config: &BrokerConfig) -> Result<BackendRegistry> {
    let manager = ModelManager::new(config.models.dir.as_deref(), config.models.offline)?;
    let mut engines: Vec<Arc<dyn RecognitionBackend>> = vec![Arc::new(NeuralBackend::new(manager))];

    #[cfg(windows)]
    engines.push(Arc::new(backend::native::NativeBackend::new(
        config.service.default_language.clone(),
    )));

    let requested = config.service.default_engine.as_str();
    let default_index = engines
        .iter()
        .position(|engine| engine.name() == requested)
        .unwrap_or_else(|| {
            warn!(
                requested,
                "configured default engine not available on this platform, using neural"
            );
            0
        });

    let mut registry = BackendRegistry::new(Arc::clone(&engines[default_index]));
    for engine in engines {
        registry.register(engine);
    }
    Ok(registry)
}
