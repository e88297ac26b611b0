//! farmtrack - game log observer and farming tracker backend.
//!
//! Wires the pipeline together: log tailer -> parser registry -> event bus
//! -> domain services -> storage/WebSocket, plus the REST query surface.

use anyhow::{Context, Result};
use clap::Parser as ClapParser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use farmtrack_backend::api::{self, AppState};
use farmtrack_backend::config::Config;
use farmtrack_backend::events::EventBus;
use farmtrack_backend::items::ItemCatalog;
use farmtrack_backend::maps::MapTable;
use farmtrack_backend::parsing::ParserRegistry;
use farmtrack_backend::prices::PriceBook;
use farmtrack_backend::services::broadcaster::BroadcastService;
use farmtrack_backend::services::{builtin_services, ServiceContainer, ServiceContext};
use farmtrack_backend::storage::Database;
use farmtrack_backend::tailer::{LogTailer, TailerConfig};

#[derive(Debug, ClapParser)]
#[command(name = "farmtrack", about = "Game log observer and farming tracker")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, short, env = "FARMTRACK_CONFIG", default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    let args = Args::parse();

    // Configuration problems are fatal before anything else starts.
    let config = Arc::new(Config::load(&args.config)?);
    init_tracing(&config);

    info!("🚀 farmtrack starting");

    let db = Arc::new(Database::open(&config.database_path())?);
    let catalog = Arc::new(ItemCatalog::load(&config.price_table_path()));
    let maps = Arc::new(MapTable::load(&config.map_table_path())?);
    let bus = Arc::new(EventBus::new());
    let broadcaster = Arc::new(BroadcastService::new());

    let prices = Arc::new(PriceBook::new(
        Arc::clone(&db),
        Arc::clone(&catalog),
        config.price_db.url.clone(),
        config.price_table_path(),
    )?);
    prices.register(&bus);
    if let Err(e) = prices.refresh().await {
        warn!("💰 Price refresh failed: {e:#}");
    }

    let ctx = ServiceContext {
        bus: Arc::clone(&bus),
        db: Arc::clone(&db),
        prices: Arc::clone(&prices),
        catalog: Arc::clone(&catalog),
        maps: Arc::clone(&maps),
        config: Arc::clone(&config),
        broadcaster: Arc::clone(&broadcaster),
    };
    let container = Arc::new(ServiceContainer::start(&ctx, builtin_services()).await);

    // Parser pipeline: tailer -> lines channel -> registry -> bus.
    let event_log_dir = config.parser.log.then(|| config.parser_log_dir());
    let mut registry = ParserRegistry::spawn(Arc::clone(&bus), &catalog, &maps, event_log_dir);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (lines_tx, mut lines_rx) = mpsc::channel::<String>(1000);

    let tailer = LogTailer::open(TailerConfig::new(config.parser.log_path.clone()))
        .await
        .context("Failed to open game log")?;
    let tailer_task = tokio::spawn(tailer.run(lines_tx, shutdown_rx.clone()));

    let pump_task = tokio::spawn(async move {
        while let Some(line) = lines_rx.recv().await {
            registry.feed_line(&line);
        }
        registry.shutdown().await;
    });

    // Ctrl-C flips the same shutdown switch as POST /system/restart.
    let ctrl_c_shutdown = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            let _ = ctrl_c_shutdown.send(true);
        }
    });

    let state = AppState {
        db: Arc::clone(&db),
        bus: Arc::clone(&bus),
        broadcaster: Arc::clone(&broadcaster),
        shutdown: shutdown_tx.clone(),
    };
    let app = api::router(state);

    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr} - is the port already in use?"))?;
    info!("🎯 API server listening on {addr}");

    let mut serve_shutdown = shutdown_rx.clone();
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = serve_shutdown.changed().await;
        })
        .await;
    if let Err(e) = serve_result {
        error!("Server error: {e}");
    }

    // Best-effort ordered shutdown: stop the line source, drain the
    // pipeline, then the services (the active session survives on purpose).
    let _ = shutdown_tx.send(true);
    let _ = tailer_task.await;
    let _ = pump_task.await;
    container.shutdown().await;
    bus.clear();

    info!("👋 farmtrack stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.env_filter().into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
