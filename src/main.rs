use clap::Parser;
use dotenvy::dotenv;
use stashbin::config::Config;
use stashbin::infrastructure::{database, paths::Paths};
use stashbin::services::cdn::CdnPurger;
use stashbin::services::chunks::ChunkCoordinator;
use stashbin::services::deleter::BulkDeleter;
use stashbin::services::idstore::IdStore;
use stashbin::services::ingest::IngestEngine;
use stashbin::services::retention::RetentionPolicy;
use stashbin::services::scanner;
use stashbin::services::stats::StatsService;
use stashbin::services::sweeper::RetentionSweeper;
use stashbin::services::zipper::AlbumZipper;
use stashbin::utils::datastore::Caches;
use stashbin::utils::ratelimit::AuthRateLimiter;
use stashbin::{AppState, create_app};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port for the HTTP server; overrides PORT from the environment
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stashbin=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::from_env();
    if let Some(port) = args.port {
        config.port = port;
    }
    let config = Arc::new(config);

    info!(
        "Starting stashbin v{} (private: {}, max size: {} MiB)",
        env!("CARGO_PKG_VERSION"),
        config.private,
        config.max_size / 1024 / 1024
    );

    let db = database::setup_database(&config.database_url).await?;

    let paths = Arc::new(Paths::new(&config.uploads_root));
    paths.init().await?;

    let scanner_service = scanner::create_scanner(&config);
    if config.scan_enabled {
        if scanner_service.health_check().await {
            info!(
                "Virus scanner connected at {}:{}",
                config.clamav_host, config.clamav_port
            );
        } else {
            warn!(
                "Virus scanner at {}:{} is not responding; uploads will fail while it is down",
                config.clamav_host, config.clamav_port
            );
        }
    }

    let caches = Caches::new();
    let stats = StatsService::new();
    let ids = IdStore::new(config.id_max_tries);
    let retention = Arc::new(RetentionPolicy::from_config(&config));
    let cdn = CdnPurger::new(Arc::clone(&config));
    let chunks = ChunkCoordinator::new(Arc::clone(&paths), Arc::clone(&config));
    let deleter = BulkDeleter::new(
        db.clone(),
        Arc::clone(&config),
        Arc::clone(&paths),
        Arc::clone(&caches),
        Arc::clone(&cdn),
        Arc::clone(&stats),
    );
    let writer = stashbin::services::dbwriter::DbWriter::new(
        db.clone(),
        Arc::clone(&config),
        Arc::clone(&paths),
        Arc::clone(&caches),
        Arc::clone(&stats),
    );
    let ingest = IngestEngine::new(
        db.clone(),
        Arc::clone(&config),
        Arc::clone(&paths),
        Arc::clone(&ids),
        Arc::clone(&chunks),
        scanner_service,
        Arc::clone(&retention),
        writer,
    )?;
    let zipper = AlbumZipper::new(db.clone(), Arc::clone(&config), Arc::clone(&paths));

    // Background maintenance: expired uploads and idle chunk sessions.
    let sweeper = RetentionSweeper::new(db.clone(), Arc::clone(&deleter), config.sweep_interval_secs);
    let _sweeper_task = sweeper.spawn();
    let _reaper_task = chunks.spawn_reaper();

    let state = AppState {
        db,
        config: Arc::clone(&config),
        paths,
        ids,
        chunks,
        ingest,
        deleter,
        zipper,
        retention,
        caches,
        stats,
        auth_limiter: Arc::new(AuthRateLimiter::new()),
    };

    let app = create_app(state).layer(TraceLayer::new_for_http());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server exited cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl+C received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
}
