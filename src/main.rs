//! StreamForge API Gateway binary
//!
//! Usage:
//!   streamforge-gateway --config gateway.toml --bind 0.0.0.0:8080
//!
//! Every setting can also come from the environment (see `GatewayConfig`).

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use streamforge_gateway::{
    auth::UserStore,
    build_router,
    config::{FailurePolicy, GatewayConfig, LogFormat, LoggingConfig, StoreBackend},
    server::identity_routes,
    store::{KeyValueStore, MemoryStore, SqliteStore, TimeoutStore},
    GatewayContext,
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "streamforge-gateway")]
#[command(about = "StreamForge API gateway: authentication and admission control")]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(long)]
    bind: Option<String>,

    /// Store backend (overrides config)
    #[arg(long, value_enum)]
    store: Option<StoreBackend>,

    /// Admit requests when the store is unreachable (overrides config)
    #[arg(long)]
    fail_open: bool,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    match logging.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}

fn apply_args(config: &mut GatewayConfig, args: &Args) {
    if let Some(bind) = &args.bind {
        config.server.bind_addr = bind.clone();
    }
    if let Some(backend) = args.store {
        config.store.backend = backend;
    }
    if args.fail_open {
        config.store.failure_policy = FailurePolicy::FailOpen;
    }
    if args.json_logs {
        config.logging.format = LogFormat::Json;
    }
}

fn open_store(config: &GatewayConfig) -> Result<Arc<dyn KeyValueStore>> {
    let backend: Arc<dyn KeyValueStore> = match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using the in-process store; limits and revocations are not shared across replicas");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Sqlite => Arc::new(
            SqliteStore::new(&config.store.sqlite_path).context("Failed to open key/value store")?,
        ),
    };
    Ok(Arc::new(TimeoutStore::new(
        backend,
        config.store.call_timeout(),
    )))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();

    let mut config = GatewayConfig::load(args.config.as_deref())?;
    apply_args(&mut config, &args);
    config.validate()?;

    init_tracing(&config.logging);
    info!(
        environment = %config.environment,
        store = ?config.store.backend,
        "StreamForge API gateway starting"
    );

    if config.store.failure_policy == FailurePolicy::FailOpen {
        warn!("Store failure policy is FAIL-OPEN: revocation and rate limiting are skipped while the store is unreachable");
    }
    if config.is_development() {
        warn!("Running in development mode; do not expose this instance");
    }

    let store = open_store(&config)?;

    let user_store = Arc::new(
        UserStore::new(&config.users.db_path, config.users.bcrypt_cost)
            .context("Failed to open user database")?,
    );
    info!("User database initialized at: {}", config.users.db_path);

    if let (Some(email), Some(password)) = (
        config.users.bootstrap_admin_email.as_deref(),
        config.users.bootstrap_admin_password.as_deref(),
    ) {
        user_store
            .ensure_admin(email, password)
            .context("Failed to create bootstrap administrator")?;
    }

    let bind_addr = config.server.bind_addr.clone();
    let ctx = GatewayContext::new(config, store, user_store)?;
    let app = build_router(&ctx, identity_routes(&ctx));

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;
    info!("API gateway listening on {}", bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    Ok(())
}
