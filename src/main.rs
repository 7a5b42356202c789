//! AlphaVest backend service.
//!
//! Wires the position lifecycle engine to SQLite, spawns the accrual sweep,
//! and serves the HTTP API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use alphavest_backend::{
    api::create_router,
    audit::AuditNotifier,
    catalog::SqliteCatalog,
    models::Config,
    positions::{spawn_accrual_sweep, PositionLedger},
    store::Db,
    wallet::WalletStore,
};

#[derive(Parser, Debug)]
#[command(name = "alphavest", about = "Position lifecycle engine service")]
struct Cli {
    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH")]
    db: Option<String>,

    /// HTTP listen port
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Accrual sweep period in seconds
    #[arg(long)]
    sweep_interval: Option<u64>,

    /// Disable the eager accrual sweep (lazy recompute-on-read only)
    #[arg(long)]
    no_sweep: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(secs) = cli.sweep_interval {
        config.sweep_interval_secs = secs;
    }
    if cli.no_sweep {
        config.sweep_enabled = false;
    }

    let db = Db::new(&config.database_path).context("open database")?;
    let catalog = SqliteCatalog::new(db.clone());
    if config.seed_demo_catalog {
        catalog.seed_demo().await?;
        info!("demo catalog seeded");
    }

    let notifier = AuditNotifier::default();
    let ledger = Arc::new(PositionLedger::new(
        db.clone(),
        Arc::new(catalog),
        notifier.clone(),
    ));
    let wallets = Arc::new(WalletStore::new(db));

    if config.sweep_enabled {
        let period = Duration::from_secs(config.sweep_interval_secs.max(1));
        spawn_accrual_sweep(ledger.clone(), period);
        info!(period_secs = config.sweep_interval_secs, "accrual sweep running");
    } else {
        info!("accrual sweep disabled; relying on lazy recompute");
    }

    let app = create_router(ledger, wallets)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    info!(%addr, "alphavest backend listening");

    axum::serve(listener, app).await.context("serve http")?;
    Ok(())
}
