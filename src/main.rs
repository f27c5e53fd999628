//! parlay server binary.

use clap::Parser;
use parlay::archive::RoundArchive;
use parlay::config::PlatformConfig;
use parlay::dispatch::Dispatcher;
use parlay::errors::GameResult;
use parlay::ledger::Ledger;
use parlay::rng::GameRng;
use parlay::rooms::Registry;
use parlay::scheduler::Scheduler;
use parlay::server::session::{Role, Sessions};
use parlay::server::{routes, shutdown_signal, AppState};
use parlay::wallet::Wallet;
use parlay::Services;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "parlay", version, about = "Authoritative multi-game session server")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the listen address.
    #[arg(long)]
    listen: Option<String>,
    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,
    /// Override the data directory.
    #[arg(long)]
    data_dir: Option<String>,
}

#[tokio::main]
async fn main() -> GameResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,parlay=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = PlatformConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.listen_address = listen;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(data_dir) = cli.data_dir {
        config.wallet.data_dir = data_dir;
    }

    let data_dir = Path::new(&config.wallet.data_dir);
    let ledger = Arc::new(Ledger::open(&data_dir.join("ledger.jsonl"))?);
    let wallet = Arc::new(Wallet::new(ledger));
    let recovered = wallet.recover_open_bets()?;
    if recovered > 0 {
        info!(recovered, "refunded open bets from a previous run");
    }
    let archive = Arc::new(
        RoundArchive::open(&data_dir.join("rounds.jsonl"))
            .map_err(parlay::errors::GameError::from)?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let services = Arc::new(Services {
        config: Arc::new(config.clone()),
        wallet,
        rng: Arc::new(GameRng::from_entropy()),
        archive,
        scheduler: Scheduler::new(shutdown_rx),
    });

    let registry = Registry::new(services.clone());
    registry.bootstrap();
    let dispatcher = Dispatcher::new(registry.clone(), services.clone());

    let sessions = Sessions::new();
    match std::env::var("PARLAY_ADMIN_PASSWORD") {
        Ok(password) => {
            sessions.register("admin", &password, Role::Admin)?;
            info!("admin account registered");
        }
        Err(_) => warn!("PARLAY_ADMIN_PASSWORD not set; admin endpoints are unavailable"),
    }

    let app = AppState::new(services.clone(), registry.clone(), dispatcher, sessions);
    let router = routes::router(app);

    let addr = format!("{}:{}", config.server.listen_address, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "parlay listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received, draining");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    // Drivers refund their own rooms on the shutdown flag; this pass covers
    // turn-card rooms and anything a driver did not reach. Settlement keys
    // make the overlap harmless.
    registry.shutdown_refunds().await;
    info!("parlay stopped");
    Ok(())
}
