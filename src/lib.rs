//! Authoritative multi-game session server.
//!
//! Clients connect over WebSocket, hold a wallet balance and play in rooms:
//! a shared crash room, a shared pool-flip room and player-created turn-card
//! rooms. All game state lives on the server; clients only submit intents
//! and render the views they are sent.

pub mod archive;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod games;
pub mod ledger;
pub mod money;
pub mod protocol;
pub mod rng;
pub mod rooms;
pub mod scheduler;
pub mod server;
pub mod wallet;

use std::sync::Arc;

pub type UserId = String;

/// Shared service stack handed to every component.
pub struct Services {
    pub config: Arc<config::PlatformConfig>,
    pub wallet: Arc<wallet::Wallet>,
    pub rng: Arc<rng::GameRng>,
    pub archive: Arc<archive::RoundArchive>,
    pub scheduler: scheduler::Scheduler,
}

/// In-memory service stack for tests: no files, fixed seed, detached
/// shutdown.
pub fn test_services() -> Arc<Services> {
    Arc::new(Services {
        config: Arc::new(config::PlatformConfig::default()),
        wallet: Arc::new(wallet::Wallet::new(Arc::new(ledger::Ledger::in_memory()))),
        rng: Arc::new(rng::GameRng::seeded(7)),
        archive: Arc::new(archive::RoundArchive::in_memory()),
        scheduler: scheduler::Scheduler::detached(),
    })
}
