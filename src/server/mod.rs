//! HTTP and WebSocket surface.

pub mod gateway;
pub mod routes;
pub mod session;

use crate::dispatch::Dispatcher;
use crate::rooms::Registry;
use crate::Services;
use chrono::{DateTime, Utc};
use session::Sessions;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
    pub registry: Arc<Registry>,
    pub dispatcher: Arc<Dispatcher>,
    pub sessions: Arc<Sessions>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        services: Arc<Services>,
        registry: Arc<Registry>,
        dispatcher: Arc<Dispatcher>,
        sessions: Arc<Sessions>,
    ) -> Self {
        Self {
            services,
            registry,
            dispatcher,
            sessions,
            started_at: Utc::now(),
        }
    }
}

/// Resolves when SIGINT or SIGTERM arrives.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
