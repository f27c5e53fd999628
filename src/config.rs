//! Configuration for the session server.
//!
//! Loads from a TOML file, applies `PARLAY_*` environment overrides, then
//! validates. Defaults match the documented game timings and house edges.

use crate::errors::{GameError, GameResult};
use crate::money::Amount;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PlatformConfig {
    pub server: ServerConfig,
    pub wallet: WalletConfig,
    pub crash: CrashConfig,
    pub turn_card: TurnCardConfig,
    pub pool_flip: PoolFlipConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_address: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub request_timeout_secs: u64,
    /// Outbound frames buffered per connection before the client is dropped.
    pub outbound_queue_bound: usize,
    /// Per-connection command budget per one-second window.
    pub commands_per_second: u32,
    pub heartbeat_secs: u64,
    /// Grace given to running rounds on shutdown before open bets refund.
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            port: 8090,
            allowed_origins: vec!["*".to_string()],
            request_timeout_secs: 30,
            outbound_queue_bound: 256,
            commands_per_second: 20,
            heartbeat_secs: 30,
            shutdown_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Directory holding the ledger and round archive files.
    pub data_dir: String,
    /// Balance granted to new users as a `bonus_grant`.
    pub starting_balance: Amount,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            data_dir: "./parlay_data".to_string(),
            starting_balance: Amount::from_units(1_000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashConfig {
    pub bet_window_ms: u64,
    pub cooldown_ms: u64,
    pub tick_interval_ms: u64,
    /// Growth constant k in m(t) = exp(k * t), t in seconds.
    pub growth_k: f64,
    /// House edge in basis points (300 = 3%).
    pub edge_bps: u32,
    pub min_bet: Amount,
    pub max_bet: Amount,
    pub history_len: usize,
}

impl Default for CrashConfig {
    fn default() -> Self {
        Self {
            bet_window_ms: 5_000,
            cooldown_ms: 3_000,
            tick_interval_ms: 100,
            growth_k: 0.08,
            edge_bps: 300,
            min_bet: Amount::from_cents(10),
            max_bet: Amount::from_units(10_000),
            history_len: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnCardConfig {
    pub turn_secs: u64,
    pub reach_grace_secs: u64,
    pub reconnect_grace_secs: u64,
    /// How long a finished or deleted room lingers before destruction.
    pub finished_grace_secs: u64,
    pub hand_size: usize,
    pub edge_bps: u32,
    pub min_entry: Amount,
    pub max_entry: Amount,
}

impl Default for TurnCardConfig {
    fn default() -> Self {
        Self {
            turn_secs: 15,
            reach_grace_secs: 5,
            reconnect_grace_secs: 30,
            finished_grace_secs: 30,
            hand_size: 7,
            edge_bps: 0,
            min_entry: Amount::from_cents(100),
            max_entry: Amount::from_units(10_000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolFlipConfig {
    pub bet_window_ms: u64,
    pub flip_ms: u64,
    pub cooldown_ms: u64,
    pub edge_bps: u32,
    pub min_bet: Amount,
    pub max_bet: Amount,
    pub history_len: usize,
}

impl Default for PoolFlipConfig {
    fn default() -> Self {
        Self {
            bet_window_ms: 5_000,
            flip_ms: 3_000,
            cooldown_ms: 3_000,
            edge_bps: 200,
            min_bet: Amount::from_cents(10),
            max_bet: Amount::from_units(10_000),
            history_len: 20,
        }
    }
}

impl PlatformConfig {
    /// Load from an optional TOML file, then env overrides, then validate.
    pub fn load(path: Option<&Path>) -> GameResult<Self> {
        let mut config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p).map_err(|e| {
                    GameError::Internal(format!("failed to read {}: {}", p.display(), e))
                })?;
                toml::from_str(&content)
                    .map_err(|e| GameError::Internal(format!("failed to parse config: {}", e)))?
            }
            None => PlatformConfig::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> GameResult<()> {
        if let Ok(addr) = env::var("PARLAY_LISTEN_ADDRESS") {
            self.server.listen_address = addr;
        }
        if let Ok(port) = env::var("PARLAY_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| GameError::Internal(format!("invalid PARLAY_PORT: {}", port)))?;
        }
        if let Ok(dir) = env::var("PARLAY_DATA_DIR") {
            self.wallet.data_dir = dir;
        }
        if let Ok(balance) = env::var("PARLAY_STARTING_BALANCE") {
            let value: f64 = balance.parse().map_err(|_| {
                GameError::Internal(format!("invalid PARLAY_STARTING_BALANCE: {}", balance))
            })?;
            self.wallet.starting_balance = Amount::from_decimal(value)
                .ok_or_else(|| GameError::Internal("starting balance out of range".into()))?;
        }
        Ok(())
    }

    /// Reject configurations that break game invariants.
    pub fn validate(&self) -> GameResult<()> {
        if self.crash.tick_interval_ms == 0 || self.crash.tick_interval_ms > 100 {
            return Err(GameError::Internal(
                "crash.tick_interval_ms must be 1..=100 (ticks at >=10 Hz)".into(),
            ));
        }
        if self.crash.growth_k <= 0.0 || self.crash.growth_k > 1.0 {
            return Err(GameError::Internal("crash.growth_k must be in (0, 1]".into()));
        }
        for (name, edge) in [
            ("crash", self.crash.edge_bps),
            ("turn_card", self.turn_card.edge_bps),
            ("pool_flip", self.pool_flip.edge_bps),
        ] {
            if edge >= 10_000 {
                return Err(GameError::Internal(format!(
                    "{}.edge_bps must be below 10000",
                    name
                )));
            }
        }
        if self.turn_card.turn_secs == 0 {
            return Err(GameError::Internal("turn_card.turn_secs must be nonzero".into()));
        }
        if self.turn_card.min_entry > self.turn_card.max_entry
            || self.crash.min_bet > self.crash.max_bet
            || self.pool_flip.min_bet > self.pool_flip.max_bet
        {
            return Err(GameError::Internal("min bet/entry exceeds max".into()));
        }
        if self.server.outbound_queue_bound == 0 {
            return Err(GameError::Internal(
                "server.outbound_queue_bound must be nonzero".into(),
            ));
        }
        Ok(())
    }

    pub fn crash_tick_interval(&self) -> Duration {
        Duration::from_millis(self.crash.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = PlatformConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.crash.edge_bps, 300);
        assert_eq!(config.turn_card.edge_bps, 0);
        assert_eq!(config.pool_flip.edge_bps, 200);
    }

    #[test]
    fn test_tick_rate_floor() {
        let mut config = PlatformConfig::default();
        config.crash.tick_interval_ms = 250; // 4 Hz is too coarse
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_partial_override() {
        let config: PlatformConfig = toml::from_str(
            r#"
            [crash]
            edge_bps = 100

            [server]
            port = 9000
            "#,
        )
        .unwrap();
        assert_eq!(config.crash.edge_bps, 100);
        assert_eq!(config.server.port, 9000);
        // Untouched sections keep defaults.
        assert_eq!(config.turn_card.turn_secs, 15);
    }
}
