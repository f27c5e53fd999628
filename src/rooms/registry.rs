//! Room registry: the two singleton house rooms plus player-created
//! turn-card rooms.

use crate::errors::{GameError, GameResult};
use crate::games::crash::CrashState;
use crate::games::pool_flip::PoolFlipState;
use crate::games::turn_card::{TurnCardState, TurnPhase};
use crate::ledger::bet_leg;
use crate::rooms::room::{GameState, Room, RoomHandle};
use crate::Services;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRASH_ROOM_ID: &str = "crash";
pub const POOL_FLIP_ROOM_ID: &str = "pool_flip";

pub struct Registry {
    rooms: DashMap<String, Arc<RoomHandle>>,
    services: Arc<Services>,
}

impl Registry {
    pub fn new(services: Arc<Services>) -> Arc<Self> {
        Arc::new(Self {
            rooms: DashMap::new(),
            services,
        })
    }

    /// Create the singleton house rooms and spawn their drivers.
    pub fn bootstrap(self: &Arc<Self>) {
        let crash = RoomHandle::new(Room::new(
            CRASH_ROOM_ID.to_string(),
            GameState::Crash(CrashState::new(
                CRASH_ROOM_ID.to_string(),
                self.services.config.crash.clone(),
            )),
        ));
        self.rooms.insert(CRASH_ROOM_ID.to_string(), crash.clone());
        tokio::spawn(crate::games::run_crash_driver(
            crash,
            self.services.clone(),
        ));

        let flip = RoomHandle::new(Room::new(
            POOL_FLIP_ROOM_ID.to_string(),
            GameState::PoolFlip(PoolFlipState::new(
                POOL_FLIP_ROOM_ID.to_string(),
                self.services.config.pool_flip.clone(),
            )),
        ));
        self.rooms.insert(POOL_FLIP_ROOM_ID.to_string(), flip.clone());
        tokio::spawn(crate::games::run_pool_flip_driver(
            flip,
            self.services.clone(),
        ));
        info!("house rooms bootstrapped");
    }

    pub fn get(&self, room_id: &str) -> GameResult<Arc<RoomHandle>> {
        self.rooms
            .get(room_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| GameError::RoomNotFound(room_id.to_string()))
    }

    /// Create a turn-card room. The host's entry debit happens before the
    /// room becomes visible, so a room never exists with an unpaid host.
    pub fn create_turn_card(
        self: &Arc<Self>,
        user_id: &str,
        username: &str,
        entry_amount: crate::money::Amount,
        max_seats: usize,
    ) -> GameResult<Arc<RoomHandle>> {
        let config = &self.services.config.turn_card;
        if !(2..=4).contains(&max_seats) {
            return Err(GameError::Validation("max_seats must be 2..=4".into()));
        }
        if entry_amount < config.min_entry || entry_amount > config.max_entry {
            return Err(GameError::Validation(format!(
                "entry must be between {} and {}",
                config.min_entry, config.max_entry
            )));
        }
        let room_id = format!("tc-{}", Uuid::new_v4());
        self.services.wallet.debit(
            user_id,
            entry_amount,
            &room_id,
            &bet_leg("entry"),
            "turn_card entry",
        )?;
        let state = TurnCardState::new(
            room_id.clone(),
            user_id.to_string(),
            username.to_string(),
            entry_amount,
            max_seats,
            config.clone(),
            self.services.rng.clone(),
        );
        let handle = RoomHandle::new(Room::new(room_id.clone(), GameState::TurnCard(state)));
        self.rooms.insert(room_id.clone(), handle.clone());
        info!(room_id = %room_id, host = %user_id, entry = %entry_amount, max_seats, "turn_card room created");
        Ok(handle)
    }

    /// Tear a finished or dead room down after its lingering grace, so late
    /// subscribers can still read the result. The check re-runs under the
    /// lock; a room that somehow revived is left alone.
    pub fn schedule_destruction(self: &Arc<Self>, room_id: &str, delay: Duration) {
        let registry = self.clone();
        let room_id = room_id.to_string();
        self.services
            .scheduler
            .schedule_after(delay, move || async move {
                let Ok(handle) = registry.get(&room_id) else {
                    return;
                };
                let removable = {
                    let room = handle.state.lock().await;
                    room.dead
                        || matches!(
                            &room.game,
                            GameState::TurnCard(s) if matches!(s.phase, TurnPhase::Finished { .. })
                        )
                };
                if removable {
                    registry.rooms.remove(&room_id);
                    info!(room_id = %room_id, "room destroyed");
                }
            });
    }

    pub fn remove(&self, room_id: &str) {
        self.rooms.remove(room_id);
    }

    pub async fn list(&self) -> Vec<Value> {
        let handles: Vec<Arc<RoomHandle>> =
            self.rooms.iter().map(|entry| entry.clone()).collect();
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            let room = handle.state.lock().await;
            let view = room.game.public_view();
            summaries.push(json!({
                "room_id": handle.id,
                "game_kind": handle.kind,
                "version": room.version,
                "phase": view.get("phase").cloned().unwrap_or(Value::Null),
                "subscribers": handle.subscriber_count(),
            }));
        }
        summaries
    }

    /// Shutdown pass: refund every open bet in every room. Settlement keys
    /// make a second pass (or a racing driver refund) harmless.
    pub async fn shutdown_refunds(&self) {
        let handles: Vec<Arc<RoomHandle>> =
            self.rooms.iter().map(|entry| entry.clone()).collect();
        for handle in handles {
            let mut room = handle.state.lock().await;
            let result = match &mut room.game {
                GameState::Crash(s) => s.refund_open(&self.services.wallet, "server shutting down"),
                GameState::PoolFlip(s) => {
                    s.refund_open(&self.services.wallet, "server shutting down")
                }
                GameState::TurnCard(s) => match s.phase {
                    TurnPhase::Finished { .. } => continue,
                    _ => s.refund_all_entries(&self.services.wallet, "server shutting down"),
                },
            };
            match result {
                Ok(fanout) => handle.emit(&mut room, fanout),
                Err(e) => warn!(room_id = %handle.id, error = %e, "shutdown refund failed"),
            }
        }
        info!("shutdown refunds complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Amount;
    use crate::test_services;

    #[tokio::test]
    async fn test_create_turn_card_debits_host() {
        let services = test_services();
        let registry = Registry::new(services.clone());
        services
            .wallet
            .grant_bonus("host", Amount::from_units(100))
            .unwrap();
        let handle = registry
            .create_turn_card("host", "host", Amount::from_units(50), 4)
            .unwrap();
        assert_eq!(services.wallet.balance("host"), Amount::from_units(50));
        let room = handle.state.lock().await;
        assert!(room.game.is_participant("host"));
    }

    #[tokio::test]
    async fn test_create_rejects_bad_seats_and_entry() {
        let services = test_services();
        let registry = Registry::new(services.clone());
        services
            .wallet
            .grant_bonus("host", Amount::from_units(100))
            .unwrap();
        assert!(registry
            .create_turn_card("host", "host", Amount::from_units(50), 5)
            .is_err());
        assert!(registry
            .create_turn_card("host", "host", Amount::from_cents(1), 3)
            .is_err());
        // Failed creations leave the balance alone.
        assert_eq!(services.wallet.balance("host"), Amount::from_units(100));
    }

    #[tokio::test]
    async fn test_insufficient_host_funds_leaves_no_room() {
        let services = test_services();
        let registry = Registry::new(services.clone());
        services
            .wallet
            .grant_bonus("host", Amount::from_units(10))
            .unwrap();
        assert!(registry
            .create_turn_card("host", "host", Amount::from_units(50), 3)
            .is_err());
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_refunds_waiting_room() {
        let services = test_services();
        let registry = Registry::new(services.clone());
        services
            .wallet
            .grant_bonus("host", Amount::from_units(100))
            .unwrap();
        registry
            .create_turn_card("host", "host", Amount::from_units(50), 3)
            .unwrap();
        registry.shutdown_refunds().await;
        assert_eq!(services.wallet.balance("host"), Amount::from_units(100));
    }
}
