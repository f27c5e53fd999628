//! A room: one game instance behind one async mutex.
//!
//! Every mutation of a room happens under its lock; the handle stamps the
//! room's monotonic version onto the resulting fan-out and pushes it onto the
//! room's broadcast channel. `broadcast::Sender::send` never blocks, so
//! emitting under the lock keeps per-subscriber version order without
//! coupling command latency to slow clients (laggards are dropped by the
//! channel, not waited on).

use crate::errors::{GameError, GameResult};
use crate::games::crash::CrashState;
use crate::games::pool_flip::PoolFlipState;
use crate::games::turn_card::TurnCardState;
use crate::protocol::{Fanout, GameKind, RoomEvent, ServerMessage};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::error;

/// Fan-out frames buffered per room before lagging subscribers drop.
const EVENT_CHANNEL_CAPACITY: usize = 512;

/// Consecutive internal failures before a room is poisoned.
const FAILURE_LIMIT: u32 = 3;

pub enum GameState {
    Crash(CrashState),
    TurnCard(TurnCardState),
    PoolFlip(PoolFlipState),
}

impl GameState {
    pub fn kind(&self) -> GameKind {
        match self {
            GameState::Crash(_) => GameKind::Crash,
            GameState::TurnCard(_) => GameKind::TurnCard,
            GameState::PoolFlip(_) => GameKind::PoolFlip,
        }
    }

    pub fn public_view(&self) -> Value {
        match self {
            GameState::Crash(s) => s.public_view(),
            GameState::TurnCard(s) => s.public_view(),
            GameState::PoolFlip(s) => s.public_view(),
        }
    }

    /// The recipient's private overlay, if they are a participant with one.
    pub fn private_view(&self, user_id: &str) -> Option<ServerMessage> {
        match self {
            GameState::TurnCard(s) => s.private_view(user_id),
            GameState::Crash(_) | GameState::PoolFlip(_) => None,
        }
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        match self {
            GameState::Crash(s) => s.is_participant(user_id),
            GameState::TurnCard(s) => s.is_participant(user_id),
            GameState::PoolFlip(s) => s.is_participant(user_id),
        }
    }
}

pub struct Room {
    pub id: String,
    pub version: u64,
    pub game: GameState,
    /// Consecutive internal errors; at the limit the room goes dead.
    failures: u32,
    pub dead: bool,
}

impl Room {
    pub fn new(id: String, game: GameState) -> Self {
        Self {
            id,
            version: 0,
            game,
            failures: 0,
            dead: false,
        }
    }

    pub fn crash_mut(&mut self) -> GameResult<&mut CrashState> {
        match &mut self.game {
            GameState::Crash(s) => Ok(s),
            _ => Err(GameError::Validation("not a crash room".into())),
        }
    }

    pub fn turn_card_mut(&mut self) -> GameResult<&mut TurnCardState> {
        match &mut self.game {
            GameState::TurnCard(s) => Ok(s),
            _ => Err(GameError::Validation("not a turn_card room".into())),
        }
    }

    pub fn pool_flip_mut(&mut self) -> GameResult<&mut PoolFlipState> {
        match &mut self.game {
            GameState::PoolFlip(s) => Ok(s),
            _ => Err(GameError::Validation("not a pool_flip room".into())),
        }
    }

    pub fn ensure_alive(&self) -> GameResult<()> {
        if self.dead {
            return Err(GameError::PhaseNotOpen("room is out of service".into()));
        }
        Ok(())
    }

    /// Track an internal failure against the poison limit. Returns `true`
    /// when the room just died.
    pub fn record_failure(&mut self) -> bool {
        self.failures += 1;
        if self.failures >= FAILURE_LIMIT && !self.dead {
            self.dead = true;
            error!(room_id = %self.id, failures = self.failures, "room poisoned after repeated internal errors");
            return true;
        }
        false
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    /// Snapshot sent to a fresh subscriber: the public view plus, for
    /// participants, their private overlay.
    pub fn snapshot_for(&self, user_id: &str) -> Vec<ServerMessage> {
        let mut messages = vec![ServerMessage::RoomState(self.game.public_view())];
        if let Some(private) = self.game.private_view(user_id) {
            messages.push(private);
        }
        messages
    }
}

pub struct RoomHandle {
    pub id: String,
    pub kind: GameKind,
    pub state: Mutex<Room>,
    events: broadcast::Sender<RoomEvent>,
}

impl RoomHandle {
    pub fn new(room: Room) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            id: room.id.clone(),
            kind: room.game.kind(),
            state: Mutex::new(room),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Bump the room version and broadcast one mutation's fan-out. Called
    /// with the room lock held so versions leave in order.
    pub fn emit(&self, room: &mut Room, fanout: Fanout) {
        if fanout.is_empty() {
            return;
        }
        room.version += 1;
        // A send error just means no subscribers right now.
        let _ = self.events.send(RoomEvent {
            room_id: self.id.clone(),
            version: room.version,
            public: fanout.public,
            private: fanout.private,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolFlipConfig;

    fn flip_room() -> Room {
        Room::new(
            "pool_flip".into(),
            GameState::PoolFlip(PoolFlipState::new(
                "pool_flip".into(),
                PoolFlipConfig::default(),
            )),
        )
    }

    #[tokio::test]
    async fn test_emit_bumps_version_in_order() {
        let handle = RoomHandle::new(flip_room());
        let mut rx = handle.subscribe();
        {
            let mut room = handle.state.lock().await;
            let f1 = room.pool_flip_mut().unwrap().begin_betting();
            handle.emit(&mut room, f1);
            let f2 = room.pool_flip_mut().unwrap().begin_flip(
                crate::games::pool_flip::FlipSide::Heads,
            );
            handle.emit(&mut room, f2);
        }
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
    }

    #[tokio::test]
    async fn test_empty_fanout_does_not_bump() {
        let handle = RoomHandle::new(flip_room());
        let mut room = handle.state.lock().await;
        handle.emit(&mut room, Fanout::new());
        assert_eq!(room.version, 0);
    }

    #[tokio::test]
    async fn test_failure_limit_poisons_room() {
        let handle = RoomHandle::new(flip_room());
        let mut room = handle.state.lock().await;
        assert!(!room.record_failure());
        assert!(!room.record_failure());
        assert!(room.record_failure());
        assert!(room.ensure_alive().is_err());
    }
}
