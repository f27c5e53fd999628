//! Command dispatch: one validated mutation per room lock hold.
//!
//! The gateway hands every parsed client op to the dispatcher, which locks
//! the target room, runs the engine mutation, emits the fan-out and arms any
//! follow-up timer. Validation failures leave the room untouched and bounce
//! back to the sender only.

use crate::archive::{ArchivedRound, ArchivedWinner};
use crate::errors::{GameError, GameResult};
use crate::games::turn_card::TurnPhase;
use crate::protocol::{ClientOp, Fanout, ServerMessage};
use crate::rooms::{GameState, Registry, Room, RoomHandle};
use crate::Services;
use chrono::Utc;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::warn;

pub enum DispatchOutcome {
    None,
    /// A freshly created room the gateway should auto-subscribe to.
    RoomCreated(Arc<RoomHandle>),
}

impl std::fmt::Debug for DispatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchOutcome::None => write!(f, "None"),
            DispatchOutcome::RoomCreated(handle) => {
                f.debug_tuple("RoomCreated").field(&handle.id).finish()
            }
        }
    }
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    services: Arc<Services>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, services: Arc<Services>) -> Arc<Self> {
        Arc::new(Self { registry, services })
    }

    pub async fn dispatch(
        self: &Arc<Self>,
        user_id: &str,
        username: &str,
        room_id: Option<&str>,
        op: ClientOp,
    ) -> GameResult<DispatchOutcome> {
        if let ClientOp::CreateRoom {
            entry_amount,
            max_seats,
        } = op
        {
            let handle =
                self.registry
                    .create_turn_card(user_id, username, entry_amount, max_seats)?;
            {
                let mut room = handle.state.lock().await;
                let balance = self.services.wallet.balance(user_id);
                let fanout = Fanout::new()
                    .public(ServerMessage::RoomState(room.game.public_view()))
                    .private(user_id, ServerMessage::Wallet { balance });
                handle.emit(&mut room, fanout);
            }
            return Ok(DispatchOutcome::RoomCreated(handle));
        }

        let room_id =
            room_id.ok_or_else(|| GameError::Validation("room_id is required".into()))?;
        let handle = self.registry.get(room_id)?;
        let mut room = handle.state.lock().await;
        room.ensure_alive()?;

        let wallet = &self.services.wallet;
        let result = match &mut room.game {
            GameState::Crash(state) => match op {
                ClientOp::PlaceBet {
                    amount,
                    slot,
                    auto_cashout,
                    ..
                } => {
                    let slot =
                        slot.ok_or_else(|| GameError::Validation("slot is required".into()))?;
                    state.place_bet(user_id, amount, slot, auto_cashout, wallet)
                }
                ClientOp::CashOut { slot } => state.cash_out(user_id, slot, wallet),
                _ => Err(GameError::Validation(
                    "op not supported in a crash room".into(),
                )),
            },
            GameState::PoolFlip(state) => match op {
                ClientOp::PlaceBet { amount, side, .. } => {
                    let side =
                        side.ok_or_else(|| GameError::Validation("side is required".into()))?;
                    state.place_bet(user_id, amount, side, wallet)
                }
                _ => Err(GameError::Validation(
                    "op not supported in a pool_flip room".into(),
                )),
            },
            GameState::TurnCard(state) => match op {
                ClientOp::Join => state.join(user_id, username, wallet),
                ClientOp::Leave => state.leave(user_id, wallet),
                ClientOp::Delete => state.delete(user_id, wallet),
                ClientOp::ToggleReady => state.toggle_ready(user_id),
                ClientOp::Start => state.start(user_id),
                ClientOp::PlayCard {
                    card_index,
                    wild_color,
                } => state.play_card(user_id, card_index, wild_color, wallet),
                ClientOp::DrawCard {
                    play_if_legal,
                    wild_color,
                } => state.draw_card(user_id, play_if_legal, wild_color, wallet),
                ClientOp::CallUno => state.call_uno(user_id),
                _ => Err(GameError::Validation(
                    "op not supported in a turn_card room".into(),
                )),
            },
        };

        match result {
            Ok(fanout) => {
                room.record_success();
                handle.emit(&mut room, fanout);
                self.after_mutation(&handle, &mut room);
                Ok(DispatchOutcome::None)
            }
            Err(e) => {
                if matches!(e, GameError::Internal(_)) && room.record_failure() {
                    self.abort_dead_room(&handle, &mut room);
                }
                Err(e)
            }
        }
    }

    /// Presence change from the gateway: a participant's last subscription
    /// to a turn-card room appeared or disappeared.
    pub async fn presence(self: &Arc<Self>, user_id: &str, room_id: &str, connected: bool) {
        let Ok(handle) = self.registry.get(room_id) else {
            return;
        };
        let mut room = handle.state.lock().await;
        let GameState::TurnCard(state) = &mut room.game else {
            return;
        };
        let fanout = if connected {
            state.handle_reconnect(user_id)
        } else {
            state.handle_disconnect(user_id)
        };
        if let Some(fanout) = fanout {
            handle.emit(&mut room, fanout);
            self.after_mutation(&handle, &mut room);
        }
    }

    /// Post-mutation bookkeeping for turn-card rooms: archive and schedule
    /// destruction when the round just finished, otherwise keep the turn
    /// timer armed.
    fn after_mutation(self: &Arc<Self>, handle: &Arc<RoomHandle>, room: &mut Room) {
        let GameState::TurnCard(state) = &room.game else {
            return;
        };
        match &state.phase {
            TurnPhase::Finished { winner } => {
                if winner.is_some() {
                    let (winners, house_take) = state.round_summary();
                    self.services.archive.record(ArchivedRound {
                        round_id: state.room_id.clone(),
                        room_id: state.room_id.clone(),
                        game_kind: "turn_card".to_string(),
                        finished_at: Utc::now(),
                        final_state: state.public_view(),
                        winners: winners
                            .into_iter()
                            .map(|(user_id, payout)| ArchivedWinner { user_id, payout })
                            .collect(),
                        house_take,
                    });
                }
                self.registry.schedule_destruction(
                    &handle.id,
                    Duration::from_secs(self.services.config.turn_card.finished_grace_secs),
                );
            }
            TurnPhase::Playing => {
                if let Some(deadline) = state.turn_deadline {
                    self.arm_turn_timer(handle.clone(), deadline);
                }
            }
            TurnPhase::Waiting => {}
        }
    }

    /// One-shot turn timer. The deadline is the guard: if the room's
    /// deadline moved on by the time this fires, a newer timer owns the turn
    /// and this one does nothing.
    fn arm_turn_timer(self: &Arc<Self>, handle: Arc<RoomHandle>, deadline: Instant) {
        let dispatcher = self.clone();
        self.services.scheduler.schedule_at(deadline, move || async move {
            let mut room = handle.state.lock().await;
            let GameState::TurnCard(state) = &mut room.game else {
                return;
            };
            if state.turn_deadline != Some(deadline) {
                return;
            }
            match state.handle_turn_timeout() {
                Ok(fanout) => {
                    handle.emit(&mut room, fanout);
                    dispatcher.after_mutation(&handle, &mut room);
                }
                Err(e) => {
                    warn!(room_id = %handle.id, error = %e, "turn timeout handling failed");
                    room.record_failure();
                }
            }
        });
    }

    /// A room just hit the failure limit: push everyone's money back and
    /// tear it down.
    fn abort_dead_room(self: &Arc<Self>, handle: &Arc<RoomHandle>, room: &mut Room) {
        if let GameState::TurnCard(state) = &mut room.game {
            if !matches!(state.phase, TurnPhase::Finished { .. }) {
                match state.refund_all_entries(&self.services.wallet, "room aborted") {
                    Ok(fanout) => handle.emit(room, fanout),
                    Err(e) => {
                        warn!(room_id = %handle.id, error = %e, "abort refund failed")
                    }
                }
            }
        }
        self.registry
            .schedule_destruction(&handle.id, Duration::from_secs(1));
    }
}
