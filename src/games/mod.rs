//! Game engines and the driver loops for the self-running house rooms.
//!
//! The engines are synchronous state machines; the drivers here own the
//! clock. Each driver sleeps through the scheduler so a shutdown flag wakes
//! it mid-phase, refunds whatever is still open and winds down.

pub mod crash;
pub mod pool_flip;
pub mod turn_card;

use crate::archive::{ArchivedRound, ArchivedWinner};
use crate::money::Amount;
use crate::rooms::{GameState, RoomHandle};
use crate::Services;
use crate::UserId;
use chrono::Utc;
use pool_flip::FlipSide;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, warn};

fn archive_round(
    services: &Services,
    room_id: &str,
    round_id: &str,
    game_kind: &str,
    final_state: serde_json::Value,
    winners: Vec<(UserId, Amount)>,
    house_take: Amount,
) {
    services.archive.record(ArchivedRound {
        round_id: round_id.to_string(),
        room_id: room_id.to_string(),
        game_kind: game_kind.to_string(),
        finished_at: Utc::now(),
        final_state,
        winners: winners
            .into_iter()
            .map(|(user_id, payout)| ArchivedWinner { user_id, payout })
            .collect(),
        house_take,
    });
}

/// Crash room driver: waiting -> flying -> crashed -> cooldown, forever.
pub async fn run_crash_driver(handle: Arc<RoomHandle>, services: Arc<Services>) {
    let config = services.config.crash.clone();
    let scheduler = services.scheduler.clone();
    'rounds: loop {
        {
            let mut room = handle.state.lock().await;
            let GameState::Crash(state) = &mut room.game else {
                return;
            };
            let fanout = state.begin_waiting();
            handle.emit(&mut room, fanout);
        }
        if !scheduler.sleep(Duration::from_millis(config.bet_window_ms)).await {
            break;
        }
        {
            let mut room = handle.state.lock().await;
            let GameState::Crash(state) = &mut room.game else {
                return;
            };
            let (seed, crash_point) = services.rng.crash_point(config.edge_bps);
            let fanout = state.begin_flight(seed, crash_point);
            handle.emit(&mut room, fanout);
        }
        loop {
            if !scheduler.sleep(services.config.crash_tick_interval()).await {
                break 'rounds;
            }
            let mut room = handle.state.lock().await;
            let GameState::Crash(state) = &mut room.game else {
                return;
            };
            match state.tick(&services.wallet) {
                Ok((fanout, crashed)) => {
                    if crashed {
                        let (winners, house_take) = state.round_summary();
                        archive_round(
                            &services,
                            &handle.id,
                            &state.round_id,
                            "crash",
                            state.public_view(),
                            winners,
                            house_take,
                        );
                    }
                    handle.emit(&mut room, fanout);
                    if crashed {
                        break;
                    }
                }
                Err(e) => {
                    warn!(room_id = %handle.id, error = %e, "crash tick failed");
                    room.record_failure();
                }
            }
        }
        if !scheduler.sleep(Duration::from_millis(config.cooldown_ms)).await {
            break;
        }
    }
    // Shutdown: whatever is still open refunds. Settlement keys make this
    // safe against the boot-time recovery pass re-running it.
    let mut room = handle.state.lock().await;
    if let GameState::Crash(state) = &mut room.game {
        match state.refund_open(&services.wallet, "server shutting down") {
            Ok(fanout) => handle.emit(&mut room, fanout),
            Err(e) => warn!(room_id = %handle.id, error = %e, "crash shutdown refund failed"),
        }
    }
    info!(room_id = %handle.id, "crash driver stopped");
}

/// Pool-flip room driver: betting -> flipping -> result -> cooldown.
pub async fn run_pool_flip_driver(handle: Arc<RoomHandle>, services: Arc<Services>) {
    let config = services.config.pool_flip.clone();
    let scheduler = services.scheduler.clone();
    loop {
        {
            let mut room = handle.state.lock().await;
            let GameState::PoolFlip(state) = &mut room.game else {
                return;
            };
            let fanout = state.begin_betting();
            handle.emit(&mut room, fanout);
        }
        if !scheduler.sleep(Duration::from_millis(config.bet_window_ms)).await {
            break;
        }
        {
            let mut room = handle.state.lock().await;
            let GameState::PoolFlip(state) = &mut room.game else {
                return;
            };
            let outcome = if services.rng.flip() {
                FlipSide::Heads
            } else {
                FlipSide::Tails
            };
            let fanout = state.begin_flip(outcome);
            handle.emit(&mut room, fanout);
        }
        if !scheduler.sleep(Duration::from_millis(config.flip_ms)).await {
            break;
        }
        {
            let mut room = handle.state.lock().await;
            let GameState::PoolFlip(state) = &mut room.game else {
                return;
            };
            match state.reveal(&services.wallet) {
                Ok(fanout) => {
                    let (winners, house_take) = state.round_summary();
                    archive_round(
                        &services,
                        &handle.id,
                        &state.round_id,
                        "pool_flip",
                        state.public_view(),
                        winners,
                        house_take,
                    );
                    handle.emit(&mut room, fanout);
                }
                Err(e) => {
                    warn!(room_id = %handle.id, error = %e, "flip reveal failed");
                    room.record_failure();
                }
            }
        }
        if !scheduler.sleep(Duration::from_millis(config.cooldown_ms)).await {
            break;
        }
    }
    let mut room = handle.state.lock().await;
    if let GameState::PoolFlip(state) = &mut room.game {
        match state.refund_open(&services.wallet, "server shutting down") {
            Ok(fanout) => handle.emit(&mut room, fanout),
            Err(e) => warn!(room_id = %handle.id, error = %e, "flip shutdown refund failed"),
        }
    }
    info!(room_id = %handle.id, "pool_flip driver stopped");
}
