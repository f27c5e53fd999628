//! Crash engine: a shared multiplier climbs until it crashes.
//!
//! The singleton crash room cycles waiting -> flying -> crashed forever. The
//! crash point is sealed when the flight starts, before any tick is emitted.
//! Players hold up to two bet slots per round; a bet settles exactly once, by
//! auto target, manual cash-out or the crash itself.

use crate::config::CrashConfig;
use crate::errors::{GameError, GameResult};
use crate::ledger::{bet_leg, payout_leg, refund_leg, TxKind};
use crate::money::{Amount, Mult};
use crate::protocol::{Fanout, ServerMessage};
use crate::wallet::Wallet;
use crate::UserId;
use serde_json::json;
use std::collections::VecDeque;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

pub const SLOTS: [u8; 2] = [1, 2];

#[derive(Debug, Clone, PartialEq)]
pub enum CrashPhase {
    /// Bet window open.
    Waiting,
    /// Multiplier climbing; the crash point is sealed but never broadcast.
    Flying { seed: u64, crash_point: Mult },
    /// Terminal until the cooldown rolls the next round.
    Crashed { point: Mult },
}

impl CrashPhase {
    fn name(&self) -> &'static str {
        match self {
            CrashPhase::Waiting => "waiting",
            CrashPhase::Flying { .. } => "flying",
            CrashPhase::Crashed { .. } => "crashed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrashBet {
    pub user_id: UserId,
    pub slot: u8,
    pub amount: Amount,
    pub auto_cashout: Option<Mult>,
    /// Set once, at settlement.
    pub cashed_out: Option<Mult>,
    pub payout: Option<Amount>,
}

impl CrashBet {
    fn settled(&self) -> bool {
        self.payout.is_some()
    }
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    round_id: String,
    crash_point: Mult,
}

pub struct CrashState {
    pub room_id: String,
    pub round_id: String,
    pub phase: CrashPhase,
    /// Current multiplier; monotonically non-decreasing within a flight and
    /// capped at the crash point.
    pub current: Mult,
    started_at: Option<Instant>,
    pub bets: Vec<CrashBet>,
    history: VecDeque<HistoryEntry>,
    config: CrashConfig,
}

impl CrashState {
    pub fn new(room_id: String, config: CrashConfig) -> Self {
        Self {
            room_id,
            round_id: String::new(),
            phase: CrashPhase::Crashed { point: Mult::ONE },
            current: Mult::ONE,
            started_at: None,
            bets: Vec::new(),
            history: VecDeque::new(),
            config,
        }
    }

    /// Open the bet window for a fresh round.
    pub fn begin_waiting(&mut self) -> Fanout {
        self.round_id = Uuid::new_v4().to_string();
        self.phase = CrashPhase::Waiting;
        self.current = Mult::ONE;
        self.started_at = None;
        self.bets.clear();
        debug!(room_id = %self.room_id, round_id = %self.round_id, "crash bet window open");
        Fanout::new().public(self.room_state())
    }

    pub fn place_bet(
        &mut self,
        user_id: &str,
        amount: Amount,
        slot: u8,
        auto_cashout: Option<Mult>,
        wallet: &Wallet,
    ) -> GameResult<Fanout> {
        if self.phase != CrashPhase::Waiting {
            return Err(GameError::PhaseNotOpen(format!(
                "bets are closed while {}",
                self.phase.name()
            )));
        }
        if !SLOTS.contains(&slot) {
            return Err(GameError::Validation(format!("slot must be 1 or 2, got {}", slot)));
        }
        if amount < self.config.min_bet || amount > self.config.max_bet {
            return Err(GameError::Validation(format!(
                "bet must be between {} and {}",
                self.config.min_bet, self.config.max_bet
            )));
        }
        if self
            .bets
            .iter()
            .any(|b| b.user_id == user_id && b.slot == slot)
        {
            return Err(GameError::IllegalMove(format!("slot {} already has a bet", slot)));
        }
        let balance = wallet.debit(
            user_id,
            amount,
            &self.round_id,
            &bet_leg(&slot.to_string()),
            "crash bet",
        )?;
        self.bets.push(CrashBet {
            user_id: user_id.to_string(),
            slot,
            amount,
            auto_cashout,
            cashed_out: None,
            payout: None,
        });
        Ok(Fanout::new()
            .public(ServerMessage::Patch(json!({ "bets": self.bets_view() })))
            .private(user_id, ServerMessage::Wallet { balance }))
    }

    /// Seal the crash point and start the flight. No tick has gone out yet,
    /// so the point is fixed before anyone sees a multiplier.
    pub fn begin_flight(&mut self, seed: u64, crash_point: Mult) -> Fanout {
        self.phase = CrashPhase::Flying { seed, crash_point };
        self.current = Mult::ONE;
        self.started_at = Some(Instant::now());
        info!(room_id = %self.room_id, round_id = %self.round_id, bets = self.bets.len(), "crash flight started");
        Fanout::new().public(self.room_state())
    }

    /// Manual cash-out at the server's current multiplier. The client's
    /// displayed multiplier is irrelevant.
    pub fn cash_out(&mut self, user_id: &str, slot: u8, wallet: &Wallet) -> GameResult<Fanout> {
        if !matches!(self.phase, CrashPhase::Flying { .. }) {
            return Err(GameError::PhaseNotOpen("no flight in progress".into()));
        }
        let at = self.current;
        let index = self
            .bets
            .iter()
            .position(|b| b.user_id == user_id && b.slot == slot)
            .ok_or_else(|| GameError::IllegalMove(format!("no bet in slot {}", slot)))?;
        if self.bets[index].settled() {
            return Err(GameError::IllegalMove(format!("slot {} already settled", slot)));
        }
        let mut fanout = self.settle_bet(index, at, wallet)?;
        fanout.push_public(ServerMessage::Patch(json!({ "bets": self.bets_view() })));
        Ok(fanout)
    }

    /// One driver tick. Advances the multiplier, fires due auto cash-outs and
    /// detects the crash. Returns the fan-out and whether the round ended.
    pub fn tick(&mut self, wallet: &Wallet) -> GameResult<(Fanout, bool)> {
        let CrashPhase::Flying { crash_point, .. } = self.phase else {
            return Ok((Fanout::new(), false));
        };
        let elapsed = self
            .started_at
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let raw = (self.config.growth_k * elapsed).exp();
        let computed = Mult::from_f64_truncated(raw);
        let crashed = computed >= crash_point;
        // Monotonic and capped: ticks never decrease and never show a
        // multiplier past the crash point.
        self.current = self.current.max(computed.min(crash_point));

        let mut fanout = Fanout::new();

        // Auto targets fire at exactly the requested multiplier, even on the
        // crash tick when the target was still reachable.
        let due: Vec<usize> = self
            .bets
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                !b.settled()
                    && b.auto_cashout
                        .map(|target| target <= self.current)
                        .unwrap_or(false)
            })
            .map(|(i, _)| i)
            .collect();
        let had_autos = !due.is_empty();
        for index in due {
            let at = self.bets[index].auto_cashout.unwrap();
            fanout.merge(self.settle_bet(index, at, wallet)?);
        }

        if crashed {
            // Everyone still flying settles at zero.
            for index in 0..self.bets.len() {
                if !self.bets[index].settled() {
                    fanout.merge(self.settle_lost(index, wallet)?);
                }
            }
            self.phase = CrashPhase::Crashed { point: crash_point };
            self.history.push_front(HistoryEntry {
                round_id: self.round_id.clone(),
                crash_point,
            });
            self.history.truncate(self.config.history_len);
            info!(room_id = %self.room_id, round_id = %self.round_id, crash_point = %crash_point, "crashed");
            fanout.push_public(ServerMessage::RoundResult(json!({
                "round_id": self.round_id,
                "crash_point": crash_point,
                "bets": self.bets_view(),
            })));
            fanout.push_public(self.room_state());
            return Ok((fanout, true));
        }

        fanout.push_public(ServerMessage::Tick(json!({
            "multiplier": self.current,
            "elapsed_ms": (elapsed * 1_000.0) as u64,
        })));
        if had_autos {
            fanout.push_public(ServerMessage::Patch(json!({ "bets": self.bets_view() })));
        }
        Ok((fanout, false))
    }

    fn settle_bet(&mut self, index: usize, at: Mult, wallet: &Wallet) -> GameResult<Fanout> {
        let (user_id, slot, amount) = {
            let bet = &self.bets[index];
            (bet.user_id.clone(), bet.slot, bet.amount)
        };
        let payout = amount.mul_mult(at);
        let balance = wallet.credit(
            &user_id,
            payout,
            TxKind::PayoutCredit,
            &self.round_id,
            &payout_leg(&slot.to_string()),
            "crash cash-out",
        )?;
        let bet = &mut self.bets[index];
        bet.cashed_out = Some(at);
        bet.payout = Some(payout);
        debug!(room_id = %self.room_id, user_id = %user_id, slot, at = %at, payout = %payout, "bet cashed out");
        Ok(Fanout::new().private(user_id, ServerMessage::Wallet { balance }))
    }

    /// Close a losing bet with a zero payout so its leg settles exactly once.
    fn settle_lost(&mut self, index: usize, wallet: &Wallet) -> GameResult<Fanout> {
        let (user_id, slot) = {
            let bet = &self.bets[index];
            (bet.user_id.clone(), bet.slot)
        };
        wallet.credit(
            &user_id,
            Amount::ZERO,
            TxKind::PayoutCredit,
            &self.round_id,
            &payout_leg(&slot.to_string()),
            "crash bet lost",
        )?;
        self.bets[index].payout = Some(Amount::ZERO);
        Ok(Fanout::new())
    }

    /// Refund every open bet (shutdown mid-round).
    pub fn refund_open(&mut self, wallet: &Wallet, reason: &str) -> GameResult<Fanout> {
        let mut fanout = Fanout::new();
        for index in 0..self.bets.len() {
            if self.bets[index].settled() {
                continue;
            }
            let (user_id, slot, amount) = {
                let bet = &self.bets[index];
                (bet.user_id.clone(), bet.slot, bet.amount)
            };
            let balance = wallet.credit(
                &user_id,
                amount,
                TxKind::BetRefund,
                &self.round_id,
                &refund_leg(&slot.to_string()),
                reason,
            )?;
            self.bets[index].cashed_out = None;
            self.bets[index].payout = Some(amount);
            fanout.push_private(user_id, ServerMessage::Wallet { balance });
        }
        Ok(fanout)
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.bets.iter().any(|b| b.user_id == user_id)
    }

    fn bets_view(&self) -> serde_json::Value {
        let bets: Vec<_> = self
            .bets
            .iter()
            .map(|b| {
                json!({
                    "user_id": b.user_id,
                    "slot": b.slot,
                    "amount": b.amount,
                    "auto_cashout": b.auto_cashout,
                    "cashed_out": b.cashed_out,
                    "payout": b.payout,
                })
            })
            .collect();
        json!(bets)
    }

    pub fn public_view(&self) -> serde_json::Value {
        let crash_point = match self.phase {
            // Sealed but secret while flying.
            CrashPhase::Crashed { point } => Some(point),
            _ => None,
        };
        json!({
            "room_id": self.room_id,
            "game_kind": "crash",
            "round_id": self.round_id,
            "phase": self.phase.name(),
            "multiplier": self.current,
            "crash_point": crash_point,
            "bets": self.bets_view(),
            "history": self
                .history
                .iter()
                .map(|h| json!({ "round_id": h.round_id, "crash_point": h.crash_point }))
                .collect::<Vec<_>>(),
        })
    }

    fn room_state(&self) -> ServerMessage {
        ServerMessage::RoomState(self.public_view())
    }

    /// Winners and the house take for the round that just crashed, for the
    /// archive.
    pub fn round_summary(&self) -> (Vec<(UserId, Amount)>, Amount) {
        let winners: Vec<_> = self
            .bets
            .iter()
            .filter(|b| b.payout.map(|p| !p.is_zero()).unwrap_or(false))
            .map(|b| (b.user_id.clone(), b.payout.unwrap()))
            .collect();
        let staked: Amount = self.bets.iter().map(|b| b.amount).sum();
        let paid: Amount = self.bets.iter().filter_map(|b| b.payout).sum();
        (winners, staked - paid)
    }
}
