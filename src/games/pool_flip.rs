//! Pool-flip engine: a coin flip against the pool.
//!
//! The singleton room cycles betting -> flipping -> result. Everyone picks a
//! side during the window; winners are paid double minus the edge, and if
//! one side ends up empty the whole round refunds.

use crate::config::PoolFlipConfig;
use crate::errors::{GameError, GameResult};
use crate::ledger::{bet_leg, payout_leg, refund_leg, TxKind};
use crate::money::Amount;
use crate::protocol::{Fanout, ServerMessage};
use crate::wallet::Wallet;
use crate::UserId;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use tracing::{debug, info};
use uuid::Uuid;

/// Settlement leg slot; one bet per user per round.
const FLIP_SLOT: &str = "flip";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlipSide {
    Heads,
    Tails,
}

impl std::fmt::Display for FlipSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlipSide::Heads => write!(f, "heads"),
            FlipSide::Tails => write!(f, "tails"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlipPhase {
    /// Bet window open.
    Betting,
    /// Outcome sealed, animation window running. No bets, no reveals.
    Flipping { outcome: FlipSide },
    /// Outcome public, bets settled.
    Result { outcome: FlipSide },
}

impl FlipPhase {
    fn name(&self) -> &'static str {
        match self {
            FlipPhase::Betting => "betting",
            FlipPhase::Flipping { .. } => "flipping",
            FlipPhase::Result { .. } => "result",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlipBet {
    pub user_id: UserId,
    pub side: FlipSide,
    pub amount: Amount,
    pub payout: Option<Amount>,
    /// Stake returned rather than won; refunds never count as wins.
    pub refunded: bool,
}

pub struct PoolFlipState {
    pub room_id: String,
    pub round_id: String,
    pub phase: FlipPhase,
    pub bets: Vec<FlipBet>,
    history: VecDeque<FlipSide>,
    config: PoolFlipConfig,
}

impl PoolFlipState {
    pub fn new(room_id: String, config: PoolFlipConfig) -> Self {
        Self {
            room_id,
            round_id: String::new(),
            phase: FlipPhase::Result {
                outcome: FlipSide::Heads,
            },
            bets: Vec::new(),
            history: VecDeque::new(),
            config,
        }
    }

    pub fn begin_betting(&mut self) -> Fanout {
        self.round_id = Uuid::new_v4().to_string();
        self.phase = FlipPhase::Betting;
        self.bets.clear();
        debug!(room_id = %self.room_id, round_id = %self.round_id, "flip bet window open");
        Fanout::new().public(self.room_state())
    }

    pub fn place_bet(
        &mut self,
        user_id: &str,
        amount: Amount,
        side: FlipSide,
        wallet: &Wallet,
    ) -> GameResult<Fanout> {
        if self.phase != FlipPhase::Betting {
            return Err(GameError::PhaseNotOpen(format!(
                "bets are closed while {}",
                self.phase.name()
            )));
        }
        if amount < self.config.min_bet || amount > self.config.max_bet {
            return Err(GameError::Validation(format!(
                "bet must be between {} and {}",
                self.config.min_bet, self.config.max_bet
            )));
        }
        if self.bets.iter().any(|b| b.user_id == user_id) {
            return Err(GameError::IllegalMove("one bet per round".into()));
        }
        let balance = wallet.debit(
            user_id,
            amount,
            &self.round_id,
            &bet_leg(FLIP_SLOT),
            "pool flip bet",
        )?;
        self.bets.push(FlipBet {
            user_id: user_id.to_string(),
            side,
            amount,
            payout: None,
            refunded: false,
        });
        Ok(Fanout::new()
            .public(ServerMessage::Patch(json!({ "bets": self.bets_view() })))
            .private(user_id, ServerMessage::Wallet { balance }))
    }

    /// Close the window and seal the outcome. The outcome stays hidden until
    /// the result phase.
    pub fn begin_flip(&mut self, outcome: FlipSide) -> Fanout {
        self.phase = FlipPhase::Flipping { outcome };
        debug!(room_id = %self.room_id, round_id = %self.round_id, "flip sealed");
        Fanout::new().public(self.room_state())
    }

    /// Reveal and settle. Winners get `2 * stake * (1 - edge)`; a one-sided
    /// round refunds every stake instead.
    pub fn reveal(&mut self, wallet: &Wallet) -> GameResult<Fanout> {
        let FlipPhase::Flipping { outcome } = self.phase else {
            return Err(GameError::Internal("reveal outside flipping phase".into()));
        };
        let mut fanout = Fanout::new();
        let heads = self.bets.iter().any(|b| b.side == FlipSide::Heads);
        let tails = self.bets.iter().any(|b| b.side == FlipSide::Tails);
        let one_sided = !(heads && tails);

        for index in 0..self.bets.len() {
            let (user_id, side, amount) = {
                let bet = &self.bets[index];
                (bet.user_id.clone(), bet.side, bet.amount)
            };
            let balance = if one_sided {
                self.bets[index].payout = Some(amount);
                self.bets[index].refunded = true;
                wallet.credit(
                    &user_id,
                    amount,
                    TxKind::BetRefund,
                    &self.round_id,
                    &refund_leg(FLIP_SLOT),
                    "one-sided flip refund",
                )?
            } else if side == outcome {
                let payout = amount.mul_mult(crate::money::Mult(200)).apply_edge_bps(self.config.edge_bps);
                self.bets[index].payout = Some(payout);
                wallet.credit(
                    &user_id,
                    payout,
                    TxKind::PayoutCredit,
                    &self.round_id,
                    &payout_leg(FLIP_SLOT),
                    "pool flip win",
                )?
            } else {
                self.bets[index].payout = Some(Amount::ZERO);
                wallet.credit(
                    &user_id,
                    Amount::ZERO,
                    TxKind::PayoutCredit,
                    &self.round_id,
                    &payout_leg(FLIP_SLOT),
                    "pool flip loss",
                )?
            };
            fanout.push_private(user_id, ServerMessage::Wallet { balance });
        }

        self.phase = FlipPhase::Result { outcome };
        self.history.push_front(outcome);
        self.history.truncate(self.config.history_len);
        info!(
            room_id = %self.room_id,
            round_id = %self.round_id,
            outcome = %outcome,
            bets = self.bets.len(),
            one_sided,
            "flip revealed"
        );
        fanout.push_public(ServerMessage::RoundResult(json!({
            "round_id": self.round_id,
            "outcome": outcome,
            "refunded": one_sided,
            "bets": self.bets_view(),
        })));
        fanout.push_public(self.room_state());
        Ok(fanout)
    }

    /// Refund every open bet (shutdown mid-round).
    pub fn refund_open(&mut self, wallet: &Wallet, reason: &str) -> GameResult<Fanout> {
        let mut fanout = Fanout::new();
        for index in 0..self.bets.len() {
            if self.bets[index].payout.is_some() {
                continue;
            }
            let (user_id, amount) = {
                let bet = &self.bets[index];
                (bet.user_id.clone(), bet.amount)
            };
            let balance = wallet.credit(
                &user_id,
                amount,
                TxKind::BetRefund,
                &self.round_id,
                &refund_leg(FLIP_SLOT),
                reason,
            )?;
            self.bets[index].payout = Some(amount);
            self.bets[index].refunded = true;
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
                    "side": b.side,
                    "amount": b.amount,
                    "payout": b.payout,
                })
            })
            .collect();
        json!(bets)
    }

    pub fn public_view(&self) -> serde_json::Value {
        let outcome = match self.phase {
            // Sealed but secret while flipping.
            FlipPhase::Result { outcome } => Some(outcome),
            _ => None,
        };
        json!({
            "room_id": self.room_id,
            "game_kind": "pool_flip",
            "round_id": self.round_id,
            "phase": self.phase.name(),
            "outcome": outcome,
            "bets": self.bets_view(),
            "history": self.history.iter().collect::<Vec<_>>(),
        })
    }

    fn room_state(&self) -> ServerMessage {
        ServerMessage::RoomState(self.public_view())
    }

    /// Winners and house take for the archive.
    pub fn round_summary(&self) -> (Vec<(UserId, Amount)>, Amount) {
        let winners: Vec<_> = self
            .bets
            .iter()
            .filter(|b| !b.refunded && b.payout.map(|p| !p.is_zero()).unwrap_or(false))
            .map(|b| (b.user_id.clone(), b.payout.unwrap()))
            .collect();
        let staked: Amount = self.bets.iter().map(|b| b.amount).sum();
        let paid: Amount = self.bets.iter().filter_map(|b| b.payout).sum();
        (winners, staked - paid)
    }
}
