//! Turn-card engine: a 2-4 player shedding card game.
//!
//! The room is the round: seats pay the entry on join, the host starts once
//! everyone is ready, and the first seat to shed its hand takes the pot.
//! All rule enforcement lives here; the dispatcher only routes commands and
//! arms timers off the state this module leaves behind.

use crate::config::TurnCardConfig;
use crate::errors::{GameError, GameResult};
use crate::ledger::{bet_leg, payout_leg, refund_leg, TxKind};
use crate::money::Amount;
use crate::protocol::{Fanout, ServerMessage};
use crate::rng::GameRng;
use crate::wallet::Wallet;
use crate::UserId;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

/// Slot string for the entry settlement legs of this game.
const ENTRY_SLOT: &str = "entry";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardColor {
    Red,
    Yellow,
    Green,
    Blue,
}

pub const ALL_COLORS: [CardColor; 4] = [
    CardColor::Red,
    CardColor::Yellow,
    CardColor::Green,
    CardColor::Blue,
];

/// Card face. Numbers serialize as JSON numbers, actions as strings
/// (`"skip"`, `"reverse"`, `"draw_two"`, `"wild"`, `"wild_draw_four"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardValue {
    Number(u8),
    Skip,
    Reverse,
    DrawTwo,
    Wild,
    WildDrawFour,
}

impl CardValue {
    pub fn is_wild(self) -> bool {
        matches!(self, CardValue::Wild | CardValue::WildDrawFour)
    }
}

impl Serialize for CardValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CardValue::Number(n) => serializer.serialize_u8(*n),
            CardValue::Skip => serializer.serialize_str("skip"),
            CardValue::Reverse => serializer.serialize_str("reverse"),
            CardValue::DrawTwo => serializer.serialize_str("draw_two"),
            CardValue::Wild => serializer.serialize_str("wild"),
            CardValue::WildDrawFour => serializer.serialize_str("wild_draw_four"),
        }
    }
}

impl<'de> Deserialize<'de> for CardValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u8),
            Name(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) if n <= 9 => Ok(CardValue::Number(n)),
            Raw::Number(n) => Err(de::Error::custom(format!("card number {} out of range", n))),
            Raw::Name(name) => match name.as_str() {
                "skip" => Ok(CardValue::Skip),
                "reverse" => Ok(CardValue::Reverse),
                "draw_two" => Ok(CardValue::DrawTwo),
                "wild" => Ok(CardValue::Wild),
                "wild_draw_four" => Ok(CardValue::WildDrawFour),
                other => Err(de::Error::custom(format!("unknown card value '{}'", other))),
            },
        }
    }
}

/// A card. Wild cards have no color until played, when the player's chosen
/// color is tracked as the room's `current_color` (the card itself stays
/// colorless so a reshuffle returns it to the deck unassigned).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<CardColor>,
    pub value: CardValue,
}

impl Card {
    pub fn colored(color: CardColor, value: CardValue) -> Self {
        Card {
            color: Some(color),
            value,
        }
    }

    pub fn wild(value: CardValue) -> Self {
        Card { color: None, value }
    }
}

/// The full 108-card deck: per color one 0, two each of 1-9, two skips, two
/// reverses, two draw-twos; plus four wilds and four wild-draw-fours.
pub fn full_deck() -> Vec<Card> {
    let mut deck = Vec::with_capacity(108);
    for color in ALL_COLORS {
        deck.push(Card::colored(color, CardValue::Number(0)));
        for n in 1..=9 {
            deck.push(Card::colored(color, CardValue::Number(n)));
            deck.push(Card::colored(color, CardValue::Number(n)));
        }
        for value in [CardValue::Skip, CardValue::Reverse, CardValue::DrawTwo] {
            deck.push(Card::colored(color, value));
            deck.push(Card::colored(color, value));
        }
    }
    for _ in 0..4 {
        deck.push(Card::wild(CardValue::Wild));
        deck.push(Card::wild(CardValue::WildDrawFour));
    }
    deck
}

#[derive(Debug, Clone)]
pub struct SeatState {
    pub user_id: UserId,
    pub username: String,
    pub paid: bool,
    pub ready: bool,
    pub hand: Vec<Card>,
    pub connected: bool,
    /// Set while the seat is disconnected, for the reconnection grace.
    pub last_left: Option<Instant>,
    /// Forfeited or left mid-game; skipped by the turn order.
    pub absent: bool,
}

impl SeatState {
    fn new(user_id: UserId, username: String) -> Self {
        Self {
            user_id,
            username,
            paid: false,
            ready: false,
            hand: Vec::new(),
            connected: true,
            last_left: None,
            absent: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnPhase {
    Waiting,
    Playing,
    Finished { winner: Option<UserId> },
}

impl TurnPhase {
    fn name(&self) -> &'static str {
        match self {
            TurnPhase::Waiting => "waiting",
            TurnPhase::Playing => "playing",
            TurnPhase::Finished { .. } => "finished",
        }
    }
}

/// One-card grace window: the seat must call before the window closes, a
/// challenge lands, or its next turn arrives.
#[derive(Debug, Clone)]
pub struct ReachState {
    pub seat_index: usize,
    pub deadline: Instant,
    pub called: bool,
}

#[derive(Debug)]
pub struct TurnCardState {
    pub room_id: String,
    pub host: UserId,
    pub entry_amount: Amount,
    pub max_seats: usize,
    pub phase: TurnPhase,
    pub seats: Vec<SeatState>,
    /// Draw pile; the top of the pile is the last element.
    pub stock: Vec<Card>,
    /// Discard pile; the top is the last element and never face-down.
    pub discard: Vec<Card>,
    pub current_color: Option<CardColor>,
    pub current_turn: usize,
    /// +1 or -1.
    pub direction: i8,
    /// Accumulated +2 penalty awaiting the first non-+2 response.
    pub pending_draw: u32,
    pub drawn_this_turn: bool,
    pub turn_deadline: Option<Instant>,
    pub reach: Option<ReachState>,
    config: TurnCardConfig,
    /// Process-wide seedable source; deals and reshuffles both draw from it
    /// so a fixed seed replays the whole round.
    rng: Arc<GameRng>,
}

impl TurnCardState {
    /// New waiting room. The host's entry debit happens in the registry,
    /// atomically with room insertion; the host seat arrives already paid.
    pub fn new(
        room_id: String,
        host: UserId,
        host_name: String,
        entry_amount: Amount,
        max_seats: usize,
        config: TurnCardConfig,
        rng: Arc<GameRng>,
    ) -> Self {
        let mut host_seat = SeatState::new(host.clone(), host_name);
        host_seat.paid = true;
        host_seat.ready = true;
        Self {
            room_id,
            host,
            entry_amount,
            max_seats,
            phase: TurnPhase::Waiting,
            seats: vec![host_seat],
            stock: Vec::new(),
            discard: Vec::new(),
            current_color: None,
            current_turn: 0,
            direction: 1,
            pending_draw: 0,
            drawn_this_turn: false,
            turn_deadline: None,
            reach: None,
            config,
            rng,
        }
    }

    pub fn seat_of(&self, user_id: &str) -> Option<usize> {
        self.seats.iter().position(|s| s.user_id == user_id)
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.seat_of(user_id).is_some()
    }

    fn active_seats(&self) -> usize {
        self.seats.iter().filter(|s| !s.absent).count()
    }

    fn require_phase(&self, phase: &TurnPhase) -> GameResult<()> {
        if &self.phase != phase {
            return Err(GameError::PhaseNotOpen(format!(
                "room is {}",
                self.phase.name()
            )));
        }
        Ok(())
    }

    fn require_active_seat(&self, user_id: &str) -> GameResult<usize> {
        let seat = self.seat_of(user_id).ok_or(GameError::NotParticipant)?;
        if seat != self.current_turn {
            return Err(GameError::NotYourTurn);
        }
        Ok(seat)
    }

    // ---- lobby operations -------------------------------------------------

    pub fn join(&mut self, user_id: &str, username: &str, wallet: &Wallet) -> GameResult<Fanout> {
        self.require_phase(&TurnPhase::Waiting)?;
        if self.is_participant(user_id) {
            return Err(GameError::IllegalMove("already seated".into()));
        }
        if self.seats.len() >= self.max_seats {
            return Err(GameError::RoomFull);
        }
        let balance = wallet.debit(
            user_id,
            self.entry_amount,
            &self.room_id,
            &bet_leg(ENTRY_SLOT),
            "turn_card entry",
        )?;
        let mut seat = SeatState::new(user_id.to_string(), username.to_string());
        seat.paid = true;
        self.seats.push(seat);
        Ok(Fanout::new()
            .public(self.room_state())
            .private(user_id, ServerMessage::Wallet { balance }))
    }

    pub fn toggle_ready(&mut self, user_id: &str) -> GameResult<Fanout> {
        self.require_phase(&TurnPhase::Waiting)?;
        let seat = self.seat_of(user_id).ok_or(GameError::NotParticipant)?;
        if self.seats[seat].user_id == self.host {
            return Err(GameError::IllegalMove("host is always ready".into()));
        }
        self.seats[seat].ready = !self.seats[seat].ready;
        Ok(Fanout::new().public(self.room_state()))
    }

    /// Host deletes the waiting room; every paid entry refunds.
    pub fn delete(&mut self, user_id: &str, wallet: &Wallet) -> GameResult<Fanout> {
        self.require_phase(&TurnPhase::Waiting)?;
        if user_id != self.host {
            return Err(GameError::NotParticipant);
        }
        let fanout = self.refund_all_entries(wallet, "room deleted by host")?;
        self.phase = TurnPhase::Finished { winner: None };
        Ok(fanout.public(self.room_state()))
    }

    pub fn leave(&mut self, user_id: &str, wallet: &Wallet) -> GameResult<Fanout> {
        let seat = self.seat_of(user_id).ok_or(GameError::NotParticipant)?;
        match self.phase {
            TurnPhase::Waiting => {
                if user_id == self.host {
                    // No host migration: the host leaving tears the room down.
                    return self.delete(user_id, wallet);
                }
                let balance = wallet.credit(
                    user_id,
                    self.entry_amount,
                    TxKind::BetRefund,
                    &self.room_id,
                    &refund_leg(ENTRY_SLOT),
                    "left before start",
                )?;
                self.seats.remove(seat);
                Ok(Fanout::new()
                    .public(self.room_state())
                    .private(user_id, ServerMessage::Wallet { balance }))
            }
            TurnPhase::Playing => self.forfeit(seat, wallet),
            TurnPhase::Finished { .. } => {
                Err(GameError::PhaseNotOpen("room is finished".into()))
            }
        }
    }

    /// Forfeit mid-game: the entry is lost, the seat goes absent and its
    /// cards return to the bottom of the stock.
    fn forfeit(&mut self, seat: usize, wallet: &Wallet) -> GameResult<Fanout> {
        let cards: Vec<Card> = self.seats[seat].hand.drain(..).collect();
        for mut card in cards {
            if card.value.is_wild() {
                card.color = None;
            }
            self.stock.insert(0, card);
        }
        self.seats[seat].absent = true;
        if let Some(reach) = &self.reach {
            if reach.seat_index == seat {
                self.reach = None;
            }
        }
        info!(room_id = %self.room_id, user_id = %self.seats[seat].user_id, "seat forfeited");

        if self.active_seats() == 1 {
            let winner = self.seats.iter().position(|s| !s.absent).unwrap();
            return self.finish_with_winner(winner, wallet);
        }
        let mut fanout = Fanout::new();
        if self.current_turn == seat {
            self.advance_turn(1);
            fanout.merge(self.begin_turn()?);
        }
        Ok(fanout.public(self.room_state()))
    }

    // ---- game start -------------------------------------------------------

    pub fn start(&mut self, user_id: &str) -> GameResult<Fanout> {
        self.require_phase(&TurnPhase::Waiting)?;
        if user_id != self.host {
            return Err(GameError::NotParticipant);
        }
        let paid = self.seats.iter().filter(|s| s.paid).count();
        if paid < 2 {
            return Err(GameError::IllegalMove("need at least 2 paid seats".into()));
        }
        if !self.seats.iter().all(|s| s.ready) {
            return Err(GameError::IllegalMove("not everyone is ready".into()));
        }

        let mut deck = full_deck();
        self.rng.shuffle(&mut deck);
        self.stock = deck;
        for seat in &mut self.seats {
            seat.hand = (0..self.config.hand_size)
                .filter_map(|_| self.stock.pop())
                .collect();
        }
        // Flip the starter; action and wild cards are buried at the bottom of
        // the stock until a colored number card comes up.
        loop {
            let card = self
                .stock
                .pop()
                .ok_or_else(|| GameError::Internal("deck exhausted before starter".into()))?;
            match (card.color, card.value) {
                (Some(color), CardValue::Number(_)) => {
                    self.discard.push(card);
                    self.current_color = Some(color);
                    break;
                }
                _ => self.stock.insert(0, card),
            }
        }

        self.phase = TurnPhase::Playing;
        self.direction = 1;
        self.current_turn = 0;
        self.pending_draw = 0;
        let mut fanout = self.begin_turn()?;
        fanout.push_public(self.room_state());
        for seat in &self.seats {
            fanout.push_private(seat.user_id.clone(), self.private_hand(seat));
        }
        info!(room_id = %self.room_id, seats = self.seats.len(), "turn_card round started");
        Ok(fanout)
    }

    // ---- turn mechanics ---------------------------------------------------

    fn discard_top(&self) -> Option<&Card> {
        self.discard.last()
    }

    /// Legality predicate: wild is always legal; otherwise match the current
    /// color or the discard top's value.
    pub fn is_legal(&self, card: &Card) -> bool {
        if card.value.is_wild() {
            return true;
        }
        if card.color == self.current_color {
            return true;
        }
        match self.discard_top() {
            Some(top) => card.value == top.value,
            None => false,
        }
    }

    pub fn play_card(
        &mut self,
        user_id: &str,
        card_index: usize,
        wild_color: Option<CardColor>,
        wallet: &Wallet,
    ) -> GameResult<Fanout> {
        self.require_phase(&TurnPhase::Playing)?;
        let seat = self.require_active_seat(user_id)?;
        if card_index >= self.seats[seat].hand.len() {
            return Err(GameError::Validation(format!(
                "card index {} out of range",
                card_index
            )));
        }
        let card = self.seats[seat].hand[card_index];
        if self.pending_draw > 0 && card.value != CardValue::DrawTwo {
            return Err(GameError::IllegalMove(
                "must stack a +2 or draw the penalty".into(),
            ));
        }
        if !self.is_legal(&card) {
            return Err(GameError::IllegalMove("card does not match color or value".into()));
        }
        if card.value.is_wild() && wild_color.is_none() {
            return Err(GameError::IllegalMove("wild requires a color choice".into()));
        }
        self.apply_play(seat, card_index, wild_color, wallet)
    }

    /// Commit an already-validated play. Shared by `play_card` and the
    /// draw-to-play path.
    fn apply_play(
        &mut self,
        seat: usize,
        card_index: usize,
        wild_color: Option<CardColor>,
        wallet: &Wallet,
    ) -> GameResult<Fanout> {
        let card = self.seats[seat].hand.remove(card_index);
        self.discard.push(card);
        self.current_color = match card.value {
            CardValue::Wild | CardValue::WildDrawFour => wild_color,
            _ => card.color,
        };
        debug!(
            room_id = %self.room_id,
            seat,
            card = ?card,
            color = ?self.current_color,
            "card played"
        );

        let mut fanout = Fanout::new();

        if self.seats[seat].hand.is_empty() {
            fanout.merge(self.finish_with_winner(seat, wallet)?);
            return Ok(fanout);
        }

        // Entering reach: exactly one card left opens the call window.
        if self.seats[seat].hand.len() == 1 {
            self.reach = Some(ReachState {
                seat_index: seat,
                deadline: Instant::now() + Duration::from_secs(self.config.reach_grace_secs),
                called: false,
            });
        }

        match card.value {
            CardValue::Number(_) | CardValue::Wild => self.advance_turn(1),
            CardValue::Skip => self.advance_turn(2),
            CardValue::Reverse => {
                self.direction = -self.direction;
                if self.active_seats() == 2 {
                    // With two seats a reverse acts like a skip: same player
                    // goes again.
                    self.advance_turn(2);
                } else {
                    self.advance_turn(1);
                }
            }
            CardValue::DrawTwo => {
                self.pending_draw += 2;
                self.advance_turn(1);
            }
            CardValue::WildDrawFour => {
                // No +4 stacking: the next seat draws immediately and is
                // skipped.
                self.advance_turn(1);
                let victim = self.current_turn;
                let drawn = self.draw_cards(victim, 4);
                fanout.push_private(
                    self.seats[victim].user_id.clone(),
                    self.private_hand(&self.seats[victim]),
                );
                debug!(room_id = %self.room_id, victim, drawn, "wild draw four applied");
                self.advance_turn(1);
            }
        }

        fanout.merge(self.begin_turn()?);
        fanout.push_public(self.room_state());
        fanout.push_private(
            self.seats[seat].user_id.clone(),
            self.private_hand(&self.seats[seat]),
        );
        Ok(fanout)
    }

    pub fn draw_card(
        &mut self,
        user_id: &str,
        play_if_legal: bool,
        wild_color: Option<CardColor>,
        wallet: &Wallet,
    ) -> GameResult<Fanout> {
        self.require_phase(&TurnPhase::Playing)?;
        let seat = self.require_active_seat(user_id)?;

        // Facing an accumulated +2 penalty: drawing discharges it and the
        // seat is skipped.
        if self.pending_draw > 0 {
            let count = self.pending_draw;
            self.pending_draw = 0;
            self.draw_cards(seat, count as usize);
            let mut fanout = Fanout::new().private(
                self.seats[seat].user_id.clone(),
                self.private_hand(&self.seats[seat]),
            );
            self.advance_turn(1);
            fanout.merge(self.begin_turn()?);
            fanout.push_public(self.room_state());
            return Ok(fanout);
        }

        if self.drawn_this_turn {
            return Err(GameError::IllegalMove("already drew this turn".into()));
        }
        self.drawn_this_turn = true;
        let drawn = self.draw_cards(seat, 1);
        let mut fanout = Fanout::new().private(
            self.seats[seat].user_id.clone(),
            self.private_hand(&self.seats[seat]),
        );

        let playable = drawn == 1 && {
            let card = *self.seats[seat].hand.last().unwrap();
            self.is_legal(&card) && (!card.value.is_wild() || wild_color.is_some())
        };
        if play_if_legal && playable {
            let idx = self.seats[seat].hand.len() - 1;
            fanout.merge(self.apply_play(seat, idx, wild_color, wallet)?);
            return Ok(fanout);
        }

        // Turn ends after the single draw.
        self.advance_turn(1);
        fanout.merge(self.begin_turn()?);
        fanout.push_public(self.room_state());
        Ok(fanout)
    }

    /// Call "one-card" during the reach window, or challenge another seat's
    /// uncalled reach.
    pub fn call_uno(&mut self, user_id: &str) -> GameResult<Fanout> {
        self.require_phase(&TurnPhase::Playing)?;
        let caller = self.seat_of(user_id).ok_or(GameError::NotParticipant)?;
        let now = Instant::now();
        let Some(reach) = self.reach.clone() else {
            return Err(GameError::IllegalMove("no one-card window open".into()));
        };
        if reach.called || now > reach.deadline {
            return Err(GameError::IllegalMove("the window has closed".into()));
        }
        if caller == reach.seat_index {
            if let Some(reach) = self.reach.as_mut() {
                reach.called = true;
            }
            debug!(room_id = %self.room_id, seat = caller, "one-card called");
            return Ok(Fanout::new().public(self.room_state()));
        }
        // Challenge: the reach seat takes a 2-card penalty.
        let victim = reach.seat_index;
        self.reach = None;
        self.draw_cards(victim, 2);
        info!(room_id = %self.room_id, victim, challenger = caller, "one-card challenge landed");
        Ok(Fanout::new()
            .public(self.room_state())
            .private(
                self.seats[victim].user_id.clone(),
                self.private_hand(&self.seats[victim]),
            ))
    }

    // ---- timers -----------------------------------------------------------

    /// Turn timer expiry: force-draw for the active seat and end the turn.
    pub fn handle_turn_timeout(&mut self) -> GameResult<Fanout> {
        if self.phase != TurnPhase::Playing {
            return Ok(Fanout::new());
        }
        let seat = self.current_turn;
        let count = if self.pending_draw > 0 {
            let count = self.pending_draw;
            self.pending_draw = 0;
            count as usize
        } else if self.drawn_this_turn {
            0
        } else {
            1
        };
        let drawn = self.draw_cards(seat, count);
        debug!(room_id = %self.room_id, seat, drawn, "turn timed out");
        let mut fanout = Fanout::new();
        if drawn > 0 {
            fanout.push_private(
                self.seats[seat].user_id.clone(),
                self.private_hand(&self.seats[seat]),
            );
        }
        self.advance_turn(1);
        fanout.merge(self.begin_turn()?);
        fanout.push_public(self.room_state());
        Ok(fanout)
    }

    /// A subscriber connection dropped. An active disconnected seat gets the
    /// reconnection grace instead of the regular turn timer.
    pub fn handle_disconnect(&mut self, user_id: &str) -> Option<Fanout> {
        let seat = self.seat_of(user_id)?;
        self.seats[seat].connected = false;
        self.seats[seat].last_left = Some(Instant::now());
        if self.phase == TurnPhase::Playing && self.current_turn == seat {
            self.turn_deadline =
                Some(Instant::now() + Duration::from_secs(self.config.reconnect_grace_secs));
        }
        Some(Fanout::new().public(self.room_state()))
    }

    /// The seat reconnected within grace: same hand, and the same turn if it
    /// has not been forced yet.
    pub fn handle_reconnect(&mut self, user_id: &str) -> Option<Fanout> {
        let seat = self.seat_of(user_id)?;
        self.seats[seat].connected = true;
        self.seats[seat].last_left = None;
        let mut fanout = Fanout::new().public(self.room_state());
        if self.phase == TurnPhase::Playing {
            fanout.push_private(
                self.seats[seat].user_id.clone(),
                self.private_hand(&self.seats[seat]),
            );
        }
        Some(fanout)
    }

    // ---- internals --------------------------------------------------------

    /// Start the clock for the current seat and apply the missed-call penalty
    /// if its reach window is still open and uncalled.
    fn begin_turn(&mut self) -> GameResult<Fanout> {
        if self.phase != TurnPhase::Playing {
            self.turn_deadline = None;
            return Ok(Fanout::new());
        }
        self.drawn_this_turn = false;
        let grace = if self.seats[self.current_turn].connected {
            self.config.turn_secs
        } else {
            self.config.reconnect_grace_secs
        };
        self.turn_deadline = Some(Instant::now() + Duration::from_secs(grace));

        let mut fanout = Fanout::new();
        if let Some(reach) = self.reach.clone() {
            if reach.seat_index == self.current_turn {
                if !reach.called {
                    // The next turn arrived without a call: 2-card penalty,
                    // whether or not the challenge window already closed.
                    let victim = reach.seat_index;
                    self.draw_cards(victim, 2);
                    info!(room_id = %self.room_id, victim, "missed one-card call penalty");
                    fanout.push_private(
                        self.seats[victim].user_id.clone(),
                        self.private_hand(&self.seats[victim]),
                    );
                }
                self.reach = None;
            }
        }
        Ok(fanout)
    }

    /// Move `steps` occupied seats in the current direction, skipping absent
    /// seats entirely.
    fn advance_turn(&mut self, steps: usize) {
        if self.active_seats() == 0 {
            return;
        }
        let len = self.seats.len();
        let mut remaining = steps;
        let mut index = self.current_turn;
        while remaining > 0 {
            loop {
                index = (index as i64 + self.direction as i64).rem_euclid(len as i64) as usize;
                if !self.seats[index].absent {
                    break;
                }
            }
            remaining -= 1;
        }
        self.current_turn = index;
    }

    /// Draw up to `count` cards into a seat's hand, reshuffling the discard
    /// pile (minus its top) when the stock empties. Returns how many cards
    /// were actually drawn; fewer than asked means both piles ran dry.
    fn draw_cards(&mut self, seat: usize, count: usize) -> usize {
        let mut drawn = 0;
        for _ in 0..count {
            if self.stock.is_empty() {
                self.reshuffle_discard();
            }
            match self.stock.pop() {
                Some(card) => {
                    self.seats[seat].hand.push(card);
                    drawn += 1;
                }
                None => break,
            }
        }
        drawn
    }

    fn reshuffle_discard(&mut self) {
        if self.discard.len() <= 1 {
            return;
        }
        let top = self.discard.pop().unwrap();
        let mut recycled: Vec<Card> = self.discard.drain(..).collect();
        for card in &mut recycled {
            if card.value.is_wild() {
                card.color = None;
            }
        }
        self.rng.shuffle(&mut recycled);
        self.stock = recycled;
        self.discard.push(top);
        debug!(room_id = %self.room_id, recycled = self.stock.len(), "discard reshuffled into stock");
    }

    fn finish_with_winner(&mut self, seat: usize, wallet: &Wallet) -> GameResult<Fanout> {
        let winner_id = self.seats[seat].user_id.clone();
        let paid: Vec<UserId> = self
            .seats
            .iter()
            .filter(|s| s.paid)
            .map(|s| s.user_id.clone())
            .collect();
        let pot = Amount::from_cents(self.entry_amount.cents() * paid.len() as i64);
        let payout = pot.apply_edge_bps(self.config.edge_bps);

        let mut fanout = Fanout::new();
        let balance = wallet.credit(
            &winner_id,
            payout,
            TxKind::PayoutCredit,
            &self.room_id,
            &payout_leg(ENTRY_SLOT),
            "turn_card pot",
        )?;
        fanout.push_private(winner_id.clone(), ServerMessage::Wallet { balance });
        // Losing entries settle at zero so every bet leg closes exactly once.
        for user_id in paid.iter().filter(|u| **u != winner_id) {
            wallet.credit(
                user_id,
                Amount::ZERO,
                TxKind::PayoutCredit,
                &self.room_id,
                &payout_leg(ENTRY_SLOT),
                "turn_card entry lost",
            )?;
        }

        self.phase = TurnPhase::Finished {
            winner: Some(winner_id.clone()),
        };
        self.turn_deadline = None;
        self.reach = None;
        info!(room_id = %self.room_id, winner = %winner_id, pot = %pot, payout = %payout, "turn_card round finished");
        fanout.push_public(ServerMessage::RoundResult(json!({
            "winner": winner_id,
            "pot": pot,
            "payout": payout,
        })));
        fanout.push_public(self.room_state());
        Ok(fanout)
    }

    /// Refund every paid seat's entry (host delete / shutdown abort).
    pub fn refund_all_entries(&mut self, wallet: &Wallet, reason: &str) -> GameResult<Fanout> {
        let mut fanout = Fanout::new();
        for seat in self.seats.iter_mut().filter(|s| s.paid) {
            let balance = wallet.credit(
                &seat.user_id,
                self.entry_amount,
                TxKind::BetRefund,
                &self.room_id,
                &refund_leg(ENTRY_SLOT),
                reason,
            )?;
            seat.paid = false;
            fanout.push_private(seat.user_id.clone(), ServerMessage::Wallet { balance });
        }
        Ok(fanout)
    }

    /// Winner and house take for the archive. Empty unless the round
    /// finished with a winner.
    pub fn round_summary(&self) -> (Vec<(UserId, Amount)>, Amount) {
        let TurnPhase::Finished {
            winner: Some(winner),
        } = &self.phase
        else {
            return (Vec::new(), Amount::ZERO);
        };
        let paid = self.seats.iter().filter(|s| s.paid).count();
        let pot = Amount::from_cents(self.entry_amount.cents() * paid as i64);
        let payout = pot.apply_edge_bps(self.config.edge_bps);
        (vec![(winner.clone(), payout)], pot - payout)
    }

    // ---- views ------------------------------------------------------------

    /// Full public view. Hands appear only as counts.
    pub fn public_view(&self) -> serde_json::Value {
        let seats: Vec<_> = self
            .seats
            .iter()
            .enumerate()
            .map(|(index, seat)| {
                json!({
                    "seat_index": index,
                    "user_id": seat.user_id,
                    "username": seat.username,
                    "paid": seat.paid,
                    "ready": seat.ready,
                    "connected": seat.connected,
                    "absent": seat.absent,
                    "hand_count": seat.hand.len(),
                })
            })
            .collect();
        let winner = match &self.phase {
            TurnPhase::Finished { winner } => winner.clone(),
            _ => None,
        };
        json!({
            "room_id": self.room_id,
            "game_kind": "turn_card",
            "phase": self.phase.name(),
            "host": self.host,
            "entry_amount": self.entry_amount,
            "max_seats": self.max_seats,
            "pot": Amount::from_cents(
                self.entry_amount.cents() * self.seats.iter().filter(|s| s.paid).count() as i64
            ),
            "seats": seats,
            "discard_top": self.discard_top(),
            "current_color": self.current_color,
            "current_turn": self.current_turn,
            "direction": self.direction,
            "pending_draw": self.pending_draw,
            "stock_count": self.stock.len(),
            "reach_seat": self.reach.as_ref().map(|r| r.seat_index),
            "winner": winner,
        })
    }

    fn room_state(&self) -> ServerMessage {
        ServerMessage::RoomState(self.public_view())
    }

    fn private_hand(&self, seat: &SeatState) -> ServerMessage {
        ServerMessage::PrivateHand(json!({
            "user_id": seat.user_id,
            "hand": seat.hand,
        }))
    }

    pub fn private_view(&self, user_id: &str) -> Option<ServerMessage> {
        let seat = self.seat_of(user_id)?;
        Some(self.private_hand(&self.seats[seat]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use std::sync::Arc;

    fn test_wallet(users: &[&str]) -> Wallet {
        let wallet = Wallet::new(Arc::new(Ledger::in_memory()));
        for user in users {
            wallet.grant_bonus(user, Amount::from_units(1_000)).unwrap();
        }
        wallet
    }

    fn waiting_room(host: &str, max_seats: usize) -> TurnCardState {
        TurnCardState::new(
            "room-1".into(),
            host.to_string(),
            host.to_string(),
            Amount::from_units(50),
            max_seats,
            TurnCardConfig::default(),
            Arc::new(GameRng::seeded(99)),
        )
    }

    fn started_room(users: &[&str]) -> (TurnCardState, Wallet) {
        let wallet = test_wallet(users);
        let mut state = waiting_room(users[0], 4);
        wallet
            .debit(
                users[0],
                Amount::from_units(50),
                "room-1",
                &bet_leg(ENTRY_SLOT),
                "entry",
            )
            .unwrap();
        for user in &users[1..] {
            state.join(user, user, &wallet).unwrap();
            state.toggle_ready(user).unwrap();
        }
        state.start(users[0]).unwrap();
        (state, wallet)
    }

    /// Force a known discard top and color for legality tests.
    fn set_top(state: &mut TurnCardState, card: Card) {
        state.discard.push(card);
        state.current_color = card.color;
    }

    #[test]
    fn test_full_deck_composition() {
        let deck = full_deck();
        assert_eq!(deck.len(), 108);
        let wilds = deck.iter().filter(|c| c.value == CardValue::Wild).count();
        let fours = deck
            .iter()
            .filter(|c| c.value == CardValue::WildDrawFour)
            .count();
        assert_eq!(wilds, 4);
        assert_eq!(fours, 4);
        let red_zeroes = deck
            .iter()
            .filter(|c| c.color == Some(CardColor::Red) && c.value == CardValue::Number(0))
            .count();
        assert_eq!(red_zeroes, 1);
    }

    #[test]
    fn test_start_deals_and_flips_number_starter() {
        let (state, _) = started_room(&["x", "y"]);
        assert_eq!(state.phase, TurnPhase::Playing);
        for seat in &state.seats {
            assert_eq!(seat.hand.len(), 7);
        }
        let top = state.discard_top().unwrap();
        assert!(matches!(top.value, CardValue::Number(_)));
        assert!(top.color.is_some());
        assert_eq!(state.current_color, top.color);
        assert_eq!(state.current_turn, 0);
    }

    #[test]
    fn test_illegal_move_changes_nothing() {
        let (mut state, wallet) = started_room(&["x", "y"]);
        set_top(&mut state, Card::colored(CardColor::Red, CardValue::Number(5)));
        // Hand a known non-matching card to the active seat.
        state.seats[0].hand[0] = Card::colored(CardColor::Blue, CardValue::Number(7));
        let hand_before = state.seats[0].hand.clone();
        let err = state.play_card("x", 0, None, &wallet).unwrap_err();
        assert!(matches!(err, GameError::IllegalMove(_)));
        assert_eq!(state.seats[0].hand, hand_before);
        assert_eq!(state.current_turn, 0);
    }

    #[test]
    fn test_value_match_across_colors_is_legal() {
        let (mut state, wallet) = started_room(&["x", "y"]);
        set_top(&mut state, Card::colored(CardColor::Red, CardValue::Number(5)));
        state.seats[0].hand[0] = Card::colored(CardColor::Blue, CardValue::Number(5));
        state.play_card("x", 0, None, &wallet).unwrap();
        assert_eq!(state.current_turn, 1);
        assert_eq!(state.current_color, Some(CardColor::Blue));
    }

    #[test]
    fn test_wild_requires_color() {
        let (mut state, wallet) = started_room(&["x", "y"]);
        state.seats[0].hand[0] = Card::wild(CardValue::Wild);
        let err = state.play_card("x", 0, None, &wallet).unwrap_err();
        assert!(matches!(err, GameError::IllegalMove(_)));
        state
            .play_card("x", 0, Some(CardColor::Green), &wallet)
            .unwrap();
        assert_eq!(state.current_color, Some(CardColor::Green));
    }

    #[test]
    fn test_plus_two_stack_and_discharge() {
        let (mut state, wallet) = started_room(&["x", "y", "z"]);
        set_top(&mut state, Card::colored(CardColor::Red, CardValue::Number(5)));
        state.seats[0].hand[0] = Card::colored(CardColor::Red, CardValue::DrawTwo);
        state.seats[1].hand[0] = Card::colored(CardColor::Blue, CardValue::DrawTwo);
        state.play_card("x", 0, None, &wallet).unwrap();
        assert_eq!(state.pending_draw, 2);
        assert_eq!(state.current_turn, 1);
        // Stacking by value is legal even across colors.
        state.play_card("y", 0, None, &wallet).unwrap();
        assert_eq!(state.pending_draw, 4);
        assert_eq!(state.current_turn, 2);
        // Z cannot play a non-+2 while the penalty is pending.
        state.seats[2].hand[0] = Card::colored(CardColor::Blue, CardValue::Number(3));
        let err = state.play_card("z", 0, None, &wallet).unwrap_err();
        assert!(matches!(err, GameError::IllegalMove(_)));
        // Drawing discharges all four cards and skips the seat.
        let before = state.seats[2].hand.len();
        state.draw_card("z", false, None, &wallet).unwrap();
        assert_eq!(state.seats[2].hand.len(), before + 4);
        assert_eq!(state.pending_draw, 0);
        assert_eq!(state.current_turn, 0);
    }

    #[test]
    fn test_wild_draw_four_immediate() {
        let (mut state, wallet) = started_room(&["x", "y", "z"]);
        state.seats[0].hand[0] = Card::wild(CardValue::WildDrawFour);
        let y_before = state.seats[1].hand.len();
        state
            .play_card("x", 0, Some(CardColor::Red), &wallet)
            .unwrap();
        assert_eq!(state.seats[1].hand.len(), y_before + 4);
        assert_eq!(state.current_color, Some(CardColor::Red));
        // Y is skipped; Z is up.
        assert_eq!(state.current_turn, 2);
    }

    #[test]
    fn test_reverse_two_seats_acts_like_skip() {
        let (mut state, wallet) = started_room(&["x", "y"]);
        set_top(&mut state, Card::colored(CardColor::Red, CardValue::Number(5)));
        state.seats[0].hand[0] = Card::colored(CardColor::Red, CardValue::Reverse);
        state.play_card("x", 0, None, &wallet).unwrap();
        assert_eq!(state.current_turn, 0);
    }

    #[test]
    fn test_draw_to_play() {
        let (mut state, wallet) = started_room(&["x", "y"]);
        set_top(&mut state, Card::colored(CardColor::Red, CardValue::Number(5)));
        // Rig the stock so the drawn card matches.
        state
            .stock
            .push(Card::colored(CardColor::Red, CardValue::Number(8)));
        let before = state.seats[0].hand.len();
        state.draw_card("x", true, None, &wallet).unwrap();
        // Drawn and immediately played: hand size unchanged, turn advanced.
        assert_eq!(state.seats[0].hand.len(), before);
        assert_eq!(
            state.discard_top().unwrap().value,
            CardValue::Number(8)
        );
        assert_eq!(state.current_turn, 1);
    }

    #[test]
    fn test_draw_without_play_ends_turn() {
        let (mut state, wallet) = started_room(&["x", "y"]);
        set_top(&mut state, Card::colored(CardColor::Red, CardValue::Number(5)));
        state
            .stock
            .push(Card::colored(CardColor::Blue, CardValue::Number(9)));
        state.current_color = Some(CardColor::Red);
        let before = state.seats[0].hand.len();
        state.draw_card("x", true, None, &wallet).unwrap();
        assert_eq!(state.seats[0].hand.len(), before + 1);
        assert_eq!(state.current_turn, 1);
    }

    #[test]
    fn test_win_and_settlement_conservation() {
        let (mut state, wallet) = started_room(&["x", "y"]);
        set_top(&mut state, Card::colored(CardColor::Red, CardValue::Number(5)));
        state.seats[0].hand = vec![Card::colored(CardColor::Red, CardValue::Number(9))];
        let before = wallet.balance("x");
        state.play_card("x", 0, None, &wallet).unwrap();
        assert_eq!(
            state.phase,
            TurnPhase::Finished {
                winner: Some("x".into())
            }
        );
        // Entry 50 each, pot 100, zero edge.
        assert_eq!(wallet.balance("x"), before + Amount::from_units(100));
        let totals = wallet.ledger().round_totals("room-1");
        assert_eq!(totals.house_take(), Amount::ZERO);
    }

    #[test]
    fn test_turn_timeout_forces_draw() {
        let (mut state, _wallet) = started_room(&["x", "y"]);
        let before = state.seats[0].hand.len();
        state.handle_turn_timeout().unwrap();
        assert_eq!(state.seats[0].hand.len(), before + 1);
        assert_eq!(state.current_turn, 1);
    }

    #[test]
    fn test_uno_challenge_penalty() {
        let (mut state, wallet) = started_room(&["x", "y"]);
        set_top(&mut state, Card::colored(CardColor::Red, CardValue::Number(5)));
        state.seats[0].hand = vec![
            Card::colored(CardColor::Red, CardValue::Number(9)),
            Card::colored(CardColor::Blue, CardValue::Number(2)),
        ];
        state.play_card("x", 0, None, &wallet).unwrap();
        assert!(state.reach.is_some());
        // Y challenges before X calls: X draws 2.
        state.call_uno("y").unwrap();
        assert_eq!(state.seats[0].hand.len(), 3);
        assert!(state.reach.is_none());
    }

    #[test]
    fn test_uno_call_in_time_is_safe() {
        let (mut state, wallet) = started_room(&["x", "y"]);
        set_top(&mut state, Card::colored(CardColor::Red, CardValue::Number(5)));
        state.seats[0].hand = vec![
            Card::colored(CardColor::Red, CardValue::Number(9)),
            Card::colored(CardColor::Blue, CardValue::Number(2)),
        ];
        state.play_card("x", 0, None, &wallet).unwrap();
        state.call_uno("x").unwrap();
        // A later challenge bounces.
        let err = state.call_uno("y").unwrap_err();
        assert!(matches!(err, GameError::IllegalMove(_)));
        assert_eq!(state.seats[0].hand.len(), 1);
    }

    #[test]
    fn test_reshuffle_uses_seeded_rng() {
        let run = || {
            let (mut state, wallet) = started_room(&["x", "y"]);
            state.stock.clear();
            for n in 1..=5 {
                state
                    .discard
                    .push(Card::colored(CardColor::Red, CardValue::Number(n)));
            }
            state.draw_card("x", false, None, &wallet).unwrap();
            (state.seats[0].hand.clone(), state.stock.clone())
        };
        // Same seed, same round: the mid-game reshuffle replays identically.
        let (hand_a, stock_a) = run();
        let (hand_b, stock_b) = run();
        assert_eq!(hand_a, hand_b);
        assert_eq!(stock_a, stock_b);
        // Five discards recycled under the kept top, one drawn.
        assert_eq!(stock_a.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncalled_reach_penalized_even_after_window() {
        let (mut state, wallet) = started_room(&["x", "y"]);
        set_top(&mut state, Card::colored(CardColor::Red, CardValue::Number(5)));
        state.seats[0].hand = vec![
            Card::colored(CardColor::Red, CardValue::Number(9)),
            Card::colored(CardColor::Blue, CardValue::Number(2)),
        ];
        state.play_card("x", 0, None, &wallet).unwrap();
        // The call window lapses quietly.
        tokio::time::advance(Duration::from_secs(6)).await;
        // Y ends a turn; X's turn arrives without a call: 2-card penalty.
        state.draw_card("y", false, None, &wallet).unwrap();
        assert_eq!(state.current_turn, 0);
        assert_eq!(state.seats[0].hand.len(), 3);
        assert!(state.reach.is_none());
    }

    #[test]
    fn test_leave_waiting_refunds() {
        let wallet = test_wallet(&["x", "y"]);
        let mut state = waiting_room("x", 4);
        wallet
            .debit("x", Amount::from_units(50), "room-1", &bet_leg(ENTRY_SLOT), "entry")
            .unwrap();
        state.join("y", "y", &wallet).unwrap();
        assert_eq!(wallet.balance("y"), Amount::from_units(950));
        state.leave("y", &wallet).unwrap();
        assert_eq!(wallet.balance("y"), Amount::from_units(1_000));
        assert_eq!(state.seats.len(), 1);
    }

    #[test]
    fn test_leave_during_play_forfeits_and_last_seat_wins() {
        let (mut state, wallet) = started_room(&["x", "y"]);
        let y_before = wallet.balance("y");
        state.leave("x", &wallet).unwrap();
        assert_eq!(
            state.phase,
            TurnPhase::Finished {
                winner: Some("y".into())
            }
        );
        // Y takes the whole pot: both entries.
        assert_eq!(wallet.balance("y"), y_before + Amount::from_units(100));
    }

    #[test]
    fn test_host_delete_refunds_all() {
        let wallet = test_wallet(&["x", "y"]);
        let mut state = waiting_room("x", 3);
        wallet
            .debit("x", Amount::from_units(50), "room-1", &bet_leg(ENTRY_SLOT), "entry")
            .unwrap();
        state.join("y", "y", &wallet).unwrap();
        state.delete("x", &wallet).unwrap();
        assert_eq!(wallet.balance("x"), Amount::from_units(1_000));
        assert_eq!(wallet.balance("y"), Amount::from_units(1_000));
        assert!(matches!(state.phase, TurnPhase::Finished { winner: None }));
    }

    #[test]
    fn test_public_view_hides_hands() {
        let (state, _) = started_room(&["x", "y"]);
        let view = state.public_view();
        let rendered = view.to_string();
        assert!(!rendered.contains("\"hand\":"));
        assert_eq!(view["seats"][0]["hand_count"], 7);
    }

    #[test]
    fn test_disconnect_extends_active_deadline() {
        let (mut state, _wallet) = started_room(&["x", "y"]);
        let before = state.turn_deadline.unwrap();
        state.handle_disconnect("x").unwrap();
        let after = state.turn_deadline.unwrap();
        assert!(after > before);
        assert!(!state.seats[0].connected);
        state.handle_reconnect("x").unwrap();
        assert!(state.seats[0].connected);
    }
}
