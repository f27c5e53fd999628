//! Wire protocol: client commands in, server frames out.
//!
//! Client → server messages are `{op, room_id, payload}`; parsing is an
//! exhaustive match over `op`, so an unknown op is a validation error before
//! any engine sees it. Server → client frames are
//! `{type, room_id, version, payload}` where `version` is the room's
//! monotonic counter at emission.

use crate::errors::{ErrorCode, GameError, GameResult};
use crate::games::pool_flip::FlipSide;
use crate::games::turn_card::CardColor;
use crate::money::{Amount, Mult};
use crate::UserId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The three game kinds a room can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameKind {
    Crash,
    TurnCard,
    PoolFlip,
}

impl std::fmt::Display for GameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GameKind::Crash => write!(f, "crash"),
            GameKind::TurnCard => write!(f, "turn_card"),
            GameKind::PoolFlip => write!(f, "pool_flip"),
        }
    }
}

/// Raw client message as it arrives on the socket.
#[derive(Debug, Clone, Deserialize)]
pub struct RawCommand {
    pub op: String,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// Parsed, typed client operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientOp {
    Subscribe,
    Unsubscribe,
    /// Crash and pool-flip bet intake share the op name; the owning engine
    /// picks the fields it needs and rejects the rest.
    PlaceBet {
        amount: Amount,
        slot: Option<u8>,
        auto_cashout: Option<Mult>,
        side: Option<FlipSide>,
    },
    CashOut {
        slot: u8,
    },
    CreateRoom {
        entry_amount: Amount,
        max_seats: usize,
    },
    Join,
    Leave,
    Delete,
    ToggleReady,
    Start,
    PlayCard {
        card_index: usize,
        wild_color: Option<CardColor>,
    },
    DrawCard {
        play_if_legal: bool,
        wild_color: Option<CardColor>,
    },
    CallUno,
}

impl ClientOp {
    /// Ops that do not address an existing room.
    pub fn is_roomless(&self) -> bool {
        matches!(self, ClientOp::CreateRoom { .. })
    }
}

#[derive(Deserialize)]
struct PlaceBetPayload {
    amount: Amount,
    #[serde(default)]
    slot: Option<u8>,
    #[serde(default)]
    auto_cashout: Option<Mult>,
    #[serde(default)]
    side: Option<FlipSide>,
}

#[derive(Deserialize)]
struct CashOutPayload {
    slot: u8,
    /// Client-side display multiplier; accepted and ignored, payout is
    /// always at the server's current multiplier.
    #[serde(default)]
    #[allow(dead_code)]
    at: Option<f64>,
}

#[derive(Deserialize)]
struct CreateRoomPayload {
    entry_amount: Amount,
    max_seats: usize,
}

#[derive(Deserialize)]
struct PlayCardPayload {
    card_index: usize,
    #[serde(default)]
    wild_color: Option<CardColor>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct DrawCardPayload {
    play_if_legal: bool,
    wild_color: Option<CardColor>,
}

/// Parse a raw command into a typed op. Malformed payloads and unknown ops
/// are validation errors with no state change.
pub fn parse_command(raw: &RawCommand) -> GameResult<ClientOp> {
    fn payload<T: serde::de::DeserializeOwned>(raw: &RawCommand) -> GameResult<T> {
        serde_json::from_value(raw.payload.clone())
            .map_err(|e| GameError::Validation(format!("payload for '{}': {}", raw.op, e)))
    }

    let op = match raw.op.as_str() {
        "subscribe" => ClientOp::Subscribe,
        "unsubscribe" => ClientOp::Unsubscribe,
        "place_bet" => {
            let p: PlaceBetPayload = payload(raw)?;
            if p.amount.is_zero() || p.amount.is_negative() {
                return Err(GameError::Validation("bet amount must be positive".into()));
            }
            ClientOp::PlaceBet {
                amount: p.amount,
                slot: p.slot,
                auto_cashout: p.auto_cashout,
                side: p.side,
            }
        }
        "cash_out" => {
            let p: CashOutPayload = payload(raw)?;
            ClientOp::CashOut { slot: p.slot }
        }
        "create_room" => {
            let p: CreateRoomPayload = payload(raw)?;
            ClientOp::CreateRoom {
                entry_amount: p.entry_amount,
                max_seats: p.max_seats,
            }
        }
        "join" => ClientOp::Join,
        "leave" => ClientOp::Leave,
        "delete" => ClientOp::Delete,
        "toggle_ready" => ClientOp::ToggleReady,
        "start" => ClientOp::Start,
        "play_card" => {
            let p: PlayCardPayload = payload(raw)?;
            ClientOp::PlayCard {
                card_index: p.card_index,
                wild_color: p.wild_color,
            }
        }
        "draw_card" => {
            let p: DrawCardPayload = payload(raw)?;
            ClientOp::DrawCard {
                play_if_legal: p.play_if_legal,
                wild_color: p.wild_color,
            }
        }
        "call_uno" => ClientOp::CallUno,
        unknown => return Err(GameError::Validation(format!("unknown op '{}'", unknown))),
    };
    Ok(op)
}

/// A server-to-client message before framing.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    /// Full public view, sent on subscribe and on phase changes.
    RoomState(Value),
    /// Partial delta against the previous public view.
    Patch(Value),
    /// The recipient seat's own hand. Never fanned out to anyone else.
    PrivateHand(Value),
    /// Crash multiplier tick.
    Tick(Value),
    /// Terminal result of a round.
    RoundResult(Value),
    /// Balance update for the affected user only.
    Wallet { balance: Amount },
    Error { code: ErrorCode, message: String },
    Heartbeat { timestamp: i64 },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::RoomState(_) => "room_state",
            ServerMessage::Patch(_) => "patch",
            ServerMessage::PrivateHand(_) => "private_hand",
            ServerMessage::Tick(_) => "tick",
            ServerMessage::RoundResult(_) => "round_result",
            ServerMessage::Wallet { .. } => "wallet",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Heartbeat { .. } => "heartbeat",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            ServerMessage::RoomState(v)
            | ServerMessage::Patch(v)
            | ServerMessage::PrivateHand(v)
            | ServerMessage::Tick(v)
            | ServerMessage::RoundResult(v) => v.clone(),
            ServerMessage::Wallet { balance } => serde_json::json!({ "balance": balance }),
            ServerMessage::Error { code, message } => {
                serde_json::json!({ "code": code, "message": message })
            }
            ServerMessage::Heartbeat { timestamp } => {
                serde_json::json!({ "timestamp": timestamp })
            }
        }
    }

    pub fn error(err: &GameError) -> Self {
        ServerMessage::Error {
            code: err.code(),
            message: err.client_message(),
        }
    }
}

/// The framed wire shape of every server-to-client message.
#[derive(Debug, Clone, Serialize)]
pub struct WireFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub version: u64,
    pub payload: Value,
}

impl WireFrame {
    pub fn new(message: &ServerMessage, room_id: Option<String>, version: u64) -> Self {
        Self {
            kind: message.kind(),
            room_id,
            version,
            payload: message.payload(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Messages produced by one state mutation, before version stamping.
#[derive(Debug, Clone, Default)]
pub struct Fanout {
    pub public: Vec<ServerMessage>,
    pub private: Vec<(UserId, ServerMessage)>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn public(mut self, message: ServerMessage) -> Self {
        self.public.push(message);
        self
    }

    pub fn private(mut self, user_id: impl Into<UserId>, message: ServerMessage) -> Self {
        self.private.push((user_id.into(), message));
        self
    }

    pub fn push_public(&mut self, message: ServerMessage) {
        self.public.push(message);
    }

    pub fn push_private(&mut self, user_id: impl Into<UserId>, message: ServerMessage) {
        self.private.push((user_id.into(), message));
    }

    pub fn merge(&mut self, other: Fanout) {
        self.public.extend(other.public);
        self.private.extend(other.private);
    }

    pub fn is_empty(&self) -> bool {
        self.public.is_empty() && self.private.is_empty()
    }
}

/// A version-stamped fan-out unit as carried on a room's broadcast channel.
/// The gateway forwards `public` to every subscriber and each `private`
/// entry only to its owner.
#[derive(Debug, Clone)]
pub struct RoomEvent {
    pub room_id: String,
    pub version: u64,
    pub public: Vec<ServerMessage>,
    pub private: Vec<(UserId, ServerMessage)>,
}
