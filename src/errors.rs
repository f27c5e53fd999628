//! Error taxonomy for the session server.
//!
//! Every command failure maps onto a stable wire code. Validation,
//! authorization, phase, economic and rule errors are surfaced to the
//! originating client only; internal errors are logged and surfaced without
//! detail.

use crate::money::Amount;
use serde::{Deserialize, Serialize};

/// Stable error codes carried on `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    NotAuthenticated,
    NotParticipant,
    NotYourTurn,
    IllegalMove,
    InsufficientFunds,
    WouldGoNegative,
    PhaseNotOpen,
    RoomNotFound,
    RoomFull,
    RateLimited,
    Internal,
}

/// Domain error for command handling. The `code()` mapping is the only part
/// a client ever sees; messages are for operators and logs.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GameError {
    #[error("malformed command: {0}")]
    Validation(String),

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("user is not a participant of this room")]
    NotParticipant,

    #[error("not this seat's turn")]
    NotYourTurn,

    #[error("illegal move: {0}")]
    IllegalMove(String),

    #[error("insufficient funds: balance {balance}, needed {needed}")]
    InsufficientFunds { balance: Amount, needed: Amount },

    #[error("adjustment would take balance below zero")]
    WouldGoNegative,

    #[error("command not accepted in the current phase: {0}")]
    PhaseNotOpen(String),

    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("room is full")]
    RoomFull,

    #[error("rate limited")]
    RateLimited,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GameError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GameError::Validation(_) => ErrorCode::Validation,
            GameError::NotAuthenticated => ErrorCode::NotAuthenticated,
            GameError::NotParticipant => ErrorCode::NotParticipant,
            GameError::NotYourTurn => ErrorCode::NotYourTurn,
            GameError::IllegalMove(_) => ErrorCode::IllegalMove,
            GameError::InsufficientFunds { .. } => ErrorCode::InsufficientFunds,
            GameError::WouldGoNegative => ErrorCode::WouldGoNegative,
            GameError::PhaseNotOpen(_) => ErrorCode::PhaseNotOpen,
            GameError::RoomNotFound(_) => ErrorCode::RoomNotFound,
            GameError::RoomFull => ErrorCode::RoomFull,
            GameError::RateLimited => ErrorCode::RateLimited,
            GameError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Message safe to surface to the client. Internal detail stays in logs.
    pub fn client_message(&self) -> String {
        match self {
            GameError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for GameError {
    fn from(e: std::io::Error) -> Self {
        GameError::Internal(format!("io: {}", e))
    }
}

impl From<serde_json::Error> for GameError {
    fn from(e: serde_json::Error) -> Self {
        GameError::Validation(e.to_string())
    }
}

pub type GameResult<T> = Result<T, GameError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        let err = GameError::IllegalMove("card not playable".into());
        assert_eq!(err.code(), ErrorCode::IllegalMove);
        assert_eq!(
            serde_json::to_string(&err.code()).unwrap(),
            "\"illegal_move\""
        );
    }

    #[test]
    fn test_internal_detail_hidden() {
        let err = GameError::Internal("ledger fsync failed".into());
        assert_eq!(err.client_message(), "internal error");
        assert!(err.to_string().contains("ledger fsync"));
    }
}
