//! Finished-round archive.
//!
//! Final public state and winners of every finished round, appended as JSON
//! lines. Purely historical: nothing replays from here, so a write failure
//! is logged and swallowed rather than failing the settlement that produced
//! it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

use crate::money::Amount;
use crate::UserId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedRound {
    pub round_id: String,
    pub room_id: String,
    pub game_kind: String,
    pub finished_at: DateTime<Utc>,
    /// Final public view of the round, as broadcast to subscribers.
    pub final_state: Value,
    pub winners: Vec<ArchivedWinner>,
    pub house_take: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedWinner {
    pub user_id: UserId,
    pub payout: Amount,
}

pub struct RoundArchive {
    file: Option<Mutex<File>>,
}

impl RoundArchive {
    pub fn in_memory() -> Self {
        Self { file: None }
    }

    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Some(Mutex::new(file)),
        })
    }

    pub fn record(&self, round: ArchivedRound) {
        let Some(file) = &self.file else {
            return;
        };
        let line = match serde_json::to_string(&round) {
            Ok(line) => line,
            Err(e) => {
                warn!(round_id = %round.round_id, error = %e, "failed to encode archived round");
                return;
            }
        };
        match file.lock() {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", line) {
                    warn!(round_id = %round.round_id, error = %e, "failed to append archived round");
                }
            }
            Err(_) => warn!("round archive lock poisoned"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_archive_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rounds.jsonl");
        let archive = RoundArchive::open(&path).unwrap();
        archive.record(ArchivedRound {
            round_id: "r1".into(),
            room_id: "crash".into(),
            game_kind: "crash".into(),
            finished_at: Utc::now(),
            final_state: json!({"crash_point": 3.5}),
            winners: vec![ArchivedWinner {
                user_id: "u1".into(),
                payout: Amount::from_units(20),
            }],
            house_take: Amount::from_units(1),
        });
        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: ArchivedRound = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.round_id, "r1");
        assert_eq!(parsed.winners.len(), 1);
    }
}
