//! Append-only transaction ledger.
//!
//! Every balance mutation in the system is a `TxRecord` appended here, never
//! mutated. The ledger persists as a JSON-lines file and is replayed on boot
//! to rebuild balances, the settlement-idempotence set, and the
//! crash-recovery refund list (bet debits with no matching settlement leg).

use crate::errors::{GameError, GameResult};
use crate::money::Amount;
use crate::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

/// Transaction kinds. Debits are stored with negative amounts, credits
/// positive, so a plain sum over a user's records is their balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    BetDebit,
    BetRefund,
    PayoutCredit,
    AdminAdjust,
    BonusGrant,
}

/// One ledger entry. `round_id` + `leg` correlate settlement pairs: a bet
/// debit writes leg `bet/<slot>` and its settlement writes `payout/<slot>`
/// or `refund/<slot>` under the same round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRecord {
    pub id: String,
    pub user_id: UserId,
    pub amount: Amount,
    pub kind: TxKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leg: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub description: String,
}

impl TxRecord {
    pub fn new(
        user_id: UserId,
        amount: Amount,
        kind: TxKind,
        round_id: Option<String>,
        leg: Option<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            amount,
            kind,
            round_id,
            leg,
            timestamp: Utc::now(),
            description: description.into(),
        }
    }
}

/// Leg name helpers shared by engines and recovery.
pub fn bet_leg(slot: &str) -> String {
    format!("bet/{}", slot)
}

pub fn payout_leg(slot: &str) -> String {
    format!("payout/{}", slot)
}

pub fn refund_leg(slot: &str) -> String {
    format!("refund/{}", slot)
}

/// Totals for one round, used by conservation checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundTotals {
    pub debits: Amount,
    pub refunds: Amount,
    pub payouts: Amount,
}

impl RoundTotals {
    /// `Σ bet_debit − Σ bet_refund − Σ payout_credit`. Non-negative for every
    /// settled round; the positive part is the house take.
    pub fn house_take(&self) -> Amount {
        self.debits - self.refunds - self.payouts
    }
}

/// An unsettled bet found during the boot recovery scan.
#[derive(Debug, Clone)]
pub struct OpenBet {
    pub user_id: UserId,
    pub round_id: String,
    pub slot: String,
    pub amount: Amount,
}

pub struct Ledger {
    file: Option<Mutex<File>>,
    entries: RwLock<Vec<TxRecord>>,
}

impl Ledger {
    /// In-memory ledger for tests and ephemeral runs.
    pub fn in_memory() -> Self {
        Self {
            file: None,
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Open (or create) the ledger file and replay existing entries.
    pub fn open(path: &Path) -> GameResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut entries = Vec::new();
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<TxRecord>(&line) {
                    Ok(record) => entries.push(record),
                    Err(e) => {
                        // A torn final line from a crashed process is
                        // tolerated; anything earlier is corruption.
                        warn!(lineno, error = %e, "skipping unparseable ledger line");
                    }
                }
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!(path = %path.display(), entries = entries.len(), "ledger opened");
        Ok(Self {
            file: Some(Mutex::new(file)),
            entries: RwLock::new(entries),
        })
    }

    /// Append one record. The write hits disk before the in-memory mirror so
    /// a failed append never leaves a phantom balance mutation.
    pub fn append(&self, record: TxRecord) -> GameResult<()> {
        if let Some(file) = &self.file {
            let line = serde_json::to_string(&record)
                .map_err(|e| GameError::Internal(format!("ledger encode: {}", e)))?;
            let mut file = file
                .lock()
                .map_err(|_| GameError::Internal("ledger lock poisoned".into()))?;
            writeln!(file, "{}", line)?;
            file.sync_data()?;
        }
        self.entries
            .write()
            .map_err(|_| GameError::Internal("ledger lock poisoned".into()))?
            .push(record);
        Ok(())
    }

    /// Snapshot of all entries (replay order).
    pub fn entries(&self) -> Vec<TxRecord> {
        self.entries.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most recent entries for one user, newest first.
    pub fn history_for_user(&self, user_id: &str, limit: usize) -> Vec<TxRecord> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .rev()
            .filter(|r| r.user_id == user_id)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Balance of every user by replaying the log.
    pub fn replay_balances(&self) -> HashMap<UserId, Amount> {
        let mut balances: HashMap<UserId, Amount> = HashMap::new();
        for record in self.entries.read().unwrap().iter() {
            *balances.entry(record.user_id.clone()).or_default() += record.amount;
        }
        balances
    }

    /// Totals per round for conservation checks.
    pub fn round_totals(&self, round_id: &str) -> RoundTotals {
        let mut totals = RoundTotals::default();
        for record in self.entries.read().unwrap().iter() {
            if record.round_id.as_deref() != Some(round_id) {
                continue;
            }
            match record.kind {
                TxKind::BetDebit => totals.debits += -record.amount,
                TxKind::BetRefund => totals.refunds += record.amount,
                TxKind::PayoutCredit => totals.payouts += record.amount,
                TxKind::AdminAdjust | TxKind::BonusGrant => {}
            }
        }
        totals
    }

    /// Bet debits with no settlement leg in the same round. Run at boot so
    /// rooms lost on restart refund their open bets.
    pub fn unsettled_bets(&self) -> Vec<OpenBet> {
        let entries = self.entries.read().unwrap();
        let mut open: Vec<OpenBet> = Vec::new();
        let mut settled: HashMap<(String, UserId, String), ()> = HashMap::new();
        for record in entries.iter() {
            let (Some(round_id), Some(leg)) = (&record.round_id, &record.leg) else {
                continue;
            };
            if let Some(slot) = leg
                .strip_prefix("payout/")
                .or_else(|| leg.strip_prefix("refund/"))
            {
                settled.insert(
                    (round_id.clone(), record.user_id.clone(), slot.to_string()),
                    (),
                );
            }
        }
        for record in entries.iter() {
            let (Some(round_id), Some(leg)) = (&record.round_id, &record.leg) else {
                continue;
            };
            let Some(slot) = leg.strip_prefix("bet/") else {
                continue;
            };
            let key = (round_id.clone(), record.user_id.clone(), slot.to_string());
            if !settled.contains_key(&key) {
                open.push(OpenBet {
                    user_id: record.user_id.clone(),
                    round_id: round_id.clone(),
                    slot: slot.to_string(),
                    amount: -record.amount,
                });
            }
        }
        open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn debit(user: &str, round: &str, slot: &str, cents: i64) -> TxRecord {
        TxRecord::new(
            user.to_string(),
            Amount::from_cents(-cents),
            TxKind::BetDebit,
            Some(round.to_string()),
            Some(bet_leg(slot)),
            "bet",
        )
    }

    #[test]
    fn test_replay_balances() {
        let ledger = Ledger::in_memory();
        ledger
            .append(TxRecord::new(
                "u1".into(),
                Amount::from_units(100),
                TxKind::BonusGrant,
                None,
                None,
                "welcome",
            ))
            .unwrap();
        ledger.append(debit("u1", "r1", "1", 1000)).unwrap();
        let balances = ledger.replay_balances();
        assert_eq!(balances["u1"], Amount::from_cents(9000));
    }

    #[test]
    fn test_round_totals_house_take() {
        let ledger = Ledger::in_memory();
        ledger.append(debit("u1", "r1", "1", 1000)).unwrap();
        ledger.append(debit("u2", "r1", "1", 1000)).unwrap();
        ledger
            .append(TxRecord::new(
                "u1".into(),
                Amount::from_cents(1960),
                TxKind::PayoutCredit,
                Some("r1".into()),
                Some(payout_leg("1")),
                "win",
            ))
            .unwrap();
        let totals = ledger.round_totals("r1");
        assert_eq!(totals.debits, Amount::from_cents(2000));
        assert_eq!(totals.payouts, Amount::from_cents(1960));
        assert_eq!(totals.house_take(), Amount::from_cents(40));
    }

    #[test]
    fn test_unsettled_bet_detection() {
        let ledger = Ledger::in_memory();
        ledger.append(debit("u1", "r1", "1", 500)).unwrap();
        ledger.append(debit("u1", "r1", "2", 700)).unwrap();
        ledger
            .append(TxRecord::new(
                "u1".into(),
                Amount::from_cents(500),
                TxKind::BetRefund,
                Some("r1".into()),
                Some(refund_leg("1")),
                "refund",
            ))
            .unwrap();
        let open = ledger.unsettled_bets();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].slot, "2");
        assert_eq!(open[0].amount, Amount::from_cents(700));
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        {
            let ledger = Ledger::open(&path).unwrap();
            ledger.append(debit("u1", "r1", "1", 500)).unwrap();
            ledger.append(debit("u2", "r1", "1", 300)).unwrap();
        }
        let reopened = Ledger::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        let balances = reopened.replay_balances();
        assert_eq!(balances["u1"], Amount::from_cents(-500));
        assert_eq!(balances["u2"], Amount::from_cents(-300));
    }

    #[test]
    fn test_torn_line_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        {
            let ledger = Ledger::open(&path).unwrap();
            ledger.append(debit("u1", "r1", "1", 500)).unwrap();
        }
        // Simulate a crash mid-append.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"id\":\"tor").unwrap();
        drop(file);
        let reopened = Ledger::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
    }
}
