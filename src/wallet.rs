//! Wallet: atomic per-user balance mutation over the ledger.
//!
//! Atomicity is per user: each account sits behind its own mutex inside a
//! `DashMap`, so two debits on one user serialize while debits on distinct
//! users run in parallel. Every settlement call carries a
//! `(round_id, user, leg)` triple; a repeat of the same triple is refused and
//! the prior resulting balance returned (at-most-once settlement).

use crate::errors::{GameError, GameResult};
use crate::ledger::{Ledger, TxKind, TxRecord};
use crate::money::Amount;
use crate::UserId;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SettlementKey {
    pub round_id: String,
    pub user_id: UserId,
    pub leg: String,
}

struct Account {
    balance: Amount,
}

pub struct Wallet {
    ledger: Arc<Ledger>,
    accounts: DashMap<UserId, Arc<Mutex<Account>>>,
    /// Settlement triples already applied, mapped to the balance they
    /// produced. Rebuilt from the ledger on boot.
    settled: DashMap<SettlementKey, Amount>,
}

impl Wallet {
    /// Build a wallet over a ledger, replaying it into balances and the
    /// settlement-idempotence set.
    pub fn new(ledger: Arc<Ledger>) -> Self {
        let wallet = Self {
            ledger,
            accounts: DashMap::new(),
            settled: DashMap::new(),
        };
        let mut running = std::collections::HashMap::<UserId, Amount>::new();
        for record in wallet.ledger.entries() {
            let balance = running.entry(record.user_id.clone()).or_default();
            *balance += record.amount;
            if let (Some(round_id), Some(leg)) = (&record.round_id, &record.leg) {
                wallet.settled.insert(
                    SettlementKey {
                        round_id: round_id.clone(),
                        user_id: record.user_id.clone(),
                        leg: leg.clone(),
                    },
                    *balance,
                );
            }
        }
        for (user_id, balance) in running {
            wallet
                .accounts
                .insert(user_id, Arc::new(Mutex::new(Account { balance })));
        }
        wallet
    }

    fn account(&self, user_id: &str) -> Arc<Mutex<Account>> {
        self.accounts
            .entry(user_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Account {
                    balance: Amount::ZERO,
                }))
            })
            .clone()
    }

    pub fn has_account(&self, user_id: &str) -> bool {
        self.accounts.contains_key(user_id)
    }

    /// Consistent balance read.
    pub fn balance(&self, user_id: &str) -> Amount {
        self.account(user_id).lock().unwrap().balance
    }

    /// Welcome grant for a freshly registered user.
    pub fn grant_bonus(&self, user_id: &str, amount: Amount) -> GameResult<Amount> {
        self.credit_inner(user_id, amount, TxKind::BonusGrant, None, None, "welcome bonus")
    }

    /// Debit `amount` from `user_id`. Fails with `insufficient_funds` when
    /// the balance cannot cover it. Returns the new balance.
    pub fn debit(
        &self,
        user_id: &str,
        amount: Amount,
        round_id: &str,
        leg: &str,
        description: &str,
    ) -> GameResult<Amount> {
        if amount.is_negative() || amount.is_zero() {
            return Err(GameError::Validation("debit amount must be positive".into()));
        }
        let key = SettlementKey {
            round_id: round_id.to_string(),
            user_id: user_id.to_string(),
            leg: leg.to_string(),
        };
        let account = self.account(user_id);
        let mut account = account.lock().unwrap();
        if let Some(prior) = self.settled.get(&key) {
            warn!(user_id, round_id, leg, "duplicate debit refused");
            return Ok(*prior);
        }
        if account.balance < amount {
            return Err(GameError::InsufficientFunds {
                balance: account.balance,
                needed: amount,
            });
        }
        self.ledger.append(TxRecord::new(
            user_id.to_string(),
            -amount,
            TxKind::BetDebit,
            Some(round_id.to_string()),
            Some(leg.to_string()),
            description,
        ))?;
        account.balance -= amount;
        self.settled.insert(key, account.balance);
        Ok(account.balance)
    }

    /// Credit `amount` to `user_id`. Always succeeds unless the store fails.
    pub fn credit(
        &self,
        user_id: &str,
        amount: Amount,
        kind: TxKind,
        round_id: &str,
        leg: &str,
        description: &str,
    ) -> GameResult<Amount> {
        if amount.is_negative() {
            return Err(GameError::Validation("credit amount must be non-negative".into()));
        }
        if !matches!(kind, TxKind::BetRefund | TxKind::PayoutCredit) {
            return Err(GameError::Internal(format!(
                "credit with non-settlement kind {:?}",
                kind
            )));
        }
        self.credit_inner(
            user_id,
            amount,
            kind,
            Some(round_id.to_string()),
            Some(leg.to_string()),
            description,
        )
    }

    fn credit_inner(
        &self,
        user_id: &str,
        amount: Amount,
        kind: TxKind,
        round_id: Option<String>,
        leg: Option<String>,
        description: &str,
    ) -> GameResult<Amount> {
        let key = match (&round_id, &leg) {
            (Some(round_id), Some(leg)) => Some(SettlementKey {
                round_id: round_id.clone(),
                user_id: user_id.to_string(),
                leg: leg.clone(),
            }),
            _ => None,
        };
        let account = self.account(user_id);
        let mut account = account.lock().unwrap();
        if let Some(key) = &key {
            if let Some(prior) = self.settled.get(key) {
                warn!(user_id, leg = %key.leg, round_id = %key.round_id, "duplicate credit refused");
                return Ok(*prior);
            }
        }
        self.ledger.append(TxRecord::new(
            user_id.to_string(),
            amount,
            kind,
            round_id,
            leg,
            description,
        ))?;
        account.balance += amount;
        if let Some(key) = key {
            self.settled.insert(key, account.balance);
        }
        Ok(account.balance)
    }

    /// Signed adjustment by an operator. May be negative but must not take
    /// the balance below zero.
    pub fn admin_adjust(
        &self,
        user_id: &str,
        amount: Amount,
        description: &str,
    ) -> GameResult<Amount> {
        let account = self.account(user_id);
        let mut account = account.lock().unwrap();
        let next = account.balance + amount;
        if next.is_negative() {
            return Err(GameError::WouldGoNegative);
        }
        self.ledger.append(TxRecord::new(
            user_id.to_string(),
            amount,
            TxKind::AdminAdjust,
            None,
            None,
            description,
        ))?;
        account.balance = next;
        Ok(account.balance)
    }

    /// Boot-time crash recovery: refund every bet debit that never settled.
    /// Rooms are in-memory only, so a restart orphans their open bets; this
    /// pass closes them with `bet_refund` entries.
    pub fn recover_open_bets(&self) -> GameResult<usize> {
        let open = self.ledger.unsettled_bets();
        let count = open.len();
        for bet in open {
            let balance = self.credit(
                &bet.user_id,
                bet.amount,
                TxKind::BetRefund,
                &bet.round_id,
                &crate::ledger::refund_leg(&bet.slot),
                "recovery refund after restart",
            )?;
            info!(
                user_id = %bet.user_id,
                round_id = %bet.round_id,
                slot = %bet.slot,
                amount = %bet.amount,
                balance = %balance,
                "recovered open bet"
            );
        }
        Ok(count)
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{bet_leg, payout_leg, refund_leg};

    fn wallet_with_balance(user: &str, units: i64) -> Wallet {
        let wallet = Wallet::new(Arc::new(Ledger::in_memory()));
        wallet.grant_bonus(user, Amount::from_units(units)).unwrap();
        wallet
    }

    #[test]
    fn test_debit_insufficient() {
        let wallet = wallet_with_balance("u1", 5);
        let err = wallet
            .debit("u1", Amount::from_units(10), "r1", &bet_leg("1"), "bet")
            .unwrap_err();
        assert!(matches!(err, GameError::InsufficientFunds { .. }));
        assert_eq!(wallet.balance("u1"), Amount::from_units(5));
    }

    #[test]
    fn test_duplicate_settlement_refused() {
        let wallet = wallet_with_balance("u1", 100);
        wallet
            .debit("u1", Amount::from_units(10), "r1", &bet_leg("1"), "bet")
            .unwrap();
        let first = wallet
            .credit(
                "u1",
                Amount::from_units(20),
                TxKind::PayoutCredit,
                "r1",
                &payout_leg("1"),
                "win",
            )
            .unwrap();
        let second = wallet
            .credit(
                "u1",
                Amount::from_units(20),
                TxKind::PayoutCredit,
                "r1",
                &payout_leg("1"),
                "win",
            )
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(wallet.balance("u1"), Amount::from_units(110));
        // Only one payout entry landed in the ledger.
        let payouts = wallet
            .ledger()
            .entries()
            .iter()
            .filter(|r| r.kind == TxKind::PayoutCredit)
            .count();
        assert_eq!(payouts, 1);
    }

    #[test]
    fn test_admin_adjust_zero_crossing() {
        let wallet = wallet_with_balance("u1", 10);
        let err = wallet
            .admin_adjust("u1", Amount::from_cents(-1001), "claw back")
            .unwrap_err();
        assert!(matches!(err, GameError::WouldGoNegative));
        wallet
            .admin_adjust("u1", Amount::from_units(-10), "claw back")
            .unwrap();
        assert_eq!(wallet.balance("u1"), Amount::ZERO);
    }

    #[test]
    fn test_replay_rebuilds_state() {
        let ledger = Arc::new(Ledger::in_memory());
        {
            let wallet = Wallet::new(ledger.clone());
            wallet.grant_bonus("u1", Amount::from_units(100)).unwrap();
            wallet
                .debit("u1", Amount::from_units(10), "r1", &bet_leg("1"), "bet")
                .unwrap();
        }
        let rebuilt = Wallet::new(ledger);
        assert_eq!(rebuilt.balance("u1"), Amount::from_units(90));
        // The replayed settlement key still blocks a duplicate debit.
        let balance = rebuilt
            .debit("u1", Amount::from_units(10), "r1", &bet_leg("1"), "bet")
            .unwrap();
        assert_eq!(balance, Amount::from_units(90));
    }

    #[test]
    fn test_recovery_refunds_open_bets() {
        let ledger = Arc::new(Ledger::in_memory());
        let wallet = Wallet::new(ledger.clone());
        wallet.grant_bonus("u1", Amount::from_units(100)).unwrap();
        wallet
            .debit("u1", Amount::from_units(10), "r1", &bet_leg("1"), "bet")
            .unwrap();
        wallet
            .debit("u1", Amount::from_units(5), "r1", &bet_leg("2"), "bet")
            .unwrap();
        wallet
            .credit(
                "u1",
                Amount::from_units(20),
                TxKind::PayoutCredit,
                "r1",
                &payout_leg("1"),
                "win",
            )
            .unwrap();

        // Fresh wallet over the same ledger, as after a restart.
        let rebooted = Wallet::new(ledger.clone());
        let recovered = rebooted.recover_open_bets().unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(rebooted.balance("u1"), Amount::from_units(110));
        // Every bet leg in the round is now closed.
        let totals = ledger.round_totals("r1");
        assert_eq!(totals.debits, Amount::from_units(15));
        assert_eq!(totals.refunds, Amount::from_units(5));

        // Running recovery again is a no-op.
        assert_eq!(rebooted.recover_open_bets().unwrap(), 0);
    }

    #[test]
    fn test_refund_leg_idempotent_with_recovery() {
        let ledger = Arc::new(Ledger::in_memory());
        let wallet = Wallet::new(ledger);
        wallet.grant_bonus("u1", Amount::from_units(100)).unwrap();
        wallet
            .debit("u1", Amount::from_units(10), "r1", &bet_leg("1"), "bet")
            .unwrap();
        wallet
            .credit(
                "u1",
                Amount::from_units(10),
                TxKind::BetRefund,
                "r1",
                &refund_leg("1"),
                "round aborted",
            )
            .unwrap();
        assert_eq!(wallet.recover_open_bets().unwrap(), 0);
        assert_eq!(wallet.balance("u1"), Amount::from_units(100));
    }
}
