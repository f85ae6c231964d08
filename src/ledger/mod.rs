//! Custodial bank ledger: per-account balances of a single unit of value,
//! a global cap on held funds, and a per-operation withdrawal ceiling.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub type AccountId = String;
pub type Amount = u64;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid config: {0} must be positive")]
    InvalidConfig(&'static str),
    #[error("amount must be positive")]
    ZeroAmount,
    #[error("unsolicited transfer rejected, value enters only through deposit")]
    DepositRequired,
    #[error("bank cap exceeded: attempted {attempted}, available {available}")]
    BankCapExceeded { attempted: Amount, available: Amount },
    #[error("withdraw limit exceeded: limit {limit}, requested {requested}")]
    WithdrawLimitExceeded { limit: Amount, requested: Amount },
    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance {
        available: Amount,
        requested: Amount,
    },
    #[error("transfer of {amount} to {account} failed: {reason}")]
    TransferFailed {
        account: AccountId,
        amount: Amount,
        reason: String,
    },
}

/// Failure reported by the external payout rail.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct PayoutError(pub String);

/// Outbound value-transfer primitive invoked by [`Bank::withdraw`]. The rail
/// is handed only the destination and amount; it never sees ledger state.
pub trait Settlement {
    fn pay_out(&mut self, to: &AccountId, amount: Amount) -> Result<(), PayoutError>;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    Deposited {
        account: AccountId,
        amount: Amount,
        new_balance: Amount,
    },
    Withdrawn {
        account: AccountId,
        amount: Amount,
        new_balance: Amount,
    },
}

#[derive(Clone, Debug)]
pub struct Bank {
    withdraw_limit: Amount,
    bank_cap: Amount,
    balances: BTreeMap<AccountId, Amount>,
    total_balance: Amount,
    deposit_count: u64,
    withdraw_count: u64,
    events: Vec<LedgerEvent>,
}

impl Bank {
    pub fn new(withdraw_limit: Amount, bank_cap: Amount) -> Result<Self, LedgerError> {
        if withdraw_limit == 0 {
            return Err(LedgerError::InvalidConfig("withdraw_limit"));
        }
        if bank_cap == 0 {
            return Err(LedgerError::InvalidConfig("bank_cap"));
        }
        Ok(Self {
            withdraw_limit,
            bank_cap,
            balances: BTreeMap::new(),
            total_balance: 0,
            deposit_count: 0,
            withdraw_count: 0,
            events: Vec::new(),
        })
    }

    pub fn deposit(&mut self, account: &AccountId, amount: Amount) -> Result<Amount, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        let available = self.bank_cap - self.total_balance;
        if amount > available {
            return Err(LedgerError::BankCapExceeded {
                attempted: amount,
                available,
            });
        }
        let balance = self.balances.entry(account.clone()).or_insert(0);
        *balance += amount;
        let new_balance = *balance;
        self.total_balance += amount;
        self.deposit_count += 1;
        self.events.push(LedgerEvent::Deposited {
            account: account.clone(),
            amount,
            new_balance,
        });
        Ok(new_balance)
    }

    /// Debits the account, then asks `rail` to deliver the funds. The debit
    /// commits before the rail runs, so the rail can never observe a
    /// pre-debit balance; if the rail refuses, the debit is compensated and
    /// the caller sees the exact pre-call state.
    pub fn withdraw(
        &mut self,
        account: &AccountId,
        amount: Amount,
        rail: &mut dyn Settlement,
    ) -> Result<Amount, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        if amount > self.withdraw_limit {
            return Err(LedgerError::WithdrawLimitExceeded {
                limit: self.withdraw_limit,
                requested: amount,
            });
        }
        let available = self.balance_of(account);
        if amount > available {
            return Err(LedgerError::InsufficientBalance {
                available,
                requested: amount,
            });
        }
        let balance = self.balances.entry(account.clone()).or_insert(0);
        *balance -= amount;
        let new_balance = *balance;
        self.total_balance -= amount;
        self.withdraw_count += 1;
        if let Err(err) = rail.pay_out(account, amount) {
            let balance = self.balances.entry(account.clone()).or_insert(0);
            *balance += amount;
            self.total_balance += amount;
            self.withdraw_count -= 1;
            return Err(LedgerError::TransferFailed {
                account: account.clone(),
                amount,
                reason: err.0,
            });
        }
        self.events.push(LedgerEvent::Withdrawn {
            account: account.clone(),
            amount,
            new_balance,
        });
        Ok(new_balance)
    }

    /// Guard for value arriving through any channel other than [`Bank::deposit`].
    /// Every unit held must be accounted for by exactly one deposit, so this
    /// refuses unconditionally and touches no state.
    pub fn receive_transfer(
        &mut self,
        _from: &AccountId,
        _amount: Amount,
    ) -> Result<(), LedgerError> {
        Err(LedgerError::DepositRequired)
    }

    pub fn balance_of(&self, account: &AccountId) -> Amount {
        self.balances.get(account).copied().unwrap_or(0)
    }

    pub fn total_balance(&self) -> Amount {
        self.total_balance
    }

    pub fn withdraw_limit(&self) -> Amount {
        self.withdraw_limit
    }

    pub fn bank_cap(&self) -> Amount {
        self.bank_cap
    }

    pub fn deposit_count(&self) -> u64 {
        self.deposit_count
    }

    pub fn withdraw_count(&self) -> u64 {
        self.withdraw_count
    }

    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    pub fn snapshot(&self) -> BankSnapshot {
        BankSnapshot {
            withdraw_limit: self.withdraw_limit,
            bank_cap: self.bank_cap,
            total_balance: self.total_balance,
            deposit_count: self.deposit_count,
            withdraw_count: self.withdraw_count,
            balances: self.balances.clone(),
            events: self.events.clone(),
        }
    }

    /// Rebuilds a bank from foreign state, re-checking every invariant the
    /// running ledger maintains incrementally.
    pub fn restore(snapshot: BankSnapshot) -> Result<Self, RestoreError> {
        if snapshot.withdraw_limit == 0 {
            return Err(RestoreError::InvalidConfig("withdraw_limit"));
        }
        if snapshot.bank_cap == 0 {
            return Err(RestoreError::InvalidConfig("bank_cap"));
        }
        let mut computed: Amount = 0;
        for balance in snapshot.balances.values() {
            computed = match computed.checked_add(*balance) {
                Some(sum) => sum,
                None => {
                    return Err(RestoreError::TotalMismatch {
                        recorded: snapshot.total_balance,
                        computed: Amount::MAX,
                    })
                }
            };
        }
        if computed != snapshot.total_balance {
            return Err(RestoreError::TotalMismatch {
                recorded: snapshot.total_balance,
                computed,
            });
        }
        if snapshot.total_balance > snapshot.bank_cap {
            return Err(RestoreError::CapViolated {
                total: snapshot.total_balance,
                cap: snapshot.bank_cap,
            });
        }
        Ok(Self {
            withdraw_limit: snapshot.withdraw_limit,
            bank_cap: snapshot.bank_cap,
            total_balance: snapshot.total_balance,
            deposit_count: snapshot.deposit_count,
            withdraw_count: snapshot.withdraw_count,
            balances: snapshot.balances,
            events: snapshot.events,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BankSnapshot {
    pub withdraw_limit: Amount,
    pub bank_cap: Amount,
    pub total_balance: Amount,
    pub deposit_count: u64,
    pub withdraw_count: u64,
    pub balances: BTreeMap<AccountId, Amount>,
    pub events: Vec<LedgerEvent>,
}

impl BankSnapshot {
    /// Commitment to the balance state. Events are an audit trail and stay
    /// outside the digest.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"bank-state");
        hasher.update(self.withdraw_limit.to_le_bytes());
        hasher.update(self.bank_cap.to_le_bytes());
        hasher.update(self.total_balance.to_le_bytes());
        hasher.update(self.deposit_count.to_le_bytes());
        hasher.update(self.withdraw_count.to_le_bytes());
        for (account, balance) in &self.balances {
            hasher.update(b"acct");
            hasher.update((account.len() as u64).to_le_bytes());
            hasher.update(account.as_bytes());
            hasher.update(balance.to_le_bytes());
        }
        hasher.finalize().into()
    }
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("invalid config: {0} must be positive")]
    InvalidConfig(&'static str),
    #[error("recorded total {recorded} does not match summed balances {computed}")]
    TotalMismatch { recorded: Amount, computed: Amount },
    #[error("total balance {total} exceeds bank cap {cap}")]
    CapViolated { total: Amount, cap: Amount },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingRail {
        orders: Vec<(AccountId, Amount)>,
    }

    impl Settlement for RecordingRail {
        fn pay_out(&mut self, to: &AccountId, amount: Amount) -> Result<(), PayoutError> {
            self.orders.push((to.clone(), amount));
            Ok(())
        }
    }

    struct FailingRail;

    impl Settlement for FailingRail {
        fn pay_out(&mut self, _to: &AccountId, _amount: Amount) -> Result<(), PayoutError> {
            Err(PayoutError("rail offline".into()))
        }
    }

    fn conserved(bank: &Bank) -> bool {
        let summed: Amount = bank.balances.values().sum();
        summed == bank.total_balance() && bank.total_balance() <= bank.bank_cap()
    }

    #[test]
    fn new_rejects_zero_config() {
        match Bank::new(1, 0).unwrap_err() {
            LedgerError::InvalidConfig(field) => assert_eq!(field, "bank_cap"),
            other => panic!("unexpected error: {other}"),
        }
        match Bank::new(0, 10).unwrap_err() {
            LedgerError::InvalidConfig(field) => assert_eq!(field, "withdraw_limit"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn deposit_tracks_balance_total_and_counter() {
        let mut bank = Bank::new(1, 10).unwrap();
        let alice: AccountId = "alice".into();
        let new_balance = bank.deposit(&alice, 5).unwrap();
        assert_eq!(new_balance, 5);
        assert_eq!(bank.balance_of(&alice), 5);
        assert_eq!(bank.total_balance(), 5);
        assert_eq!(bank.deposit_count(), 1);
        assert_eq!(
            bank.events(),
            &[LedgerEvent::Deposited {
                account: alice,
                amount: 5,
                new_balance: 5,
            }]
        );
        assert!(conserved(&bank));
    }

    #[test]
    fn deposit_beyond_cap_fails_with_headroom() {
        let mut bank = Bank::new(1, 10).unwrap();
        bank.deposit(&"alice".to_string(), 5).unwrap();
        let err = bank.deposit(&"bob".to_string(), 6).unwrap_err();
        match err {
            LedgerError::BankCapExceeded {
                attempted,
                available,
            } => {
                assert_eq!(attempted, 6);
                assert_eq!(available, 5);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(bank.balance_of(&"bob".to_string()), 0);
        assert_eq!(bank.total_balance(), 5);
        assert_eq!(bank.deposit_count(), 1);
        assert_eq!(bank.events().len(), 1);
    }

    #[test]
    fn deposit_exactly_filling_headroom_succeeds() {
        let mut bank = Bank::new(1, 10).unwrap();
        bank.deposit(&"alice".to_string(), 5).unwrap();
        bank.deposit(&"bob".to_string(), 5).unwrap();
        assert_eq!(bank.total_balance(), 10);
        let err = bank.deposit(&"carol".to_string(), 1).unwrap_err();
        match err {
            LedgerError::BankCapExceeded {
                attempted,
                available,
            } => {
                assert_eq!(attempted, 1);
                assert_eq!(available, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_amounts_are_rejected() {
        let mut bank = Bank::new(1, 10).unwrap();
        let alice: AccountId = "alice".into();
        assert!(matches!(
            bank.deposit(&alice, 0),
            Err(LedgerError::ZeroAmount)
        ));
        let mut rail = RecordingRail::default();
        assert!(matches!(
            bank.withdraw(&alice, 0, &mut rail),
            Err(LedgerError::ZeroAmount)
        ));
        assert!(rail.orders.is_empty());
        assert_eq!(bank.deposit_count(), 0);
        assert_eq!(bank.withdraw_count(), 0);
    }

    #[test]
    fn withdraw_above_limit_fails() {
        let mut bank = Bank::new(1, 10).unwrap();
        let alice: AccountId = "alice".into();
        bank.deposit(&alice, 5).unwrap();
        let mut rail = RecordingRail::default();
        let err = bank.withdraw(&alice, 2, &mut rail).unwrap_err();
        match err {
            LedgerError::WithdrawLimitExceeded { limit, requested } => {
                assert_eq!(limit, 1);
                assert_eq!(requested, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(bank.balance_of(&alice), 5);
        assert!(rail.orders.is_empty());
    }

    #[test]
    fn withdraw_debits_and_emits_event() {
        let mut bank = Bank::new(1, 10).unwrap();
        let alice: AccountId = "alice".into();
        bank.deposit(&alice, 5).unwrap();
        let mut rail = RecordingRail::default();
        let new_balance = bank.withdraw(&alice, 1, &mut rail).unwrap();
        assert_eq!(new_balance, 4);
        assert_eq!(bank.balance_of(&alice), 4);
        assert_eq!(bank.total_balance(), 4);
        assert_eq!(bank.withdraw_count(), 1);
        assert_eq!(rail.orders, vec![(alice.clone(), 1)]);
        assert_eq!(
            bank.events().last().unwrap(),
            &LedgerEvent::Withdrawn {
                account: alice,
                amount: 1,
                new_balance: 4,
            }
        );
        assert!(conserved(&bank));
    }

    #[test]
    fn withdraw_from_empty_account_fails() {
        let mut bank = Bank::new(5, 10).unwrap();
        let mut rail = RecordingRail::default();
        let err = bank
            .withdraw(&"nobody".to_string(), 1, &mut rail)
            .unwrap_err();
        match err {
            LedgerError::InsufficientBalance {
                available,
                requested,
            } => {
                assert_eq!(available, 0);
                assert_eq!(requested, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(rail.orders.is_empty());
    }

    #[test]
    fn deposit_then_withdraw_restores_prior_state() {
        let mut bank = Bank::new(10, 100).unwrap();
        let alice: AccountId = "alice".into();
        bank.deposit(&alice, 20).unwrap();
        let balance_before = bank.balance_of(&alice);
        let total_before = bank.total_balance();

        let mut rail = RecordingRail::default();
        bank.deposit(&alice, 7).unwrap();
        bank.withdraw(&alice, 7, &mut rail).unwrap();

        assert_eq!(bank.balance_of(&alice), balance_before);
        assert_eq!(bank.total_balance(), total_before);
        assert!(conserved(&bank));
    }

    #[test]
    fn payout_failure_rolls_back_debit() {
        let mut bank = Bank::new(5, 10).unwrap();
        let alice: AccountId = "alice".into();
        bank.deposit(&alice, 5).unwrap();
        let events_before = bank.events().len();

        let err = bank.withdraw(&alice, 3, &mut FailingRail).unwrap_err();
        match err {
            LedgerError::TransferFailed {
                account,
                amount,
                reason,
            } => {
                assert_eq!(account, alice);
                assert_eq!(amount, 3);
                assert_eq!(reason, "rail offline");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(bank.balance_of(&alice), 5);
        assert_eq!(bank.total_balance(), 5);
        assert_eq!(bank.withdraw_count(), 0);
        assert_eq!(bank.events().len(), events_before);
        assert!(conserved(&bank));
    }

    #[test]
    fn unsolicited_transfer_is_rejected() {
        let mut bank = Bank::new(1, 10).unwrap();
        let err = bank
            .receive_transfer(&"stranger".to_string(), 4)
            .unwrap_err();
        assert!(matches!(err, LedgerError::DepositRequired));
        assert_eq!(bank.total_balance(), 0);
        assert!(bank.events().is_empty());
    }

    #[test]
    fn balances_conserve_total_across_mixed_operations() {
        let mut bank = Bank::new(10, 1_000).unwrap();
        let mut rail = RecordingRail::default();
        for (account, amount) in [("alice", 300), ("bob", 450), ("carol", 150)] {
            bank.deposit(&account.to_string(), amount).unwrap();
            assert!(conserved(&bank));
        }
        bank.withdraw(&"alice".to_string(), 10, &mut rail).unwrap();
        bank.withdraw(&"bob".to_string(), 9, &mut rail).unwrap();
        bank.deposit(&"carol".to_string(), 100).unwrap();
        bank.withdraw(&"carol".to_string(), 1, &mut rail).unwrap();
        assert!(conserved(&bank));
        assert_eq!(bank.total_balance(), 980);
        assert_eq!(bank.deposit_count(), 4);
        assert_eq!(bank.withdraw_count(), 3);
        assert_eq!(
            bank.events().len() as u64,
            bank.deposit_count() + bank.withdraw_count()
        );
    }

    #[test]
    fn snapshot_restore_round_trips() {
        let mut bank = Bank::new(10, 100).unwrap();
        let mut rail = RecordingRail::default();
        bank.deposit(&"alice".to_string(), 40).unwrap();
        bank.deposit(&"bob".to_string(), 25).unwrap();
        bank.withdraw(&"alice".to_string(), 5, &mut rail).unwrap();

        let snapshot = bank.snapshot();
        let restored = Bank::restore(snapshot.clone()).unwrap();
        assert_eq!(restored.balance_of(&"alice".to_string()), 35);
        assert_eq!(restored.total_balance(), bank.total_balance());
        assert_eq!(restored.deposit_count(), bank.deposit_count());
        assert_eq!(restored.withdraw_count(), bank.withdraw_count());
        assert_eq!(restored.events(), bank.events());
        assert_eq!(restored.snapshot(), snapshot);
    }

    #[test]
    fn restore_rejects_tampered_total() {
        let mut bank = Bank::new(10, 100).unwrap();
        bank.deposit(&"alice".to_string(), 40).unwrap();
        let mut snapshot = bank.snapshot();
        snapshot.total_balance = 41;
        match Bank::restore(snapshot).unwrap_err() {
            RestoreError::TotalMismatch { recorded, computed } => {
                assert_eq!(recorded, 41);
                assert_eq!(computed, 40);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn restore_rejects_cap_violation() {
        let mut bank = Bank::new(10, 100).unwrap();
        bank.deposit(&"alice".to_string(), 40).unwrap();
        let mut snapshot = bank.snapshot();
        snapshot.bank_cap = 39;
        match Bank::restore(snapshot).unwrap_err() {
            RestoreError::CapViolated { total, cap } => {
                assert_eq!(total, 40);
                assert_eq!(cap, 39);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn restore_rejects_zero_config() {
        let bank = Bank::new(10, 100).unwrap();
        let mut snapshot = bank.snapshot();
        snapshot.withdraw_limit = 0;
        assert!(matches!(
            Bank::restore(snapshot),
            Err(RestoreError::InvalidConfig("withdraw_limit"))
        ));
    }

    #[test]
    fn state_digest_is_deterministic_and_balance_sensitive() {
        let mut bank = Bank::new(10, 100).unwrap();
        bank.deposit(&"alice".to_string(), 40).unwrap();
        let digest1 = bank.snapshot().digest();
        let digest2 = bank.snapshot().digest();
        assert_eq!(digest1, digest2);

        bank.deposit(&"bob".to_string(), 1).unwrap();
        assert_ne!(bank.snapshot().digest(), digest1);
    }
}
