use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use crate::engine::DrawResult;
use crate::error::DrawError;
use crate::store::DrawStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("account {account_id} has {available}, needs {needed}")]
    InsufficientBalance {
        account_id: String,
        available: u64,
        needed: u64,
    },

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Debit,
    Credit,
}

/// Receipt for an applied ledger movement; handed back to [`Ledger::reverse`]
/// to undo it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: u64,
    pub account_id: String,
    pub kind: EntryKind,
    pub amount: u64,
}

/// Why a settlement did not go through. `debited` says whether the wager had
/// already been taken (and given back) when it failed.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct SettleError {
    pub debited: bool,
    pub error: DrawError,
}

impl SettleError {
    pub fn before_debit(error: impl Into<DrawError>) -> Self {
        Self {
            debited: false,
            error: error.into(),
        }
    }

    pub fn after_debit(error: impl Into<DrawError>) -> Self {
        Self {
            debited: true,
            error: error.into(),
        }
    }
}

/// Balance ledger the draw engine settles against. Each single-entry call is
/// atomic on its own; [`Ledger::settle`] is the all-or-nothing unit the engine
/// uses for a draw.
pub trait Ledger: Send + Sync {
    fn debit(
        &self,
        account_id: &str,
        amount: u64,
    ) -> impl Future<Output = Result<LedgerEntry, LedgerError>> + Send;

    fn credit(
        &self,
        account_id: &str,
        amount: u64,
    ) -> impl Future<Output = Result<LedgerEntry, LedgerError>> + Send;

    fn reverse(&self, entry: &LedgerEntry) -> impl Future<Output = Result<(), LedgerError>> + Send;

    fn balance(&self, account_id: &str) -> impl Future<Output = Result<u64, LedgerError>> + Send;

    /// Debit `result.price`, credit `result.payout` and record `result` in
    /// `store`, all or nothing. This default composes the single-entry calls
    /// and reverses what was applied when a later step fails. A ledger that
    /// shares a database with its store overrides it with one transaction.
    fn settle<S: DrawStore>(
        &self,
        result: &DrawResult,
        store: &S,
    ) -> impl Future<Output = Result<(), SettleError>> + Send {
        async move {
            let debit = self
                .debit(&result.account_id, result.price)
                .await
                .map_err(SettleError::before_debit)?;
            let credit = match self.credit(&result.account_id, result.payout).await {
                Ok(entry) => entry,
                Err(e) => {
                    reverse_entries(self, &[debit]).await;
                    return Err(SettleError::after_debit(e));
                }
            };
            if let Err(e) = store.record(result).await {
                reverse_entries(self, &[credit, debit]).await;
                return Err(SettleError::after_debit(e));
            }
            Ok(())
        }
    }
}

/// Reverse `entries` in order. A failed reversal is logged with the entry so
/// it can be repaired out of band.
async fn reverse_entries<L: Ledger + ?Sized>(ledger: &L, entries: &[LedgerEntry]) {
    for entry in entries {
        if let Err(e) = ledger.reverse(entry).await {
            error!(entry = ?entry, error = %e, "ledger reversal failed");
        }
    }
}

/// In-process ledger for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    inner: Mutex<MemoryLedgerState>,
}

#[derive(Debug, Default)]
struct MemoryLedgerState {
    balances: HashMap<String, u64>,
    next_entry: u64,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(account_id: impl Into<String>, amount: u64) -> Self {
        let ledger = Self::default();
        ledger.set_balance(account_id, amount);
        ledger
    }

    pub fn set_balance(&self, account_id: impl Into<String>, amount: u64) {
        self.state().balances.insert(account_id.into(), amount);
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryLedgerState> {
        // a panic while holding the lock cannot leave a balance half-written
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn apply(&self, account_id: &str, kind: EntryKind, amount: u64) -> Result<LedgerEntry, LedgerError> {
        let mut st = self.state();
        let current = st.balances.get(account_id).copied().unwrap_or(0);
        let next = match kind {
            EntryKind::Debit => current.checked_sub(amount).ok_or_else(|| {
                LedgerError::InsufficientBalance {
                    account_id: account_id.to_string(),
                    available: current,
                    needed: amount,
                }
            })?,
            EntryKind::Credit => current
                .checked_add(amount)
                .ok_or_else(|| LedgerError::Unavailable("balance overflow".into()))?,
        };
        st.balances.insert(account_id.to_string(), next);
        st.next_entry += 1;
        Ok(LedgerEntry {
            id: st.next_entry,
            account_id: account_id.to_string(),
            kind,
            amount,
        })
    }
}

impl Ledger for MemoryLedger {
    async fn debit(&self, account_id: &str, amount: u64) -> Result<LedgerEntry, LedgerError> {
        self.apply(account_id, EntryKind::Debit, amount)
    }

    async fn credit(&self, account_id: &str, amount: u64) -> Result<LedgerEntry, LedgerError> {
        self.apply(account_id, EntryKind::Credit, amount)
    }

    async fn reverse(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let mut st = self.state();
        let balance = st.balances.entry(entry.account_id.clone()).or_insert(0);
        *balance = match entry.kind {
            EntryKind::Debit => balance.saturating_add(entry.amount),
            EntryKind::Credit => balance.checked_sub(entry.amount).ok_or_else(|| {
                LedgerError::Unavailable(format!(
                    "cannot reverse credit {} on {}",
                    entry.id, entry.account_id
                ))
            })?,
        };
        Ok(())
    }

    async fn balance(&self, account_id: &str) -> Result<u64, LedgerError> {
        Ok(self.state().balances.get(account_id).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_debit_credit_reverse() {
        let ledger = MemoryLedger::with_balance("alice", 50);
        let debit = ledger.debit("alice", 50).await.unwrap();
        assert_eq!(ledger.balance("alice").await.unwrap(), 0);
        let credit = ledger.credit("alice", 30).await.unwrap();
        assert_eq!(ledger.balance("alice").await.unwrap(), 30);
        ledger.reverse(&credit).await.unwrap();
        ledger.reverse(&debit).await.unwrap();
        assert_eq!(ledger.balance("alice").await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_insufficient_balance_leaves_balance() {
        let ledger = MemoryLedger::with_balance("bob", 10);
        let err = ledger.debit("bob", 11).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { available: 10, needed: 11, .. }));
        assert_eq!(ledger.balance("bob").await.unwrap(), 10);
    }
}
