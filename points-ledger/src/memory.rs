//! In-process storage
//!
//! Same contract as the RocksDB store, held behind one lock so commits and
//! reads are trivially atomic. Used for tests and for embedding the ledger
//! where durability is handled elsewhere.

use crate::{
    error::{Error, Result},
    storage::Storage,
    types::{Account, PointTransaction, Reference, TransactionType, UserId},
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};

type ReferenceKey = (UserId, TransactionType, String, u64);

#[derive(Debug, Default)]
struct Inner {
    accounts: BTreeMap<UserId, Account>,
    transactions: HashMap<UserId, Vec<PointTransaction>>,
    expiry: BTreeSet<(DateTime<Utc>, UserId, u64)>,
    references: HashMap<ReferenceKey, u64>,
    sweep_queue: BTreeSet<UserId>,
}

/// Storage held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    /// Create empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn transaction(inner: &Inner, user_id: UserId, sequence: u64) -> Result<PointTransaction> {
        inner
            .transactions
            .get(&user_id)
            .and_then(|txs| txs.get(sequence as usize))
            .cloned()
            .ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "Index points at missing transaction {}/{}",
                    user_id, sequence
                ))
            })
    }
}

impl Storage for MemoryStorage {
    fn get_account(&self, user_id: UserId) -> Result<Option<Account>> {
        Ok(self.inner.read().accounts.get(&user_id).cloned())
    }

    fn account_history(
        &self,
        user_id: UserId,
    ) -> Result<Option<(Account, Vec<PointTransaction>)>> {
        let inner = self.inner.read();
        Ok(inner.accounts.get(&user_id).map(|account| {
            let history = inner.transactions.get(&user_id).cloned().unwrap_or_default();
            (account.clone(), history)
        }))
    }

    fn find_by_reference(
        &self,
        user_id: UserId,
        tx_type: TransactionType,
        reference: &Reference,
    ) -> Result<Option<PointTransaction>> {
        let inner = self.inner.read();
        let key = (user_id, tx_type, reference.kind.clone(), reference.id);
        match inner.references.get(&key) {
            Some(&sequence) => Ok(Some(Self::transaction(&inner, user_id, sequence)?)),
            None => Ok(None),
        }
    }

    fn earn_expiring(
        &self,
        after: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PointTransaction>> {
        let inner = self.inner.read();
        inner
            .expiry
            .iter()
            .filter(|(at, _, _)| after.map_or(true, |after| *at > after) && *at <= until)
            .take(limit)
            .map(|&(_, user_id, sequence)| Self::transaction(&inner, user_id, sequence))
            .collect()
    }

    fn accounts(&self) -> Result<Vec<Account>> {
        Ok(self.inner.read().accounts.values().cloned().collect())
    }

    fn sweep_queue(&self, limit: usize) -> Result<Vec<UserId>> {
        Ok(self
            .inner
            .read()
            .sweep_queue
            .iter()
            .take(limit)
            .copied()
            .collect())
    }

    fn commit(&self, account: &Account, transaction: Option<&PointTransaction>) -> Result<()> {
        let mut inner = self.inner.write();

        if let Some(tx) = transaction {
            let history = inner.transactions.entry(tx.user_id).or_default();
            if tx.sequence != history.len() as u64 {
                return Err(Error::Storage(format!(
                    "Out-of-order append for user {}: sequence {} after {} rows",
                    tx.user_id,
                    tx.sequence,
                    history.len()
                )));
            }
            history.push(tx.clone());

            if let (TransactionType::Earn, Some(expires_at)) = (tx.tx_type, tx.expires_at) {
                inner.expiry.insert((expires_at, tx.user_id, tx.sequence));
            }
            if tx.reference_id != 0 {
                inner.references.insert(
                    (tx.user_id, tx.tx_type, tx.reference_type.clone(), tx.reference_id),
                    tx.sequence,
                );
            }
        }

        if account.needs_sweep {
            inner.sweep_queue.insert(account.user_id);
        } else {
            inner.sweep_queue.remove(&account.user_id);
        }
        inner.accounts.insert(account.user_id, account.clone());
        Ok(())
    }
}
