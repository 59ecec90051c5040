//! Storage layer
//!
//! [`Storage`] is the persistence boundary the ledger is constructed with.
//! [`RocksStorage`] is the durable implementation.
//!
//! # Column Families
//!
//! - `accounts` - Account rows (key: user_id)
//! - `transactions` - Append-only transaction log (key: user_id || sequence)
//! - `indices` - Secondary indices:
//!   - `e` || expires_at_ms || user_id || sequence -> empty (Earn expiry)
//!   - `r` || user_id || type || reference_type || 0 || reference_id -> transaction key
//!   - `q` || user_id -> empty (accounts queued for the expiry sweep)

use crate::{
    error::{Error, Result},
    types::{Account, PointTransaction, Reference, TransactionType, UserId},
    Config,
};
use chrono::{DateTime, Utc};
use rocksdb::{
    BlockBasedOptions, BoundColumnFamily, ColumnFamilyDescriptor, DBCompressionType, Direction,
    IteratorMode, Options, WriteBatch, WriteOptions, DB,
};
use std::sync::Arc;

/// Persistence boundary for the ledger.
///
/// Implementations must make [`Storage::commit`] all-or-nothing and serve the
/// read methods from a single point-in-time view, so a read never observes
/// an account row without the transaction committed alongside it.
pub trait Storage: Send + Sync {
    /// Load one account
    fn get_account(&self, user_id: UserId) -> Result<Option<Account>>;

    /// Load one account with its full history (ascending sequence) from one snapshot
    fn account_history(&self, user_id: UserId)
        -> Result<Option<(Account, Vec<PointTransaction>)>>;

    /// Find the transaction posted for a (user, type, reference) triple
    fn find_by_reference(
        &self,
        user_id: UserId,
        tx_type: TransactionType,
        reference: &Reference,
    ) -> Result<Option<PointTransaction>>;

    /// Earn transactions with `after < expires_at <= until`, ordered by `expires_at`
    fn earn_expiring(
        &self,
        after: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PointTransaction>>;

    /// All accounts, ordered by user id
    fn accounts(&self) -> Result<Vec<Account>>;

    /// Up to `limit` accounts flagged with `needs_sweep`, ordered by user id
    fn sweep_queue(&self, limit: usize) -> Result<Vec<UserId>>;

    /// Atomically write the account row and, if given, the transaction appended with it
    fn commit(&self, account: &Account, transaction: Option<&PointTransaction>) -> Result<()>;
}

/// Column family names
const CF_ACCOUNTS: &str = "accounts";
const CF_TRANSACTIONS: &str = "transactions";
const CF_INDICES: &str = "indices";

/// Index tags
const IDX_EXPIRY: u8 = b'e';
const IDX_REFERENCE: u8 = b'r';
const IDX_SWEEP: u8 = b'q';

const EXPIRY_KEY_LEN: usize = 25;

/// RocksDB-backed storage
pub struct RocksStorage {
    db: Arc<DB>,
    sync_writes: bool,
}

impl std::fmt::Debug for RocksStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStorage")
            .field("path", &self.db.path())
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl RocksStorage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ACCOUNTS, Self::cf_options_accounts()),
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Self::cf_options_transactions()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened points store");

        Ok(Self {
            db: Arc::new(db),
            sync_writes: config.rocksdb.sync_writes,
        })
    }

    // Column family options

    fn cf_options_accounts() -> Options {
        let mut opts = Options::default();
        // Accounts are read on every posting, use LZ4 for speed
        opts.set_compression_type(DBCompressionType::Lz4);
        opts
    }

    fn cf_options_transactions() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(DBCompressionType::Zstd);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(DBCompressionType::Lz4);
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }
}

impl Storage for RocksStorage {
    fn get_account(&self, user_id: UserId) -> Result<Option<Account>> {
        let cf = self.cf(CF_ACCOUNTS)?;
        match self.db.get_cf(&cf, account_key(user_id))? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn account_history(
        &self,
        user_id: UserId,
    ) -> Result<Option<(Account, Vec<PointTransaction>)>> {
        let cf_accounts = self.cf(CF_ACCOUNTS)?;
        let cf_transactions = self.cf(CF_TRANSACTIONS)?;
        let snapshot = self.db.snapshot();

        let prefix = account_key(user_id);
        let account: Account = match snapshot.get_cf(&cf_accounts, prefix)? {
            Some(value) => bincode::deserialize(&value)?,
            None => return Ok(None),
        };

        let mut transactions = Vec::with_capacity(account.next_sequence as usize);
        let iter = snapshot.iterator_cf(
            &cf_transactions,
            IteratorMode::From(&prefix, Direction::Forward),
        );
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            transactions.push(bincode::deserialize(&value)?);
        }

        Ok(Some((account, transactions)))
    }

    fn find_by_reference(
        &self,
        user_id: UserId,
        tx_type: TransactionType,
        reference: &Reference,
    ) -> Result<Option<PointTransaction>> {
        let cf_indices = self.cf(CF_INDICES)?;
        let cf_transactions = self.cf(CF_TRANSACTIONS)?;
        let snapshot = self.db.snapshot();

        let tx_key = match snapshot.get_cf(&cf_indices, reference_key(user_id, tx_type, reference))? {
            Some(tx_key) => tx_key,
            None => return Ok(None),
        };

        let value = snapshot.get_cf(&cf_transactions, &tx_key)?.ok_or_else(|| {
            Error::InvariantViolation(format!(
                "Reference {} for user {} points at a missing transaction",
                reference, user_id
            ))
        })?;

        Ok(Some(bincode::deserialize(&value)?))
    }

    fn earn_expiring(
        &self,
        after: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PointTransaction>> {
        let cf_indices = self.cf(CF_INDICES)?;
        let cf_transactions = self.cf(CF_TRANSACTIONS)?;
        let snapshot = self.db.snapshot();

        let mut start = vec![IDX_EXPIRY];
        if let Some(after) = after {
            start.extend_from_slice(&millis_key(after));
        }
        let until_key = millis_key(until);

        let mut found = Vec::new();
        if limit == 0 {
            return Ok(found);
        }

        let iter = snapshot.iterator_cf(&cf_indices, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if key.len() != EXPIRY_KEY_LEN || key[0] != IDX_EXPIRY {
                break;
            }
            if key[1..9] > until_key[..] {
                break;
            }

            let user_id = UserId::new(read_u64(&key[9..17])?);
            let sequence = read_u64(&key[17..25])?;
            let value = snapshot
                .get_cf(&cf_transactions, transaction_key(user_id, sequence))?
                .ok_or_else(|| {
                    Error::InvariantViolation(format!(
                        "Expiry index points at missing transaction {}/{}",
                        user_id, sequence
                    ))
                })?;
            let tx: PointTransaction = bincode::deserialize(&value)?;

            // Index keys are millisecond-precision; compare exact deadlines.
            let in_window = match tx.expires_at {
                Some(at) => after.map_or(true, |after| at > after) && at <= until,
                None => false,
            };
            if in_window {
                found.push(tx);
                if found.len() >= limit {
                    break;
                }
            }
        }

        Ok(found)
    }

    fn accounts(&self) -> Result<Vec<Account>> {
        let cf = self.cf(CF_ACCOUNTS)?;
        let snapshot = self.db.snapshot();

        let mut accounts = Vec::new();
        for item in snapshot.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            accounts.push(bincode::deserialize(&value)?);
        }

        Ok(accounts)
    }

    fn sweep_queue(&self, limit: usize) -> Result<Vec<UserId>> {
        let cf = self.cf(CF_INDICES)?;
        let snapshot = self.db.snapshot();

        let mut queued = Vec::new();
        if limit == 0 {
            return Ok(queued);
        }
        let start = [IDX_SWEEP];
        for item in snapshot.iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, _) = item?;
            if key.len() != 9 || key[0] != IDX_SWEEP {
                break;
            }
            queued.push(UserId::new(read_u64(&key[1..])?));
            if queued.len() >= limit {
                break;
            }
        }

        Ok(queued)
    }

    fn commit(&self, account: &Account, transaction: Option<&PointTransaction>) -> Result<()> {
        let mut batch = WriteBatch::default();

        // 1. Account row
        let cf_accounts = self.cf(CF_ACCOUNTS)?;
        batch.put_cf(&cf_accounts, account_key(account.user_id), bincode::serialize(account)?);

        let cf_indices = self.cf(CF_INDICES)?;
        if account.needs_sweep {
            batch.put_cf(&cf_indices, sweep_key(account.user_id), b"");
        } else {
            batch.delete_cf(&cf_indices, sweep_key(account.user_id));
        }

        if let Some(tx) = transaction {
            // 2. Transaction row
            let cf_transactions = self.cf(CF_TRANSACTIONS)?;
            let tx_key = transaction_key(tx.user_id, tx.sequence);
            batch.put_cf(&cf_transactions, tx_key, bincode::serialize(tx)?);

            // 3. Indices
            if let (TransactionType::Earn, Some(expires_at)) = (tx.tx_type, tx.expires_at) {
                batch.put_cf(&cf_indices, expiry_key(expires_at, tx.user_id, tx.sequence), b"");
            }
            if tx.reference_id != 0 {
                batch.put_cf(
                    &cf_indices,
                    reference_key(tx.user_id, tx.tx_type, &tx.reference()),
                    tx_key,
                );
            }
        }

        // Atomic commit
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        tracing::debug!(
            user_id = %account.user_id,
            balance = account.balance,
            sequence = transaction.map(|tx| tx.sequence),
            "Account committed"
        );

        Ok(())
    }
}

// Key helpers

fn account_key(user_id: UserId) -> [u8; 8] {
    user_id.as_u64().to_be_bytes()
}

fn transaction_key(user_id: UserId, sequence: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&user_id.as_u64().to_be_bytes());
    key[8..].copy_from_slice(&sequence.to_be_bytes());
    key
}

/// Order-preserving encoding of a signed millisecond timestamp
fn millis_key(at: DateTime<Utc>) -> [u8; 8] {
    ((at.timestamp_millis() as u64) ^ (1 << 63)).to_be_bytes()
}

fn expiry_key(expires_at: DateTime<Utc>, user_id: UserId, sequence: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(EXPIRY_KEY_LEN);
    key.push(IDX_EXPIRY);
    key.extend_from_slice(&millis_key(expires_at));
    key.extend_from_slice(&transaction_key(user_id, sequence));
    key
}

fn sweep_key(user_id: UserId) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = IDX_SWEEP;
    key[1..].copy_from_slice(&account_key(user_id));
    key
}

fn reference_key(user_id: UserId, tx_type: TransactionType, reference: &Reference) -> Vec<u8> {
    let mut key = Vec::with_capacity(18 + reference.kind.len());
    key.push(IDX_REFERENCE);
    key.extend_from_slice(&account_key(user_id));
    key.push(tx_type as u8);
    key.extend_from_slice(reference.kind.as_bytes());
    key.push(0);
    key.extend_from_slice(&reference.id.to_be_bytes());
    key
}

fn read_u64(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Storage("Malformed index key".to_string()))?;
    Ok(u64::from_be_bytes(raw))
}

/// Behaviour every [`Storage`] implementation must share
#[cfg(test)]
pub(crate) mod conformance {
    use super::*;
    use crate::types::TransactionStatus;
    use chrono::Duration;
    use uuid::Uuid;

    pub(crate) fn post(
        account: &mut Account,
        tx_type: TransactionType,
        delta: i64,
        reference: Reference,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> PointTransaction {
        let sequence = account.apply(tx_type, delta, now).unwrap();
        PointTransaction {
            transaction_id: Uuid::now_v7(),
            account_id: account.account_id,
            user_id: account.user_id,
            sequence,
            tx_type,
            amount: delta,
            balance: account.balance,
            reference_type: reference.kind,
            reference_id: reference.id,
            description: format!("{} {}", tx_type, delta),
            notes: None,
            expires_at,
            status: TransactionStatus::Completed,
            created_at: now,
        }
    }

    pub(crate) fn exercise(storage: &dyn Storage) {
        let now = Utc::now();
        let alice = UserId::new(1);
        let bob = UserId::new(2);

        assert!(storage.get_account(alice).unwrap().is_none());
        assert!(storage.account_history(alice).unwrap().is_none());

        let mut a = Account::open(alice, 30, now);
        let tx0 = post(&mut a, TransactionType::Earn, 100, Reference::order(11), Some(now + Duration::days(30)), now);
        storage.commit(&a, Some(&tx0)).unwrap();
        let tx1 = post(&mut a, TransactionType::Redeem, -40, Reference::order(12), None, now);
        storage.commit(&a, Some(&tx1)).unwrap();

        let mut b = Account::open(bob, 30, now);
        let tx2 = post(&mut b, TransactionType::Earn, 5, Reference::order(13), Some(now + Duration::days(2)), now);
        storage.commit(&b, Some(&tx2)).unwrap();

        // Account rows and history
        let (account, history) = storage.account_history(alice).unwrap().unwrap();
        assert_eq!(account.balance, 60);
        assert_eq!(history, vec![tx0.clone(), tx1.clone()]);
        assert_eq!(storage.get_account(bob).unwrap().unwrap().balance, 5);

        // Reference index is per (user, type, reference)
        let found = storage
            .find_by_reference(alice, TransactionType::Redeem, &Reference::order(12))
            .unwrap();
        assert_eq!(found, Some(tx1.clone()));
        assert!(storage
            .find_by_reference(alice, TransactionType::Earn, &Reference::order(12))
            .unwrap()
            .is_none());
        assert!(storage
            .find_by_reference(bob, TransactionType::Redeem, &Reference::order(12))
            .unwrap()
            .is_none());

        // Expiry index, ordered by deadline, bounds exclusive/inclusive
        let soon = storage.earn_expiring(None, now + Duration::days(60), 10).unwrap();
        assert_eq!(soon, vec![tx2.clone(), tx0.clone()]);
        let after_bob = storage
            .earn_expiring(Some(now + Duration::days(2)), now + Duration::days(30), 10)
            .unwrap();
        assert_eq!(after_bob, vec![tx0.clone()]);
        let limited = storage.earn_expiring(None, now + Duration::days(60), 1).unwrap();
        assert_eq!(limited, vec![tx2.clone()]);
        assert!(storage.earn_expiring(None, now, 10).unwrap().is_empty());

        // Account-only commit (administration) writes no transaction
        a.is_active = false;
        storage.commit(&a, None).unwrap();
        let (account, history) = storage.account_history(alice).unwrap().unwrap();
        assert!(!account.is_active);
        assert_eq!(history.len(), 2);

        // Sweep queue follows the account flag
        assert!(storage.sweep_queue(10).unwrap().is_empty());
        a.needs_sweep = true;
        storage.commit(&a, None).unwrap();
        b.needs_sweep = true;
        storage.commit(&b, None).unwrap();
        assert_eq!(storage.sweep_queue(10).unwrap(), vec![alice, bob]);
        assert_eq!(storage.sweep_queue(1).unwrap(), vec![alice]);
        a.needs_sweep = false;
        storage.commit(&a, None).unwrap();
        assert_eq!(storage.sweep_queue(10).unwrap(), vec![bob]);

        let accounts = storage.accounts().unwrap();
        assert_eq!(
            accounts.iter().map(|a| a.user_id).collect::<Vec<_>>(),
            vec![alice, bob]
        );
    }
}
