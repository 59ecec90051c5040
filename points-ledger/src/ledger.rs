//! Main ledger orchestration layer
//!
//! This module ties together storage, the clock and the writer actors into
//! the high-level API used by checkout, admin tooling and the expiry sweep.
//!
//! # Example
//!
//! ```no_run
//! use points_ledger::{Config, Ledger, Reference, UserId};
//!
//! #[tokio::main]
//! async fn main() -> points_ledger::Result<()> {
//!     let ledger = Ledger::open(Config::default()).await?;
//!     let user = UserId::new(7);
//!
//!     ledger.earn(user, 50, Reference::order(1001), "Order #1001", None).await?;
//!     let tx = ledger.redeem(user, 20, Reference::order(1002), "Order #1002").await?;
//!     assert_eq!(tx.balance, 30);
//!
//!     ledger.shutdown().await
//! }
//! ```

use crate::{
    actor::{spawn_ledger_actor, AccountUpdate, Command, LedgerHandle, PostingRules},
    clock::{Clock, SystemClock},
    metrics::Metrics,
    storage::{RocksStorage, Storage},
    sweep::{points_expiring, ExpiryNotice},
    types::{
        Account, HistoryPage, HistoryQuery, LedgerStatistics, PointTransaction, Reference,
        TransactionType, UserId,
    },
    Config, Error, Result,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Main ledger interface
pub struct Ledger {
    /// One writer per shard; accounts are routed by user id
    shards: Vec<LedgerHandle>,

    /// Writer tasks, joined on shutdown
    tasks: Vec<JoinHandle<()>>,

    /// Direct storage access (for reads)
    storage: Arc<dyn Storage>,

    /// Time source
    clock: Arc<dyn Clock>,

    /// Metrics
    metrics: Arc<Metrics>,

    /// Configuration
    config: Config,
}

impl Ledger {
    /// Open the RocksDB-backed ledger with configuration
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let storage = Arc::new(RocksStorage::open(&config)?);
        Self::with_storage(config, storage, Arc::new(SystemClock)).await
    }

    /// Build a ledger over an injected store and clock
    pub async fn with_storage(
        config: Config,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(Metrics::new()?);
        let rules = PostingRules {
            default_expiry_days: config.ledger.default_expiry_days,
            deduplicate_references: config.ledger.deduplicate_references,
        };

        let (shards, tasks) = (0..config.ledger.shards)
            .map(|shard| {
                spawn_ledger_actor(
                    shard,
                    storage.clone(),
                    clock.clone(),
                    metrics.clone(),
                    rules,
                    config.ledger.mailbox_capacity,
                )
            })
            .unzip();

        tracing::info!(
            service = %config.service_name,
            shards = config.ledger.shards,
            "Points ledger opened"
        );

        Ok(Self {
            shards,
            tasks,
            storage,
            clock,
            metrics,
            config,
        })
    }

    fn shard(&self, user_id: UserId) -> &LedgerHandle {
        let index = (user_id.as_u64() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    async fn post(&self, command: Command) -> Result<PointTransaction> {
        self.shard(command.user_id()).post(command).await
    }

    // Balance mutations

    /// Grant points, opening the account on first earn.
    ///
    /// `expiry_days` overrides the account's default validity window.
    pub async fn earn(
        &self,
        user_id: UserId,
        amount: i64,
        reference: Reference,
        description: impl Into<String>,
        expiry_days: Option<u32>,
    ) -> Result<PointTransaction> {
        self.post(Command::Earn {
            user_id,
            amount,
            reference,
            description: description.into(),
            expiry_days,
        })
        .await
    }

    /// Spend points; fails with `InsufficientBalance` rather than overdraw
    pub async fn redeem(
        &self,
        user_id: UserId,
        amount: i64,
        reference: Reference,
        description: impl Into<String>,
    ) -> Result<PointTransaction> {
        self.post(Command::Redeem {
            user_id,
            amount,
            reference,
            description: description.into(),
        })
        .await
    }

    /// Return points after a reversal; lifetime earned is left alone
    pub async fn refund(
        &self,
        user_id: UserId,
        amount: i64,
        reference: Reference,
        description: impl Into<String>,
    ) -> Result<PointTransaction> {
        self.post(Command::Refund {
            user_id,
            amount,
            reference,
            description: description.into(),
        })
        .await
    }

    /// Administrative correction of either sign
    pub async fn adjust(
        &self,
        user_id: UserId,
        amount: i64,
        description: impl Into<String>,
        notes: Option<String>,
    ) -> Result<PointTransaction> {
        self.post(Command::Adjust {
            user_id,
            amount,
            description: description.into(),
            notes,
        })
        .await
    }

    /// Forfeit points; the amount is clamped to the current balance
    pub async fn expire(
        &self,
        user_id: UserId,
        amount: i64,
        description: impl Into<String>,
    ) -> Result<PointTransaction> {
        self.post(Command::Expire {
            user_id,
            amount,
            description: description.into(),
        })
        .await
    }

    /// Expire the FIFO amount due for one account; `None` when nothing is due
    pub async fn expire_due(
        &self,
        user_id: UserId,
        as_of: DateTime<Utc>,
    ) -> Result<Option<PointTransaction>> {
        self.shard(user_id).expire_due(user_id, as_of).await
    }

    // Account administration

    /// Retire (`false`) or reactivate (`true`) an account
    pub async fn set_active(&self, user_id: UserId, active: bool) -> Result<Account> {
        self.shard(user_id)
            .update_account(user_id, AccountUpdate::SetActive(active))
            .await
    }

    /// Change the default validity window for future earns
    pub async fn set_expiry_days(&self, user_id: UserId, days: u32) -> Result<Account> {
        self.shard(user_id)
            .update_account(user_id, AccountUpdate::SetExpiryDays(days))
            .await
    }

    // Queries

    /// Current balance, 0 for users without an account
    pub fn balance(&self, user_id: UserId) -> Result<i64> {
        Ok(self
            .storage
            .get_account(user_id)?
            .map_or(0, |account| account.balance))
    }

    /// Account row, if one exists
    pub fn account(&self, user_id: UserId) -> Result<Option<Account>> {
        self.storage.get_account(user_id)
    }

    /// Filtered transaction history, newest first
    pub fn history(&self, user_id: UserId, query: &HistoryQuery) -> Result<HistoryPage> {
        let page = query.page.max(1);
        let per_page = query.per_page;

        let matching: Vec<PointTransaction> = match self.storage.account_history(user_id)? {
            Some((_, history)) => history
                .into_iter()
                .rev()
                .filter(|tx| query.matches(tx))
                .collect(),
            None => Vec::new(),
        };

        let total = matching.len();
        let items = matching
            .into_iter()
            .skip((page - 1).saturating_mul(per_page))
            .take(per_page)
            .collect();

        Ok(HistoryPage {
            items,
            total,
            page,
            per_page,
        })
    }

    /// Earn transactions whose deadline has passed as of `as_of`
    pub fn expired_candidates(
        &self,
        as_of: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PointTransaction>> {
        self.storage.earn_expiring(None, as_of, limit)
    }

    /// Earn transactions with `after < expires_at <= until`
    pub fn earn_expiring_between(
        &self,
        after: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PointTransaction>> {
        self.storage.earn_expiring(after, until, limit)
    }

    /// Earn transactions expiring within the next `days` days
    pub fn expiring_within(&self, days: u32) -> Result<Vec<PointTransaction>> {
        let now = self.clock.now();
        let until = now
            .checked_add_signed(Duration::days(i64::from(days)))
            .ok_or_else(|| Error::InvalidAmount(format!("Horizon of {} days is out of range", days)))?;
        self.storage.earn_expiring(Some(now), until, usize::MAX)
    }

    /// Accounts flagged for a re-check by the expiry sweep
    pub fn queued_for_sweep(&self, limit: usize) -> Result<Vec<UserId>> {
        self.storage.sweep_queue(limit)
    }

    /// Points of one user that fall due in `(from, until]` after FIFO
    /// consumption, computed from a single snapshot
    pub fn expiry_notice(
        &self,
        user_id: UserId,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<ExpiryNotice>> {
        let Some((account, history)) = self.storage.account_history(user_id)? else {
            return Ok(None);
        };
        Ok(
            points_expiring(&history, account.balance, from, until).map(|(points, earliest_expiry)| {
                ExpiryNotice {
                    user_id,
                    points,
                    earliest_expiry,
                }
            }),
        )
    }

    /// Aggregate figures across all accounts (snapshot read)
    pub fn statistics(&self) -> Result<LedgerStatistics> {
        let accounts = self.storage.accounts()?;

        let mut stats = LedgerStatistics {
            total_accounts: accounts.len() as u64,
            active_accounts: 0,
            total_earned: 0,
            total_redeemed: 0,
            total_expired: 0,
            outstanding_balance: 0,
            average_balance: Decimal::ZERO,
        };

        for account in &accounts {
            if account.is_funded() {
                stats.active_accounts += 1;
            }
            stats.total_earned = stats.total_earned.saturating_add(account.total_earned);
            stats.total_redeemed = stats.total_redeemed.saturating_add(account.total_redeemed);
            stats.total_expired = stats.total_expired.saturating_add(account.total_expired);
            stats.outstanding_balance = stats.outstanding_balance.saturating_add(account.balance);
        }

        if stats.total_accounts > 0 {
            stats.average_balance = (Decimal::from(stats.outstanding_balance)
                / Decimal::from(stats.total_accounts))
            .round_dp(2);
        }

        Ok(stats)
    }

    /// Top `limit` accounts by lifetime points earned
    pub fn top_earners(&self, limit: usize) -> Result<Vec<Account>> {
        let mut accounts = self.storage.accounts()?;
        accounts.sort_by(|a, b| {
            b.total_earned
                .cmp(&a.total_earned)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        accounts.truncate(limit);
        Ok(accounts)
    }

    /// Check the balance invariant and the snapshot chain for one account.
    ///
    /// Verify that the balance equals the sum of all transaction amounts and
    /// that every transaction's snapshot equals the running sum at its position.
    pub fn verify_account(&self, user_id: UserId) -> Result<()> {
        let (account, history) = self
            .storage
            .account_history(user_id)?
            .ok_or(Error::AccountNotFound(user_id))?;

        let mut running: i64 = 0;
        for (position, tx) in history.iter().enumerate() {
            if tx.sequence != position as u64 {
                return Err(Error::InvariantViolation(format!(
                    "User {}: transaction at position {} has sequence {}",
                    user_id, position, tx.sequence
                )));
            }
            running = running.checked_add(tx.amount).ok_or_else(|| {
                Error::InvariantViolation(format!("User {}: running balance overflow", user_id))
            })?;
            if running < 0 || tx.balance != running {
                return Err(Error::InvariantViolation(format!(
                    "User {}: snapshot {} at sequence {} but running sum is {}",
                    user_id, tx.balance, tx.sequence, running
                )));
            }
            if tx.tx_type == TransactionType::Earn && tx.expires_at.is_none() {
                return Err(Error::InvariantViolation(format!(
                    "User {}: earn at sequence {} has no deadline",
                    user_id, tx.sequence
                )));
            }
        }

        if account.balance != running || account.next_sequence != history.len() as u64 {
            return Err(Error::InvariantViolation(format!(
                "User {}: stored balance {} (next sequence {}) but log sums to {} over {} rows",
                user_id,
                account.balance,
                account.next_sequence,
                running,
                history.len()
            )));
        }

        Ok(())
    }

    // Accessors

    /// Current time according to the ledger's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop every writer; pending requests ahead of the signal still complete
    pub async fn shutdown(self) -> Result<()> {
        for handle in &self.shards {
            handle.shutdown().await?;
        }
        for task in self.tasks {
            task.await
                .map_err(|e| Error::Concurrency(format!("Ledger actor failed: {}", e)))?;
        }
        tracing::info!("Points ledger shut down");
        Ok(())
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("shards", &self.shards.len())
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
