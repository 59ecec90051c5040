//! Actor-based concurrency for the ledger
//!
//! Every account is owned by exactly one writer actor (its shard). The actor
//! runs "load account → validate → write account + transaction" for one
//! request at a time, so two postings against the same account are always
//! serialized while accounts on other shards proceed in parallel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │        Checkout / admin / expiry sweep callers        │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ Ledger::earn / redeem / ...
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │     LedgerHandle[user_id % shards] (Clone)            │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              LedgerActor (one per shard)              │
//! │   Account::apply() → Storage::commit() (atomic)      │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Reads never go through the actors; they are served from storage snapshots.

use crate::clock::Clock;
use crate::metrics::Metrics;
use crate::storage::Storage;
use crate::sweep::{has_matured_lots, points_due};
use crate::types::{
    Account, PointTransaction, Reference, TransactionStatus, TransactionType, UserId,
};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Balance-mutating request
#[derive(Debug, Clone)]
pub enum Command {
    /// Grant points, opening the account if needed
    Earn {
        /// Account owner
        user_id: UserId,
        /// Points to grant (> 0)
        amount: i64,
        /// Originating event
        reference: Reference,
        /// Description
        description: String,
        /// Overrides the account's expiry policy
        expiry_days: Option<u32>,
    },
    /// Spend points
    Redeem {
        /// Account owner
        user_id: UserId,
        /// Points to spend (> 0)
        amount: i64,
        /// Originating event
        reference: Reference,
        /// Description
        description: String,
    },
    /// Return points after a reversal
    Refund {
        /// Account owner
        user_id: UserId,
        /// Points to return (> 0)
        amount: i64,
        /// Originating event
        reference: Reference,
        /// Description
        description: String,
    },
    /// Administrative correction
    Adjust {
        /// Account owner
        user_id: UserId,
        /// Signed delta (!= 0)
        amount: i64,
        /// Description
        description: String,
        /// Operator notes
        notes: Option<String>,
    },
    /// Forfeit points, clamped to the balance
    Expire {
        /// Account owner
        user_id: UserId,
        /// Points to forfeit (> 0)
        amount: i64,
        /// Description
        description: String,
    },
}

impl Command {
    /// Account the command targets
    pub fn user_id(&self) -> UserId {
        match self {
            Command::Earn { user_id, .. }
            | Command::Redeem { user_id, .. }
            | Command::Refund { user_id, .. }
            | Command::Adjust { user_id, .. }
            | Command::Expire { user_id, .. } => *user_id,
        }
    }

    /// Transaction type the command records
    pub fn tx_type(&self) -> TransactionType {
        match self {
            Command::Earn { .. } => TransactionType::Earn,
            Command::Redeem { .. } => TransactionType::Redeem,
            Command::Refund { .. } => TransactionType::Refund,
            Command::Adjust { .. } => TransactionType::Adjust,
            Command::Expire { .. } => TransactionType::Expire,
        }
    }
}

/// Account change that records no transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountUpdate {
    /// Retire or reactivate
    SetActive(bool),
    /// Change the default expiry window
    SetExpiryDays(u32),
}

/// Posting rules shared by all shards
#[derive(Debug, Clone, Copy)]
pub struct PostingRules {
    /// Expiry window for accounts opened by an earn
    pub default_expiry_days: u32,
    /// Replay postings whose reference was already recorded
    pub deduplicate_references: bool,
}

/// Message sent to a ledger actor
#[derive(Debug)]
pub enum LedgerMessage {
    /// Apply a balance mutation
    Post {
        /// Mutation to apply
        command: Command,
        /// Committed (or replayed) transaction
        response: oneshot::Sender<Result<PointTransaction>>,
    },

    /// Expire whatever is due for one account as of a point in time
    ExpireDue {
        /// Account owner
        user_id: UserId,
        /// Deadlines at or before this instant count as matured
        as_of: DateTime<Utc>,
        /// Expire transaction, `None` when nothing was due
        response: oneshot::Sender<Result<Option<PointTransaction>>>,
    },

    /// Change account settings
    UpdateAccount {
        /// Account owner
        user_id: UserId,
        /// Setting to change
        update: AccountUpdate,
        /// Account as committed
        response: oneshot::Sender<Result<Account>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that owns the writes for one shard of accounts
pub struct LedgerActor {
    shard: usize,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    rules: PostingRules,
    mailbox: mpsc::Receiver<LedgerMessage>,
}

impl std::fmt::Debug for LedgerActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerActor")
            .field("shard", &self.shard)
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl LedgerActor {
    /// Create new actor
    pub fn new(
        shard: usize,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        rules: PostingRules,
        mailbox: mpsc::Receiver<LedgerMessage>,
    ) -> Self {
        Self {
            shard,
            storage,
            clock,
            metrics,
            rules,
            mailbox,
        }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        tracing::debug!(shard = self.shard, "Ledger actor started");

        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                LedgerMessage::Post { command, response } => {
                    let result = self.execute(command);
                    let _ = response.send(result);
                }
                LedgerMessage::ExpireDue {
                    user_id,
                    as_of,
                    response,
                } => {
                    let started = Instant::now();
                    let result = self.expire_due(user_id, as_of);
                    self.observe(TransactionType::Expire, started, &result);
                    let _ = response.send(result);
                }
                LedgerMessage::UpdateAccount {
                    user_id,
                    update,
                    response,
                } => {
                    let _ = response.send(self.update_account(user_id, update));
                }
                LedgerMessage::Shutdown => break,
            }
        }

        tracing::debug!(shard = self.shard, "Ledger actor stopped");
    }

    /// Execute one command as a single unit of work
    fn execute(&self, command: Command) -> Result<PointTransaction> {
        let started = Instant::now();
        let tx_type = command.tx_type();
        let result = self.post(command);
        self.observe(tx_type, started, &result);
        result
    }

    fn observe<T>(&self, tx_type: TransactionType, started: Instant, result: &Result<T>)
    where
        T: AsPosted,
    {
        self.metrics
            .record_posting_duration(started.elapsed().as_secs_f64());
        match result {
            Ok(value) => {
                if let Some(tx) = value.as_posted() {
                    self.metrics.record_posting(tx);
                }
            }
            Err(e) => {
                tracing::warn!(
                    shard = self.shard,
                    tx_type = %tx_type,
                    reason = e.kind(),
                    "Posting rejected: {}",
                    e
                );
                self.metrics.record_rejection(tx_type, e.kind());
            }
        }
    }

    fn post(&self, command: Command) -> Result<PointTransaction> {
        match command {
            Command::Earn {
                user_id,
                amount,
                reference,
                description,
                expiry_days,
            } => {
                require_positive(TransactionType::Earn, amount)?;
                if let Some(tx) = self.replay(user_id, TransactionType::Earn, amount, &reference)? {
                    return Ok(tx);
                }

                let now = self.clock.now();
                // Get-or-create happens inside the same unit as the write.
                let account = match self.storage.get_account(user_id)? {
                    Some(account) => account,
                    None => {
                        tracing::info!(user_id = %user_id, "Opening points account");
                        Account::open(user_id, self.rules.default_expiry_days, now)
                    }
                };

                let days = expiry_days.unwrap_or(account.expiry_days);
                if days == 0 {
                    return Err(Error::InvalidAmount(
                        "Expiry window must be at least one day".to_string(),
                    ));
                }
                let expires_at = now
                    .checked_add_signed(Duration::days(i64::from(days)))
                    .ok_or_else(|| {
                        Error::InvalidAmount(format!("Expiry window of {} days is out of range", days))
                    })?;

                self.append(
                    account,
                    TransactionType::Earn,
                    amount,
                    reference,
                    description,
                    None,
                    Some(expires_at),
                    now,
                )
            }

            Command::Redeem {
                user_id,
                amount,
                reference,
                description,
            } => {
                require_positive(TransactionType::Redeem, amount)?;
                if let Some(tx) = self.replay(user_id, TransactionType::Redeem, -amount, &reference)? {
                    return Ok(tx);
                }
                let account = self.load(user_id)?;
                let now = self.clock.now();
                self.append(
                    account,
                    TransactionType::Redeem,
                    -amount,
                    reference,
                    description,
                    None,
                    None,
                    now,
                )
            }

            Command::Refund {
                user_id,
                amount,
                reference,
                description,
            } => {
                require_positive(TransactionType::Refund, amount)?;
                if let Some(tx) = self.replay(user_id, TransactionType::Refund, amount, &reference)? {
                    return Ok(tx);
                }
                let (mut account, history) = self
                    .storage
                    .account_history(user_id)?
                    .ok_or(Error::AccountNotFound(user_id))?;
                let now = self.clock.now();
                // Refunded points may land back on a lot the sweep already passed.
                if has_matured_lots(&history, now) {
                    account.needs_sweep = true;
                }
                self.append(
                    account,
                    TransactionType::Refund,
                    amount,
                    reference,
                    description,
                    None,
                    None,
                    now,
                )
            }

            Command::Adjust {
                user_id,
                amount,
                description,
                notes,
            } => {
                if amount == 0 {
                    return Err(Error::InvalidAmount(
                        "Adjustment must be non-zero".to_string(),
                    ));
                }
                let account = self.load(user_id)?;
                let now = self.clock.now();
                self.append(
                    account,
                    TransactionType::Adjust,
                    amount,
                    Reference::manual(),
                    description,
                    notes,
                    None,
                    now,
                )
            }

            Command::Expire {
                user_id,
                amount,
                description,
            } => {
                require_positive(TransactionType::Expire, amount)?;
                let account = self.load(user_id)?;
                self.expire_clamped(account, amount, description)
            }
        }
    }

    /// Compute the FIFO amount due and expire it; `None` when nothing is due
    fn expire_due(
        &self,
        user_id: UserId,
        as_of: DateTime<Utc>,
    ) -> Result<Option<PointTransaction>> {
        let (mut account, history) = self
            .storage
            .account_history(user_id)?
            .ok_or(Error::AccountNotFound(user_id))?;
        if !account.is_active {
            return Err(Error::AccountInactive(user_id));
        }

        let queued = account.needs_sweep;
        account.needs_sweep = false;

        let due = points_due(&history, account.balance, as_of);
        if due == 0 {
            if queued {
                account.updated_at = self.clock.now();
                self.storage.commit(&account, None)?;
            }
            return Ok(None);
        }

        let description = format!("Points expired as of {}", as_of.format("%Y-%m-%d"));
        self.expire_clamped(account, due, description).map(Some)
    }

    fn expire_clamped(
        &self,
        account: Account,
        requested: i64,
        description: String,
    ) -> Result<PointTransaction> {
        if !account.is_active {
            return Err(Error::AccountInactive(account.user_id));
        }
        // Stale sweep bookkeeping can never drive the balance negative.
        let amount = requested.min(account.balance);
        if amount <= 0 {
            return Err(Error::InsufficientBalance {
                requested,
                available: account.balance,
            });
        }
        if amount < requested {
            tracing::debug!(
                user_id = %account.user_id,
                requested,
                clamped = amount,
                "Expiry clamped to balance"
            );
        }

        let now = self.clock.now();
        self.append(
            account,
            TransactionType::Expire,
            -amount,
            Reference::expiry(),
            description,
            None,
            None,
            now,
        )
    }

    /// Shared balance-mutation primitive: apply, build the record, commit both
    #[allow(clippy::too_many_arguments)]
    fn append(
        &self,
        mut account: Account,
        tx_type: TransactionType,
        delta: i64,
        reference: Reference,
        description: String,
        notes: Option<String>,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<PointTransaction> {
        let sequence = account.apply(tx_type, delta, now)?;

        let tx = PointTransaction {
            transaction_id: Uuid::now_v7(),
            account_id: account.account_id,
            user_id: account.user_id,
            sequence,
            tx_type,
            amount: delta,
            balance: account.balance,
            reference_type: reference.kind,
            reference_id: reference.id,
            description,
            notes,
            expires_at,
            status: TransactionStatus::Completed,
            created_at: now,
        };

        self.storage.commit(&account, Some(&tx))?;

        tracing::info!(
            user_id = %tx.user_id,
            tx_type = %tx.tx_type,
            amount = tx.amount,
            balance = tx.balance,
            sequence = tx.sequence,
            reference = %tx.reference(),
            "Points posted"
        );

        Ok(tx)
    }

    /// Return the transaction already posted under this reference, if any
    fn replay(
        &self,
        user_id: UserId,
        tx_type: TransactionType,
        delta: i64,
        reference: &Reference,
    ) -> Result<Option<PointTransaction>> {
        if !self.rules.deduplicate_references || !reference.is_identified() {
            return Ok(None);
        }

        match self.storage.find_by_reference(user_id, tx_type, reference)? {
            Some(tx) if tx.amount == delta => {
                tracing::info!(
                    user_id = %user_id,
                    tx_type = %tx_type,
                    reference = %reference,
                    "Replayed posting for known reference"
                );
                Ok(Some(tx))
            }
            Some(tx) => Err(Error::InvalidAmount(format!(
                "Reference {} already posted {} with amount {}",
                reference, tx_type, tx.amount
            ))),
            None => Ok(None),
        }
    }

    fn load(&self, user_id: UserId) -> Result<Account> {
        self.storage
            .get_account(user_id)?
            .ok_or(Error::AccountNotFound(user_id))
    }

    fn update_account(&self, user_id: UserId, update: AccountUpdate) -> Result<Account> {
        let (mut account, history) = self
            .storage
            .account_history(user_id)?
            .ok_or(Error::AccountNotFound(user_id))?;
        let now = self.clock.now();
        match update {
            AccountUpdate::SetActive(false) => {
                account.is_active = false;
                account.needs_sweep = false;
            }
            AccountUpdate::SetActive(true) => {
                // Lots that matured while retired were skipped by the sweep.
                if !account.is_active && has_matured_lots(&history, now) {
                    account.needs_sweep = true;
                }
                account.is_active = true;
            }
            AccountUpdate::SetExpiryDays(0) => {
                return Err(Error::InvalidAmount(
                    "Expiry window must be at least one day".to_string(),
                ));
            }
            AccountUpdate::SetExpiryDays(days) => account.expiry_days = days,
        }
        account.updated_at = now;

        self.storage.commit(&account, None)?;
        tracing::info!(user_id = %user_id, update = ?update, "Account updated");

        Ok(account)
    }
}

/// Results that may carry a committed transaction
trait AsPosted {
    fn as_posted(&self) -> Option<&PointTransaction>;
}

impl AsPosted for PointTransaction {
    fn as_posted(&self) -> Option<&PointTransaction> {
        Some(self)
    }
}

impl AsPosted for Option<PointTransaction> {
    fn as_posted(&self) -> Option<&PointTransaction> {
        self.as_ref()
    }
}

fn require_positive(tx_type: TransactionType, amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(Error::InvalidAmount(format!(
            "{} amount must be positive, got {}",
            tx_type, amount
        )));
    }
    Ok(())
}

/// Handle for sending messages to one actor
#[derive(Clone, Debug)]
pub struct LedgerHandle {
    sender: mpsc::Sender<LedgerMessage>,
}

impl LedgerHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<LedgerMessage>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> LedgerMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Apply a balance mutation
    pub async fn post(&self, command: Command) -> Result<PointTransaction> {
        self.request(|response| LedgerMessage::Post { command, response })
            .await
    }

    /// Expire whatever is due for one account
    pub async fn expire_due(
        &self,
        user_id: UserId,
        as_of: DateTime<Utc>,
    ) -> Result<Option<PointTransaction>> {
        self.request(|response| LedgerMessage::ExpireDue {
            user_id,
            as_of,
            response,
        })
        .await
    }

    /// Change account settings
    pub async fn update_account(&self, user_id: UserId, update: AccountUpdate) -> Result<Account> {
        self.request(|response| LedgerMessage::UpdateAccount {
            user_id,
            update,
            response,
        })
        .await
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(LedgerMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the actor for one shard
pub fn spawn_ledger_actor(
    shard: usize,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    rules: PostingRules,
    mailbox_capacity: usize,
) -> (LedgerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(mailbox_capacity); // Bounded channel for backpressure
    let actor = LedgerActor::new(shard, storage, clock, metrics, rules, rx);

    let task = tokio::spawn(async move {
        actor.run().await;
    });

    (LedgerHandle::new(tx), task)
}
