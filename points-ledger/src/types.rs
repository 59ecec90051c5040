//! Core types for the points ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact integer arithmetic on points (checked, never wrapping)
//! - Append-only history (transactions are immutable once built)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{Error, Result};

/// Identifier of the user owning an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(u64);

impl UserId {
    /// Create new user ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get as integer
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of balance mutation recorded by a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionType {
    /// Points granted (positive)
    Earn = 1,
    /// Points spent (negative)
    Redeem = 2,
    /// Points returned after a reversal (positive)
    Refund = 3,
    /// Administrative correction (either sign)
    Adjust = 4,
    /// Points forfeited by the expiry sweep (negative)
    Expire = 5,
}

impl TransactionType {
    /// All variants in tag order
    pub const ALL: [TransactionType; 5] = [
        TransactionType::Earn,
        TransactionType::Redeem,
        TransactionType::Refund,
        TransactionType::Adjust,
        TransactionType::Expire,
    ];

    /// Lowercase label
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Earn => "earn",
            TransactionType::Redeem => "redeem",
            TransactionType::Refund => "refund",
            TransactionType::Adjust => "adjust",
            TransactionType::Expire => "expire",
        }
    }

    /// Parse from label
    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionStatus {
    /// Posted and reflected in the balance
    Completed = 1,
    /// Reserved
    Pending = 2,
    /// Reserved
    Failed = 3,
}

/// Opaque pointer to the business event behind a transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    /// Event kind ("order", "manual", "expiry", ...)
    pub kind: String,
    /// Event identifier, 0 when the event has none
    pub id: u64,
}

impl Reference {
    /// Create new reference
    pub fn new(kind: impl Into<String>, id: u64) -> Self {
        Self {
            kind: kind.into(),
            id,
        }
    }

    /// Reference to an order
    pub fn order(order_id: u64) -> Self {
        Self::new("order", order_id)
    }

    /// Reference for administrative actions
    pub fn manual() -> Self {
        Self::new("manual", 0)
    }

    /// Reference for the expiry sweep
    pub fn expiry() -> Self {
        Self::new("expiry", 0)
    }

    /// Whether the reference names a concrete business event
    pub fn is_identified(&self) -> bool {
        self.id != 0
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Per-user points account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Unique account ID (UUIDv7)
    pub account_id: Uuid,

    /// Owning user (one account per user)
    pub user_id: UserId,

    /// Spendable points, never negative
    pub balance: i64,

    /// Lifetime points earned (including positive adjustments)
    pub total_earned: i64,

    /// Lifetime points redeemed (including negative adjustments)
    pub total_redeemed: i64,

    /// Lifetime points expired
    pub total_expired: i64,

    /// Validity window for newly earned points
    pub expiry_days: u32,

    /// Inactive accounts reject balance mutations
    pub is_active: bool,

    /// Sequence number the next transaction will take
    pub next_sequence: u64,

    /// Matured points may have come back (refund, reactivation); the next
    /// sweep re-checks this account
    pub needs_sweep: bool,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Open an empty account
    pub fn open(user_id: UserId, expiry_days: u32, now: DateTime<Utc>) -> Self {
        Self {
            account_id: Uuid::now_v7(),
            user_id,
            balance: 0,
            total_earned: 0,
            total_redeemed: 0,
            total_expired: 0,
            expiry_days,
            is_active: true,
            next_sequence: 0,
            needs_sweep: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a signed delta and return the sequence number it was posted at.
    ///
    /// This is the only place balances and lifetime counters change. On error
    /// the account is left untouched.
    pub fn apply(
        &mut self,
        tx_type: TransactionType,
        delta: i64,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        if !self.is_active {
            return Err(Error::AccountInactive(self.user_id));
        }

        let positive = match tx_type {
            TransactionType::Earn | TransactionType::Refund => true,
            TransactionType::Redeem | TransactionType::Expire => false,
            TransactionType::Adjust => {
                if delta == 0 {
                    return Err(Error::InvalidAmount(
                        "Adjustment must be non-zero".to_string(),
                    ));
                }
                delta > 0
            }
        };
        if (positive && delta <= 0) || (!positive && delta >= 0) {
            return Err(Error::InvalidAmount(format!(
                "{} cannot post a delta of {}",
                tx_type, delta
            )));
        }

        let balance = self
            .balance
            .checked_add(delta)
            .ok_or_else(|| Error::InvalidAmount("Balance overflow".to_string()))?;

        if balance < 0 {
            return Err(match tx_type {
                TransactionType::Adjust => Error::InvalidAdjustment(format!(
                    "Adjustment of {} would leave balance {}",
                    delta, balance
                )),
                _ => Error::InsufficientBalance {
                    requested: delta.saturating_neg(),
                    available: self.balance,
                },
            });
        }

        let magnitude = delta.checked_abs().ok_or_else(|| {
            Error::InvalidAmount("Amount out of range".to_string())
        })?;
        let overflow = || Error::InvalidAmount("Lifetime counter overflow".to_string());

        let mut next = self.clone();
        match tx_type {
            TransactionType::Earn => {
                next.total_earned = self.total_earned.checked_add(magnitude).ok_or_else(overflow)?;
            }
            TransactionType::Redeem => {
                next.total_redeemed = self.total_redeemed.checked_add(magnitude).ok_or_else(overflow)?;
            }
            TransactionType::Refund => {}
            TransactionType::Adjust if delta > 0 => {
                next.total_earned = self.total_earned.checked_add(magnitude).ok_or_else(overflow)?;
            }
            TransactionType::Adjust => {
                next.total_redeemed = self.total_redeemed.checked_add(magnitude).ok_or_else(overflow)?;
            }
            TransactionType::Expire => {
                next.total_expired = self.total_expired.checked_add(magnitude).ok_or_else(overflow)?;
            }
        }

        let sequence = self.next_sequence;
        next.balance = balance;
        next.next_sequence = sequence + 1;
        next.updated_at = now;
        *self = next;

        Ok(sequence)
    }

    /// Active with something to spend
    pub fn is_funded(&self) -> bool {
        self.is_active && self.balance > 0
    }
}

/// Immutable record of one balance mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointTransaction {
    /// Unique transaction ID (UUIDv7 for time-ordering)
    pub transaction_id: Uuid,

    /// Owning account
    pub account_id: Uuid,

    /// Owning user (denormalized)
    pub user_id: UserId,

    /// Position in the account's history, starting at 0
    pub sequence: u64,

    /// Kind of mutation
    pub tx_type: TransactionType,

    /// Signed delta applied to the balance
    pub amount: i64,

    /// Balance immediately after this transaction
    pub balance: i64,

    /// Originating event kind
    pub reference_type: String,

    /// Originating event id
    pub reference_id: u64,

    /// Human-readable description
    pub description: String,

    /// Free-form notes
    pub notes: Option<String>,

    /// Deadline for the earned points (Earn only)
    pub expires_at: Option<DateTime<Utc>>,

    /// Status
    pub status: TransactionStatus,

    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

impl PointTransaction {
    /// Reference this transaction was posted under
    pub fn reference(&self) -> Reference {
        Reference::new(self.reference_type.clone(), self.reference_id)
    }
}

/// Filter and page selection for transaction history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Only this transaction type
    pub tx_type: Option<TransactionType>,
    /// Only this reference kind
    pub reference_type: Option<String>,
    /// Only this reference id
    pub reference_id: Option<u64>,
    /// Created at or after
    pub from: Option<DateTime<Utc>>,
    /// Created strictly before
    pub to: Option<DateTime<Utc>>,
    /// 1-based page number
    pub page: usize,
    /// Page size
    pub per_page: usize,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            tx_type: None,
            reference_type: None,
            reference_id: None,
            from: None,
            to: None,
            page: 1,
            per_page: 20,
        }
    }
}

impl HistoryQuery {
    /// Check a transaction against every set filter
    pub fn matches(&self, tx: &PointTransaction) -> bool {
        self.tx_type.map_or(true, |t| tx.tx_type == t)
            && self
                .reference_type
                .as_deref()
                .map_or(true, |kind| tx.reference_type == kind)
            && self.reference_id.map_or(true, |id| tx.reference_id == id)
            && self.from.map_or(true, |from| tx.created_at >= from)
            && self.to.map_or(true, |to| tx.created_at < to)
    }
}

/// One page of transaction history, newest first
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    /// Transactions on this page
    pub items: Vec<PointTransaction>,
    /// Matching transactions across all pages
    pub total: usize,
    /// 1-based page number
    pub page: usize,
    /// Page size
    pub per_page: usize,
}

impl HistoryPage {
    /// Number of pages for the current total
    pub fn total_pages(&self) -> usize {
        if self.per_page == 0 {
            return 0;
        }
        self.total.div_ceil(self.per_page)
    }
}

/// Aggregate figures across all accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerStatistics {
    /// Number of accounts
    pub total_accounts: u64,
    /// Accounts that are active and hold a positive balance
    pub active_accounts: u64,
    /// Σ total_earned
    pub total_earned: i64,
    /// Σ total_redeemed
    pub total_redeemed: i64,
    /// Σ total_expired
    pub total_expired: i64,
    /// Σ balance
    pub outstanding_balance: i64,
    /// outstanding_balance / total_accounts, 2 decimal places
    pub average_balance: Decimal,
}
