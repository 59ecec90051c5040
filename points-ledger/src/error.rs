//! Error types for the points ledger

use crate::types::UserId;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
///
/// Every error aborts the whole unit of work: an account row is never
/// written without its matching transaction row, and vice versa.
#[derive(Error, Debug)]
pub enum Error {
    /// No account exists for the user (redeem/refund/adjust before any earn)
    #[error("Account not found for user {0}")]
    AccountNotFound(UserId),

    /// Account has been retired and rejects balance mutations
    #[error("Account inactive for user {0}")]
    AccountInactive(UserId),

    /// Amount outside the operation's sign domain, or arithmetic overflow
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Debit exceeds the spendable balance
    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance {
        /// Points the caller asked to debit
        requested: i64,
        /// Balance at the time of the check
        available: i64,
    },

    /// Administrative adjustment would leave the balance negative
    #[error("Invalid adjustment: {0}")]
    InvalidAdjustment(String),

    /// Storage error (RocksDB or another backend)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Stored state contradicts the transaction log
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the caller may retry the operation with the same reference.
    ///
    /// Business-rule rejections are final; only persistence failures and a
    /// writer that went away mid-request are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Storage(_) | Error::Io(_) | Error::Concurrency(_)
        )
    }

    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::AccountNotFound(_) => "account_not_found",
            Error::AccountInactive(_) => "account_inactive",
            Error::InvalidAmount(_) => "invalid_amount",
            Error::InsufficientBalance { .. } => "insufficient_balance",
            Error::InvalidAdjustment(_) => "invalid_adjustment",
            Error::Storage(_) => "storage",
            Error::Serialization(_) => "serialization",
            Error::InvariantViolation(_) => "invariant_violation",
            Error::Concurrency(_) => "concurrency",
            Error::Config(_) => "config",
            Error::Metrics(_) => "metrics",
            Error::Io(_) => "io",
            Error::Other(_) => "other",
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
