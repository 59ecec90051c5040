//! Storefront Points Ledger
//!
//! Per-user loyalty points accounts with an append-only transaction log.
//!
//! # Architecture
//!
//! - **Single Writer per Account**: Postings are routed to one actor per shard,
//!   so read-validate-write never interleaves for the same account
//! - **Atomic Commit**: The account row and its transaction land in one write batch
//! - **Snapshot Reads**: Balances, history and statistics never block writers
//! - **FIFO Expiry**: A periodic sweep forfeits matured earned points
//!
//! # Invariants
//!
//! - Balance equals the sum of the account's transaction amounts
//! - Balance is never negative
//! - Every transaction stores the balance right after it was applied
//! - Lifetime counters never decrease

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod actor;
pub mod clock;
pub mod config;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod metrics;
pub mod storage;
pub mod sweep;
pub mod types;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::Ledger;
pub use memory::MemoryStorage;
pub use storage::{RocksStorage, Storage};
pub use sweep::{ExpiryNotice, ExpirySweeper, SweepReport};
pub use types::{
    Account, HistoryPage, HistoryQuery, LedgerStatistics, PointTransaction, Reference,
    TransactionStatus, TransactionType, UserId,
};
