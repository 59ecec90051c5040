//! Expiry sweep
//!
//! Earned points carry an `expires_at` deadline, but consumption is only
//! tracked at the account level. Expiry follows a FIFO rule: replaying the
//! history in sequence order, every debit (redemption, negative adjustment,
//! expiry) draws from the earliest-expiring lot open at that moment, and
//! points without a deadline (positive adjustments) are drawn last. A refund
//! hands points back to the lots its redemption drew from. What is left of
//! the matured lots is due.
//!
//! The amount due is computed inside the account's writer, so two sweeps
//! racing each other can never expire the same points twice.

use crate::config::SweepConfig;
use crate::types::{PointTransaction, TransactionType, UserId};
use crate::{Error, Ledger, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

/// Earned points still open after replay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Lot {
    expires_at: DateTime<Utc>,
    remaining: i64,
}

/// Where a debit took its points from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Lot(usize),
    Undated,
}

/// Points a redemption took, kept so a refund can hand them back
#[derive(Debug)]
struct Draw {
    reference: (String, u64),
    source: Source,
    amount: i64,
}

/// FIFO replay of one account's history
#[derive(Debug, Default)]
struct LotBook {
    /// In posting order; consumption picks by deadline
    lots: Vec<Lot>,
    /// Points without a deadline
    undated: i64,
    draws: Vec<Draw>,
}

impl LotBook {
    fn replay(history: &[PointTransaction]) -> Self {
        let mut book = Self::default();
        for tx in history {
            match tx.tx_type {
                TransactionType::Earn => match tx.expires_at {
                    Some(expires_at) => book.lots.push(Lot {
                        expires_at,
                        remaining: tx.amount,
                    }),
                    None => book.undated = book.undated.saturating_add(tx.amount),
                },
                TransactionType::Adjust if tx.amount > 0 => {
                    book.undated = book.undated.saturating_add(tx.amount);
                }
                TransactionType::Redeem | TransactionType::Adjust => {
                    book.draw(tx.amount.saturating_neg(), Some(tx));
                }
                TransactionType::Expire => book.draw(tx.amount.saturating_neg(), None),
                TransactionType::Refund => book.restore(tx),
            }
        }
        book
    }

    /// Take `amount` earliest deadline first, undated points last
    fn draw(&mut self, mut amount: i64, recorded: Option<&PointTransaction>) {
        let mut order: Vec<usize> = (0..self.lots.len()).collect();
        order.sort_by_key(|&i| self.lots[i].expires_at);

        let sources = order
            .into_iter()
            .map(Source::Lot)
            .chain(std::iter::once(Source::Undated));
        for source in sources {
            if amount <= 0 {
                break;
            }
            let available = match source {
                Source::Lot(i) => &mut self.lots[i].remaining,
                Source::Undated => &mut self.undated,
            };
            let taken = amount.min(*available);
            if taken <= 0 {
                continue;
            }
            *available -= taken;
            amount -= taken;

            if let Some(tx) = recorded {
                self.draws.push(Draw {
                    reference: (tx.reference_type.clone(), tx.reference_id),
                    source,
                    amount: taken,
                });
            }
        }
    }

    /// Hand refunded points back: first to the redemption with the same
    /// reference, then to the most recent redemptions, then as undated points
    fn restore(&mut self, refund: &PointTransaction) {
        let mut amount = refund.amount;
        let reference = (refund.reference_type.clone(), refund.reference_id);

        let matching: Vec<usize> = (0..self.draws.len())
            .rev()
            .filter(|&i| refund.reference_id != 0 && self.draws[i].reference == reference)
            .collect();
        let others: Vec<usize> = (0..self.draws.len())
            .rev()
            .filter(|i| !matching.contains(i))
            .collect();

        for i in matching.into_iter().chain(others) {
            if amount <= 0 {
                break;
            }
            let draw = &mut self.draws[i];
            let given = amount.min(draw.amount);
            if given <= 0 {
                continue;
            }
            draw.amount -= given;
            amount -= given;
            match draw.source {
                Source::Lot(lot) => self.lots[lot].remaining += given,
                Source::Undated => self.undated += given,
            }
        }

        self.undated = self.undated.saturating_add(amount.max(0));
    }

    /// Open points whose deadline is at or before `as_of`
    fn matured(&self, as_of: DateTime<Utc>) -> i64 {
        self.lots
            .iter()
            .filter(|lot| lot.expires_at <= as_of)
            .fold(0i64, |sum, lot| sum.saturating_add(lot.remaining))
    }
}

/// Points due for expiry as of `as_of` under FIFO consumption.
pub fn points_due(history: &[PointTransaction], balance: i64, as_of: DateTime<Utc>) -> i64 {
    LotBook::replay(history)
        .matured(as_of)
        .clamp(0, balance.max(0))
}

/// Points that fall due in `(from, until]`, with the earliest deadline among them
pub fn points_expiring(
    history: &[PointTransaction],
    balance: i64,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Option<(i64, DateTime<Utc>)> {
    let book = LotBook::replay(history);
    let cap = balance.max(0);
    let points = book.matured(until).clamp(0, cap) - book.matured(from).clamp(0, cap);
    if points <= 0 {
        return None;
    }
    book.lots
        .iter()
        .filter(|lot| lot.remaining > 0 && lot.expires_at > from && lot.expires_at <= until)
        .map(|lot| lot.expires_at)
        .min()
        .map(|earliest| (points, earliest))
}

/// Whether any earned lot has reached its deadline by `as_of`
pub fn has_matured_lots(history: &[PointTransaction], as_of: DateTime<Utc>) -> bool {
    history.iter().any(|tx| {
        tx.tx_type == TransactionType::Earn && tx.expires_at.map_or(false, |at| at <= as_of)
    })
}

/// Points about to expire for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpiryNotice {
    /// Account owner
    pub user_id: UserId,
    /// Points that will fall due in the window after FIFO consumption
    pub points: i64,
    /// Earliest deadline in the window
    pub earliest_expiry: DateTime<Utc>,
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Accounts with at least one matured earn
    pub accounts_scanned: usize,
    /// Accounts that had points expired
    pub accounts_expired: usize,
    /// Points expired across all accounts
    pub points_expired: i64,
    /// Inactive accounts left alone
    pub accounts_skipped: usize,
    /// Accounts whose expiry failed (retried next sweep)
    pub failures: usize,
    /// Users to notify about points expiring soon
    pub expiring_soon: Vec<ExpiryNotice>,
}

/// Periodic expiry job
#[derive(Debug)]
pub struct ExpirySweeper {
    ledger: Arc<Ledger>,
    config: SweepConfig,
    /// Deadlines up to this point have been fully processed
    watermark: Mutex<Option<DateTime<Utc>>>,
}

impl ExpirySweeper {
    /// Create new sweeper
    pub fn new(ledger: Arc<Ledger>, config: SweepConfig) -> Self {
        Self {
            ledger,
            config,
            watermark: Mutex::new(None),
        }
    }

    /// Run one sweep at the ledger's current time
    pub async fn run_once(&self) -> Result<SweepReport> {
        let now = self.ledger.now();
        let after = *self.watermark.lock();

        // Snapshot read; the writers are not held up by the scan.
        let matured = self
            .ledger
            .earn_expiring_between(after, now, self.config.batch_limit)?;
        let cut = if matured.len() >= self.config.batch_limit {
            matured.last().and_then(|tx| tx.expires_at)
        } else {
            None
        };

        let mut users: BTreeSet<UserId> = matured.iter().map(|tx| tx.user_id).collect();
        if let Some(cut) = cut {
            // Lots sharing the last deadline may lie past the limit.
            let ties = self.ledger.earn_expiring_between(
                Some(cut - Duration::nanoseconds(1)),
                cut,
                usize::MAX,
            )?;
            users.extend(ties.iter().map(|tx| tx.user_id));
        }

        // Accounts whose matured points came back (refund, reactivation)
        users.extend(self.ledger.queued_for_sweep(self.config.batch_limit)?);

        let mut report = SweepReport {
            accounts_scanned: users.len(),
            ..SweepReport::default()
        };

        for user_id in users {
            match self.ledger.expire_due(user_id, now).await {
                Ok(Some(tx)) => {
                    report.accounts_expired += 1;
                    report.points_expired += tx.amount.saturating_neg();
                }
                Ok(None) => {}
                Err(Error::AccountInactive(_)) => report.accounts_skipped += 1,
                Err(e) => {
                    tracing::warn!(user_id = %user_id, "Expiry failed: {}", e);
                    report.failures += 1;
                }
            }
        }

        if report.failures == 0 {
            *self.watermark.lock() = Some(cut.unwrap_or(now));
        }

        report.expiring_soon = self.expiring_soon(now)?;
        self.ledger
            .metrics()
            .record_swept(report.points_expired.unsigned_abs());

        tracing::info!(
            accounts_scanned = report.accounts_scanned,
            accounts_expired = report.accounts_expired,
            points_expired = report.points_expired,
            accounts_skipped = report.accounts_skipped,
            failures = report.failures,
            notices = report.expiring_soon.len(),
            "Expiry sweep complete"
        );

        Ok(report)
    }

    /// Run sweeps on the configured interval until `shutdown` resolves
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tracing::info!(
            interval_secs = self.config.interval_secs,
            "Starting expiry sweeper"
        );

        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(self.config.interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Expiry sweeper stopping");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::warn!("Expiry sweep failed: {}", e);
                    }
                }
            }
        }
    }

    fn expiring_soon(&self, now: DateTime<Utc>) -> Result<Vec<ExpiryNotice>> {
        let until = now
            .checked_add_signed(Duration::days(i64::from(self.config.notify_within_days)))
            .ok_or_else(|| Error::Config("sweep.notify_within_days is out of range".to_string()))?;

        let users: BTreeSet<UserId> = self
            .ledger
            .earn_expiring_between(Some(now), until, usize::MAX)?
            .into_iter()
            .map(|tx| tx.user_id)
            .collect();

        let mut notices = Vec::with_capacity(users.len());
        for user_id in users {
            if let Some(notice) = self.ledger.expiry_notice(user_id, now, until)? {
                notices.push(notice);
            }
        }

        Ok(notices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TransactionStatus, TransactionType};
    use uuid::Uuid;

    fn tx(
        tx_type: TransactionType,
        amount: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> PointTransaction {
        PointTransaction {
            transaction_id: Uuid::now_v7(),
            account_id: Uuid::nil(),
            user_id: UserId::new(1),
            sequence: 0,
            tx_type,
            amount,
            balance: 0,
            reference_type: "order".to_string(),
            reference_id: 0,
            description: String::new(),
            notes: None,
            expires_at,
            status: TransactionStatus::Completed,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_partially_redeemed_lot_expires_remainder() {
        let start = Utc::now();
        let history = vec![
            tx(TransactionType::Earn, 100, Some(start + Duration::days(30))),
            tx(TransactionType::Redeem, -50, None),
        ];

        assert_eq!(points_due(&history, 50, start + Duration::days(29)), 0);
        assert_eq!(points_due(&history, 50, start + Duration::days(31)), 50);
    }

    #[test]
    fn test_redemptions_consume_oldest_lot_first() {
        let start = Utc::now();
        let history = vec![
            tx(TransactionType::Earn, 100, Some(start + Duration::days(30))),
            tx(TransactionType::Earn, 100, Some(start + Duration::days(60))),
            tx(TransactionType::Redeem, -150, None),
        ];

        assert_eq!(points_due(&history, 50, start + Duration::days(31)), 0);
        assert_eq!(points_due(&history, 50, start + Duration::days(61)), 50);
    }

    #[test]
    fn test_prior_expiry_counts_as_consumed() {
        let start = Utc::now();
        let history = vec![
            tx(TransactionType::Earn, 100, Some(start + Duration::days(30))),
            tx(TransactionType::Expire, -100, None),
        ];
        assert_eq!(points_due(&history, 0, start + Duration::days(31)), 0);
    }

    #[test]
    fn test_refund_returns_consumption_to_lot() {
        let start = Utc::now();
        let history = vec![
            tx(TransactionType::Earn, 100, Some(start + Duration::days(30))),
            tx(TransactionType::Redeem, -60, None),
            tx(TransactionType::Refund, 60, None),
        ];
        assert_eq!(points_due(&history, 100, start + Duration::days(31)), 100);
    }

    #[test]
    fn test_positive_adjustment_never_expires() {
        let start = Utc::now();
        let history = vec![
            tx(TransactionType::Earn, 10, Some(start + Duration::days(30))),
            tx(TransactionType::Adjust, 25, None),
        ];
        assert_eq!(points_due(&history, 35, start + Duration::days(31)), 10);
    }

    #[test]
    fn test_later_short_lot_not_shielded_by_earlier_redemption() {
        let start = Utc::now();
        let history = vec![
            tx(TransactionType::Earn, 100, Some(start + Duration::days(60))),
            tx(TransactionType::Redeem, -100, None),
            tx(TransactionType::Earn, 100, Some(start + Duration::days(10))),
        ];
        assert_eq!(points_due(&history, 100, start + Duration::days(11)), 100);
    }

    #[test]
    fn test_refund_goes_back_to_its_own_redemption() {
        let start = Utc::now();
        let mut first = tx(TransactionType::Redeem, -100, None);
        first.reference_id = 1;
        let mut second = tx(TransactionType::Redeem, -100, None);
        second.reference_id = 2;
        let mut refund = tx(TransactionType::Refund, 100, None);
        refund.reference_id = 1;

        let history = vec![
            tx(TransactionType::Earn, 100, Some(start + Duration::days(10))),
            tx(TransactionType::Earn, 100, Some(start + Duration::days(60))),
            first,
            second,
            refund,
        ];
        // Order 1 drew the short lot, so its refund matures with it
        assert_eq!(points_due(&history, 100, start + Duration::days(11)), 100);
    }

    #[test]
    fn test_refund_beyond_redemptions_never_expires() {
        let start = Utc::now();
        let history = vec![
            tx(TransactionType::Earn, 10, Some(start + Duration::days(30))),
            tx(TransactionType::Redeem, -10, None),
            tx(TransactionType::Refund, 25, None),
        ];
        assert_eq!(points_due(&history, 25, start + Duration::days(31)), 10);
    }

    #[test]
    fn test_points_expiring_subtracts_consumption() {
        let start = Utc::now();
        let history = vec![
            tx(TransactionType::Earn, 100, Some(start + Duration::days(30))),
            tx(TransactionType::Earn, 50, Some(start + Duration::days(60))),
            tx(TransactionType::Redeem, -100, None),
        ];

        let day = |n| start + Duration::days(n);
        assert_eq!(points_expiring(&history, 50, day(25), day(32)), None);
        assert_eq!(
            points_expiring(&history, 50, day(55), day(62)),
            Some((50, day(60)))
        );
    }

    #[test]
    fn test_has_matured_lots() {
        let start = Utc::now();
        let history = vec![tx(TransactionType::Earn, 5, Some(start + Duration::days(1)))];
        assert!(!has_matured_lots(&history, start));
        assert!(has_matured_lots(&history, start + Duration::days(1)));
    }

    #[test]
    fn test_due_capped_at_balance() {
        let start = Utc::now();
        let history = vec![tx(TransactionType::Earn, 100, Some(start))];
        assert_eq!(points_due(&history, 30, start), 30);
    }
}
