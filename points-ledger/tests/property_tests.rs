//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify critical invariants:
//! - Balance conservation: balance == Σ(transaction amounts)
//! - Non-negativity: no sequence of operations overdraws an account
//! - Monotonic lifetime counters
//! - Snapshot correctness: each transaction stores the balance after it
//! - Stable newest-first pagination

use points_ledger::{
    Account, Config, Error, HistoryQuery, Ledger, ManualClock, MemoryStorage, Reference, UserId,
};
use proptest::prelude::*;
use std::sync::Arc;

/// One balance mutation
#[derive(Debug, Clone)]
enum Op {
    Earn(i64),
    Redeem(i64),
    Refund(i64),
    Adjust(i64),
    Expire(i64),
}

/// Strategy for generating point amounts
fn amount_strategy() -> impl Strategy<Value = i64> {
    1i64..500
}

/// Strategy for generating operations, earn-heavy so redemptions mostly succeed
fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => amount_strategy().prop_map(Op::Earn),
        2 => amount_strategy().prop_map(Op::Redeem),
        1 => amount_strategy().prop_map(Op::Refund),
        1 => (-300i64..300).prop_filter("non-zero", |a| *a != 0).prop_map(Op::Adjust),
        1 => amount_strategy().prop_map(Op::Expire),
    ]
}

/// Create test ledger over in-memory storage
async fn create_test_ledger() -> Ledger {
    let mut config = Config::default();
    config.ledger.shards = 2;
    Ledger::with_storage(
        config,
        Arc::new(MemoryStorage::new()),
        Arc::new(ManualClock::new(chrono::Utc::now())),
    )
    .await
    .unwrap()
}

async fn apply(ledger: &Ledger, user: UserId, op: &Op, order: u64) -> points_ledger::Result<()> {
    let reference = Reference::order(order);
    match *op {
        Op::Earn(amount) => ledger.earn(user, amount, reference, "reward", None).await,
        Op::Redeem(amount) => ledger.redeem(user, amount, reference, "checkout").await,
        Op::Refund(amount) => ledger.refund(user, amount, reference, "return").await,
        Op::Adjust(amount) => ledger.adjust(user, amount, "correction", None).await,
        Op::Expire(amount) => ledger.expire(user, amount, "expired").await,
    }
    .map(|_| ())
}

fn counters(account: &Option<Account>) -> (i64, i64, i64) {
    account
        .as_ref()
        .map_or((0, 0, 0), |a| (a.total_earned, a.total_redeemed, a.total_expired))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: any operation sequence keeps the log and the account consistent
    #[test]
    fn prop_balance_invariant_holds(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ledger = create_test_ledger().await;
            let user = UserId::new(42);

            for (i, op) in ops.iter().enumerate() {
                let before = ledger.account(user).unwrap();
                let result = apply(&ledger, user, op, i as u64 + 1).await;
                let after = ledger.account(user).unwrap();

                if result.is_err() {
                    // Rejections leave the account exactly as it was
                    prop_assert_eq!(&before, &after);
                }

                let (earned0, redeemed0, expired0) = counters(&before);
                let (earned1, redeemed1, expired1) = counters(&after);
                prop_assert!(earned1 >= earned0);
                prop_assert!(redeemed1 >= redeemed0);
                prop_assert!(expired1 >= expired0);

                prop_assert!(ledger.balance(user).unwrap() >= 0);
            }

            if ledger.account(user).unwrap().is_some() {
                prop_assert!(ledger.verify_account(user).is_ok());
            }

            ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }

    /// Property: each transaction's snapshot is the balance right after it
    #[test]
    fn prop_snapshots_track_running_balance(amounts in prop::collection::vec(amount_strategy(), 1..20)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ledger = create_test_ledger().await;
            let user = UserId::new(7);

            let mut expected = 0;
            for (i, amount) in amounts.iter().enumerate() {
                let tx = ledger
                    .earn(user, *amount, Reference::order(i as u64 + 1), "reward", None)
                    .await
                    .unwrap();
                expected += amount;
                prop_assert_eq!(tx.balance, expected);
                prop_assert_eq!(tx.sequence, i as u64);
            }

            let spend = expected / 2;
            if spend > 0 {
                let tx = ledger
                    .redeem(user, spend, Reference::order(10_000), "checkout")
                    .await
                    .unwrap();
                prop_assert_eq!(tx.balance, expected - spend);
            }

            ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }

    /// Property: redeeming more than the balance is always rejected without effect
    #[test]
    fn prop_overdraw_rejected(earned in amount_strategy(), extra in 1i64..1000) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ledger = create_test_ledger().await;
            let user = UserId::new(3);

            ledger.earn(user, earned, Reference::order(1), "reward", None).await.unwrap();
            let result = ledger.redeem(user, earned + extra, Reference::order(2), "checkout").await;

            let is_insufficient = matches!(
                result,
                Err(Error::InsufficientBalance { requested, available })
                    if requested == earned + extra && available == earned
            );
            prop_assert!(is_insufficient);
            prop_assert_eq!(ledger.balance(user).unwrap(), earned);

            ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }

    /// Property: pages are disjoint, newest first, and cover the whole history
    #[test]
    fn prop_pagination_is_stable(count in 1usize..40, per_page in 1usize..10) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ledger = create_test_ledger().await;
            let user = UserId::new(11);

            for i in 0..count {
                ledger
                    .earn(user, 1, Reference::order(i as u64 + 1), "reward", None)
                    .await
                    .unwrap();
            }

            let mut sequences = Vec::new();
            let mut page = 1;
            loop {
                let result = ledger
                    .history(user, &HistoryQuery { page, per_page, ..HistoryQuery::default() })
                    .unwrap();
                prop_assert_eq!(result.total, count);
                if result.items.is_empty() {
                    break;
                }
                sequences.extend(result.items.iter().map(|tx| tx.sequence));
                page += 1;
            }

            let expected: Vec<u64> = (0..count as u64).rev().collect();
            prop_assert_eq!(sequences, expected);
            prop_assert_eq!(page - 1, count.div_ceil(per_page));

            ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use points_ledger::TransactionType;

    #[tokio::test]
    async fn test_balance_read_is_idempotent() {
        let ledger = create_test_ledger().await;
        let user = UserId::new(99);

        assert_eq!(ledger.balance(user).unwrap(), 0);
        assert_eq!(ledger.balance(user).unwrap(), 0);
        assert!(ledger.account(user).unwrap().is_none());

        ledger.earn(user, 25, Reference::order(1), "reward", None).await.unwrap();
        assert_eq!(ledger.balance(user).unwrap(), 25);
        assert_eq!(ledger.balance(user).unwrap(), 25);

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_redemptions_never_overdraw() {
        let ledger = Arc::new(create_test_ledger().await);

        for id in 1..=20u64 {
            let user = UserId::new(id);
            ledger.earn(user, 100, Reference::order(id), "reward", None).await.unwrap();

            let first = {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger.redeem(user, 60, Reference::order(1000 + id), "checkout A").await
                })
            };
            let second = {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger.redeem(user, 60, Reference::order(2000 + id), "checkout B").await
                })
            };

            let results = [first.await.unwrap(), second.await.unwrap()];
            let succeeded = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(succeeded, 1);
            assert!(results
                .iter()
                .any(|r| matches!(r, Err(Error::InsufficientBalance { available: 40, .. }))));
            assert_eq!(ledger.balance(user).unwrap(), 40);
            ledger.verify_account(user).unwrap();
        }

        let ledger = Arc::try_unwrap(ledger).unwrap();
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_redeem_and_expire_stay_consistent() {
        let ledger = Arc::new(create_test_ledger().await);
        let user = UserId::new(5);
        ledger.earn(user, 100, Reference::order(1), "reward", None).await.unwrap();

        let redeem = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.redeem(user, 60, Reference::order(2), "checkout").await })
        };
        let expire = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.expire(user, 60, "expired").await })
        };
        let redeemed = redeem.await.unwrap();
        let expired = expire.await.unwrap().unwrap();

        let account = ledger.account(user).unwrap().unwrap();
        match redeemed {
            // Expire ran first and took 60; 40 cannot cover the redemption
            Err(Error::InsufficientBalance { requested, available }) => {
                assert_eq!((requested, available), (60, 40));
                assert_eq!(expired.amount, -60);
                assert_eq!(account.balance, 40);
                assert_eq!(account.total_redeemed + account.total_expired, 60);
            }
            // Redeem ran first; expire is clamped to the remaining 40
            Ok(tx) => {
                assert_eq!(tx.balance, 40);
                assert_eq!(expired.amount, -40);
                assert_eq!(account.balance, 0);
                assert_eq!(account.total_redeemed + account.total_expired, 100);
            }
            Err(e) => panic!("unexpected redemption error: {}", e),
        }
        ledger.verify_account(user).unwrap();

        let ledger = Arc::try_unwrap(ledger).unwrap();
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_expire_clamps_to_balance() {
        let ledger = create_test_ledger().await;
        let user = UserId::new(6);

        ledger.earn(user, 10, Reference::order(1), "reward", None).await.unwrap();
        let tx = ledger.expire(user, 30, "expired").await.unwrap();

        assert_eq!(tx.tx_type, TransactionType::Expire);
        assert_eq!(tx.amount, -10);
        assert_eq!(tx.balance, 0);
        assert_eq!(ledger.balance(user).unwrap(), 0);

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_reference_is_replayed() {
        let ledger = create_test_ledger().await;
        let user = UserId::new(8);

        let first = ledger.earn(user, 40, Reference::order(77), "reward", None).await.unwrap();
        let retry = ledger.earn(user, 40, Reference::order(77), "reward", None).await.unwrap();
        assert_eq!(first.transaction_id, retry.transaction_id);
        assert_eq!(ledger.balance(user).unwrap(), 40);

        // Same order id under a different type is a different posting
        ledger.redeem(user, 40, Reference::order(77), "checkout").await.unwrap();
        assert_eq!(ledger.balance(user).unwrap(), 0);

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_rocksdb_state_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        let user = UserId::new(21);

        {
            let ledger = Ledger::open(config.clone()).await.unwrap();
            ledger.earn(user, 50, Reference::order(1), "reward", None).await.unwrap();
            ledger.redeem(user, 20, Reference::order(2), "checkout").await.unwrap();
            ledger.shutdown().await.unwrap();
        }

        let ledger = Ledger::open(config).await.unwrap();
        assert_eq!(ledger.balance(user).unwrap(), 30);
        let history = ledger.history(user, &HistoryQuery::default()).unwrap();
        assert_eq!(history.total, 2);
        assert_eq!(history.items[0].tx_type, TransactionType::Redeem);
        ledger.verify_account(user).unwrap();

        let tx = ledger.earn(user, 5, Reference::order(3), "reward", None).await.unwrap();
        assert_eq!(tx.sequence, 2);
        assert_eq!(tx.balance, 35);

        ledger.shutdown().await.unwrap();
    }
}
