//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify:
//! - Idempotency: appending an id twice leaves one row
//! - Balance derivation: balance == Σ(received) - Σ(sent) over confirmed records
//! - Lifecycle: state is a function of the timestamps alone
//! - Queue upsert: one entry per id, carrying the latest payload

use chrono::{Duration, TimeZone, Utc};
use ledger_node::{
    types::{AccountId, AppendOutcome, Transaction, TxState, GENESIS_AMOUNT},
    Config, Ledger, Queue,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Strategy for generating valid amounts (positive decimals)
fn amount_strategy() -> impl Strategy<Value = Decimal> {
    (1u64..1_000_000_00u64).prop_map(|cents| Decimal::new(cents as i64, 2))
}

/// Strategy for generating account IDs from a small pool, so transfers collide
fn account_strategy() -> impl Strategy<Value = AccountId> {
    prop_oneof![
        Just(AccountId::new("alice")),
        Just(AccountId::new("bob")),
        Just(AccountId::new("carol")),
        Just(AccountId::system()),
    ]
}

/// Strategy for confirmed transfers
fn transfer_strategy() -> impl Strategy<Value = Transaction> {
    (account_strategy(), account_strategy(), amount_strategy()).prop_map(|(from, to, amount)| {
        let mut tx = Transaction::initiate(from, to, amount);
        tx.stamp_request(Utc::now());
        tx.stamp_confirm(Utc::now());
        tx
    })
}

/// Helper to create test ledger
async fn create_test_ledger() -> (Ledger, tempfile::TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();

    let ledger = Ledger::open(&config).await.unwrap();
    ledger.ensure_genesis().await.unwrap();
    (ledger, temp_dir)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: replaying every append leaves exactly one row per id
    #[test]
    fn prop_append_idempotent(txs in prop::collection::vec(transfer_strategy(), 1..20)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger().await;

            for tx in &txs {
                prop_assert_eq!(ledger.append(tx).await.unwrap(), AppendOutcome::Appended);
            }
            for tx in &txs {
                prop_assert_eq!(ledger.append(tx).await.unwrap(), AppendOutcome::Duplicate);
            }

            prop_assert_eq!(ledger.row_count().unwrap(), txs.len() as u64 + 1);

            ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }

    /// Property: balances equal received minus sent, and total money is conserved
    #[test]
    fn prop_balance_derivation(txs in prop::collection::vec(transfer_strategy(), 0..20)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger().await;

            let mut expected: HashMap<AccountId, Decimal> = HashMap::new();
            expected.insert(AccountId::system(), Decimal::from(GENESIS_AMOUNT));

            for tx in &txs {
                ledger.append(tx).await.unwrap();
                *expected.entry(tx.to.clone()).or_default() += tx.amount;
                if let Some(from) = &tx.from {
                    *expected.entry(from.clone()).or_default() -= tx.amount;
                }
            }

            let mut total = Decimal::ZERO;
            for (account, amount) in &expected {
                let balance = ledger.balance(account).unwrap();
                prop_assert_eq!(balance, *amount);
                total += balance;
            }
            prop_assert_eq!(total, Decimal::from(GENESIS_AMOUNT));

            ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }

    /// Property: state follows the timestamps present, nothing else
    #[test]
    fn prop_state_from_timestamps(
        offset_secs in 0i64..86_400,
        has_request in any::<bool>(),
        has_confirm in any::<bool>(),
    ) {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let request = has_request.then(|| base + Duration::seconds(offset_secs));
        let confirm = has_confirm.then(|| base + Duration::seconds(offset_secs + 1));

        let expected = match (has_request, has_confirm) {
            (false, false) => TxState::Initiated,
            (true, false) => TxState::Requested,
            (true, true) => TxState::Confirmed,
            (false, true) => TxState::Failed,
        };

        prop_assert_eq!(TxState::classify(request.as_ref(), confirm.as_ref()), expected);
    }

    /// Property: upserting the same id keeps one entry with the last payload
    #[test]
    fn prop_queue_upsert_keeps_latest(amounts in prop::collection::vec(amount_strategy(), 1..10)) {
        let queue = Queue::new();
        let base = Transaction::initiate(AccountId::system(), AccountId::new("alice"), Decimal::ONE);

        for amount in &amounts {
            let mut tx = base.clone();
            tx.amount = *amount;
            queue.upsert(vec![tx]).unwrap();
        }

        prop_assert_eq!(queue.len(), 1);
        prop_assert_eq!(queue.get(base.id).unwrap().amount, *amounts.last().unwrap());
    }
}
