//! Ledger store
//!
//! Ties together storage and the single-writer actor into the durable,
//! append-only transaction log that balances are derived from.
//!
//! # Example
//!
//! ```no_run
//! use ledger_node::{types::AccountId, Config, Ledger};
//!
//! #[tokio::main]
//! async fn main() -> ledger_node::Result<()> {
//!     let config = Config::default();
//!     let ledger = Ledger::open(&config).await?;
//!     ledger.ensure_genesis().await?;
//!
//!     let balance = ledger.balance(&AccountId::system())?;
//!     println!("system balance: {}", balance);
//!     Ok(())
//! }
//! ```

use crate::{
    actor::{spawn_ledger_actor, LedgerHandle},
    storage::Flow,
    types::{AccountId, AppendOutcome, Transaction, TxState},
    Config, Error, Result, Storage,
};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Durable transaction log
#[derive(Debug)]
pub struct Ledger {
    /// Actor handle for writes
    handle: LedgerHandle,

    /// Direct storage access (for reads)
    storage: Arc<Storage>,
}

impl Ledger {
    /// Open ledger with configuration
    pub async fn open(config: &Config) -> Result<Self> {
        let storage = Arc::new(Storage::open(config)?);
        let handle = spawn_ledger_actor(storage.clone());

        Ok(Self { handle, storage })
    }

    /// Append a confirmed transaction
    ///
    /// Appending an id that is already present writes nothing and reports
    /// [`AppendOutcome::Duplicate`].
    pub async fn append(&self, tx: &Transaction) -> Result<AppendOutcome> {
        self.handle.append(tx.clone()).await
    }

    /// Point lookup
    pub fn transaction(&self, id: Uuid) -> Result<Option<Transaction>> {
        self.storage.get_transaction(id)
    }

    /// Whether `id` has been persisted
    pub fn contains(&self, id: Uuid) -> Result<bool> {
        self.storage.contains_transaction(id)
    }

    /// Balance of `account`: received minus sent, over confirmed records
    ///
    /// Recomputed from the log on every call.
    pub fn balance(&self, account: &AccountId) -> Result<Decimal> {
        let received: Decimal = self
            .storage
            .account_transactions(Flow::Incoming, account)?
            .iter()
            .filter(|t| t.state() == TxState::Confirmed)
            .map(|t| t.amount)
            .sum();

        let sent: Decimal = self
            .storage
            .account_transactions(Flow::Outgoing, account)?
            .iter()
            .filter(|t| t.state() == TxState::Confirmed)
            .map(|t| t.amount)
            .sum();

        Ok(received - sent)
    }

    /// Check that `account` can cover `amount`, returning the balance
    pub fn ensure_funds(&self, account: &AccountId, amount: Decimal) -> Result<Decimal> {
        let available = self.balance(account)?;
        if available < amount {
            return Err(Error::InsufficientBalance {
                account: account.to_string(),
                required: amount,
                available,
            });
        }
        Ok(available)
    }

    /// Insert the genesis record if the log is empty
    pub async fn ensure_genesis(&self) -> Result<bool> {
        self.handle.ensure_genesis().await
    }

    /// Exact number of persisted transactions
    pub fn row_count(&self) -> Result<u64> {
        self.storage.count_transactions()
    }

    /// Transactions involving `account`, most recently confirmed first
    pub fn history(&self, account: &AccountId, limit: usize) -> Result<Vec<Transaction>> {
        let mut seen = HashSet::new();
        let mut txs: Vec<Transaction> = self
            .storage
            .account_transactions(Flow::Incoming, account)?
            .into_iter()
            .chain(self.storage.account_transactions(Flow::Outgoing, account)?)
            .filter(|t| seen.insert(t.id))
            .collect();

        txs.sort_by(|a, b| b.confirm_time().cmp(&a.confirm_time()));
        txs.truncate(limit);
        Ok(txs)
    }

    /// Underlying storage
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Stop the writer actor
    ///
    /// Reads keep working through the shared storage handle, which closes
    /// when the last clone of it is dropped.
    pub async fn shutdown(&self) -> Result<()> {
        self.handle.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GENESIS_AMOUNT;
    use chrono::Utc;

    async fn create_test_ledger() -> (Ledger, tempfile::TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        (Ledger::open(&config).await.unwrap(), temp_dir)
    }

    fn confirmed(from: &str, to: &str, amount: i64) -> Transaction {
        let mut tx = Transaction::initiate(AccountId::new(from), AccountId::new(to), Decimal::from(amount));
        tx.stamp_request(Utc::now());
        tx.stamp_confirm(Utc::now());
        tx
    }

    #[tokio::test]
    async fn test_ledger_open() {
        let (ledger, _temp) = create_test_ledger().await;
        assert_eq!(ledger.row_count().unwrap(), 0);
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_genesis_seeds_system() {
        let (ledger, _temp) = create_test_ledger().await;

        assert!(ledger.ensure_genesis().await.unwrap());
        assert!(!ledger.ensure_genesis().await.unwrap());

        assert_eq!(ledger.row_count().unwrap(), 1);
        assert_eq!(
            ledger.balance(&AccountId::system()).unwrap(),
            Decimal::from(GENESIS_AMOUNT)
        );

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_append_is_idempotent() {
        let (ledger, _temp) = create_test_ledger().await;
        ledger.ensure_genesis().await.unwrap();

        let tx = confirmed("system", "alice", 100);
        assert_eq!(ledger.append(&tx).await.unwrap(), AppendOutcome::Appended);

        let mut replay = tx.clone();
        replay.amount = Decimal::from(999);
        assert_eq!(ledger.append(&replay).await.unwrap(), AppendOutcome::Duplicate);

        assert_eq!(ledger.row_count().unwrap(), 2);
        assert_eq!(ledger.transaction(tx.id).unwrap().unwrap().amount, Decimal::from(100));
        assert_eq!(ledger.balance(&AccountId::new("alice")).unwrap(), Decimal::from(100));

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_balance_derivation() {
        let (ledger, _temp) = create_test_ledger().await;
        ledger.ensure_genesis().await.unwrap();

        ledger.append(&confirmed("system", "alice", 100)).await.unwrap();
        ledger.append(&confirmed("alice", "bob", 30)).await.unwrap();
        ledger.append(&confirmed("bob", "alice", 5)).await.unwrap();

        assert_eq!(ledger.balance(&AccountId::new("alice")).unwrap(), Decimal::from(75));
        assert_eq!(ledger.balance(&AccountId::new("Bob")).unwrap(), Decimal::from(25));
        assert_eq!(
            ledger.balance(&AccountId::system()).unwrap(),
            Decimal::from(GENESIS_AMOUNT - 100)
        );
        assert_eq!(ledger.balance(&AccountId::new("nobody")).unwrap(), Decimal::ZERO);

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_funds() {
        let (ledger, _temp) = create_test_ledger().await;
        ledger.ensure_genesis().await.unwrap();

        assert!(ledger.ensure_funds(&AccountId::system(), Decimal::from(10)).is_ok());
        let err = ledger
            .ensure_funds(&AccountId::new("alice"), Decimal::from(10))
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { .. }));
        assert_eq!(err.code(), "notEnoughBalance");

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_history_newest_first() {
        let (ledger, _temp) = create_test_ledger().await;
        ledger.ensure_genesis().await.unwrap();

        let first = confirmed("system", "alice", 1);
        ledger.append(&first).await.unwrap();
        let second = confirmed("alice", "alice", 1);
        ledger.append(&second).await.unwrap();

        let history = ledger.history(&AccountId::new("alice"), 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, second.id);

        assert_eq!(ledger.history(&AccountId::new("alice"), 1).unwrap().len(), 1);

        ledger.shutdown().await.unwrap();
    }
}
