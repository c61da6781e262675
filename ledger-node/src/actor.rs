//! Single-writer actor for the transaction log
//!
//! Every append goes through one Tokio task, so the "is this id already
//! present?" check and the write that follows can never interleave with
//! another append of the same id. Reads bypass the actor and go straight to
//! [`Storage`].
//!
//! # Architecture
//!
//! ```text
//!  sync tick ──┐
//!              │   LedgerHandle (Clone)
//!  finalize ───┼──────────────────────────┐
//!  handlers    │                          │ mpsc::channel (bounded)
//!              ┘                          ▼
//!                         ┌───────────────────────────────┐
//!                         │    LedgerActor (single task)  │
//!                         │  contains? ─ yes ─> Duplicate │
//!                         │      │                        │
//!                         │      no                       │
//!                         │      ▼                        │
//!                         │  Storage::put_transaction()   │
//!                         │  (atomic WriteBatch)          │
//!                         └───────────────────────────────┘
//! ```

use crate::types::{AppendOutcome, Transaction, TxState};
use crate::{Error, Result, Storage};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Message sent to the ledger actor
#[derive(Debug)]
pub enum LedgerMessage {
    /// Append a confirmed transaction
    Append {
        tx: Transaction,
        response: oneshot::Sender<Result<AppendOutcome>>,
    },

    /// Insert the genesis record if the log is empty
    EnsureGenesis {
        response: oneshot::Sender<Result<bool>>,
    },

    /// Shutdown actor; acknowledged once the actor has exited and dropped its storage handle
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

/// Actor that owns all writes to the transaction log
#[derive(Debug)]
pub struct LedgerActor {
    /// Storage backend
    storage: Arc<Storage>,

    /// Mailbox for incoming messages
    mailbox: mpsc::Receiver<LedgerMessage>,
}

impl LedgerActor {
    /// Create new actor
    pub fn new(storage: Arc<Storage>, mailbox: mpsc::Receiver<LedgerMessage>) -> Self {
        Self { storage, mailbox }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        let mut ack = None;
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                LedgerMessage::Append { tx, response } => {
                    let result = self.append(&tx);
                    if let Err(e) = &result {
                        tracing::error!(tx_id = %tx.id, "Append failed: {}", e);
                    }
                    let _ = response.send(result);
                }

                LedgerMessage::EnsureGenesis { response } => {
                    let _ = response.send(self.ensure_genesis());
                }

                LedgerMessage::Shutdown { response } => {
                    ack = Some(response);
                    break;
                }
            }
        }

        drop(self);
        tracing::debug!("Ledger actor stopped");
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    fn append(&self, tx: &Transaction) -> Result<AppendOutcome> {
        if tx.state() != TxState::Confirmed {
            return Err(Error::InvalidTransaction(format!(
                "{} is {}, only confirmed transactions are appended",
                tx.id,
                tx.state()
            )));
        }
        tx.validate()?;

        if self.storage.contains_transaction(tx.id)? {
            tracing::info!(tx_id = %tx.id, "Transaction already exists, skipping append");
            return Ok(AppendOutcome::Duplicate);
        }

        self.storage.put_transaction(tx)?;
        Ok(AppendOutcome::Appended)
    }

    fn ensure_genesis(&self) -> Result<bool> {
        if !self.storage.is_empty()? {
            return Ok(false);
        }

        let genesis = Transaction::genesis();
        self.storage.put_transaction(&genesis)?;
        tracing::info!(tx_id = %genesis.id, amount = %genesis.amount, "Genesis transaction created");
        Ok(true)
    }
}

/// Handle for sending messages to the actor
#[derive(Debug, Clone)]
pub struct LedgerHandle {
    sender: mpsc::Sender<LedgerMessage>,
}

impl LedgerHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<LedgerMessage>) -> Self {
        Self { sender }
    }

    /// Append a confirmed transaction
    pub async fn append(&self, tx: Transaction) -> Result<AppendOutcome> {
        let (response, rx) = oneshot::channel();
        self.sender
            .send(LedgerMessage::Append { tx, response })
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Insert genesis if the log is empty; returns whether it was inserted
    pub async fn ensure_genesis(&self) -> Result<bool> {
        let (response, rx) = oneshot::channel();
        self.sender
            .send(LedgerMessage::EnsureGenesis { response })
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Shutdown actor and wait for it to exit
    ///
    /// The database stays open until every other `Arc<Storage>` holder
    /// (the owning `Ledger` and a mirrored `Queue`) is dropped as well.
    pub async fn shutdown(&self) -> Result<()> {
        let (response, rx) = oneshot::channel();
        self.sender
            .send(LedgerMessage::Shutdown { response })
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }
}

/// Spawn the ledger actor
pub fn spawn_ledger_actor(storage: Arc<Storage>) -> LedgerHandle {
    let (tx, rx) = mpsc::channel(1000); // Bounded channel for backpressure
    let actor = LedgerActor::new(storage, rx);

    tokio::spawn(async move {
        actor.run().await;
    });

    LedgerHandle::new(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AccountId;
    use crate::Config;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn open_storage() -> (Arc<Storage>, tempfile::TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (Arc::new(Storage::open(&config).unwrap()), temp_dir)
    }

    #[tokio::test]
    async fn test_actor_spawn_and_shutdown() {
        let (storage, _temp) = open_storage();
        let handle = spawn_ledger_actor(storage);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_actor_rejects_unconfirmed() {
        let (storage, _temp) = open_storage();
        let handle = spawn_ledger_actor(storage.clone());

        let mut tx = Transaction::initiate(AccountId::system(), AccountId::new("alice"), Decimal::TEN);
        tx.stamp_request(Utc::now());

        let result = handle.append(tx).await;
        assert!(matches!(result, Err(Error::InvalidTransaction(_))));
        assert_eq!(storage.count_transactions().unwrap(), 0);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_appends_of_same_id() {
        let (storage, _temp) = open_storage();
        let handle = spawn_ledger_actor(storage.clone());

        let mut tx = Transaction::initiate(AccountId::system(), AccountId::new("alice"), Decimal::TEN);
        tx.stamp_request(Utc::now());
        tx.stamp_confirm(Utc::now());

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let handle = handle.clone();
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move { handle.append(tx).await }));
        }

        let mut appended = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() == AppendOutcome::Appended {
                appended += 1;
            }
        }

        assert_eq!(appended, 1);
        assert_eq!(storage.count_transactions().unwrap(), 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_genesis_inserted_once() {
        let (storage, _temp) = open_storage();
        let handle = spawn_ledger_actor(storage.clone());

        assert!(handle.ensure_genesis().await.unwrap());
        assert!(!handle.ensure_genesis().await.unwrap());
        assert_eq!(storage.count_transactions().unwrap(), 1);

        handle.shutdown().await.unwrap();
    }
}
