//! In-memory holding area for transactions not yet durably confirmed
//!
//! Keyed upsert by id: inserting a transaction whose id is already queued
//! replaces the earlier entry and moves it to the back. Every operation takes
//! the lock briefly and never awaits, so request handlers and the sync tick
//! can share one queue.
//!
//! With a mirror attached, new entries are also written to the `pending`
//! table so a restarted node can pick them up again.

use crate::{
    types::{PendingTransaction, Transaction},
    Result, Storage,
};
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// Pending transaction queue
#[derive(Debug, Default)]
pub struct Queue {
    entries: Mutex<Vec<Transaction>>,
    mirror: Option<Arc<Storage>>,
}

impl Queue {
    /// Queue without a pending-table mirror
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue mirrored into the pending table of `storage`
    pub fn with_mirror(storage: Arc<Storage>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            mirror: Some(storage),
        }
    }

    /// Insert or replace transactions by id, mirroring them to the pending table
    pub fn upsert(&self, txs: impl IntoIterator<Item = Transaction>) -> Result<()> {
        let txs: Vec<Transaction> = txs.into_iter().collect();
        if let Some(storage) = &self.mirror {
            for tx in &txs {
                storage.put_pending(&PendingTransaction::from(tx))?;
            }
        }
        self.requeue(txs);
        Ok(())
    }

    /// Insert or replace transactions by id without touching the pending table
    ///
    /// Used for entries that were drained by a tick and already have a row.
    pub fn requeue(&self, txs: impl IntoIterator<Item = Transaction>) {
        let mut entries = self.entries.lock();
        for tx in txs {
            entries.retain(|e| e.id != tx.id);
            entries.push(tx);
        }
    }

    /// Take every entry, in insertion order
    pub fn drain(&self) -> Vec<Transaction> {
        std::mem::take(&mut *self.entries.lock())
    }

    /// Drop entries and their pending rows; returns how many were queued
    pub fn remove(&self, ids: &[Uuid]) -> Result<usize> {
        let removed = {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|e| !ids.contains(&e.id));
            before - entries.len()
        };
        self.forget(ids)?;
        Ok(removed)
    }

    /// Delete pending rows for entries that are no longer queued
    pub fn forget(&self, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        if let Some(storage) = &self.mirror {
            storage.delete_pending(ids)?;
        }
        Ok(())
    }

    /// Reload entries from the pending table; returns how many were restored
    pub fn restore(&self) -> Result<usize> {
        let Some(storage) = &self.mirror else {
            return Ok(0);
        };
        let rows = storage.load_pending()?;
        let count = rows.len();
        self.requeue(rows.into_iter().map(Transaction::from));
        if count > 0 {
            tracing::info!(count, "Restored pending transactions");
        }
        Ok(count)
    }

    /// Copy of a queued entry
    pub fn get(&self, id: Uuid) -> Option<Transaction> {
        self.entries.lock().iter().find(|e| e.id == id).cloned()
    }

    /// Copy of all entries
    pub fn snapshot(&self) -> Vec<Transaction> {
        self.entries.lock().clone()
    }

    /// Number of queued entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountId, TxState};
    use crate::Config;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn transfer(amount: i64) -> Transaction {
        Transaction::initiate(AccountId::system(), AccountId::new("alice"), Decimal::from(amount))
    }

    #[test]
    fn test_upsert_replaces_by_id() {
        let queue = Queue::new();
        let first = transfer(1);
        let other = transfer(2);
        let mut second = first.clone();
        second.amount = Decimal::from(50);

        queue.upsert(vec![first.clone(), other.clone()]).unwrap();
        queue.upsert(vec![second.clone()]).unwrap();

        let entries = queue.snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, other.id);
        assert_eq!(entries[1].id, first.id);
        assert_eq!(entries[1].amount, Decimal::from(50));
    }

    #[test]
    fn test_drain_empties_in_order() {
        let queue = Queue::new();
        let a = transfer(1);
        let b = transfer(2);
        queue.upsert(vec![a.clone(), b.clone()]).unwrap();

        let drained = queue.drain();
        assert_eq!(drained.iter().map(|t| t.id).collect::<Vec<_>>(), vec![a.id, b.id]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_keeps_latest_state() {
        let queue = Queue::new();
        let mut tx = transfer(1);
        queue.upsert(vec![tx.clone()]).unwrap();

        tx.stamp_request(Utc::now());
        queue.requeue(vec![tx.clone()]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get(tx.id).unwrap().state(), TxState::Requested);
    }

    #[test]
    fn test_mirror_and_restore() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());

        let queue = Queue::with_mirror(storage.clone());
        let keep = transfer(1);
        let mut drop_me = transfer(2);
        queue.upsert(vec![keep.clone(), drop_me.clone()]).unwrap();

        drop_me.stamp_request(Utc::now());
        queue.requeue(vec![drop_me.clone()]);
        assert_eq!(queue.remove(&[drop_me.id]).unwrap(), 1);

        let restarted = Queue::with_mirror(storage);
        assert_eq!(restarted.restore().unwrap(), 1);
        let restored = restarted.get(keep.id).unwrap();
        assert_eq!(restored.state(), TxState::Initiated);
        assert_eq!(restored.amount, keep.amount);
    }
}
