//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `transactions` - Append-only transaction log (key: transaction id)
//! - `indices` - Account indices for balance aggregation
//!   (key: direction || account || `|` || transaction id)
//! - `pending` - Pending-transactions table mirroring the in-memory queue
//!   (key: transaction id)

use crate::{
    error::{Error, Result},
    types::{AccountId, PendingTransaction, Transaction},
    Config,
};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB,
};
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_TRANSACTIONS: &str = "transactions";
const CF_INDICES: &str = "indices";
const CF_PENDING: &str = "pending";

/// Which side of a transfer an index entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Account is the receiver
    Incoming,
    /// Account is the sender
    Outgoing,
}

impl Flow {
    fn tag(self) -> u8 {
        match self {
            Flow::Incoming => b'i',
            Flow::Outgoing => b'o',
        }
    }
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("path", &self.db.path()).finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Self::cf_options_transactions()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
            ColumnFamilyDescriptor::new(CF_PENDING, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened RocksDB");

        Ok(Self { db: Arc::new(db) })
    }

    fn cf_options_transactions() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        // Indices benefit from bloom filters
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    // Transaction log

    /// Write a transaction and its account indices in one batch
    ///
    /// Does not check for an existing id; callers go through the ledger actor,
    /// which does.
    pub fn put_transaction(&self, tx: &Transaction) -> Result<()> {
        let mut batch = WriteBatch::default();

        let cf_transactions = self.cf_handle(CF_TRANSACTIONS)?;
        batch.put_cf(&cf_transactions, tx.id.as_bytes(), bincode::serialize(tx)?);

        let cf_indices = self.cf_handle(CF_INDICES)?;
        batch.put_cf(&cf_indices, Self::index_key(Flow::Incoming, &tx.to, tx.id), b"");
        if let Some(from) = &tx.from {
            batch.put_cf(&cf_indices, Self::index_key(Flow::Outgoing, from, tx.id), b"");
        }

        // The pending row, if any, is superseded by the durable record
        let cf_pending = self.cf_handle(CF_PENDING)?;
        batch.delete_cf(&cf_pending, tx.id.as_bytes());

        self.db.write(batch)?;

        tracing::debug!(tx_id = %tx.id, "Transaction appended");

        Ok(())
    }

    /// Get transaction by ID
    pub fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Check whether a transaction ID is present
    pub fn contains_transaction(&self, id: Uuid) -> Result<bool> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        Ok(self.db.get_pinned_cf(&cf, id.as_bytes())?.is_some())
    }

    /// Exact row count of the transaction log
    pub fn count_transactions(&self) -> Result<u64> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        let mut count = 0u64;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Whether the transaction log has no rows
    pub fn is_empty(&self) -> Result<bool> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        match self.db.iterator_cf(&cf, IteratorMode::Start).next() {
            Some(item) => {
                item?;
                Ok(false)
            }
            None => Ok(true),
        }
    }

    /// All transactions where `account` is on the given side
    pub fn account_transactions(&self, flow: Flow, account: &AccountId) -> Result<Vec<Transaction>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let prefix = Self::index_prefix(flow, account);

        let mut out = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf_indices, IteratorMode::From(prefix.as_slice(), Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix.as_slice()) {
                break;
            }
            // Longer account names sharing this prefix are skipped
            if key.len() != prefix.len() + 16 {
                continue;
            }
            let id_bytes: [u8; 16] = key[prefix.len()..]
                .try_into()
                .map_err(|_| Error::Storage("Malformed index key".to_string()))?;
            let id = Uuid::from_bytes(id_bytes);
            let tx = self
                .get_transaction(id)?
                .ok_or_else(|| Error::Storage(format!("Index points at missing transaction {}", id)))?;
            out.push(tx);
        }

        Ok(out)
    }

    // Pending table

    /// Insert or replace a pending row
    pub fn put_pending(&self, row: &PendingTransaction) -> Result<()> {
        let cf = self.cf_handle(CF_PENDING)?;
        self.db.put_cf(&cf, row.id.as_bytes(), bincode::serialize(row)?)?;
        Ok(())
    }

    /// Delete pending rows
    pub fn delete_pending(&self, ids: &[Uuid]) -> Result<()> {
        let cf = self.cf_handle(CF_PENDING)?;
        let mut batch = WriteBatch::default();
        for id in ids {
            batch.delete_cf(&cf, id.as_bytes());
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Load all pending rows, oldest first
    pub fn load_pending(&self) -> Result<Vec<PendingTransaction>> {
        let cf = self.cf_handle(CF_PENDING)?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            rows.push(bincode::deserialize::<PendingTransaction>(&value)?);
        }
        rows.sort_by_key(|r| r.initiate_time);
        Ok(rows)
    }

    // Index key helpers

    fn index_prefix(flow: Flow, account: &AccountId) -> Vec<u8> {
        let mut key = vec![flow.tag()];
        key.extend_from_slice(account.as_str().as_bytes());
        key.push(b'|');
        key
    }

    fn index_key(flow: Flow, account: &AccountId, id: Uuid) -> Vec<u8> {
        let mut key = Self::index_prefix(flow, account);
        key.extend_from_slice(id.as_bytes());
        key
    }
}
