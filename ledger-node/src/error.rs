//! Error types for the ledger node

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger node operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger node errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Sender cannot cover the amount
    #[error("Not enough balance, amount requested: {required} > balance: {available}")]
    InsufficientBalance {
        /// Sender account
        account: String,
        /// Amount requested
        required: Decimal,
        /// Balance at check time
        available: Decimal,
    },

    /// Malformed transaction or one in the wrong lifecycle state
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    /// Transaction not found
    #[error("Transaction not found: {0}")]
    TransactionNotFound(Uuid),

    /// Peer call failed (network, HTTP status, bad body)
    #[error("Peer {peer} unreachable: {reason}")]
    PeerUnreachable {
        /// Peer ID or URL
        peer: String,
        /// Failure description
        reason: String,
    },

    /// A peer echoed a record that differs from the local one
    #[error("Field mismatch on transaction {id}: {field}")]
    FieldMismatch {
        /// Transaction ID
        id: Uuid,
        /// First differing field
        field: String,
    },

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Machine-readable code returned at the request boundary
    pub fn code(&self) -> &'static str {
        match self {
            Error::InsufficientBalance { .. } => "notEnoughBalance",
            Error::InvalidTransaction(_) => "invalidTransaction",
            Error::TransactionNotFound(_) => "notFound",
            Error::PeerUnreachable { .. } => "peerUnreachable",
            Error::FieldMismatch { .. } => "fieldMismatch",
            Error::Config(_) => "config",
            _ => "internal",
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let peer = err
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Error::PeerUnreachable {
            peer,
            reason: err.to_string(),
        }
    }
}
