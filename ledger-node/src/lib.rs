//! Peer-replicated account ledger node
//!
//! Each node keeps its own durable, append-only log of confirmed transfers
//! and derives account balances from it. A submitted transfer is queued,
//! sent to every active peer for a vote, and persisted on all of them once
//! every peer of the round accepted it.
//!
//! # Architecture
//!
//! - **Single Writer**: one actor task serializes appends, so an id is persisted at most once
//! - **Derived Balances**: balances are recomputed from confirmed records, never stored
//! - **Unanimous Rounds**: a transaction confirms only when every active peer echoes it back unchanged
//! - **Throttled Sync Loop**: one tick at a time drives queued entries through their lifecycle
//!
//! # Invariants
//!
//! - Idempotent append: one row per transaction id, on every node
//! - Lifecycle state is a pure function of the timestamps a record carries
//! - Submissions that the system balance cannot cover never reach the queue

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod actor;
pub mod config;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod node;
pub mod peers;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod storage;
pub mod sync;
pub mod types;

// Re-exports
pub use config::{Config, RetryPolicy};
pub use error::{Error, Result};
pub use ledger::Ledger;
pub use node::Node;
pub use queue::Queue;
pub use storage::Storage;
pub use sync::{SyncEngine, TickSummary, WaitOutcome};
pub use types::{AccountId, Transaction, TxState};
