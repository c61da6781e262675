//! Core types for the ledger node
//!
//! All types are designed for:
//! - Deterministic serialization (bincode on disk, JSON between nodes)
//! - Exact arithmetic (Decimal for money)
//! - A lifecycle tag that is derived in exactly one place ([`TxState::classify`])

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Treasury account used to seed the ledger and fund transfers
pub const SYSTEM_ACCOUNT: &str = "system";

/// Amount minted to the system account by the genesis record
pub const GENESIS_AMOUNT: i64 = 1_000_000_000;

/// Account identifier (always lower case)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().to_lowercase())
    }

    /// The treasury account
    pub fn system() -> Self {
        Self(SYSTEM_ACCOUNT.to_string())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the treasury account
    pub fn is_system(&self) -> bool {
        self.0 == SYSTEM_ACCOUNT
    }
}

impl From<String> for AccountId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl From<AccountId> for String {
    fn from(id: AccountId) -> Self {
        id.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a transaction
///
/// Never stored on its own: it is a function of which timestamps are set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxState {
    /// Only `initiateTime` is set
    Initiated,
    /// Vote requests have been sent (`requestTime` set)
    Requested,
    /// Quorum reached (`confirmTime` set)
    Confirmed,
    /// Unclassifiable timestamp combination (terminal)
    Failed,
}

impl TxState {
    /// Derive the state from the optional timestamps
    pub fn classify(
        request_time: Option<&DateTime<Utc>>,
        confirm_time: Option<&DateTime<Utc>>,
    ) -> Self {
        match (request_time, confirm_time) {
            (None, None) => TxState::Initiated,
            (Some(_), None) => TxState::Requested,
            (Some(_), Some(_)) => TxState::Confirmed,
            (None, Some(_)) => TxState::Failed,
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxState::Initiated => "initiated",
            TxState::Requested => "requested",
            TxState::Confirmed => "confirmed",
            TxState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A transfer between two accounts
///
/// The request/confirm timestamps are private so that every mutation goes
/// through a method that re-derives [`TxState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "TransactionRecord", into = "TransactionRecord")]
pub struct Transaction {
    /// Unique transaction ID
    pub id: Uuid,

    /// When the transfer was submitted
    pub initiate_time: DateTime<Utc>,

    /// Sender (`None` only for the genesis record)
    pub from: Option<AccountId>,

    /// Receiver
    pub to: AccountId,

    /// Transfer amount (exact decimal, positive)
    pub amount: Decimal,

    request_time: Option<DateTime<Utc>>,
    confirm_time: Option<DateTime<Utc>>,
    round: u32,
    state: TxState,
}

/// Wire and disk shape of [`Transaction`]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionRecord {
    id: Uuid,
    initiate_time: DateTime<Utc>,
    from: Option<AccountId>,
    to: AccountId,
    amount: Decimal,
    #[serde(default)]
    request_time: Option<DateTime<Utc>>,
    #[serde(default)]
    confirm_time: Option<DateTime<Utc>>,
    #[serde(default)]
    round: u32,
}

impl From<TransactionRecord> for Transaction {
    fn from(r: TransactionRecord) -> Self {
        let state = TxState::classify(r.request_time.as_ref(), r.confirm_time.as_ref());
        Self {
            id: r.id,
            initiate_time: r.initiate_time,
            from: r.from,
            to: r.to,
            amount: r.amount,
            request_time: r.request_time,
            confirm_time: r.confirm_time,
            round: r.round,
            state,
        }
    }
}

impl From<Transaction> for TransactionRecord {
    fn from(t: Transaction) -> Self {
        Self {
            id: t.id,
            initiate_time: t.initiate_time,
            from: t.from,
            to: t.to,
            amount: t.amount,
            request_time: t.request_time,
            confirm_time: t.confirm_time,
            round: t.round,
        }
    }
}

impl Transaction {
    /// Create a new Initiated transfer
    pub fn initiate(from: AccountId, to: AccountId, amount: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            initiate_time: Utc::now(),
            from: Some(from),
            to,
            amount,
            request_time: None,
            confirm_time: None,
            round: 0,
            state: TxState::Initiated,
        }
    }

    /// The seed record minting [`GENESIS_AMOUNT`] to the system account
    pub fn genesis() -> Self {
        let now = Utc::now();
        let mut tx = Self {
            id: Uuid::new_v4(),
            initiate_time: now,
            from: None,
            to: AccountId::system(),
            amount: Decimal::from(GENESIS_AMOUNT),
            request_time: None,
            confirm_time: None,
            round: 0,
            state: TxState::Initiated,
        };
        tx.stamp_request(now);
        tx.stamp_confirm(now);
        tx
    }

    /// Current lifecycle state
    pub fn state(&self) -> TxState {
        self.state
    }

    /// When the first vote request was sent
    pub fn request_time(&self) -> Option<DateTime<Utc>> {
        self.request_time
    }

    /// When quorum was reached
    pub fn confirm_time(&self) -> Option<DateTime<Utc>> {
        self.confirm_time
    }

    /// Confirmation round number (0 until first requested)
    pub fn round(&self) -> u32 {
        self.round
    }

    /// Stamp `requestTime` and open round 1
    pub fn stamp_request(&mut self, at: DateTime<Utc>) {
        self.request_time = Some(at);
        self.round = 1;
        self.reclassify();
    }

    /// Open another confirmation round, keeping `requestTime`
    pub fn next_round(&mut self) {
        self.round = self.round.saturating_add(1);
    }

    /// Stamp `confirmTime`
    pub fn stamp_confirm(&mut self, at: DateTime<Utc>) {
        self.confirm_time = Some(at);
        self.reclassify();
    }

    fn reclassify(&mut self) {
        self.state = TxState::classify(self.request_time.as_ref(), self.confirm_time.as_ref());
    }

    /// Check basic shape: positive amount, and a sender unless this is a mint
    /// into the system account.
    pub fn validate(&self) -> Result<()> {
        if self.amount <= Decimal::ZERO {
            return Err(Error::InvalidTransaction(format!(
                "{}: amount must be positive",
                self.id
            )));
        }
        if self.from.is_none() && !self.to.is_system() {
            return Err(Error::InvalidTransaction(format!(
                "{}: only the system account can be minted into",
                self.id
            )));
        }
        Ok(())
    }

    /// Verify that a peer echoed this record back unchanged
    pub fn verify_echo(&self, echoed: &Transaction) -> Result<()> {
        let field = if self.id != echoed.id {
            "id"
        } else if self.from != echoed.from {
            "from"
        } else if self.to != echoed.to {
            "to"
        } else if self.amount != echoed.amount {
            "amount"
        } else if self.initiate_time != echoed.initiate_time {
            "initiateTime"
        } else if self.request_time != echoed.request_time {
            "requestTime"
        } else if self.round != echoed.round {
            "round"
        } else {
            return Ok(());
        };

        Err(Error::FieldMismatch {
            id: self.id,
            field: field.to_string(),
        })
    }
}

/// Row of the pending-transactions table
///
/// Mirrors the in-memory queue for restart durability. Only the submission
/// fields are kept; restored transactions start over as Initiated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTransaction {
    /// Transaction ID
    pub id: Uuid,
    /// Submission time
    pub initiate_time: DateTime<Utc>,
    /// Sender
    pub from: Option<AccountId>,
    /// Receiver
    pub to: AccountId,
    /// Amount
    pub amount: Decimal,
}

impl From<&Transaction> for PendingTransaction {
    fn from(t: &Transaction) -> Self {
        Self {
            id: t.id,
            initiate_time: t.initiate_time,
            from: t.from.clone(),
            to: t.to.clone(),
            amount: t.amount,
        }
    }
}

impl From<PendingTransaction> for Transaction {
    fn from(p: PendingTransaction) -> Self {
        Self {
            id: p.id,
            initiate_time: p.initiate_time,
            from: p.from,
            to: p.to,
            amount: p.amount,
            request_time: None,
            confirm_time: None,
            round: 0,
            state: TxState::Initiated,
        }
    }
}

/// Result of appending to the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppendOutcome {
    /// Record written
    Appended,
    /// A record with this ID already exists; nothing was written
    Duplicate,
}

/// Peer identifier, as published by the peer directory
pub type PeerId = String;

/// Reachability status published by the peer directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    /// Taking part in confirmation rounds
    #[default]
    Active,
    /// Known but not queried
    Inactive,
}

/// A known node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    /// Node ID
    pub id: PeerId,
    /// Host or IP address
    pub ip: String,
    /// HTTP port
    pub port: u16,
    /// Status
    #[serde(default)]
    pub status: PeerStatus,
    /// Last heartbeat seen by the directory
    #[serde(default)]
    pub last_pulse_time: Option<DateTime<Utc>>,
}

impl Peer {
    /// Base URL of the peer's HTTP boundary
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }

    /// Whether the peer takes part in rounds
    pub fn is_active(&self) -> bool {
        self.status == PeerStatus::Active
    }
}

/// Peer listing payload (`GET /nodes`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerListing {
    /// Number of nodes listed
    pub total: usize,
    /// Active nodes
    pub active_nodes: Vec<Peer>,
}

/// Peer answer to a vote request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Transactions the peer accepted, echoed back as received
    pub accepted: Vec<Transaction>,
    /// Transactions the peer rejected
    pub rejected: Vec<Transaction>,
}

/// Peer answer to a finalize call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeReport {
    /// IDs written to the peer's ledger
    pub appended: Vec<Uuid>,
    /// IDs the peer already held
    pub duplicates: Vec<Uuid>,
    /// IDs refused (not confirmed or malformed)
    pub rejected: Vec<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(amount: i64) -> Transaction {
        Transaction::initiate(AccountId::system(), AccountId::new("alice"), Decimal::from(amount))
    }

    #[test]
    fn test_account_id_lowercased() {
        assert_eq!(AccountId::new("Alice").as_str(), "alice");
        let parsed: AccountId = serde_json::from_str("\"SYSTEM\"").unwrap();
        assert!(parsed.is_system());
    }

    #[test]
    fn test_state_follows_timestamps() {
        let mut tx = transfer(10);
        assert_eq!(tx.state(), TxState::Initiated);
        assert_eq!(tx.round(), 0);

        tx.stamp_request(Utc::now());
        assert_eq!(tx.state(), TxState::Requested);
        assert_eq!(tx.round(), 1);

        tx.stamp_confirm(Utc::now());
        assert_eq!(tx.state(), TxState::Confirmed);
    }

    #[test]
    fn test_confirm_without_request_is_failed() {
        let mut tx = transfer(10);
        tx.stamp_confirm(Utc::now());
        assert_eq!(tx.state(), TxState::Failed);
    }

    #[test]
    fn test_state_derived_on_deserialize() {
        let json = serde_json::json!({
            "id": Uuid::new_v4(),
            "initiateTime": Utc::now(),
            "from": "system",
            "to": "bob",
            "amount": "5",
            "confirmTime": Utc::now(),
        });
        let tx: Transaction = serde_json::from_value(json).unwrap();
        assert_eq!(tx.state(), TxState::Failed);
    }

    #[test]
    fn test_json_round_trip_keeps_timestamps() {
        let mut tx = transfer(42);
        tx.stamp_request(Utc::now());
        let json = serde_json::to_string(&tx).unwrap();
        assert!(json.contains("requestTime"));

        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tx);
        assert!(tx.verify_echo(&back).is_ok());
    }

    #[test]
    fn test_bincode_round_trip() {
        let tx = Transaction::genesis();
        let bytes = bincode::serialize(&tx).unwrap();
        let back: Transaction = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, tx);
        assert_eq!(back.state(), TxState::Confirmed);
    }

    #[test]
    fn test_verify_echo_detects_tampering() {
        let mut tx = transfer(100);
        tx.stamp_request(Utc::now());

        let mut tampered = tx.clone();
        tampered.amount = Decimal::from(1_000);
        match tx.verify_echo(&tampered) {
            Err(Error::FieldMismatch { field, .. }) => assert_eq!(field, "amount"),
            other => panic!("expected mismatch, got {:?}", other),
        }

        let mut stale = tx.clone();
        stale.next_round();
        assert!(tx.verify_echo(&stale).is_err());
    }

    #[test]
    fn test_validate_amount_and_sender() {
        assert!(transfer(1).validate().is_ok());
        assert!(transfer(0).validate().is_err());
        assert!(Transaction::genesis().validate().is_ok());

        let mut mint = transfer(5);
        mint.from = None;
        assert!(mint.validate().is_err());
    }

    #[test]
    fn test_pending_row_restores_as_initiated() {
        let mut tx = transfer(7);
        tx.stamp_request(Utc::now());
        let row = PendingTransaction::from(&tx);
        let restored = Transaction::from(row);
        assert_eq!(restored.id, tx.id);
        assert_eq!(restored.state(), TxState::Initiated);
    }
}
