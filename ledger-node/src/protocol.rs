//! Cross-node confirmation protocol
//!
//! A round for a batch of transactions:
//!
//! 1. stamp `requestTime` (first round) or bump the round counter (retries)
//! 2. take the active-peer snapshot from the [`PeerDirectory`]
//! 3. send the batch to every active peer concurrently
//! 4. tally echoed accepts that match the local record field for field
//! 5. a transaction with an accept from every peer of the snapshot is
//!    confirmed: stamp `confirmTime` and broadcast a finalize call
//!
//! Quorum is unanimity over the snapshot, not a majority. An unreachable
//! peer contributes no vote, exactly like a rejecting one, so a single
//! silent peer holds a transaction in Requested until a later round
//! succeeds. There is no timeout inside a round beyond whatever the
//! transport was configured with.
//!
//! The peer side of the protocol ([`validate_batch`], [`finalize_batch`])
//! runs on every node, the requester included when it lists itself.

use crate::{
    ledger::Ledger,
    peers::{PeerDirectory, PeerTransport},
    queue::Queue,
    types::{AppendOutcome, FinalizeReport, Peer, PeerId, Transaction, TxState, VoteResponse},
    Error, Result,
};
use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of one confirmation round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundOutcome {
    /// Peers in the active snapshot, in directory order
    pub peers_queried: Vec<PeerId>,

    /// Accepting peers per transaction, in response order
    pub votes: HashMap<Uuid, Vec<PeerId>>,

    /// Transactions that reached quorum and were stamped `confirmTime`
    pub confirmed: Vec<Uuid>,
}

impl RoundOutcome {
    /// Number of accept votes counted for `id`
    pub fn vote_count(&self, id: Uuid) -> usize {
        self.votes.get(&id).map_or(0, Vec::len)
    }
}

/// Per-round tally: transaction id -> (local record, accepting peers)
struct ConfirmationRound<'a> {
    entries: HashMap<Uuid, (&'a Transaction, Vec<PeerId>)>,
}

impl<'a> ConfirmationRound<'a> {
    fn new(batch: &'a [Transaction]) -> Self {
        Self {
            entries: batch.iter().map(|t| (t.id, (t, Vec::new()))).collect(),
        }
    }

    fn record(&mut self, peer: &Peer, echoed: &Transaction) {
        let Some((local, voters)) = self.entries.get_mut(&echoed.id) else {
            tracing::error!(
                tx_id = %echoed.id,
                peer = %peer.id,
                "Peer accepted a transaction that was not requested"
            );
            return;
        };

        if let Err(e) = local.verify_echo(echoed) {
            tracing::warn!(peer = %peer.id, "Discarding vote: {}", e);
            return;
        }

        if !voters.contains(&peer.id) {
            voters.push(peer.id.clone());
        }
    }

    fn into_votes(self) -> HashMap<Uuid, Vec<PeerId>> {
        self.entries
            .into_iter()
            .map(|(id, (_, voters))| (id, voters))
            .collect()
    }
}

/// Requester side of the protocol
pub struct ConfirmationProtocol {
    directory: Arc<dyn PeerDirectory>,
    transport: Arc<dyn PeerTransport>,
    /// Transactions whose rounds this node runs
    originated: Mutex<HashSet<Uuid>>,
}

impl std::fmt::Debug for ConfirmationProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationProtocol")
            .field("originated", &self.originated.lock().len())
            .finish()
    }
}

impl ConfirmationProtocol {
    /// Create with a directory and transport
    pub fn new(directory: Arc<dyn PeerDirectory>, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            directory,
            transport,
            originated: Mutex::new(HashSet::new()),
        }
    }

    /// Run the first round for Initiated transactions
    ///
    /// Stamps `requestTime` on every entry in place and records the batch as
    /// originated here.
    pub async fn request_confirmations(&self, batch: &mut [Transaction]) -> RoundOutcome {
        if batch.is_empty() {
            return RoundOutcome::default();
        }

        tracing::info!(count = batch.len(), "Transactions initiated, requesting confirmation");

        let now = Utc::now();
        {
            let mut originated = self.originated.lock();
            for tx in batch.iter_mut() {
                tx.stamp_request(now);
                originated.insert(tx.id);
            }
        }

        self.run_round(batch).await
    }

    /// Run another round for Requested transactions this node originated
    ///
    /// `requestTime` is kept; the round counter distinguishes the retry.
    pub async fn retry_confirmations(&self, batch: &mut [Transaction]) -> RoundOutcome {
        if batch.is_empty() {
            return RoundOutcome::default();
        }

        tracing::debug!(count = batch.len(), "Retrying confirmation rounds");

        for tx in batch.iter_mut() {
            tx.next_round();
        }

        self.run_round(batch).await
    }

    /// Whether this node runs the rounds for `id`
    pub fn owns(&self, id: Uuid) -> bool {
        self.originated.lock().contains(&id)
    }

    /// Stop tracking transactions that left the queue
    pub fn release(&self, ids: &[Uuid]) {
        let mut originated = self.originated.lock();
        for id in ids {
            originated.remove(id);
        }
    }

    async fn run_round(&self, batch: &mut [Transaction]) -> RoundOutcome {
        let peers = match self.directory.active_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                tracing::warn!("Peer directory unavailable, no votes this round: {}", e);
                return RoundOutcome::default();
            }
        };

        let mut outcome = RoundOutcome {
            peers_queried: peers.iter().map(|p| p.id.clone()).collect(),
            ..Default::default()
        };

        if peers.is_empty() {
            tracing::warn!("No active peers, transactions stay requested");
            return outcome;
        }

        let quorum = peers.iter().map(|p| &p.id).collect::<HashSet<_>>().len();

        let votes = {
            let sent: &[Transaction] = batch;
            let responses = join_all(peers.iter().map(|peer| async move {
                (peer, self.transport.request_votes(peer, sent).await)
            }))
            .await;

            tracing::debug!("Checking confirmation result");

            let mut round = ConfirmationRound::new(sent);
            for (peer, response) in responses {
                match response {
                    Ok(response) => {
                        for echoed in &response.accepted {
                            round.record(peer, echoed);
                        }
                        if !response.rejected.is_empty() {
                            tracing::info!(
                                peer = %peer.id,
                                count = response.rejected.len(),
                                "Peer rejected transactions"
                            );
                        }
                    }
                    Err(e) => {
                        tracing::warn!(peer = %peer.id, "Vote request failed: {}", e);
                    }
                }
            }
            round.into_votes()
        };

        let now = Utc::now();
        let mut confirmed = Vec::new();
        for tx in batch.iter_mut() {
            let count = votes.get(&tx.id).map_or(0, Vec::len);
            if count == quorum {
                tx.stamp_confirm(now);
                confirmed.push(tx.clone());
            } else {
                tracing::debug!(tx_id = %tx.id, votes = count, quorum, "Quorum not reached");
            }
        }

        outcome.votes = votes;
        outcome.confirmed = confirmed.iter().map(|t| t.id).collect();

        if !confirmed.is_empty() {
            self.broadcast_finalize(&peers, &confirmed).await;
        }

        outcome
    }

    async fn broadcast_finalize(&self, peers: &[Peer], confirmed: &[Transaction]) {
        let results = join_all(peers.iter().map(|peer| async move {
            (peer, self.transport.finalize(peer, confirmed).await)
        }))
        .await;

        let mut delivered = 0usize;
        for (peer, result) in results {
            match result {
                Ok(report) => {
                    delivered += 1;
                    if !report.rejected.is_empty() {
                        tracing::warn!(
                            peer = %peer.id,
                            count = report.rejected.len(),
                            "Peer refused finalized transactions"
                        );
                    }
                }
                Err(e) => tracing::warn!(peer = %peer.id, "Finalize failed: {}", e),
            }
        }

        tracing::info!(
            count = confirmed.len(),
            delivered,
            peers = peers.len(),
            "Confirmed transactions finalized"
        );
    }
}

/// Peer-side validation of a vote request
///
/// A transaction is accepted when it is in Requested state, is well formed,
/// is not already persisted and its sender's persisted balance covers the
/// amount. Accepted transactions are held in the local queue until the
/// originator finalizes them. They get no pending row: only the originator
/// restores and retries a transaction after a restart.
pub fn validate_batch(ledger: &Ledger, queue: &Queue, batch: Vec<Transaction>) -> Result<VoteResponse> {
    let mut response = VoteResponse::default();

    for tx in batch {
        match check_vote(ledger, &tx) {
            Ok(()) => response.accepted.push(tx),
            Err(e @ (Error::InvalidTransaction(_) | Error::InsufficientBalance { .. })) => {
                tracing::info!(tx_id = %tx.id, "Rejecting vote request: {}", e);
                response.rejected.push(tx);
            }
            Err(e) => return Err(e),
        }
    }

    queue.requeue(response.accepted.iter().cloned());
    Ok(response)
}

fn check_vote(ledger: &Ledger, tx: &Transaction) -> Result<()> {
    if tx.state() != TxState::Requested {
        return Err(Error::InvalidTransaction(format!("{} is {}", tx.id, tx.state())));
    }
    tx.validate()?;
    let from = tx
        .from
        .as_ref()
        .ok_or_else(|| Error::InvalidTransaction(format!("{} has no sender", tx.id)))?;
    if ledger.contains(tx.id)? {
        return Err(Error::InvalidTransaction(format!("{} is already persisted", tx.id)));
    }
    ledger.ensure_funds(from, tx.amount)?;
    Ok(())
}

/// Peer-side handling of a finalize call
///
/// Appends every confirmed transaction to the local ledger and drops it from
/// the local queue. Duplicates are reported, not treated as errors.
pub async fn finalize_batch(ledger: &Ledger, queue: &Queue, batch: Vec<Transaction>) -> Result<FinalizeReport> {
    let mut report = FinalizeReport::default();

    for tx in batch {
        match ledger.append(&tx).await {
            Ok(AppendOutcome::Appended) => report.appended.push(tx.id),
            Ok(AppendOutcome::Duplicate) => report.duplicates.push(tx.id),
            Err(Error::InvalidTransaction(reason)) => {
                tracing::warn!(tx_id = %tx.id, "Refusing to finalize: {}", reason);
                report.rejected.push(tx.id);
            }
            Err(e) => return Err(e),
        }
    }

    let settled: Vec<Uuid> = report
        .appended
        .iter()
        .chain(report.duplicates.iter())
        .copied()
        .collect();
    queue.remove(&settled)?;

    if !report.appended.is_empty() {
        tracing::info!(count = report.appended.len(), "Finalized transactions persisted");
    }

    Ok(report)
}
