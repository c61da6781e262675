//! Sync engine
//!
//! One tick drains the queue, sorts entries by lifecycle state and acts:
//!
//! - Confirmed: persist, or drop when the ledger already has the id
//! - Requested: retry the round when this node originated it, otherwise wait
//!   for the originator's finalize call
//! - Initiated: start a confirmation round
//! - Failed: keep, subject to [`RetryPolicy`]
//!
//! Survivors go back into the queue, Requested first, then Initiated, then
//! Failed. [`run_sync_loop`] runs ticks back to back, each one taking at
//! least the configured throttle.

use crate::{
    config::{RetryPolicy, SyncConfig},
    ledger::Ledger,
    metrics::Metrics,
    node::NodeState,
    protocol::ConfirmationProtocol,
    queue::Queue,
    types::{AppendOutcome, Transaction, TxState},
    Result,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Counts for one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    /// Entries drained
    pub total: usize,
    /// Initiated entries sent to a first round
    pub initiated: usize,
    /// Requested entries seen
    pub requested: usize,
    /// Confirmed entries persisted
    pub confirmed: usize,
    /// Entries dropped because the ledger already had them
    pub duplicates: usize,
    /// Entries left in Failed
    pub failed: usize,
    /// Entries dropped by a retry bound
    pub abandoned: usize,
}

/// Result of waiting for transactions to be persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum WaitOutcome {
    /// Every id is in the ledger
    Confirmed,
    /// Deadline passed with these ids still missing
    TimedOut {
        /// Ids not yet persisted
        pending: Vec<Uuid>,
    },
}

/// Drives queued transactions toward the ledger
#[derive(Debug)]
pub struct SyncEngine {
    ledger: Arc<Ledger>,
    queue: Arc<Queue>,
    protocol: ConfirmationProtocol,
    retry: RetryPolicy,
    poll_interval: Duration,
    /// Consecutive ticks each Failed entry has been seen
    failures: Mutex<HashMap<Uuid, u32>>,
    metrics: Option<Metrics>,
}

impl SyncEngine {
    /// Create engine over a ledger and queue
    pub fn new(
        ledger: Arc<Ledger>,
        queue: Arc<Queue>,
        protocol: ConfirmationProtocol,
        config: &SyncConfig,
    ) -> Self {
        Self {
            ledger,
            queue,
            protocol,
            retry: config.retry,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            failures: Mutex::new(HashMap::new()),
            metrics: None,
        }
    }

    /// Record tick metrics into `metrics`
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The confirmation protocol driven by this engine
    pub fn protocol(&self) -> &ConfirmationProtocol {
        &self.protocol
    }

    /// Run one tick
    ///
    /// Storage failures on a single entry are logged and the entry is kept
    /// as Failed; the only error returned is failing to clear pending rows
    /// after the queue has been refilled.
    pub async fn tick(&self) -> Result<TickSummary> {
        let started = Instant::now();
        let drained = self.queue.drain();

        let mut summary = TickSummary {
            total: drained.len(),
            ..Default::default()
        };

        let mut initiated = Vec::new();
        let mut requested = Vec::new();
        let mut confirmed = Vec::new();
        let mut failed = Vec::new();
        for tx in drained {
            match tx.state() {
                TxState::Initiated => initiated.push(tx),
                TxState::Requested => requested.push(tx),
                TxState::Confirmed => confirmed.push(tx),
                TxState::Failed => failed.push(tx),
            }
        }
        summary.initiated = initiated.len();
        summary.requested = requested.len();

        // Ids that left the queue for good
        let mut settled: Vec<Uuid> = Vec::new();

        for tx in confirmed {
            match self.persist(&tx).await {
                Ok(AppendOutcome::Appended) => {
                    summary.confirmed += 1;
                    settled.push(tx.id);
                }
                Ok(AppendOutcome::Duplicate) => {
                    tracing::info!(tx_id = %tx.id, "Dropping duplicate transaction");
                    summary.duplicates += 1;
                    settled.push(tx.id);
                }
                Err(e) => {
                    tracing::error!(tx_id = %tx.id, "Failed to persist transaction: {}", e);
                    failed.push(tx);
                }
            }
        }

        let mut retry = Vec::new();
        let mut waiting = Vec::new();
        let mut abandoned = Vec::new();
        for tx in requested {
            match self.ledger.contains(tx.id) {
                Ok(true) => {
                    summary.duplicates += 1;
                    settled.push(tx.id);
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(tx_id = %tx.id, "Ledger lookup failed: {}", e);
                    waiting.push(tx);
                    continue;
                }
            }

            if !self.protocol.owns(tx.id) {
                waiting.push(tx);
            } else if self.retry.max_rounds.map_or(false, |max| tx.round() >= max) {
                tracing::warn!(tx_id = %tx.id, rounds = tx.round(), "Abandoning transaction after max rounds");
                abandoned.push(tx.id);
            } else {
                retry.push(tx);
            }
        }

        self.protocol.request_confirmations(&mut initiated).await;
        self.protocol.retry_confirmations(&mut retry).await;

        let failed = self.apply_failure_bound(failed, &mut abandoned);
        summary.failed = failed.len();
        summary.abandoned = abandoned.len();

        self.queue.requeue(
            waiting
                .into_iter()
                .chain(retry)
                .chain(initiated)
                .chain(failed),
        );

        settled.extend(abandoned);
        self.protocol.release(&settled);
        self.queue.forget(&settled)?;

        if let Some(metrics) = &self.metrics {
            metrics.record_tick(&summary, self.queue.len(), started.elapsed().as_secs_f64());
        }

        Ok(summary)
    }

    async fn persist(&self, tx: &Transaction) -> Result<AppendOutcome> {
        if self.ledger.contains(tx.id)? {
            return Ok(AppendOutcome::Duplicate);
        }
        self.ledger.append(tx).await
    }

    fn apply_failure_bound(&self, failed: Vec<Transaction>, abandoned: &mut Vec<Uuid>) -> Vec<Transaction> {
        let mut failures = self.failures.lock();
        let current: HashSet<Uuid> = failed.iter().map(|t| t.id).collect();
        failures.retain(|id, _| current.contains(id));

        let mut kept = Vec::with_capacity(failed.len());
        for tx in failed {
            let seen = failures.entry(tx.id).or_insert(0);
            *seen += 1;
            match self.retry.max_failed_attempts {
                Some(max) if *seen >= max => {
                    tracing::warn!(tx_id = %tx.id, attempts = *seen, "Abandoning failed transaction");
                    failures.remove(&tx.id);
                    abandoned.push(tx.id);
                }
                _ => kept.push(tx),
            }
        }
        kept
    }

    /// Wait until every id in `ids` is persisted, or `deadline` passes
    pub async fn wait_for_confirmation(&self, ids: &[Uuid], deadline: Duration) -> Result<WaitOutcome> {
        match tokio::time::timeout(deadline, self.poll_until_persisted(ids)).await {
            Ok(result) => result.map(|()| WaitOutcome::Confirmed),
            Err(_) => Ok(WaitOutcome::TimedOut {
                pending: self.missing(ids)?,
            }),
        }
    }

    async fn poll_until_persisted(&self, ids: &[Uuid]) -> Result<()> {
        while !self.missing(ids)?.is_empty() {
            tokio::time::sleep(self.poll_interval).await;
        }
        Ok(())
    }

    fn missing(&self, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let mut missing = Vec::new();
        for id in ids {
            if !self.ledger.contains(*id)? {
                missing.push(*id);
            }
        }
        Ok(missing)
    }
}

/// Run ticks until the node stops
///
/// Each iteration runs a tick alongside the throttle timer and waits for
/// both, so ticks never start closer together than the throttle. A stop
/// request cuts the timer short but lets the running tick finish.
pub async fn run_sync_loop(state: Arc<NodeState>, engine: Arc<SyncEngine>) {
    let throttle = Duration::from_millis(state.config().sync.throttle_ms);
    tracing::info!(node = %state.node_id(), throttle_ms = throttle.as_millis() as u64, "Sync loop started");

    while state.is_running() {
        let timer = async {
            tokio::select! {
                _ = tokio::time::sleep(throttle) => {}
                _ = state.stopped() => {}
            }
        };

        let (_, result) = tokio::join!(timer, engine.tick());
        match result {
            Ok(summary) if summary.total > 0 => {
                tracing::info!(
                    total = summary.total,
                    initiated = summary.initiated,
                    requested = summary.requested,
                    confirmed = summary.confirmed,
                    duplicates = summary.duplicates,
                    failed = summary.failed,
                    abandoned = summary.abandoned,
                    "Tick complete"
                );
            }
            Ok(_) => tracing::trace!("Queue empty"),
            Err(e) => tracing::error!("Tick failed: {}", e),
        }
    }

    tracing::info!(node = %state.node_id(), "Sync loop stopped");
}
