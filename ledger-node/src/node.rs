//! Node wiring
//!
//! [`Node`] is the capability handed to request handlers and the sync loop.
//! It holds the ledger, queue, sync engine and peer directory of one ledger
//! node, plus the running flag shared with [`run_sync_loop`].

use crate::{
    ledger::Ledger,
    metrics::Metrics,
    peers::{build_client, directory_from_config, HttpPeerTransport, PeerDirectory, PeerTransport, StaticPeerDirectory},
    protocol::{finalize_batch, validate_batch, ConfirmationProtocol},
    queue::Queue,
    sync::{run_sync_loop, SyncEngine},
    types::{AccountId, FinalizeReport, PeerListing, Transaction, VoteResponse},
    Config, Error, Result,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Number of recent transactions returned with an account summary
pub const RECENT_TRANSACTIONS: usize = 100;

/// Cap on the system history served by `GET /transactions`
pub const LISTING_LIMIT: usize = 10_000;

/// Configuration plus the running flag
#[derive(Debug)]
pub struct NodeState {
    config: Config,
    running: watch::Sender<bool>,
}

impl NodeState {
    /// New state, running
    pub fn new(config: Config) -> Arc<Self> {
        let (running, _) = watch::channel(true);
        Arc::new(Self { config, running })
    }

    /// Node configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Identifier of this node
    pub fn node_id(&self) -> &str {
        &self.config.node.id
    }

    /// Whether the sync loop should keep going
    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Clear the running flag
    pub fn stop(&self) {
        self.running.send_replace(false);
    }

    /// Resolves once the running flag is cleared
    pub async fn stopped(&self) {
        let mut rx = self.running.subscribe();
        // Sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|running| !*running).await;
    }
}

/// Balance and recent history of one account
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    /// Account
    pub id: AccountId,
    /// Current balance
    pub amount: Decimal,
    /// Most recently confirmed transactions first
    pub recent_transactions: Vec<Transaction>,
}

/// Handle to a running ledger node
#[derive(Debug, Clone)]
pub struct Node {
    state: Arc<NodeState>,
    ledger: Arc<Ledger>,
    queue: Arc<Queue>,
    engine: Arc<SyncEngine>,
    peers: Arc<StaticPeerDirectory>,
    metrics: Metrics,
}

impl Node {
    /// Open a node with the HTTP transport and the configured directory
    pub async fn open(config: Config) -> Result<Self> {
        let timeout = config.peers.request_timeout_ms.map(Duration::from_millis);
        let client = build_client(timeout)?;
        let (directory, peers) = directory_from_config(&config.peers, client.clone());
        let transport = Arc::new(HttpPeerTransport::new(client));
        Self::open_with(config, directory, peers, transport).await
    }

    /// Open a node with explicit peer seams
    ///
    /// `peers` backs the `GET /nodes` listing; `directory` is what
    /// confirmation rounds query.
    pub async fn open_with(
        config: Config,
        directory: Arc<dyn PeerDirectory>,
        peers: Arc<StaticPeerDirectory>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self> {
        let ledger = Arc::new(Ledger::open(&config).await?);
        if ledger.ensure_genesis().await? {
            tracing::info!("Seeded genesis transaction");
        }

        let queue = if config.sync.persist_pending {
            let queue = Queue::with_mirror(ledger.storage().clone());
            queue.restore()?;
            Arc::new(queue)
        } else {
            Arc::new(Queue::new())
        };

        let metrics = Metrics::new().map_err(|e| Error::Other(format!("Failed to register metrics: {}", e)))?;
        let protocol = ConfirmationProtocol::new(directory, transport);
        let engine = Arc::new(
            SyncEngine::new(ledger.clone(), queue.clone(), protocol, &config.sync).with_metrics(metrics.clone()),
        );

        tracing::info!(
            node = %config.node.id,
            data_dir = %config.data_dir.display(),
            rows = ledger.row_count()?,
            queued = queue.len(),
            "Ledger node opened"
        );

        Ok(Self {
            state: NodeState::new(config),
            ledger,
            queue,
            engine,
            peers,
            metrics,
        })
    }

    /// Submit a transfer from the system account
    ///
    /// Fails with [`Error::InsufficientBalance`] before anything is queued
    /// when the system balance cannot cover `amount`.
    pub fn submit(&self, to: AccountId, amount: Decimal) -> Result<Transaction> {
        let from = AccountId::system();
        let tx = Transaction::initiate(from.clone(), to, amount);
        tx.validate()?;
        self.ledger.ensure_funds(&from, amount)?;

        self.queue.upsert(vec![tx.clone()])?;
        tracing::info!(tx_id = %tx.id, to = %tx.to, amount = %tx.amount, "Transaction submitted");
        Ok(tx)
    }

    /// Answer a peer's vote request
    pub fn handle_vote_request(&self, batch: Vec<Transaction>) -> Result<VoteResponse> {
        validate_batch(&self.ledger, &self.queue, batch)
    }

    /// Persist a peer's confirmed batch
    pub async fn handle_finalize(&self, batch: Vec<Transaction>) -> Result<FinalizeReport> {
        finalize_batch(&self.ledger, &self.queue, batch).await
    }

    /// Balance and recent history for `account`
    pub fn account(&self, account: &AccountId) -> Result<AccountSummary> {
        Ok(AccountSummary {
            id: account.clone(),
            amount: self.ledger.balance(account)?,
            recent_transactions: self.ledger.history(account, RECENT_TRANSACTIONS)?,
        })
    }

    /// Active entries of the local peer list
    pub fn listing(&self) -> PeerListing {
        self.peers.listing()
    }

    /// Newest system account records, at most [`LISTING_LIMIT`]
    pub fn system_history(&self) -> Result<Vec<Transaction>> {
        self.ledger.history(&AccountId::system(), LISTING_LIMIT)
    }

    /// Run the sync loop until [`Node::stop`]
    pub async fn run(&self) {
        run_sync_loop(self.state.clone(), self.engine.clone()).await
    }

    /// Ask the sync loop to stop after its current tick
    pub fn stop(&self) {
        tracing::info!(node = %self.state.node_id(), "Stop requested");
        self.state.stop();
    }

    /// Close the ledger writer
    pub async fn shutdown(&self) -> Result<()> {
        self.ledger.shutdown().await
    }

    /// Shared state
    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    /// Ledger store
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Pending queue
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Sync engine
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TxState, GENESIS_AMOUNT};

    async fn open_isolated() -> (Node, tempfile::TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.sync.throttle_ms = 10;
        (Node::open(config).await.unwrap(), temp_dir)
    }

    #[tokio::test]
    async fn test_submit_queues_initiated() {
        let (node, _temp) = open_isolated().await;

        let tx = node.submit(AccountId::new("alice"), Decimal::from(100)).unwrap();
        assert_eq!(tx.state(), TxState::Initiated);
        assert_eq!(tx.from, Some(AccountId::system()));
        assert_eq!(node.queue().len(), 1);
        assert_eq!(node.ledger().storage().load_pending().unwrap().len(), 1);

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_over_balance_queues_nothing() {
        let (node, _temp) = open_isolated().await;

        let err = node
            .submit(AccountId::new("alice"), Decimal::from(GENESIS_AMOUNT) + Decimal::ONE)
            .unwrap_err();
        assert_eq!(err.code(), "notEnoughBalance");
        assert!(node.queue().is_empty());
        assert!(node.ledger().storage().load_pending().unwrap().is_empty());

        assert!(node.submit(AccountId::new("alice"), Decimal::ZERO).is_err());

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_ends_sync_loop() {
        let (node, _temp) = open_isolated().await;

        let runner = node.clone();
        let task = tokio::spawn(async move { runner.run().await });
        node.stop();

        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(!node.state().is_running());

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        let tx = {
            let node = Node::open(config.clone()).await.unwrap();
            let tx = node.submit(AccountId::new("bob"), Decimal::from(3)).unwrap();
            node.shutdown().await.unwrap();
            tx
        };

        let node = Node::open(config).await.unwrap();
        let restored = node.queue().get(tx.id).unwrap();
        assert_eq!(restored.state(), TxState::Initiated);
        assert_eq!(node.ledger().row_count().unwrap(), 1);

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_voted_transaction_not_adopted_after_restart() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        let mut foreign = Transaction::initiate(AccountId::system(), AccountId::new("alice"), Decimal::from(7));
        foreign.stamp_request(chrono::Utc::now());

        {
            let node = Node::open(config.clone()).await.unwrap();
            let response = node.handle_vote_request(vec![foreign.clone()]).unwrap();
            assert_eq!(response.accepted.len(), 1);
            assert_eq!(node.queue().get(foreign.id).unwrap().state(), TxState::Requested);
            assert!(node.ledger().storage().load_pending().unwrap().is_empty());
            node.shutdown().await.unwrap();
        }

        let node = Node::open(config).await.unwrap();
        assert!(node.queue().get(foreign.id).is_none());

        let summary = node.engine().tick().await.unwrap();
        assert_eq!(summary.initiated, 0);
        assert!(!node.engine().protocol().owns(foreign.id));

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_system_history_starts_with_genesis() {
        let (node, _temp) = open_isolated().await;

        let history = node.system_history().unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].from.is_none());
        assert_eq!(history[0].amount, Decimal::from(GENESIS_AMOUNT));

        node.shutdown().await.unwrap();
    }
}
