//! Peer discovery and transport
//!
//! The confirmation protocol only sees two seams:
//! - [`PeerDirectory`] returns the active-peer snapshot for a round
//! - [`PeerTransport`] delivers vote requests and finalize calls to one peer
//!
//! The HTTP implementations talk to the routes served by [`crate::server`].

use crate::{
    config::PeersConfig,
    types::{FinalizeReport, Peer, PeerId, PeerListing, Transaction, VoteResponse},
    Error, Result,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Route for vote requests
pub const VOTE_REQUEST_PATH: &str = "/transactions/confirm/request";

/// Route for finalize calls
pub const FINALIZE_PATH: &str = "/transactions/confirm";

/// Route for the peer listing
pub const NODES_PATH: &str = "/nodes";

/// Source of the active-peer snapshot
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Peers to query in the current round
    async fn active_peers(&self) -> Result<Vec<Peer>>;
}

/// Delivery of protocol messages to a single peer
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Ask `peer` to validate `batch`
    async fn request_votes(&self, peer: &Peer, batch: &[Transaction]) -> Result<VoteResponse>;

    /// Ask `peer` to persist the confirmed `batch`
    async fn finalize(&self, peer: &Peer, batch: &[Transaction]) -> Result<FinalizeReport>;
}

/// Fixed peer list from configuration
#[derive(Debug, Default)]
pub struct StaticPeerDirectory {
    peers: Vec<Peer>,
}

impl StaticPeerDirectory {
    /// Create from a peer list
    pub fn new(peers: Vec<Peer>) -> Self {
        Self {
            peers,
        }
    }

    /// Listing payload served on `GET /nodes`
    pub fn listing(&self) -> PeerListing {
        let active_nodes: Vec<Peer> = self.peers.iter().filter(|p| p.is_active()).cloned().collect();
        PeerListing {
            total: active_nodes.len(),
            active_nodes,
        }
    }
}

#[async_trait]
impl PeerDirectory for StaticPeerDirectory {
    async fn active_peers(&self) -> Result<Vec<Peer>> {
        Ok(self.listing().active_nodes)
    }
}

/// Peer listing fetched from a gateway node on every round
#[derive(Debug, Clone)]
pub struct GatewayPeerDirectory {
    client: reqwest::Client,
    gateway_uri: String,
}

impl GatewayPeerDirectory {
    /// Create for `gateway_uri` (e.g. `http://10.0.0.1:60001`)
    pub fn new(client: reqwest::Client, gateway_uri: impl Into<String>) -> Self {
        Self {
            client,
            gateway_uri: gateway_uri.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PeerDirectory for GatewayPeerDirectory {
    async fn active_peers(&self) -> Result<Vec<Peer>> {
        let url = format!("{}{}", self.gateway_uri, NODES_PATH);
        let listing: PeerListing = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(listing.active_nodes.into_iter().filter(|p| p.is_active()).collect())
    }
}

/// JSON over HTTP transport
#[derive(Debug, Clone)]
pub struct HttpPeerTransport {
    client: reqwest::Client,
}

impl HttpPeerTransport {
    /// Create with a shared client
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn post<R: serde::de::DeserializeOwned>(
        &self,
        peer: &Peer,
        path: &str,
        batch: &[Transaction],
    ) -> Result<R> {
        let url = format!("{}{}", peer.base_url(), path);
        let response = self
            .client
            .post(&url)
            .json(batch)
            .send()
            .await
            .map_err(|e| unreachable(&peer.id, e))?
            .error_for_status()
            .map_err(|e| unreachable(&peer.id, e))?;

        response.json().await.map_err(|e| unreachable(&peer.id, e))
    }
}

fn unreachable(peer: &PeerId, err: reqwest::Error) -> Error {
    Error::PeerUnreachable {
        peer: peer.clone(),
        reason: err.to_string(),
    }
}

#[async_trait]
impl PeerTransport for HttpPeerTransport {
    async fn request_votes(&self, peer: &Peer, batch: &[Transaction]) -> Result<VoteResponse> {
        self.post(peer, VOTE_REQUEST_PATH, batch).await
    }

    async fn finalize(&self, peer: &Peer, batch: &[Transaction]) -> Result<FinalizeReport> {
        self.post(peer, FINALIZE_PATH, batch).await
    }
}

/// Build the HTTP client; the timeout is opt-in
pub fn build_client(request_timeout: Option<Duration>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = request_timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))
}

/// Directory selected by configuration: gateway when set, static list otherwise
pub fn directory_from_config(
    config: &PeersConfig,
    client: reqwest::Client,
) -> (Arc<dyn PeerDirectory>, Arc<StaticPeerDirectory>) {
    let local = Arc::new(StaticPeerDirectory::new(config.static_peers.clone()));
    let directory: Arc<dyn PeerDirectory> = match &config.gateway_uri {
        Some(uri) => Arc::new(GatewayPeerDirectory::new(client, uri.clone())),
        None => local.clone(),
    };
    (directory, local)
}
