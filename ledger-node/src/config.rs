//! Configuration for the ledger node

use crate::types::{Peer, PeerStatus};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Identity and listen address of this node
    pub node: NodeConfig,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Peer discovery and transport
    pub peers: PeersConfig,

    /// Sync loop configuration
    pub sync: SyncConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/ledger"),
            service_name: "ledger-node".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            node: NodeConfig::default(),
            rocksdb: RocksDBConfig::default(),
            peers: PeersConfig::default(),
            sync: SyncConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Identity of this node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node ID announced to peers
    pub id: String,

    /// HTTP listen IP
    pub ip: String,

    /// HTTP listen port
    pub port: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "node-1".to_string(),
            ip: "127.0.0.1".to_string(),
            port: 60001,
        }
    }
}

impl NodeConfig {
    /// `ip:port` to bind the HTTP server on
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Peer discovery configuration
///
/// When `gateway_uri` is set the active-peer snapshot is fetched from
/// `{gateway_uri}/nodes` every round; otherwise `static_peers` is used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeersConfig {
    /// Gateway node serving the peer listing
    pub gateway_uri: Option<String>,

    /// Fixed peer list
    pub static_peers: Vec<Peer>,

    /// Per-call timeout for peer requests (milliseconds, none by default)
    pub request_timeout_ms: Option<u64>,
}

/// Sync loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Minimum time between tick starts (milliseconds)
    pub throttle_ms: u64,

    /// Poll interval used when waiting for confirmation (milliseconds)
    pub poll_interval_ms: u64,

    /// Mirror the queue into the pending table
    pub persist_pending: bool,

    /// Retry bounds
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            throttle_ms: 4_000,
            poll_interval_ms: 500,
            persist_pending: true,
            retry: RetryPolicy::default(),
        }
    }
}

/// Retry bounds for queue entries that are not making progress
///
/// `None` means retry forever, which is the default for both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Ticks a Failed entry is kept before it is abandoned
    pub max_failed_attempts: Option<u32>,

    /// Confirmation rounds a transaction may go through before it is abandoned
    pub max_rounds: Option<u32>,
}

impl RetryPolicy {
    /// Retry forever
    pub fn forever() -> Self {
        Self::default()
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    pub json: bool,

    /// Default filter directive when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(id) = std::env::var("LEDGER_NODE_ID") {
            config.node.id = id;
        }

        if let Ok(ip) = std::env::var("LEDGER_HTTP_IP") {
            config.node.ip = ip;
        }

        if let Ok(port) = std::env::var("LEDGER_HTTP_PORT") {
            config.node.port = port
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid LEDGER_HTTP_PORT: {}", e)))?;
        }

        if let Ok(uri) = std::env::var("LEDGER_GATEWAY_URI") {
            config.peers.gateway_uri = Some(uri);
        }

        if let Ok(peers) = std::env::var("LEDGER_PEERS") {
            config.peers.static_peers = parse_peer_list(&peers)?;
        }

        if let Ok(ms) = std::env::var("LEDGER_SYNC_THROTTLE_MS") {
            config.sync.throttle_ms = ms
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid LEDGER_SYNC_THROTTLE_MS: {}", e)))?;
        }

        if let Ok(json) = std::env::var("LEDGER_LOG_JSON") {
            config.logging.json = matches!(json.as_str(), "1" | "true");
        }

        Ok(config)
    }
}

/// Parse `id@host:port,id@host:port`
pub fn parse_peer_list(list: &str) -> crate::Result<Vec<Peer>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (id, addr) = entry
                .split_once('@')
                .ok_or_else(|| crate::Error::Config(format!("Peer '{}' is not id@host:port", entry)))?;
            let (ip, port) = addr
                .rsplit_once(':')
                .ok_or_else(|| crate::Error::Config(format!("Peer '{}' has no port", entry)))?;
            let port = port
                .parse()
                .map_err(|e| crate::Error::Config(format!("Peer '{}' port: {}", entry, e)))?;
            Ok(Peer {
                id: id.to_string(),
                ip: ip.to_string(),
                port,
                status: PeerStatus::Active,
                last_pulse_time: None,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "ledger-node");
        assert_eq!(config.sync.throttle_ms, 4_000);
        assert!(config.sync.persist_pending);
        assert_eq!(config.sync.retry, RetryPolicy::forever());
        assert!(config.peers.request_timeout_ms.is_none());
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            data_dir = "/tmp/ledger-a"

            [node]
            id = "a"
            port = 7001

            [[peers.static_peers]]
            id = "b"
            ip = "10.0.0.2"
            port = 7002

            [sync.retry]
            max_rounds = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.node.id, "a");
        assert_eq!(config.node.ip, "127.0.0.1");
        assert_eq!(config.peers.static_peers.len(), 1);
        assert!(config.peers.static_peers[0].is_active());
        assert_eq!(config.sync.retry.max_rounds, Some(5));
        assert_eq!(config.sync.retry.max_failed_attempts, None);
    }

    #[test]
    fn test_parse_peer_list() {
        let peers = parse_peer_list("b@10.0.0.2:7002, c@host-c:7003").unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[1].base_url(), "http://host-c:7003");
        assert!(parse_peer_list("nope").is_err());
        assert!(parse_peer_list("x@host:port").is_err());
    }
}
