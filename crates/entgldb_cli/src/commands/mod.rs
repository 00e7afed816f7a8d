//! CLI command implementations.

pub mod run;
pub mod sync;

use clap::Args;
use entgldb_core::{
    CoreError, MemoryPeerStore, NodeAddress, PeerDatabase, PeerNode, PeerType, ResolverKind,
};
use entgldb_network::{DiscoveryConfig, NetworkError, NodeConfig, SyncConfig};
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Errors reported by CLI commands.
#[derive(Error, Debug)]
pub enum CliError {
    /// A `--peer` value did not have the form `id=host:port`.
    #[error("invalid peer '{0}', expected id=host:port")]
    InvalidPeer(String),

    /// A `--seed` value did not have the form `collection/key=json`.
    #[error("invalid seed '{value}': {reason}")]
    InvalidSeed {
        /// The offending value.
        value: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Local database failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Node failure.
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// Output serialization failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Node options shared by commands that start a node.
#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Unique id of this node
    #[arg(long)]
    pub node_id: String,

    /// TCP port of the sync server (0 picks a free port)
    #[arg(short, long, default_value = "0")]
    pub port: u16,

    /// Interface to bind the sync server to
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Shared cluster secret
    #[arg(long)]
    pub auth_token: String,

    /// Conflict resolution strategy (lww, merge)
    #[arg(long, default_value = "lww")]
    pub resolver: ResolverKind,

    /// Static peer as id=host:port (repeatable)
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    /// Document to write before starting, as collection/key=json (repeatable)
    #[arg(long = "seed")]
    pub seeds: Vec<String>,

    /// UDP discovery port
    #[arg(long, default_value = "5000")]
    pub discovery_port: u16,

    /// Disable UDP discovery
    #[arg(long)]
    pub no_discovery: bool,

    /// Record discovered peers at 127.0.0.1
    #[arg(long)]
    pub localhost: bool,

    /// Seconds between sync cycles
    #[arg(long, default_value = "10")]
    pub sync_interval: u64,

    /// Peers contacted per sync cycle
    #[arg(long, default_value = "3")]
    pub fan_out: usize,

    /// Send frames unencrypted
    #[arg(long)]
    pub insecure: bool,

    /// Disable compression
    #[arg(long)]
    pub no_compression: bool,
}

impl NodeArgs {
    /// Builds the node configuration.
    pub fn config(&self) -> CliResult<NodeConfig> {
        let discovery = if self.no_discovery {
            DiscoveryConfig::disabled()
        } else {
            DiscoveryConfig::new(self.discovery_port).with_use_localhost(self.localhost)
        };
        let mut config = NodeConfig::new(&self.node_id, self.port, &self.auth_token)
            .with_bind_host(self.bind)
            .with_secure(!self.insecure)
            .with_compression(!self.no_compression)
            .with_discovery(discovery)
            .with_sync(SyncConfig::new(
                Duration::from_secs(self.sync_interval),
                self.fan_out,
            ));
        for peer in &self.peers {
            config = config.with_static_peer(parse_peer(peer)?);
        }
        config.validate()?;
        Ok(config)
    }

    /// Opens an in-memory database and applies the seed documents.
    pub fn open_database(&self) -> CliResult<Arc<PeerDatabase>> {
        let store = Arc::new(MemoryPeerStore::with_resolver(self.resolver));
        let database = PeerDatabase::open(&self.node_id, store)?;
        for seed in &self.seeds {
            let (collection, key, content) = parse_seed(seed)?;
            let timestamp = database.collection(collection).put(&key, content)?;
            info!(%collection, %key, %timestamp, "seeded document");
        }
        Ok(Arc::new(database))
    }
}

/// Parses `id=host:port` into a static peer.
pub fn parse_peer(value: &str) -> CliResult<PeerNode> {
    let (id, address) = value
        .split_once('=')
        .ok_or_else(|| CliError::InvalidPeer(value.to_string()))?;
    if id.is_empty() {
        return Err(CliError::InvalidPeer(value.to_string()));
    }
    let address: NodeAddress = address
        .parse()
        .map_err(|_| CliError::InvalidPeer(value.to_string()))?;
    Ok(PeerNode::new(
        id,
        address.to_string(),
        0,
        PeerType::StaticRemote,
    ))
}

/// Parses `collection/key=json` into a document write.
pub fn parse_seed(value: &str) -> CliResult<(&str, String, Value)> {
    let invalid = |reason: &str| CliError::InvalidSeed {
        value: value.to_string(),
        reason: reason.to_string(),
    };
    let (path, json) = value
        .split_once('=')
        .ok_or_else(|| invalid("missing '='"))?;
    let (collection, key) = path
        .split_once('/')
        .ok_or_else(|| invalid("missing '/' between collection and key"))?;
    if collection.is_empty() || key.is_empty() {
        return Err(invalid("empty collection or key"));
    }
    let content = serde_json::from_str(json).map_err(|e| invalid(&e.to_string()))?;
    Ok((collection, key.to_string(), content))
}
