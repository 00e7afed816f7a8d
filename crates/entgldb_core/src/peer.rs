//! Peer model shared by discovery, election and the sync loop.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a peer became known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerType {
    /// Found through LAN broadcast discovery. Expires when silent.
    LanDiscovered,
    /// Configured statically.
    StaticRemote,
    /// A cloud relay or always-on remote node.
    CloudRemote,
}

impl PeerType {
    /// Converts to a code.
    pub fn to_code(&self) -> u8 {
        match self {
            PeerType::LanDiscovered => 0,
            PeerType::StaticRemote => 1,
            PeerType::CloudRemote => 2,
        }
    }

    /// Converts from a code.
    pub fn from_code(code: u8) -> CoreResult<Self> {
        match code {
            0 => Ok(PeerType::LanDiscovered),
            1 => Ok(PeerType::StaticRemote),
            2 => Ok(PeerType::CloudRemote),
            other => Err(CoreError::UnknownPeerType(other)),
        }
    }
}

/// A known peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerNode {
    /// Peer node id.
    pub node_id: String,
    /// Sync endpoint as `host:port`.
    pub address: String,
    /// Last time the peer was seen, in milliseconds since the Unix epoch.
    pub last_seen: i64,
    /// How the peer became known.
    pub peer_type: PeerType,
}

impl PeerNode {
    /// Creates a peer record.
    pub fn new(
        node_id: impl Into<String>,
        address: impl Into<String>,
        last_seen: i64,
        peer_type: PeerType,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
            last_seen,
            peer_type,
        }
    }

    /// Returns true if the peer should survive restarts.
    pub fn is_persistent(&self) -> bool {
        self.peer_type != PeerType::LanDiscovered
    }

    /// Parses the peer address.
    pub fn node_address(&self) -> CoreResult<NodeAddress> {
        self.address.parse()
    }
}

/// A parsed `host:port` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    /// Host name or IP literal, without IPv6 brackets.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl NodeAddress {
    /// Creates an address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for NodeAddress {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| CoreError::invalid_address(s))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() || (host.contains(':') && !s.starts_with('[')) {
            return Err(CoreError::invalid_address(s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| CoreError::invalid_address(s))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
