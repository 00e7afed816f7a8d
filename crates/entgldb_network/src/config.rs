//! Node configuration.

use crate::error::{NetworkError, NetworkResult};
use entgldb_core::PeerNode;
use entgldb_sync_protocol::{FrameCodec, COMPRESSION_THRESHOLD, DEFAULT_MAX_FRAME_SIZE};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default UDP discovery port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 5000;

/// Configuration for a sync node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique node id. Also the election key.
    pub node_id: String,
    /// Interface the sync server binds to.
    pub bind_host: IpAddr,
    /// TCP port of the sync server. 0 picks a free port.
    pub tcp_port: u16,
    /// Pre-shared cluster secret checked during the application handshake.
    pub auth_token: String,
    /// Whether connections run the key exchange and encrypt frames.
    pub secure: bool,
    /// Whether compression is offered and accepted.
    pub compression: bool,
    /// Payloads larger than this are compressed when it helps.
    pub compression_threshold: usize,
    /// Largest accepted frame payload.
    pub max_frame_size: usize,
    /// Limit for establishing a TCP connection.
    pub connect_timeout: Duration,
    /// Limit for the key exchange and the application handshake.
    pub handshake_timeout: Duration,
    /// Limit for each client request/response round trip.
    pub io_timeout: Duration,
    /// How long the server waits for the next request.
    pub idle_timeout: Duration,
    /// Maximum concurrent server sessions.
    pub max_connections: usize,
    /// Sync loop settings.
    pub sync: SyncConfig,
    /// Discovery settings.
    pub discovery: DiscoveryConfig,
    /// Leader election settings.
    pub election: ElectionConfig,
    /// Statically configured peers, registered in the store at start.
    pub static_peers: Vec<PeerNode>,
}

impl NodeConfig {
    /// Creates a configuration with default timings.
    pub fn new(node_id: impl Into<String>, tcp_port: u16, auth_token: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp_port,
            auth_token: auth_token.into(),
            secure: true,
            compression: true,
            compression_threshold: COMPRESSION_THRESHOLD,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            max_connections: 256,
            sync: SyncConfig::default(),
            discovery: DiscoveryConfig::default(),
            election: ElectionConfig::default(),
            static_peers: Vec::new(),
        }
    }

    /// Sets the interface the server binds to.
    pub fn with_bind_host(mut self, host: IpAddr) -> Self {
        self.bind_host = host;
        self
    }

    /// Enables or disables channel encryption.
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Enables or disables compression.
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Sets the compression threshold.
    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    /// Sets the maximum frame payload size.
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the request timeout.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Sets the server idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the maximum concurrent server sessions.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the sync loop configuration.
    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    /// Sets the discovery configuration.
    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    /// Sets the election configuration.
    pub fn with_election(mut self, election: ElectionConfig) -> Self {
        self.election = election;
        self
    }

    /// Adds a statically configured peer.
    pub fn with_static_peer(mut self, peer: PeerNode) -> Self {
        self.static_peers.push(peer);
        self
    }

    /// Returns a plaintext codec with this node's frame limits.
    pub fn frame_codec(&self) -> FrameCodec {
        FrameCodec::new()
            .with_compression_threshold(self.compression_threshold)
            .with_max_frame_size(self.max_frame_size)
    }

    /// Checks the configuration for values the node cannot run with.
    pub fn validate(&self) -> NetworkResult<()> {
        if self.node_id.is_empty() {
            return Err(NetworkError::config("node id must not be empty"));
        }
        if self.auth_token.is_empty() {
            return Err(NetworkError::config("auth token must not be empty"));
        }
        if self.max_connections == 0 {
            return Err(NetworkError::config("max connections must be at least 1"));
        }
        if self.max_frame_size == 0 {
            return Err(NetworkError::config("max frame size must be positive"));
        }
        for (name, value) in [
            ("connect timeout", self.connect_timeout),
            ("handshake timeout", self.handshake_timeout),
            ("io timeout", self.io_timeout),
            ("idle timeout", self.idle_timeout),
        ] {
            if value.is_zero() {
                return Err(NetworkError::config(format!("{name} must be positive")));
            }
        }
        self.sync.validate()?;
        self.discovery.validate()?;
        self.election.validate()?;
        for peer in &self.static_peers {
            if !peer.is_persistent() {
                return Err(NetworkError::config(format!(
                    "static peer {} must not be LAN-discovered",
                    peer.node_id
                )));
            }
            peer.node_address()?;
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new("", 0, "")
    }
}

/// Configuration for the gossip sync loop.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Delay between sync cycles.
    pub interval: Duration,
    /// Maximum peers contacted per cycle.
    pub fan_out: usize,
}

impl SyncConfig {
    /// Creates a sync configuration.
    pub fn new(interval: Duration, fan_out: usize) -> Self {
        Self { interval, fan_out }
    }

    /// Sets the cycle interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the fan-out.
    pub fn with_fan_out(mut self, fan_out: usize) -> Self {
        self.fan_out = fan_out;
        self
    }

    fn validate(&self) -> NetworkResult<()> {
        if self.interval.is_zero() {
            return Err(NetworkError::config("sync interval must be positive"));
        }
        if self.fan_out == 0 {
            return Err(NetworkError::config("sync fan-out must be at least 1"));
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), 3)
    }
}

/// Configuration for UDP peer discovery.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Whether the UDP loops run at all.
    pub enabled: bool,
    /// Port the listener binds. 0 picks a free port.
    pub port: u16,
    /// Destination address of beacons.
    pub broadcast_addr: IpAddr,
    /// Destination port of beacons. Defaults to `port`.
    pub broadcast_port: Option<u16>,
    /// Delay between beacons.
    pub broadcast_interval: Duration,
    /// Delay between expiry sweeps.
    pub cleanup_interval: Duration,
    /// Silence after which a LAN peer is dropped.
    pub peer_expiry: Duration,
    /// Record discovered peers at the loopback address instead of the
    /// beacon's source address.
    pub use_localhost: bool,
}

impl DiscoveryConfig {
    /// Creates a discovery configuration for `port`.
    pub fn new(port: u16) -> Self {
        Self {
            enabled: true,
            port,
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            broadcast_port: None,
            broadcast_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(10),
            peer_expiry: Duration::from_secs(15),
            use_localhost: false,
        }
    }

    /// Creates a configuration with the UDP loops switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Sets the beacon destination.
    pub fn with_broadcast_target(mut self, addr: IpAddr, port: u16) -> Self {
        self.broadcast_addr = addr;
        self.broadcast_port = Some(port);
        self
    }

    /// Sets the beacon, sweep and expiry timings.
    pub fn with_timings(
        mut self,
        broadcast_interval: Duration,
        cleanup_interval: Duration,
        peer_expiry: Duration,
    ) -> Self {
        self.broadcast_interval = broadcast_interval;
        self.cleanup_interval = cleanup_interval;
        self.peer_expiry = peer_expiry;
        self
    }

    /// Records discovered peers at the loopback address.
    pub fn with_use_localhost(mut self, use_localhost: bool) -> Self {
        self.use_localhost = use_localhost;
        self
    }

    /// Returns where beacons are sent.
    pub fn broadcast_target(&self) -> SocketAddr {
        SocketAddr::new(self.broadcast_addr, self.broadcast_port.unwrap_or(self.port))
    }

    fn validate(&self) -> NetworkResult<()> {
        if self.broadcast_interval.is_zero() || self.cleanup_interval.is_zero() {
            return Err(NetworkError::config("discovery intervals must be positive"));
        }
        if self.peer_expiry < self.broadcast_interval {
            return Err(NetworkError::config(
                "peer expiry must not be shorter than the broadcast interval",
            ));
        }
        Ok(())
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self::new(DEFAULT_DISCOVERY_PORT)
    }
}

/// Configuration for leader election.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Delay between re-evaluations.
    pub interval: Duration,
}

impl ElectionConfig {
    /// Creates an election configuration.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    fn validate(&self) -> NetworkResult<()> {
        if self.interval.is_zero() {
            return Err(NetworkError::config("election interval must be positive"));
        }
        Ok(())
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
