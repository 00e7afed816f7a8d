//! Peer discovery.
//!
//! [`UdpDiscoveryService`] announces this node with a small JSON beacon and
//! keeps a table of LAN peers heard from recently. Persisted static and cloud
//! peers from the store are merged into the active set.

use crate::config::DiscoveryConfig;
use crate::error::{NetworkError, NetworkResult};
use crate::task::BackgroundTasks;
use entgldb_core::{wall_clock_millis, PeerNode, PeerStore, PeerType};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const MAX_BEACON_SIZE: usize = 2048;

/// Source of the peers a node may sync with.
pub trait DiscoveryService: Send + Sync {
    /// Returns the currently known peers. Never includes this node.
    fn active_peers(&self) -> Vec<PeerNode>;
}

/// Discovery without network traffic.
///
/// Returns a fixed peer list, plus the store's persisted peers if a store is
/// attached. With neither it never finds anyone.
#[derive(Clone, Default)]
pub struct StaticDiscovery {
    peers: Vec<PeerNode>,
    store: Option<Arc<dyn PeerStore>>,
}

impl StaticDiscovery {
    /// Creates a discovery that always returns `peers`.
    pub fn new(peers: Vec<PeerNode>) -> Self {
        Self { peers, store: None }
    }

    /// Also returns the remote peers persisted in `store`.
    pub fn with_store(mut self, store: Arc<dyn PeerStore>) -> Self {
        self.store = Some(store);
        self
    }
}

impl DiscoveryService for StaticDiscovery {
    fn active_peers(&self) -> Vec<PeerNode> {
        let stored = self.store.as_ref().map(stored_peers).unwrap_or_default();
        merge_peers(self.peers.clone(), stored)
    }
}

impl std::fmt::Debug for StaticDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticDiscovery")
            .field("peers", &self.peers)
            .field("store", &self.store.is_some())
            .finish()
    }
}

/// Presence announcement sent over UDP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryBeacon {
    /// Sender node id.
    pub node_id: String,
    /// Sender's sync server port.
    pub tcp_port: u16,
}

/// LAN peers keyed by node id.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: RwLock<HashMap<String, PeerNode>>,
}

impl PeerTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or refreshes a peer. Returns true if it was not known.
    pub fn upsert(&self, peer: PeerNode) -> bool {
        self.peers.write().insert(peer.node_id.clone(), peer).is_none()
    }

    /// Drops peers not seen for more than `expiry_ms`. Returns their ids.
    pub fn expire(&self, now_ms: i64, expiry_ms: i64) -> Vec<String> {
        let mut peers = self.peers.write();
        let expired: Vec<String> = peers
            .values()
            .filter(|peer| now_ms - peer.last_seen > expiry_ms)
            .map(|peer| peer.node_id.clone())
            .collect();
        for id in &expired {
            peers.remove(id);
        }
        expired
    }

    /// Returns all peers ordered by node id.
    pub fn snapshot(&self) -> Vec<PeerNode> {
        let mut peers: Vec<PeerNode> = self.peers.read().values().cloned().collect();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        peers
    }

    /// Returns the number of peers.
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Returns true if no peer is known.
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Forgets every peer.
    pub fn clear(&self) {
        self.peers.write().clear();
    }
}

struct Shared {
    node_id: String,
    config: DiscoveryConfig,
    tcp_port: AtomicU16,
    table: PeerTable,
    store: Option<Arc<dyn PeerStore>>,
}

impl Shared {
    fn beacon(&self) -> DiscoveryBeacon {
        DiscoveryBeacon {
            node_id: self.node_id.clone(),
            tcp_port: self.tcp_port.load(Ordering::Relaxed),
        }
    }

    /// Records the sender of a beacon. Returns true for a newly found peer.
    fn handle_datagram(&self, bytes: &[u8], from: SocketAddr, now_ms: i64) -> bool {
        let beacon: DiscoveryBeacon = match serde_json::from_slice(bytes) {
            Ok(beacon) => beacon,
            Err(e) => {
                debug!(%from, error = %e, "ignoring malformed beacon");
                return false;
            }
        };
        if beacon.node_id == self.node_id || beacon.node_id.is_empty() || beacon.tcp_port == 0 {
            return false;
        }

        let host = if self.config.use_localhost {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            from.ip()
        };
        let address = SocketAddr::new(host, beacon.tcp_port).to_string();
        let peer = PeerNode::new(beacon.node_id, address, now_ms, PeerType::LanDiscovered);
        trace!(peer = %peer.node_id, %from, "beacon");

        let (id, address) = (peer.node_id.clone(), peer.address.clone());
        let is_new = self.table.upsert(peer);
        if is_new {
            info!(peer = %id, %address, "peer discovered");
        }
        is_new
    }

    fn expire(&self, now_ms: i64) -> Vec<String> {
        let expiry = i64::try_from(self.config.peer_expiry.as_millis()).unwrap_or(i64::MAX);
        let expired = self.table.expire(now_ms, expiry);
        for id in &expired {
            info!(peer = %id, "peer expired");
        }
        expired
    }
}

struct Sockets {
    listener: Arc<UdpSocket>,
    sender: Arc<UdpSocket>,
}

enum State {
    Idle,
    Running {
        sockets: Sockets,
        tasks: BackgroundTasks,
    },
    Paused {
        listen_port: u16,
    },
    Stopped,
}

/// UDP broadcast discovery.
///
/// `pause` halts the loops and closes the sockets but keeps the peer table;
/// `resume` rebinds the same listen port. `stop` is final and clears the
/// table.
pub struct UdpDiscoveryService {
    shared: Arc<Shared>,
    state: Mutex<State>,
}

impl UdpDiscoveryService {
    /// Creates an idle service.
    pub fn new(node_id: impl Into<String>, config: DiscoveryConfig) -> Self {
        Self::build(node_id.into(), config, None)
    }

    /// Creates an idle service that merges the store's persisted peers.
    pub fn with_store(
        node_id: impl Into<String>,
        config: DiscoveryConfig,
        store: Arc<dyn PeerStore>,
    ) -> Self {
        Self::build(node_id.into(), config, Some(store))
    }

    fn build(node_id: String, config: DiscoveryConfig, store: Option<Arc<dyn PeerStore>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                node_id,
                config,
                tcp_port: AtomicU16::new(0),
                table: PeerTable::new(),
                store,
            }),
            state: Mutex::new(State::Idle),
        }
    }

    /// Sets the sync port advertised in beacons.
    pub fn set_tcp_port(&self, port: u16) {
        self.shared.tcp_port.store(port, Ordering::Relaxed);
    }

    /// Returns the advertised sync port.
    pub fn tcp_port(&self) -> u16 {
        self.shared.tcp_port.load(Ordering::Relaxed)
    }

    /// Binds the sockets and starts the listen, broadcast and expiry loops.
    /// Resumes a paused service on its previous listen port. Fails once
    /// stopped.
    pub async fn start(&self) -> NetworkResult<()> {
        let paused = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Idle) {
                State::Paused { listen_port } => Some(listen_port),
                State::Idle => None,
                other => {
                    let stopped = matches!(other, State::Stopped);
                    *state = other;
                    return if stopped { Err(NetworkError::Stopped) } else { Ok(()) };
                }
            }
        };

        let port = paused.unwrap_or(self.shared.config.port);
        let sockets = match self.bind(port).await {
            Ok(sockets) => sockets,
            Err(e) => {
                let mut state = self.state.lock();
                if let (State::Idle, Some(listen_port)) = (&*state, paused) {
                    *state = State::Paused { listen_port };
                }
                return Err(e);
            }
        };

        let mut state = self.state.lock();
        match &*state {
            State::Idle => {
                let tasks = self.spawn_loops(&sockets);
                *state = State::Running { sockets, tasks };
                info!(node_id = %self.shared.node_id, "discovery started");
                Ok(())
            }
            State::Stopped => Err(NetworkError::Stopped),
            _ => Ok(()),
        }
    }

    /// Halts network activity and keeps known peers.
    ///
    /// Both sockets are closed, so beacons sent while paused are never seen.
    pub async fn pause(&self) {
        let tasks = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Idle) {
                State::Running { sockets, tasks } => {
                    let listen_port = sockets
                        .listener
                        .local_addr()
                        .map(|addr| addr.port())
                        .unwrap_or(self.shared.config.port);
                    *state = State::Paused { listen_port };
                    Some(tasks)
                }
                other => {
                    *state = other;
                    None
                }
            }
        };
        if let Some(tasks) = tasks {
            tasks.shutdown().await;
            info!(node_id = %self.shared.node_id, "discovery paused");
        }
    }

    /// Resumes after [`pause`](Self::pause).
    pub async fn resume(&self) -> NetworkResult<()> {
        self.start().await
    }

    /// Stops for good and forgets all LAN peers.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), State::Stopped);
        if let State::Running { tasks, .. } = previous {
            tasks.shutdown().await;
        }
        self.shared.table.clear();
        info!(node_id = %self.shared.node_id, "discovery stopped");
    }

    /// Returns true while the loops run.
    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), State::Running { .. })
    }

    /// Returns the bound listener address while running.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        match &*self.state.lock() {
            State::Running { sockets, .. } => sockets.listener.local_addr().ok(),
            _ => None,
        }
    }

    /// Returns the LAN peers only.
    pub fn lan_peers(&self) -> Vec<PeerNode> {
        self.shared.table.snapshot()
    }

    async fn bind(&self, port: u16) -> NetworkResult<Sockets> {
        let config = &self.shared.config;
        let listener =
            UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)).await?;
        let sender = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?;
        sender.set_broadcast(true)?;
        debug!(
            listen = ?listener.local_addr().ok(),
            target = %config.broadcast_target(),
            "discovery sockets bound"
        );
        Ok(Sockets {
            listener: Arc::new(listener),
            sender: Arc::new(sender),
        })
    }

    fn spawn_loops(&self, sockets: &Sockets) -> BackgroundTasks {
        let mut tasks = BackgroundTasks::new();
        tasks.spawn(listen_loop(
            Arc::clone(&self.shared),
            Arc::clone(&sockets.listener),
            tasks.token(),
        ));
        tasks.spawn(broadcast_loop(
            Arc::clone(&self.shared),
            Arc::clone(&sockets.sender),
            tasks.token(),
        ));
        tasks.spawn(cleanup_loop(Arc::clone(&self.shared), tasks.token()));
        tasks
    }
}

impl DiscoveryService for UdpDiscoveryService {
    fn active_peers(&self) -> Vec<PeerNode> {
        let stored = self
            .shared
            .store
            .as_ref()
            .map(stored_peers)
            .unwrap_or_default();
        merge_peers(self.shared.table.snapshot(), stored)
            .into_iter()
            .filter(|peer| peer.node_id != self.shared.node_id)
            .collect()
    }
}

impl std::fmt::Debug for UdpDiscoveryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpDiscoveryService")
            .field("node_id", &self.shared.node_id)
            .field("tcp_port", &self.tcp_port())
            .field("lan_peers", &self.shared.table.len())
            .finish_non_exhaustive()
    }
}

async fn listen_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>, token: CancellationToken) {
    let mut buf = vec![0u8; MAX_BEACON_SIZE];
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => {
                    shared.handle_datagram(&buf[..len], from, wall_clock_millis());
                }
                Err(e) => {
                    warn!(error = %e, "discovery receive failed");
                    tokio::time::sleep(shared.config.broadcast_interval).await;
                }
            },
        }
    }
}

async fn broadcast_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>, token: CancellationToken) {
    let target = shared.config.broadcast_target();
    let mut ticker = tokio::time::interval(shared.config.broadcast_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let beacon = shared.beacon();
                if beacon.tcp_port == 0 {
                    continue;
                }
                let bytes = match serde_json::to_vec(&beacon) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, "failed to encode beacon");
                        continue;
                    }
                };
                if let Err(e) = socket.send_to(&bytes, target).await {
                    debug!(%target, error = %e, "beacon send failed");
                }
            }
        }
    }
}

async fn cleanup_loop(shared: Arc<Shared>, token: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.cleanup_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                shared.expire(wall_clock_millis());
            }
        }
    }
}

fn stored_peers(store: &Arc<dyn PeerStore>) -> Vec<PeerNode> {
    store.remote_peers().unwrap_or_else(|e| {
        warn!(error = %e, "failed to read remote peers");
        Vec::new()
    })
}

/// Merges two peer lists by node id, keeping the first list's entry on
/// collision. Ordered by node id.
fn merge_peers(preferred: Vec<PeerNode>, others: Vec<PeerNode>) -> Vec<PeerNode> {
    let mut merged = BTreeMap::new();
    for peer in others.into_iter().chain(preferred) {
        merged.insert(peer.node_id.clone(), peer);
    }
    merged.into_values().collect()
}
