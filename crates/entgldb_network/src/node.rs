//! Node facade tying server, discovery, sync and election together.

use crate::config::NodeConfig;
use crate::discovery::{DiscoveryService, StaticDiscovery, UdpDiscoveryService};
use crate::election::BullyLeaderElection;
use crate::error::{NetworkError, NetworkResult};
use crate::orchestrator::{SyncCycleResult, SyncOrchestrator, SyncStats};
use crate::server::TcpSyncServer;
use crate::task::run_blocking;
use entgldb_core::{NodeAddress, PeerDatabase, PeerNode};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// One peer of the mesh.
///
/// Start order is server, discovery, sync loop, election; stop runs in
/// reverse.
pub struct EntglDbNode {
    config: NodeConfig,
    database: Arc<PeerDatabase>,
    server: TcpSyncServer,
    discovery: Option<Arc<UdpDiscoveryService>>,
    peers: Arc<dyn DiscoveryService>,
    orchestrator: SyncOrchestrator,
    election: BullyLeaderElection,
}

impl EntglDbNode {
    /// Wires a node over `database`. Nothing runs until [`start`](Self::start).
    pub fn new(config: NodeConfig, database: Arc<PeerDatabase>) -> NetworkResult<Self> {
        config.validate()?;
        if config.node_id != database.node_id() {
            return Err(NetworkError::config(format!(
                "node id {} does not match database node id {}",
                config.node_id,
                database.node_id()
            )));
        }

        let store = Arc::clone(database.store());
        let discovery = config.discovery.enabled.then(|| {
            Arc::new(UdpDiscoveryService::with_store(
                config.node_id.clone(),
                config.discovery.clone(),
                Arc::clone(&store),
            ))
        });
        let peers: Arc<dyn DiscoveryService> = match &discovery {
            Some(udp) => Arc::clone(udp) as Arc<dyn DiscoveryService>,
            None => Arc::new(StaticDiscovery::default().with_store(store)),
        };

        let server = TcpSyncServer::new(config.clone(), Arc::clone(&database))?;
        let orchestrator =
            SyncOrchestrator::new(config.clone(), Arc::clone(&database), Arc::clone(&peers));
        let election = BullyLeaderElection::new(
            config.node_id.clone(),
            Arc::clone(&peers),
            config.election.interval,
        );

        Ok(Self {
            config,
            database,
            server,
            discovery,
            peers,
            orchestrator,
            election,
        })
    }

    /// Registers static peers and starts every component.
    pub async fn start(&self) -> NetworkResult<SocketAddr> {
        info!(node_id = %self.config.node_id, "starting node");

        let store = Arc::clone(self.database.store());
        let static_peers = self.config.static_peers.clone();
        run_blocking(move || {
            for peer in static_peers {
                store.save_remote_peer(peer)?;
            }
            Ok(())
        })
        .await?;

        let addr = self.server.start().await?;
        if let Some(discovery) = &self.discovery {
            discovery.set_tcp_port(addr.port());
            if let Err(e) = discovery.start().await {
                self.server.stop().await;
                return Err(e);
            }
        }
        self.orchestrator.start();
        self.election.start();

        info!(node_id = %self.config.node_id, %addr, "node started");
        Ok(addr)
    }

    /// Stops every component.
    pub async fn stop(&self) {
        info!(node_id = %self.config.node_id, "stopping node");
        self.election.stop().await;
        self.orchestrator.stop().await;
        if let Some(discovery) = &self.discovery {
            discovery.stop().await;
        }
        self.server.stop().await;
        info!(node_id = %self.config.node_id, "node stopped");
    }

    /// Pauses UDP discovery. The sync loop keeps using known peers.
    pub async fn pause_discovery(&self) {
        if let Some(discovery) = &self.discovery {
            discovery.pause().await;
        }
    }

    /// Resumes UDP discovery.
    pub async fn resume_discovery(&self) -> NetworkResult<()> {
        match &self.discovery {
            Some(discovery) => discovery.resume().await,
            None => Ok(()),
        }
    }

    /// Returns this node's id.
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Returns the local database.
    pub fn database(&self) -> &Arc<PeerDatabase> {
        &self.database
    }

    /// Returns the sync server address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    /// Returns the advertised endpoint while running.
    pub fn address(&self) -> Option<NodeAddress> {
        self.local_addr()
            .map(|addr| NodeAddress::new(addr.ip().to_string(), addr.port()))
    }

    /// Returns the UDP discovery listener address while it runs.
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.discovery.as_ref().and_then(|d| d.listen_addr())
    }

    /// Returns the peers the sync loop can currently choose from.
    pub fn active_peers(&self) -> Vec<PeerNode> {
        self.peers.active_peers()
    }

    /// Returns true if this node currently considers itself the leader.
    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    /// Subscribes to leadership changes.
    pub fn leadership(&self) -> watch::Receiver<bool> {
        self.election.subscribe()
    }

    /// Runs one sync cycle now.
    pub async fn sync_now(&self) -> SyncCycleResult {
        self.orchestrator.sync_once().await
    }

    /// Returns sync totals.
    pub fn stats(&self) -> SyncStats {
        self.orchestrator.stats()
    }
}

impl std::fmt::Debug for EntglDbNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntglDbNode")
            .field("node_id", &self.config.node_id)
            .field("local_addr", &self.local_addr())
            .field("discovery", &self.discovery.is_some())
            .finish_non_exhaustive()
    }
}
