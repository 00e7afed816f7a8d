//! Gossip sync loop.
//!
//! Every interval the orchestrator picks up to `fan_out` random peers from
//! discovery and runs one pull-then-push exchange with each, concurrently.
//! A failing peer never aborts the cycle.

use crate::client::TcpPeerClient;
use crate::config::NodeConfig;
use crate::discovery::DiscoveryService;
use crate::error::{ErrorCategory, NetworkError, NetworkResult};
use crate::task::{run_blocking, BackgroundTasks};
use entgldb_core::{PeerDatabase, PeerNode};
use entgldb_sync_protocol::ProtocolError;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Running totals across all cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Cycles that contacted at least one peer.
    pub cycles_completed: u64,
    /// Cycles skipped because no peer was known.
    pub cycles_skipped: u64,
    /// Successful peer exchanges.
    pub peers_synced: u64,
    /// Failed peer exchanges.
    pub peer_failures: u64,
    /// Entries received from peers.
    pub entries_pulled: u64,
    /// Entries sent to peers.
    pub entries_pushed: u64,
    /// Most recent failure, if any.
    pub last_error: Option<String>,
}

/// Result of a successful exchange with one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSyncOutcome {
    /// Peer id.
    pub node_id: String,
    /// Entries pulled and applied locally.
    pub pulled: usize,
    /// Entries pushed to the peer.
    pub pushed: usize,
}

/// A failed exchange with one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSyncFailure {
    /// Peer id.
    pub node_id: String,
    /// Failure message.
    pub error: String,
    /// Failure category.
    pub category: ErrorCategory,
}

/// Result of one sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCycleResult {
    /// Number of peers contacted.
    pub peers_selected: usize,
    /// Successful exchanges.
    pub synced: Vec<PeerSyncOutcome>,
    /// Failed exchanges.
    pub failures: Vec<PeerSyncFailure>,
}

struct SyncContext {
    node_id: String,
    fan_out: usize,
    database: Arc<PeerDatabase>,
    discovery: Arc<dyn DiscoveryService>,
    client: TcpPeerClient,
    stats: Mutex<SyncStats>,
}

/// Drives periodic gossip sync with discovered peers.
pub struct SyncOrchestrator {
    context: Arc<SyncContext>,
    interval: std::time::Duration,
    tasks: Mutex<Option<BackgroundTasks>>,
}

impl SyncOrchestrator {
    /// Creates a stopped orchestrator.
    pub fn new(
        config: NodeConfig,
        database: Arc<PeerDatabase>,
        discovery: Arc<dyn DiscoveryService>,
    ) -> Self {
        let interval = config.sync.interval;
        let context = SyncContext {
            node_id: config.node_id.clone(),
            fan_out: config.sync.fan_out.max(1),
            database,
            discovery,
            client: TcpPeerClient::new(config),
            stats: Mutex::new(SyncStats::default()),
        };
        Self {
            context: Arc::new(context),
            interval,
            tasks: Mutex::new(None),
        }
    }

    /// Starts the periodic loop. The first cycle runs one interval from now.
    /// Does nothing if already running.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            return;
        }
        let mut group = BackgroundTasks::new();
        let token = group.token();
        let context = Arc::clone(&self.context);
        let interval = self.interval;
        group.spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = context.run_cycle() => {}
                        }
                    }
                }
            }
        });
        *tasks = Some(group);
        info!(node_id = %self.context.node_id, ?interval, "sync orchestrator started");
    }

    /// Stops the loop, abandoning any cycle in flight.
    pub async fn stop(&self) {
        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            tasks.shutdown().await;
            info!(node_id = %self.context.node_id, "sync orchestrator stopped");
        }
    }

    /// Returns true while the loop runs.
    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some()
    }

    /// Runs one cycle immediately.
    pub async fn sync_once(&self) -> SyncCycleResult {
        self.context.run_cycle().await
    }

    /// Runs one exchange with a specific peer.
    pub async fn sync_with_peer(&self, peer: &PeerNode) -> NetworkResult<PeerSyncOutcome> {
        let result = self.context.sync_peer(peer).await;
        let mut stats = self.context.stats.lock();
        match &result {
            Ok(outcome) => stats.record_success(outcome),
            Err(e) => {
                log_failure(&peer.node_id, e);
                stats.record_failure(e.to_string());
            }
        }
        result
    }

    /// Returns a copy of the running totals.
    pub fn stats(&self) -> SyncStats {
        self.context.stats.lock().clone()
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("node_id", &self.context.node_id)
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl SyncStats {
    fn record_success(&mut self, outcome: &PeerSyncOutcome) {
        self.peers_synced += 1;
        self.entries_pulled += outcome.pulled as u64;
        self.entries_pushed += outcome.pushed as u64;
    }

    fn record_failure(&mut self, error: String) {
        self.peer_failures += 1;
        self.last_error = Some(error);
    }
}

impl SyncContext {
    fn select_peers(&self) -> Vec<PeerNode> {
        let peers: Vec<PeerNode> = self
            .discovery
            .active_peers()
            .into_iter()
            .filter(|peer| peer.node_id != self.node_id)
            .collect();
        let mut rng = rand::thread_rng();
        peers
            .choose_multiple(&mut rng, self.fan_out)
            .cloned()
            .collect()
    }

    async fn run_cycle(self: &Arc<Self>) -> SyncCycleResult {
        let selected = self.select_peers();
        if selected.is_empty() {
            debug!("no peers to sync with");
            self.stats.lock().cycles_skipped += 1;
            return SyncCycleResult::default();
        }
        debug!(peers = selected.len(), "starting sync cycle");

        let mut result = SyncCycleResult {
            peers_selected: selected.len(),
            ..SyncCycleResult::default()
        };
        let mut exchanges = JoinSet::new();
        for peer in selected {
            let context = Arc::clone(self);
            exchanges.spawn(async move {
                let outcome = context.sync_peer(&peer).await;
                (peer.node_id, outcome)
            });
        }

        while let Some(joined) = exchanges.join_next().await {
            let (node_id, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "sync task failed");
                    continue;
                }
            };
            match outcome {
                Ok(outcome) => result.synced.push(outcome),
                Err(e) => {
                    log_failure(&node_id, &e);
                    result.failures.push(PeerSyncFailure {
                        node_id,
                        error: e.to_string(),
                        category: e.category(),
                    });
                }
            }
        }

        let mut stats = self.stats.lock();
        stats.cycles_completed += 1;
        for outcome in &result.synced {
            stats.record_success(outcome);
        }
        for failure in &result.failures {
            stats.record_failure(failure.error.clone());
        }
        result
    }

    /// Pulls what the peer has beyond our latest timestamp, then pushes what
    /// we have beyond theirs.
    async fn sync_peer(&self, peer: &PeerNode) -> NetworkResult<PeerSyncOutcome> {
        let mut session = self.client.connect(peer).await?;
        let remote_clock = session.get_clock().await?;

        let database = Arc::clone(&self.database);
        let mut since = run_blocking(move || Ok(database.latest_timestamp()?)).await?;
        let mut pulled = 0;
        loop {
            let page = session.pull_changes(&since).await?;
            let Some(last) = page.last().map(|entry| entry.timestamp.clone()) else {
                break;
            };
            if last <= since {
                return Err(NetworkError::Protocol(ProtocolError::MalformedEntry(format!(
                    "change set does not advance past {since}"
                ))));
            }
            since = last;
            pulled += page.len();

            let count = page.len();
            let database = Arc::clone(&self.database);
            let summary = run_blocking(move || Ok(database.apply_remote_changes(&page)?)).await?;
            debug!(
                peer = %peer.node_id,
                count,
                applied = summary.applied,
                ignored = summary.ignored,
                "applied pulled page"
            );
        }

        let database = Arc::clone(&self.database);
        let outgoing = run_blocking(move || Ok(database.oplog_after(&remote_clock)?)).await?;
        let pushed = outgoing.len();
        if !outgoing.is_empty() {
            session.push_changes(&outgoing).await?;
        }
        if let Err(e) = session.close().await {
            debug!(peer = %peer.node_id, error = %e, "close failed");
        }

        if pulled > 0 || pushed > 0 {
            info!(peer = %peer.node_id, pulled, pushed, "synced with peer");
        }
        Ok(PeerSyncOutcome {
            node_id: peer.node_id.clone(),
            pulled,
            pushed,
        })
    }
}

/// Unreachable peers log at debug, local faults at error.
fn log_failure(node_id: &str, e: &NetworkError) {
    let category = e.category();
    if e.is_local() {
        error!(peer = %node_id, error = %e, ?category, "local failure during sync");
    } else if category == ErrorCategory::Transport {
        debug!(peer = %node_id, error = %e, "peer unreachable");
    } else {
        warn!(peer = %node_id, error = %e, ?category, "sync with peer failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticDiscovery;
    use crate::server::TcpSyncServer;
    use entgldb_core::{MemoryPeerStore, PeerType};
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};

    fn config(node_id: &str) -> NodeConfig {
        NodeConfig::new(node_id, 0, "secret").with_bind_host(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    fn database(node_id: &str) -> Arc<PeerDatabase> {
        Arc::new(PeerDatabase::open(node_id, Arc::new(MemoryPeerStore::default())).unwrap())
    }

    #[tokio::test]
    async fn empty_discovery_skips_cycle() {
        let orchestrator = SyncOrchestrator::new(
            config("a"),
            database("a"),
            Arc::new(StaticDiscovery::default()),
        );
        let result = orchestrator.sync_once().await;
        assert_eq!(result, SyncCycleResult::default());
        assert_eq!(orchestrator.stats().cycles_skipped, 1);
    }

    #[tokio::test]
    async fn self_is_never_selected() {
        let me = PeerNode::new("a", "127.0.0.1:1", 0, PeerType::StaticRemote);
        let orchestrator = SyncOrchestrator::new(
            config("a"),
            database("a"),
            Arc::new(StaticDiscovery::new(vec![me])),
        );
        assert_eq!(orchestrator.sync_once().await.peers_selected, 0);
    }

    #[tokio::test]
    async fn fan_out_limits_selection() {
        let peers = (0..6)
            .map(|i| PeerNode::new(format!("p{i}"), "127.0.0.1:1", 0, PeerType::StaticRemote))
            .collect();
        let orchestrator = SyncOrchestrator::new(
            config("a"),
            database("a"),
            Arc::new(StaticDiscovery::new(peers)),
        );
        assert_eq!(orchestrator.context.select_peers().len(), 3);
    }

    #[tokio::test]
    async fn unreachable_peer_is_a_transport_failure() {
        // Bind and drop a listener to get a port nobody listens on.
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let peer = PeerNode::new("b", format!("127.0.0.1:{port}"), 0, PeerType::StaticRemote);
        let orchestrator = SyncOrchestrator::new(
            config("a"),
            database("a"),
            Arc::new(StaticDiscovery::new(vec![peer])),
        );

        let result = orchestrator.sync_once().await;
        assert_eq!(result.peers_selected, 1);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].category, ErrorCategory::Transport);
        let stats = orchestrator.stats();
        assert_eq!(stats.cycles_completed, 1);
        assert_eq!(stats.peer_failures, 1);
        assert!(stats.last_error.is_some());
    }

    #[tokio::test]
    async fn push_then_pull_with_one_peer() {
        let remote = database("b");
        let server = TcpSyncServer::new(config("b"), Arc::clone(&remote)).unwrap();
        let addr = server.start().await.unwrap();
        let peer = PeerNode::new("b", addr.to_string(), 0, PeerType::StaticRemote);

        let local = database("a");
        local.collection("notes").put("n1", json!({"text": "from a"})).unwrap();
        let orchestrator =
            SyncOrchestrator::new(config("a"), Arc::clone(&local), Arc::new(StaticDiscovery::default()));

        let outcome = orchestrator.sync_with_peer(&peer).await.unwrap();
        assert_eq!((outcome.pulled, outcome.pushed), (0, 1));
        assert!(remote.collection("notes").get("n1").unwrap().is_some());

        // The remote clock has observed n1, so its next write sorts after it.
        remote.collection("notes").put("n2", json!({"text": "from b"})).unwrap();
        let outcome = orchestrator.sync_with_peer(&peer).await.unwrap();
        assert_eq!((outcome.pulled, outcome.pushed), (1, 0));
        assert!(local.collection("notes").get("n2").unwrap().is_some());

        let stats = orchestrator.stats();
        assert_eq!(stats.peers_synced, 2);
        assert_eq!(stats.entries_pushed, 1);
        assert_eq!(stats.entries_pulled, 1);

        server.stop().await;
    }
}
