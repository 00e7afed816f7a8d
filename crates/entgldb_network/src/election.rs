//! Bully leader election.
//!
//! The node with the lexicographically smallest id among itself and its LAN
//! and static peers is the leader. Cloud peers do not take part. The result
//! is advisory: two partitions may each elect a leader.

use crate::discovery::DiscoveryService;
use crate::task::BackgroundTasks;
use entgldb_core::{PeerNode, PeerType};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::info;

/// Returns true if `node_id` is the smallest id among the eligible peers.
pub fn is_leader_among(node_id: &str, peers: &[PeerNode]) -> bool {
    peers
        .iter()
        .filter(|peer| matches!(peer.peer_type, PeerType::LanDiscovered | PeerType::StaticRemote))
        .all(|peer| peer.node_id.as_str() >= node_id)
}

struct ElectionState {
    node_id: String,
    discovery: Arc<dyn DiscoveryService>,
    leader: watch::Sender<bool>,
}

impl ElectionState {
    fn evaluate(&self) -> bool {
        let leader = is_leader_among(&self.node_id, &self.discovery.active_peers());
        let changed = self.leader.send_if_modified(|current| {
            let changed = *current != leader;
            *current = leader;
            changed
        });
        if changed {
            info!(node_id = %self.node_id, leader, "leadership changed");
        }
        leader
    }
}

/// Periodically re-evaluates leadership from the discovered peer set.
///
/// A node starts as a non-leader until the first evaluation.
pub struct BullyLeaderElection {
    state: Arc<ElectionState>,
    interval: Duration,
    tasks: Mutex<Option<BackgroundTasks>>,
}

impl BullyLeaderElection {
    /// Creates a stopped election.
    pub fn new(
        node_id: impl Into<String>,
        discovery: Arc<dyn DiscoveryService>,
        interval: Duration,
    ) -> Self {
        let (leader, _) = watch::channel(false);
        Self {
            state: Arc::new(ElectionState {
                node_id: node_id.into(),
                discovery,
                leader,
            }),
            interval,
            tasks: Mutex::new(None),
        }
    }

    /// Runs one evaluation now and returns the result.
    pub fn evaluate(&self) -> bool {
        self.state.evaluate()
    }

    /// Returns the last evaluated leadership.
    pub fn is_leader(&self) -> bool {
        *self.state.leader.borrow()
    }

    /// Subscribes to leadership changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.leader.subscribe()
    }

    /// Starts periodic evaluation. Does nothing if already running.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            return;
        }
        let mut group = BackgroundTasks::new();
        let token = group.token();
        let state = Arc::clone(&self.state);
        let interval = self.interval;
        group.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        state.evaluate();
                    }
                }
            }
        });
        *tasks = Some(group);
        info!(node_id = %self.state.node_id, "leader election started");
    }

    /// Stops periodic evaluation.
    pub async fn stop(&self) {
        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            tasks.shutdown().await;
            info!(node_id = %self.state.node_id, "leader election stopped");
        }
    }
}

impl std::fmt::Debug for BullyLeaderElection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BullyLeaderElection")
            .field("node_id", &self.state.node_id)
            .field("is_leader", &self.is_leader())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticDiscovery;
    use parking_lot::RwLock;
    use proptest::prelude::*;

    fn peer(id: &str, peer_type: PeerType) -> PeerNode {
        PeerNode::new(id, "127.0.0.1:7000", 0, peer_type)
    }

    #[test]
    fn smallest_id_wins() {
        let peers = vec![
            peer("node-b", PeerType::LanDiscovered),
            peer("node-c", PeerType::StaticRemote),
        ];
        assert!(is_leader_among("node-a", &peers));
        assert!(!is_leader_among("node-c", &peers));
        assert!(is_leader_among("solo", &[]));
    }

    #[test]
    fn cloud_peers_do_not_vote() {
        let peers = vec![peer("aaa", PeerType::CloudRemote)];
        assert!(is_leader_among("zzz", &peers));
    }

    #[test]
    fn comparison_is_lexicographic() {
        let peers = vec![peer("node-10", PeerType::LanDiscovered)];
        assert!(!is_leader_among("node-9", &peers));
    }

    struct MutableDiscovery(RwLock<Vec<PeerNode>>);

    impl DiscoveryService for MutableDiscovery {
        fn active_peers(&self) -> Vec<PeerNode> {
            self.0.read().clone()
        }
    }

    #[test]
    fn starts_as_follower_and_tracks_changes() {
        let discovery = Arc::new(MutableDiscovery(RwLock::new(Vec::new())));
        let election = BullyLeaderElection::new("node-b", discovery.clone(), Duration::from_secs(5));
        let mut changes = election.subscribe();
        assert!(!election.is_leader());

        assert!(election.evaluate());
        assert!(election.is_leader());
        assert!(changes.has_changed().unwrap());
        changes.borrow_and_update();

        discovery.0.write().push(peer("node-a", PeerType::LanDiscovered));
        assert!(!election.evaluate());
        assert!(changes.has_changed().unwrap());
        changes.borrow_and_update();

        assert!(!election.evaluate());
        assert!(!changes.has_changed().unwrap());
    }

    #[tokio::test]
    async fn periodic_evaluation() {
        let election = BullyLeaderElection::new(
            "solo",
            Arc::new(StaticDiscovery::default()),
            Duration::from_millis(10),
        );
        let mut changes = election.subscribe();
        election.start();
        election.start();
        tokio::time::timeout(Duration::from_secs(5), changes.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(election.is_leader());
        election.stop().await;
    }

    proptest! {
        #[test]
        fn exactly_one_leader_among_lan_peers(ids in prop::collection::btree_set("[a-z]{1,6}", 1..8)) {
            let ids: Vec<String> = ids.into_iter().collect();
            let leaders: Vec<&String> = ids
                .iter()
                .filter(|me| {
                    let others: Vec<PeerNode> = ids
                        .iter()
                        .filter(|id| id != me)
                        .map(|id| peer(id, PeerType::LanDiscovered))
                        .collect();
                    is_leader_among(me, &others)
                })
                .collect();
            prop_assert_eq!(leaders, vec![&ids[0]]);
        }
    }
}
