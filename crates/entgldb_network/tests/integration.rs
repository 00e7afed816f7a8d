//! Integration tests for nodes talking over loopback.

use entgldb_core::{MemoryPeerStore, PeerDatabase, PeerNode, PeerType, ResolverKind};
use entgldb_network::{
    DiscoveryConfig, DiscoveryService, ElectionConfig, EntglDbNode, ErrorCategory, NodeConfig,
    SyncConfig, UdpDiscoveryService,
};
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn database(node_id: &str, resolver: ResolverKind) -> Arc<PeerDatabase> {
    let store = Arc::new(MemoryPeerStore::with_resolver(resolver));
    Arc::new(PeerDatabase::open(node_id, store).unwrap())
}

/// A node on loopback without UDP discovery and with a slow sync loop, so
/// tests drive cycles through `sync_now`.
fn node_config(node_id: &str, token: &str) -> NodeConfig {
    NodeConfig::new(node_id, 0, token)
        .with_bind_host(LOOPBACK)
        .with_discovery(DiscoveryConfig::disabled())
        .with_sync(SyncConfig::new(Duration::from_secs(3600), 3))
        .with_election(ElectionConfig::new(Duration::from_millis(50)))
}

async fn start_node(config: NodeConfig, resolver: ResolverKind) -> EntglDbNode {
    let db = database(&config.node_id, resolver);
    let node = EntglDbNode::new(config, db).unwrap();
    node.start().await.unwrap();
    node
}

/// Makes `target` a static peer of `node`.
fn connect(node: &EntglDbNode, target: &EntglDbNode) {
    let addr = target.local_addr().unwrap();
    node.database()
        .store()
        .save_remote_peer(PeerNode::new(
            target.node_id(),
            addr.to_string(),
            0,
            PeerType::StaticRemote,
        ))
        .unwrap();
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn two_nodes_sync_both_ways() {
    let a = start_node(node_config("node-a", "secret"), ResolverKind::LastWriteWins).await;
    let b = start_node(node_config("node-b", "secret"), ResolverKind::LastWriteWins).await;
    connect(&a, &b);
    connect(&b, &a);

    let mut changes = b.database().subscribe();

    a.database()
        .collection("todos")
        .put("t1", json!({"title": "milk"}))
        .unwrap();
    let result = b.sync_now().await;
    assert!(result.failures.is_empty());
    assert_eq!(result.synced.len(), 1);
    assert_eq!(result.synced[0].pulled, 1);

    let doc = b.database().collection("todos").get("t1").unwrap().unwrap();
    assert_eq!(doc.content, json!({"title": "milk"}));
    let event = changes.recv().await.unwrap();
    assert_eq!(event.collections, vec!["todos".to_string()]);

    // b has observed a's entry, so its next write sorts after it and a can
    // pull it.
    b.database()
        .collection("todos")
        .put("t2", json!({"title": "eggs"}))
        .unwrap();
    let result = a.sync_now().await;
    assert!(result.failures.is_empty());
    assert!(a.database().collection("todos").get("t2").unwrap().is_some());

    assert_eq!(a.database().collection("todos").list().unwrap().len(), 2);
    assert_eq!(b.database().collection("todos").list().unwrap().len(), 2);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn push_delivers_local_changes() {
    let a = start_node(node_config("node-a", "secret"), ResolverKind::LastWriteWins).await;
    let b = start_node(node_config("node-b", "secret"), ResolverKind::LastWriteWins).await;
    connect(&a, &b);

    a.database()
        .collection("users")
        .put("u1", json!({"name": "Ada"}))
        .unwrap();
    a.database().collection("users").delete("u1").unwrap();
    a.database()
        .collection("users")
        .put("u2", json!({"name": "Grace"}))
        .unwrap();

    let result = a.sync_now().await;
    assert_eq!(result.synced.len(), 1);
    assert_eq!(result.synced[0].pushed, 3);

    let users = b.database().collection("users");
    assert!(users.get("u1").unwrap().is_none());
    assert_eq!(users.get("u2").unwrap().unwrap().content, json!({"name": "Grace"}));
    assert_eq!(
        b.database().latest_timestamp().unwrap(),
        a.database().latest_timestamp().unwrap()
    );

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn large_documents_over_encrypted_compressed_channel() {
    let a = start_node(node_config("node-a", "secret"), ResolverKind::LastWriteWins).await;
    let b = start_node(node_config("node-b", "secret"), ResolverKind::LastWriteWins).await;
    connect(&b, &a);

    let body = "lorem ipsum ".repeat(2_000);
    for i in 0..20 {
        a.database()
            .collection("articles")
            .put(&format!("a{i}"), json!({"index": i, "body": body}))
            .unwrap();
    }

    let result = b.sync_now().await;
    assert!(result.failures.is_empty());
    assert_eq!(result.synced[0].pulled, 20);

    let articles = b.database().collection("articles").list().unwrap();
    assert_eq!(articles.len(), 20);
    assert!(articles.iter().all(|doc| doc.content["body"] == json!(body)));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn oplog_larger_than_one_frame_syncs_in_pages() {
    let small_frames = |id: &str| {
        node_config(id, "secret")
            .with_max_frame_size(64 * 1024)
            .with_compression(false)
    };
    let a = start_node(small_frames("node-a"), ResolverKind::LastWriteWins).await;
    let b = start_node(small_frames("node-b"), ResolverKind::LastWriteWins).await;
    connect(&b, &a);

    let body = "x".repeat(300);
    for i in 0..400 {
        a.database()
            .collection("notes")
            .put(&format!("a{i}"), json!({"body": body}))
            .unwrap();
    }

    let result = b.sync_now().await;
    assert!(result.failures.is_empty(), "{:?}", result.failures);
    assert_eq!(result.synced[0].pulled, 400);
    assert_eq!(b.database().collection("notes").list().unwrap().len(), 400);

    for i in 0..400 {
        b.database()
            .collection("notes")
            .put(&format!("b{i}"), json!({"body": body}))
            .unwrap();
    }

    let result = b.sync_now().await;
    assert!(result.failures.is_empty(), "{:?}", result.failures);
    assert_eq!(result.synced[0].pulled, 0);
    assert_eq!(result.synced[0].pushed, 400);
    assert_eq!(a.database().collection("notes").list().unwrap().len(), 800);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn plaintext_nodes_sync() {
    let a = start_node(
        node_config("node-a", "secret").with_secure(false).with_compression(false),
        ResolverKind::LastWriteWins,
    )
    .await;
    let b = start_node(
        node_config("node-b", "secret").with_secure(false).with_compression(false),
        ResolverKind::LastWriteWins,
    )
    .await;
    connect(&b, &a);

    a.database().collection("c").put("k", json!(1)).unwrap();
    let result = b.sync_now().await;
    assert!(result.failures.is_empty());
    assert!(b.database().collection("c").get("k").unwrap().is_some());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn wrong_token_is_an_authorization_failure() {
    let a = start_node(node_config("node-a", "secret"), ResolverKind::LastWriteWins).await;
    let intruder = start_node(node_config("node-x", "guess"), ResolverKind::LastWriteWins).await;
    connect(&intruder, &a);

    a.database().collection("secrets").put("s1", json!("hidden")).unwrap();
    let result = intruder.sync_now().await;
    assert!(result.synced.is_empty());
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].category, ErrorCategory::Authorization);
    assert!(intruder.database().collection("secrets").list().unwrap().is_empty());
    assert_eq!(intruder.stats().peer_failures, 1);

    a.stop().await;
    intruder.stop().await;
}

#[tokio::test]
async fn plaintext_client_cannot_talk_to_secure_server() {
    let a = start_node(node_config("node-a", "secret"), ResolverKind::LastWriteWins).await;
    let b = start_node(
        node_config("node-b", "secret")
            .with_secure(false)
            .with_handshake_timeout(Duration::from_millis(500)),
        ResolverKind::LastWriteWins,
    )
    .await;
    connect(&b, &a);

    a.database().collection("c").put("k", json!(1)).unwrap();
    let result = b.sync_now().await;
    assert_eq!(result.failures.len(), 1);
    assert!(b.database().collection("c").list().unwrap().is_empty());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn concurrent_writes_converge_last_write_wins() {
    let a = start_node(node_config("node-a", "secret"), ResolverKind::LastWriteWins).await;
    let b = start_node(node_config("node-b", "secret"), ResolverKind::LastWriteWins).await;
    connect(&a, &b);
    connect(&b, &a);

    a.database().collection("cfg").put("mode", json!("a")).unwrap();
    b.database().collection("cfg").put("mode", json!("b")).unwrap();

    a.sync_now().await;
    b.sync_now().await;

    let on_a = a.database().collection("cfg").get("mode").unwrap().unwrap();
    let on_b = b.database().collection("cfg").get("mode").unwrap().unwrap();
    assert_eq!(on_a.content, json!("b"));
    assert_eq!(on_a.content, on_b.content);
    assert_eq!(on_a.updated_at, on_b.updated_at);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn recursive_merge_combines_fields() {
    let a = start_node(node_config("node-a", "secret"), ResolverKind::RecursiveMerge).await;
    let b = start_node(node_config("node-b", "secret"), ResolverKind::RecursiveMerge).await;
    connect(&a, &b);

    a.database()
        .collection("profiles")
        .put("p1", json!({"name": "Ada", "tags": [{"id": 1, "v": "x"}]}))
        .unwrap();
    b.database()
        .collection("profiles")
        .put("p1", json!({"email": "ada@example.com", "tags": [{"id": 2, "v": "y"}]}))
        .unwrap();

    a.sync_now().await;
    let merged = a.database().collection("profiles").get("p1").unwrap().unwrap();
    assert_eq!(merged.content["name"], json!("Ada"));
    assert_eq!(merged.content["email"], json!("ada@example.com"));
    assert_eq!(merged.content["tags"].as_array().unwrap().len(), 2);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn smallest_id_becomes_leader() {
    let alpha = start_node(node_config("alpha", "secret"), ResolverKind::LastWriteWins).await;
    let beta = start_node(node_config("beta", "secret"), ResolverKind::LastWriteWins).await;
    connect(&beta, &alpha);
    connect(&alpha, &beta);

    eventually(|| alpha.is_leader()).await;
    eventually(|| !beta.is_leader()).await;
    assert!(!*beta.leadership().borrow());

    // Cloud peers never take part.
    alpha
        .database()
        .store()
        .save_remote_peer(PeerNode::new("aaa", "10.0.0.1:7000", 0, PeerType::CloudRemote))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(alpha.is_leader());

    alpha.stop().await;
    beta.stop().await;
}

/// Reserves a UDP port by binding and releasing it.
fn free_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind((LOOPBACK, 0)).unwrap();
    socket.local_addr().unwrap().port()
}

fn discovery_config(port: u16, peer_port: u16) -> DiscoveryConfig {
    DiscoveryConfig::new(port)
        .with_broadcast_target(LOOPBACK, peer_port)
        .with_timings(
            Duration::from_millis(100),
            Duration::from_millis(100),
            Duration::from_millis(600),
        )
}

#[tokio::test]
async fn udp_discovery_finds_and_expires_peers() {
    let (port_a, port_b) = (free_udp_port(), free_udp_port());
    let a = UdpDiscoveryService::new("node-a", discovery_config(port_a, port_b));
    let b = UdpDiscoveryService::new("node-b", discovery_config(port_b, port_a));
    a.set_tcp_port(7001);
    b.set_tcp_port(7002);
    a.start().await.unwrap();
    b.start().await.unwrap();

    eventually(|| a.active_peers().len() == 1 && b.active_peers().len() == 1).await;
    let peers = a.active_peers();
    let seen_by_a = &peers[0];
    assert_eq!(seen_by_a.node_id, "node-b");
    assert_eq!(seen_by_a.peer_type, PeerType::LanDiscovered);
    assert_eq!(
        seen_by_a.address.parse::<SocketAddr>().unwrap(),
        SocketAddr::new(LOOPBACK, 7002)
    );

    // Paused peers stay known but stop beaconing, so the other side expires
    // them.
    b.pause().await;
    assert_eq!(b.active_peers().len(), 1);
    eventually(|| a.active_peers().is_empty()).await;

    b.resume().await.unwrap();
    eventually(|| a.active_peers().len() == 1).await;

    b.stop().await;
    assert!(b.active_peers().is_empty());
    eventually(|| a.active_peers().is_empty()).await;
    a.stop().await;
}

#[tokio::test]
async fn nodes_discover_each_other_and_sync() {
    let (port_a, port_b) = (free_udp_port(), free_udp_port());
    let config = |id: &str, port, peer_port| {
        node_config(id, "secret")
            .with_discovery(discovery_config(port, peer_port))
            .with_sync(SyncConfig::new(Duration::from_millis(200), 3))
    };
    let a = start_node(config("node-a", port_a, port_b), ResolverKind::LastWriteWins).await;
    a.database().collection("notes").put("n1", json!("hello")).unwrap();
    let b = start_node(config("node-b", port_b, port_a), ResolverKind::LastWriteWins).await;

    eventually(|| b.database().collection("notes").get("n1").unwrap().is_some()).await;
    eventually(|| b.stats().peers_synced >= 1).await;
    assert!(b.discovery_addr().is_some());

    a.stop().await;
    b.stop().await;
}
