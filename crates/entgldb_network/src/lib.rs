//! # EntglDb Network
//!
//! Peer-to-peer transport and gossip sync for EntglDb.
//!
//! This crate provides:
//! - `TcpSyncServer` answering Handshake, GetClock, Pull and Push requests
//! - `TcpPeerClient` and `PeerSession` for outbound sessions
//! - `SecureChannel`, framed messages with X25519 key agreement and AES-GCM
//! - `UdpDiscoveryService`, LAN discovery by broadcast beacons
//! - `SyncOrchestrator`, the periodic fan-out gossip loop
//! - `BullyLeaderElection`, advisory smallest-id leadership
//! - `EntglDbNode`, a facade owning all of the above
//!
//! # Session
//!
//! A sync session between an initiator and a responder:
//! 1. Key exchange: each side writes a 32-byte ephemeral public key
//! 2. Handshake: node id, cluster token and offered compression
//! 3. GetClock: the responder's latest oplog timestamp
//! 4. Pull: entries newer than the initiator's latest timestamp
//! 5. Push: entries newer than the responder's clock
//!
//! ```rust,ignore
//! use entgldb_core::{MemoryPeerStore, PeerDatabase};
//! use entgldb_network::{EntglDbNode, NodeConfig};
//! use std::sync::Arc;
//!
//! let db = Arc::new(PeerDatabase::open("node-a", Arc::new(MemoryPeerStore::default()))?);
//! let node = EntglDbNode::new(NodeConfig::new("node-a", 7000, "cluster-secret"), db)?;
//! node.start().await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(not(test), warn(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod auth;
mod channel;
mod client;
mod config;
mod discovery;
mod election;
mod error;
mod handler;
mod handshake;
mod node;
mod orchestrator;
mod server;
mod task;

pub use auth::TokenValidator;
pub use channel::SecureChannel;
pub use client::{PeerSession, TcpPeerClient};
pub use config::{
    DiscoveryConfig, ElectionConfig, NodeConfig, SyncConfig, DEFAULT_DISCOVERY_PORT,
};
pub use discovery::{
    DiscoveryBeacon, DiscoveryService, PeerTable, StaticDiscovery, UdpDiscoveryService,
};
pub use election::{is_leader_among, BullyLeaderElection};
pub use error::{ErrorCategory, NetworkError, NetworkResult};
pub use handler::SyncMessageProcessor;
pub use node::EntglDbNode;
pub use orchestrator::{
    PeerSyncFailure, PeerSyncOutcome, SyncCycleResult, SyncOrchestrator, SyncStats,
};
pub use server::TcpSyncServer;
