//! # EntglDb Core
//!
//! Replication building blocks for EntglDb peer-to-peer document sync.
//!
//! This crate provides:
//! - `HlcTimestamp` and `HlcClock` (hybrid logical clock)
//! - `Document` and `OplogEntry` replication records
//! - `ConflictResolver` with last-write-wins and recursive-merge strategies
//! - `PeerNode` and `NodeAddress` peer model
//! - `PeerStore`, the storage collaborator contract, with an in-memory store
//! - `PeerDatabase` local write facade
//!
//! ## Convergence
//!
//! Documents are a projection of the append-only oplog. Every entry passes
//! through a deterministic resolver inside an atomic batch apply, so nodes
//! that receive the same entries in any order converge to the same state.
//!
//! ```rust,ignore
//! use entgldb_core::{MemoryPeerStore, PeerDatabase};
//! use std::sync::Arc;
//!
//! let db = PeerDatabase::open("node-a", Arc::new(MemoryPeerStore::default()))?;
//! db.collection("todos").put("t1", serde_json::json!({"title": "milk"}))?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod conflict;
mod database;
mod document;
mod error;
mod hlc;
mod peer;
mod store;

pub use change_feed::{ChangeFeed, ChangesApplied, CHANGE_FEED_CAPACITY};
pub use conflict::{
    ConflictResolutionResult, ConflictResolver, LastWriteWinsResolver, RecursiveMergeResolver,
    ResolverKind,
};
pub use database::{Collection, PeerDatabase};
pub use document::{Document, OperationType, OplogEntry};
pub use error::{CoreError, CoreResult};
pub use hlc::{wall_clock_millis, HlcClock, HlcTimestamp};
pub use peer::{NodeAddress, PeerNode, PeerType};
pub use store::{ApplySummary, MemoryPeerStore, PeerStore};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
