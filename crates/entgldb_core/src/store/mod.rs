//! Storage collaborator contract.
//!
//! The sync subsystem never touches documents or the oplog directly; it goes
//! through a [`PeerStore`]. Implementations own all mutation and must make
//! [`PeerStore::apply_batch`] atomic: the conflict resolver's read of local
//! state and the write of its result are never interleaved with another
//! write to the same key.

mod memory;

pub use memory::MemoryPeerStore;

use crate::change_feed::ChangesApplied;
use crate::document::{Document, OplogEntry};
use crate::error::CoreResult;
use crate::hlc::HlcTimestamp;
use crate::peer::PeerNode;
use tokio::sync::broadcast;

/// Counts produced by one batch apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    /// Entries that changed materialized state.
    pub applied: usize,
    /// Entries the resolver ignored.
    pub ignored: usize,
    /// Entries newly appended to the oplog.
    pub appended: usize,
}

/// Document and oplog storage used by a node.
///
/// Methods are synchronous; async callers run them on a blocking thread.
pub trait PeerStore: Send + Sync {
    /// Writes a document as is, bypassing conflict resolution.
    fn save_document(&self, document: Document) -> CoreResult<()>;

    /// Reads a document, including tombstones.
    fn get_document(&self, collection: &str, key: &str) -> CoreResult<Option<Document>>;

    /// Returns entries with timestamp strictly greater than `since`, ascending.
    fn get_oplog_after(&self, since: &HlcTimestamp) -> CoreResult<Vec<OplogEntry>>;

    /// Returns the greatest timestamp in the oplog, or [`HlcTimestamp::zero`].
    fn latest_timestamp(&self) -> CoreResult<HlcTimestamp>;

    /// Atomically saves `documents`, resolves every entry against local state,
    /// persists the resolved documents and appends all entries to the log.
    ///
    /// Publishes one change notification naming the affected collections.
    fn apply_batch(&self, documents: &[Document], entries: &[OplogEntry])
        -> CoreResult<ApplySummary>;

    /// Applies entries received from a peer.
    fn apply_remote_changes(&self, entries: &[OplogEntry]) -> CoreResult<ApplySummary> {
        self.apply_batch(&[], entries)
    }

    /// Subscribes to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<ChangesApplied>;

    /// Lists collection names holding at least one document.
    fn collections(&self) -> CoreResult<Vec<String>>;

    /// Lists live documents of a collection, ordered by key.
    fn documents(&self, collection: &str) -> CoreResult<Vec<Document>>;

    /// Lists persisted static and cloud peers.
    fn remote_peers(&self) -> CoreResult<Vec<PeerNode>>;

    /// Persists a static or cloud peer, replacing any with the same id.
    fn save_remote_peer(&self, peer: PeerNode) -> CoreResult<()>;

    /// Removes a persisted peer. Unknown ids are ignored.
    fn remove_remote_peer(&self, node_id: &str) -> CoreResult<()>;
}
