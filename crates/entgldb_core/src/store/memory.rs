//! In-memory reference store.

use super::{ApplySummary, PeerStore};
use crate::change_feed::{ChangeFeed, ChangesApplied};
use crate::conflict::{ConflictResolver, ResolverKind};
use crate::document::{Document, OplogEntry};
use crate::error::{CoreError, CoreResult};
use crate::hlc::HlcTimestamp;
use crate::peer::PeerNode;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

type DocumentKey = (String, String);
type OplogKey = (HlcTimestamp, String, String);

#[derive(Default)]
struct Inner {
    documents: BTreeMap<DocumentKey, Document>,
    oplog: BTreeMap<OplogKey, OplogEntry>,
    remote_peers: BTreeMap<String, PeerNode>,
}

/// A [`PeerStore`] kept entirely in memory.
///
/// One lock guards all state, so every batch apply is atomic with respect to
/// concurrent readers and writers. The oplog is indexed by
/// `(timestamp, collection, key)`; re-delivered entries are not appended twice.
pub struct MemoryPeerStore {
    inner: RwLock<Inner>,
    resolver: Arc<dyn ConflictResolver>,
    feed: ChangeFeed,
}

impl MemoryPeerStore {
    /// Creates an empty store using the given resolver.
    pub fn new(resolver: Arc<dyn ConflictResolver>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            resolver,
            feed: ChangeFeed::new(),
        }
    }

    /// Creates an empty store using a built-in resolver.
    pub fn with_resolver(kind: ResolverKind) -> Self {
        Self::new(kind.build())
    }

    /// Returns the number of oplog entries.
    pub fn oplog_len(&self) -> usize {
        self.inner.read().oplog.len()
    }
}

impl Default for MemoryPeerStore {
    fn default() -> Self {
        Self::with_resolver(ResolverKind::default())
    }
}

impl fmt::Debug for MemoryPeerStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("MemoryPeerStore")
            .field("documents", &inner.documents.len())
            .field("oplog", &inner.oplog.len())
            .field("remote_peers", &inner.remote_peers.len())
            .finish()
    }
}

fn validate_entry(entry: &OplogEntry) -> CoreResult<()> {
    if entry.collection.is_empty() || entry.key.is_empty() {
        return Err(CoreError::invalid_argument(
            "oplog entry needs a collection and a key",
        ));
    }
    if entry.timestamp.node_id.is_empty() {
        return Err(CoreError::invalid_argument(format!(
            "oplog entry {}/{} has no node id",
            entry.collection, entry.key
        )));
    }
    Ok(())
}

fn oplog_key(entry: &OplogEntry) -> OplogKey {
    (
        entry.timestamp.clone(),
        entry.collection.clone(),
        entry.key.clone(),
    )
}

impl PeerStore for MemoryPeerStore {
    fn save_document(&self, document: Document) -> CoreResult<()> {
        let collection = document.collection.clone();
        self.inner.write().documents.insert(
            (document.collection.clone(), document.key.clone()),
            document,
        );
        self.feed.publish([collection]);
        Ok(())
    }

    fn get_document(&self, collection: &str, key: &str) -> CoreResult<Option<Document>> {
        Ok(self
            .inner
            .read()
            .documents
            .get(&(collection.to_string(), key.to_string()))
            .cloned())
    }

    fn get_oplog_after(&self, since: &HlcTimestamp) -> CoreResult<Vec<OplogEntry>> {
        let inner = self.inner.read();
        let start = (since.clone(), String::new(), String::new());
        Ok(inner
            .oplog
            .range(start..)
            .skip_while(|((ts, _, _), _)| ts == since)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    fn latest_timestamp(&self) -> CoreResult<HlcTimestamp> {
        Ok(self
            .inner
            .read()
            .oplog
            .keys()
            .next_back()
            .map(|(ts, _, _)| ts.clone())
            .unwrap_or_else(HlcTimestamp::zero))
    }

    fn apply_batch(
        &self,
        documents: &[Document],
        entries: &[OplogEntry],
    ) -> CoreResult<ApplySummary> {
        for entry in entries {
            validate_entry(entry)?;
        }

        let mut summary = ApplySummary::default();
        let mut touched: Vec<&str> = Vec::with_capacity(documents.len() + entries.len());
        {
            let mut inner = self.inner.write();

            for document in documents {
                inner.documents.insert(
                    (document.collection.clone(), document.key.clone()),
                    document.clone(),
                );
                touched.push(&document.collection);
            }

            for entry in entries {
                let id = (entry.collection.clone(), entry.key.clone());
                let result = self.resolver.resolve(inner.documents.get(&id), entry);
                match result.merged_document {
                    Some(merged) if result.should_apply => {
                        inner.documents.insert(id, merged);
                        summary.applied += 1;
                    }
                    _ => summary.ignored += 1,
                }

                let key = oplog_key(entry);
                if !inner.oplog.contains_key(&key) {
                    inner.oplog.insert(key, entry.clone());
                    summary.appended += 1;
                }
                touched.push(&entry.collection);
            }
        }

        debug!(
            documents = documents.len(),
            applied = summary.applied,
            ignored = summary.ignored,
            appended = summary.appended,
            "applied batch"
        );
        self.feed.publish(touched);
        Ok(summary)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangesApplied> {
        self.feed.subscribe()
    }

    fn collections(&self) -> CoreResult<Vec<String>> {
        let inner = self.inner.read();
        let mut names: Vec<String> = Vec::new();
        for (collection, _) in inner.documents.keys() {
            if names.last() != Some(collection) {
                names.push(collection.clone());
            }
        }
        Ok(names)
    }

    fn documents(&self, collection: &str) -> CoreResult<Vec<Document>> {
        let inner = self.inner.read();
        let start = (collection.to_string(), String::new());
        Ok(inner
            .documents
            .range(start..)
            .take_while(|((c, _), _)| c == collection)
            .filter(|(_, doc)| !doc.is_deleted)
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    fn remote_peers(&self) -> CoreResult<Vec<PeerNode>> {
        Ok(self.inner.read().remote_peers.values().cloned().collect())
    }

    fn save_remote_peer(&self, peer: PeerNode) -> CoreResult<()> {
        if !peer.is_persistent() {
            return Err(CoreError::invalid_argument(format!(
                "peer {} is LAN-discovered and cannot be persisted",
                peer.node_id
            )));
        }
        peer.node_address()?;
        self.inner
            .write()
            .remote_peers
            .insert(peer.node_id.clone(), peer);
        Ok(())
    }

    fn remove_remote_peer(&self, node_id: &str) -> CoreResult<()> {
        self.inner.write().remote_peers.remove(node_id);
        Ok(())
    }
}
