//! Local database facade.
//!
//! [`PeerDatabase`] binds a node id, a [`PeerStore`] and the node's
//! [`HlcClock`]. Local writes are stamped by the clock and go through the
//! same resolve-and-log path as changes received from peers.

use crate::change_feed::ChangesApplied;
use crate::document::{Document, OplogEntry};
use crate::error::{CoreError, CoreResult};
use crate::hlc::{HlcClock, HlcTimestamp};
use crate::store::{ApplySummary, PeerStore};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// A node's local replica.
pub struct PeerDatabase {
    store: Arc<dyn PeerStore>,
    clock: HlcClock,
}

impl PeerDatabase {
    /// Opens a database over `store`, seeding the clock from its oplog.
    pub fn open(node_id: impl Into<String>, store: Arc<dyn PeerStore>) -> CoreResult<Self> {
        let node_id = node_id.into();
        if node_id.is_empty() {
            return Err(CoreError::invalid_argument("node id must not be empty"));
        }
        let latest = store.latest_timestamp()?;
        let clock = HlcClock::seeded(node_id, &latest);
        info!(node_id = clock.node_id(), seed = %clock.current(), "opened database");
        Ok(Self { store, clock })
    }

    /// Returns this node's id.
    pub fn node_id(&self) -> &str {
        self.clock.node_id()
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<dyn PeerStore> {
        &self.store
    }

    /// Returns the node clock.
    pub fn clock(&self) -> &HlcClock {
        &self.clock
    }

    /// Returns a handle to a collection.
    pub fn collection(&self, name: impl Into<String>) -> Collection<'_> {
        Collection {
            db: self,
            name: name.into(),
        }
    }

    /// Issues the next local timestamp.
    pub fn tick(&self) -> HlcTimestamp {
        self.clock.tick()
    }

    /// Returns the greatest timestamp in the local oplog.
    pub fn latest_timestamp(&self) -> CoreResult<HlcTimestamp> {
        self.store.latest_timestamp()
    }

    /// Returns local oplog entries newer than `since`, ascending.
    pub fn oplog_after(&self, since: &HlcTimestamp) -> CoreResult<Vec<OplogEntry>> {
        self.store.get_oplog_after(since)
    }

    /// Applies entries received from a peer and advances the clock past them.
    pub fn apply_remote_changes(&self, entries: &[OplogEntry]) -> CoreResult<ApplySummary> {
        if entries.is_empty() {
            return Ok(ApplySummary::default());
        }
        let summary = self.store.apply_remote_changes(entries)?;
        if let Some(newest) = entries.iter().map(|e| &e.timestamp).max() {
            self.clock.observe(newest);
        }
        Ok(summary)
    }

    /// Subscribes to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangesApplied> {
        self.store.subscribe()
    }

    fn write(&self, entry: OplogEntry) -> CoreResult<HlcTimestamp> {
        let timestamp = entry.timestamp.clone();
        debug!(
            collection = %entry.collection,
            key = %entry.key,
            operation = %entry.operation,
            %timestamp,
            "local write"
        );
        self.store.apply_batch(&[], std::slice::from_ref(&entry))?;
        Ok(timestamp)
    }
}

/// Handle to one collection of a [`PeerDatabase`].
pub struct Collection<'a> {
    db: &'a PeerDatabase,
    name: String,
}

impl Collection<'_> {
    /// Returns the collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Writes `content` under `key`, returning the write's timestamp.
    pub fn put(&self, key: &str, content: Value) -> CoreResult<HlcTimestamp> {
        check_key(key)?;
        let entry = OplogEntry::put(&self.name, key, content, self.db.tick());
        self.db.write(entry)
    }

    /// Deletes `key`, leaving a tombstone.
    pub fn delete(&self, key: &str) -> CoreResult<HlcTimestamp> {
        check_key(key)?;
        let entry = OplogEntry::delete(&self.name, key, self.db.tick());
        self.db.write(entry)
    }

    /// Reads a live document.
    pub fn get(&self, key: &str) -> CoreResult<Option<Document>> {
        Ok(self
            .db
            .store
            .get_document(&self.name, key)?
            .filter(|doc| !doc.is_deleted))
    }

    /// Lists live documents ordered by key.
    pub fn list(&self) -> CoreResult<Vec<Document>> {
        self.db.store.documents(&self.name)
    }
}

fn check_key(key: &str) -> CoreResult<()> {
    if key.is_empty() {
        return Err(CoreError::invalid_argument("document key must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ResolverKind;
    use crate::store::MemoryPeerStore;
    use serde_json::json;

    fn open(node: &str) -> PeerDatabase {
        PeerDatabase::open(node, Arc::new(MemoryPeerStore::default())).unwrap()
    }

    #[test]
    fn rejects_empty_node_id() {
        let result = PeerDatabase::open("", Arc::new(MemoryPeerStore::default()));
        assert!(result.is_err());
    }

    #[test]
    fn put_get_delete() {
        let db = open("A");
        let users = db.collection("users");

        users.put("u1", json!({"name": "ada"})).unwrap();
        assert_eq!(users.get("u1").unwrap().unwrap().content, json!({"name": "ada"}));

        users.delete("u1").unwrap();
        assert!(users.get("u1").unwrap().is_none());
        // The tombstone is still there for replication.
        assert!(db.store().get_document("users", "u1").unwrap().unwrap().is_deleted);
    }

    #[test]
    fn local_writes_are_logged_in_order() {
        let db = open("A");
        let c = db.collection("c");
        let t1 = c.put("a", json!(1)).unwrap();
        let t2 = c.put("b", json!(2)).unwrap();

        assert!(t2 > t1);
        let log = db.oplog_after(&HlcTimestamp::zero()).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].timestamp, t1);
        assert_eq!(db.latest_timestamp().unwrap(), t2);
    }

    #[test]
    fn empty_key_rejected() {
        let db = open("A");
        assert!(db.collection("c").put("", json!(1)).is_err());
    }

    #[test]
    fn reopen_seeds_clock_from_log() {
        let store: Arc<dyn PeerStore> = Arc::new(MemoryPeerStore::default());
        let far_future = crate::hlc::wall_clock_millis() + 3_600_000;
        store
            .apply_remote_changes(&[OplogEntry::put(
                "c",
                "k",
                json!(1),
                HlcTimestamp::new(far_future, 0, "B"),
            )])
            .unwrap();

        let db = PeerDatabase::open("A", Arc::clone(&store)).unwrap();
        let ts = db.collection("c").put("k", json!(2)).unwrap();
        assert_eq!(ts, HlcTimestamp::new(far_future, 1, "A"));
        assert_eq!(db.collection("c").get("k").unwrap().unwrap().content, json!(2));
    }

    #[test]
    fn remote_changes_advance_clock() {
        let db = open("A");
        let far_future = crate::hlc::wall_clock_millis() + 3_600_000;
        let remote = HlcTimestamp::new(far_future, 3, "B");
        db.apply_remote_changes(&[OplogEntry::put("c", "k", json!(1), remote.clone())])
            .unwrap();

        let local = db.collection("c").put("k", json!(2)).unwrap();
        assert!(local > remote);
        assert_eq!(db.collection("c").get("k").unwrap().unwrap().content, json!(2));
    }

    #[test]
    fn merge_resolver_applies_to_local_writes() {
        let store = Arc::new(MemoryPeerStore::with_resolver(ResolverKind::RecursiveMerge));
        let db = PeerDatabase::open("A", store).unwrap();
        let c = db.collection("c");
        c.put("k", json!({"a": 1})).unwrap();
        c.put("k", json!({"b": 2})).unwrap();
        assert_eq!(c.get("k").unwrap().unwrap().content, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn subscribers_see_local_writes() {
        let db = open("A");
        let mut rx = db.subscribe();
        db.collection("todos").put("t1", json!({})).unwrap();
        assert_eq!(rx.try_recv().unwrap().collections, vec!["todos"]);
    }
}
