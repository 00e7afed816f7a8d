use super::{ConflictResolutionResult, ConflictResolver};
use crate::document::{Document, OplogEntry};

/// Whole-document last write wins.
///
/// A remote entry replaces local state only when its timestamp is strictly
/// greater than the local `updated_at`. Ties keep the local document.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWinsResolver;

impl ConflictResolver for LastWriteWinsResolver {
    fn resolve(&self, local: Option<&Document>, remote: &OplogEntry) -> ConflictResolutionResult {
        match local {
            None => ConflictResolutionResult::apply(Document::from_entry(remote)),
            Some(local) if remote.timestamp > local.updated_at => {
                ConflictResolutionResult::apply(Document::from_entry(remote))
            }
            Some(_) => ConflictResolutionResult::ignore(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlc::HlcTimestamp;
    use serde_json::json;

    fn local_at(ts: HlcTimestamp) -> Document {
        Document::new("c", "k", json!({"v": "local"}), ts)
    }

    #[test]
    fn absent_local_applies() {
        let remote = OplogEntry::put("c", "k", json!({"v": 1}), HlcTimestamp::new(1, 0, "B"));
        let result = LastWriteWinsResolver.resolve(None, &remote);

        assert!(result.should_apply);
        assert_eq!(result.merged_document.unwrap().content, json!({"v": 1}));
    }

    #[test]
    fn absent_local_delete_materializes_tombstone() {
        let remote = OplogEntry::delete("c", "k", HlcTimestamp::new(1, 0, "B"));
        let doc = LastWriteWinsResolver
            .resolve(None, &remote)
            .merged_document
            .unwrap();
        assert!(doc.is_deleted);
    }

    #[test]
    fn newer_remote_wins() {
        let local = local_at(HlcTimestamp::new(100, 0, "A"));
        let remote = OplogEntry::put("c", "k", json!({"v": "remote"}), HlcTimestamp::new(200, 0, "B"));
        let result = LastWriteWinsResolver.resolve(Some(&local), &remote);

        assert!(result.should_apply);
        let doc = result.merged_document.unwrap();
        assert_eq!(doc.updated_at, HlcTimestamp::new(200, 0, "B"));
        assert_eq!(doc.content, json!({"v": "remote"}));
    }

    #[test]
    fn equal_timestamp_keeps_local() {
        let local = local_at(HlcTimestamp::new(100, 0, "A"));
        let remote = OplogEntry::put("c", "k", json!({"v": "remote"}), HlcTimestamp::new(100, 0, "A"));
        assert!(!LastWriteWinsResolver.resolve(Some(&local), &remote).should_apply);
    }

    #[test]
    fn older_remote_ignored() {
        let local = local_at(HlcTimestamp::new(100, 0, "B"));
        let remote = OplogEntry::delete("c", "k", HlcTimestamp::new(100, 0, "A"));
        assert!(!LastWriteWinsResolver.resolve(Some(&local), &remote).should_apply);
    }

    #[test]
    fn node_id_breaks_physical_ties() {
        let local = local_at(HlcTimestamp::new(100, 0, "A"));
        let remote = OplogEntry::put("c", "k", json!({}), HlcTimestamp::new(100, 0, "B"));
        assert!(LastWriteWinsResolver.resolve(Some(&local), &remote).should_apply);
    }
}
