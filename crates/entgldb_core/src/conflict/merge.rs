use super::{ConflictResolutionResult, ConflictResolver};
use crate::document::{empty_content, Document, OperationType, OplogEntry};
use crate::hlc::HlcTimestamp;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// Field-level merge of JSON documents.
///
/// Deletes are last-write-wins at document granularity. Puts merge the two
/// content trees:
///
/// - objects merge key by key; a key present on one side only is taken as is
/// - arrays whose elements are all objects merge by their `id` (or `_id`) field
/// - anything else, including mismatched node kinds, is last-write-wins on
///   the whole subtree
///
/// The merged document carries the greater of the two timestamps.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecursiveMergeResolver;

impl ConflictResolver for RecursiveMergeResolver {
    fn resolve(&self, local: Option<&Document>, remote: &OplogEntry) -> ConflictResolutionResult {
        let Some(local) = local else {
            return ConflictResolutionResult::apply(Document::from_entry(remote));
        };

        if remote.operation == OperationType::Delete {
            if remote.timestamp > local.updated_at {
                return ConflictResolutionResult::apply(Document::tombstone(
                    &remote.collection,
                    &remote.key,
                    remote.timestamp.clone(),
                ));
            }
            return ConflictResolutionResult::ignore();
        }

        let remote_content = remote.payload.clone().unwrap_or_else(empty_content);
        let stamps = Stamps {
            local: &local.updated_at,
            remote: &remote.timestamp,
        };
        let content = merge_values(&local.content, &remote_content, stamps);
        let updated_at = std::cmp::max(&local.updated_at, &remote.timestamp).clone();

        ConflictResolutionResult::apply(Document::new(
            &local.collection,
            &local.key,
            content,
            updated_at,
        ))
    }
}

/// A JSON node seen as one of the three shapes the merge distinguishes.
enum Node<'a> {
    Object(&'a Map<String, Value>),
    Array(&'a [Value]),
    Scalar(&'a Value),
}

impl<'a> Node<'a> {
    fn of(value: &'a Value) -> Self {
        match value {
            Value::Object(map) => Node::Object(map),
            Value::Array(items) => Node::Array(items),
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
                Node::Scalar(value)
            }
        }
    }
}

#[derive(Clone, Copy)]
struct Stamps<'a> {
    local: &'a HlcTimestamp,
    remote: &'a HlcTimestamp,
}

impl Stamps<'_> {
    fn newer(&self, local: &Value, remote: &Value) -> Value {
        if self.remote > self.local {
            remote.clone()
        } else {
            local.clone()
        }
    }
}

fn merge_values(local: &Value, remote: &Value, stamps: Stamps<'_>) -> Value {
    match (Node::of(local), Node::of(remote)) {
        (Node::Object(l), Node::Object(r)) => Value::Object(merge_objects(l, r, stamps)),
        (Node::Array(l), Node::Array(r)) => {
            merge_arrays(l, r, stamps).unwrap_or_else(|| stamps.newer(local, remote))
        }
        (Node::Scalar(l), Node::Scalar(r)) if l == r => l.clone(),
        _ => stamps.newer(local, remote),
    }
}

fn merge_objects(
    local: &Map<String, Value>,
    remote: &Map<String, Value>,
    stamps: Stamps<'_>,
) -> Map<String, Value> {
    let mut merged = local.clone();
    for (key, remote_value) in remote {
        let value = match local.get(key) {
            Some(local_value) => merge_values(local_value, remote_value, stamps),
            None => remote_value.clone(),
        };
        merged.insert(key.clone(), value);
    }
    merged
}

/// Merges two arrays of objects by element id.
///
/// Returns `None` when the arrays are not id-keyed, in which case the caller
/// falls back to whole-array last-write-wins.
fn merge_arrays(local: &[Value], remote: &[Value], stamps: Stamps<'_>) -> Option<Value> {
    if !local.iter().chain(remote).all(Value::is_object) {
        return None;
    }
    let (local_order, local_by_id) = index_by_id(local)?;
    let (remote_order, remote_by_id) = index_by_id(remote)?;

    let mut merged = Vec::with_capacity(local_order.len() + remote_order.len());
    for id in &local_order {
        let local_item = local_by_id[id];
        let item = match remote_by_id.get(id) {
            Some(remote_item) => merge_values(local_item, remote_item, stamps),
            None => local_item.clone(),
        };
        merged.push(item);
    }
    for id in &remote_order {
        if !local_by_id.contains_key(id) {
            merged.push(remote_by_id[id].clone());
        }
    }
    Some(Value::Array(merged))
}

/// Indexes array items by id, preserving their order.
///
/// Fails if any item lacks a scalar id or two items share one.
fn index_by_id(items: &[Value]) -> Option<(Vec<String>, HashMap<String, &Value>)> {
    let mut order = Vec::with_capacity(items.len());
    let mut by_id = HashMap::with_capacity(items.len());
    let mut seen = HashSet::with_capacity(items.len());
    for item in items {
        let id = item_id(item)?;
        if !seen.insert(id.clone()) {
            return None;
        }
        order.push(id.clone());
        by_id.insert(id, item);
    }
    Some((order, by_id))
}

fn item_id(item: &Value) -> Option<String> {
    let id = item.get("id").or_else(|| item.get("_id"))?;
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn t1() -> HlcTimestamp {
        HlcTimestamp::new(100, 0, "A")
    }

    fn t2() -> HlcTimestamp {
        HlcTimestamp::new(200, 0, "B")
    }

    fn merge(local: Value, local_ts: HlcTimestamp, remote: Value, remote_ts: HlcTimestamp) -> Document {
        let local = Document::new("c", "k", local, local_ts);
        let remote = OplogEntry::put("c", "k", remote, remote_ts);
        let result = RecursiveMergeResolver.resolve(Some(&local), &remote);
        assert!(result.should_apply);
        result.merged_document.unwrap()
    }

    #[test]
    fn nested_objects_union() {
        let doc = merge(
            json!({"a": 1, "b": {"x": 1}}),
            t1(),
            json!({"b": {"y": 2}, "c": 3}),
            t2(),
        );
        assert_eq!(doc.content, json!({"a": 1, "b": {"x": 1, "y": 2}, "c": 3}));
        assert_eq!(doc.updated_at, t2());
        assert!(!doc.is_deleted);
    }

    #[test]
    fn arrays_merge_by_id() {
        let doc = merge(
            json!({"items": [{"id": "1", "v": 1}]}),
            t1(),
            json!({"items": [{"id": "1", "v": 2}, {"id": "2", "v": 9}]}),
            t2(),
        );
        assert_eq!(
            doc.content,
            json!({"items": [{"id": "1", "v": 2}, {"id": "2", "v": 9}]})
        );
    }

    #[test]
    fn array_order_is_local_then_new_remote() {
        let doc = merge(
            json!([{"_id": "b"}, {"_id": "a"}]),
            t1(),
            json!([{"_id": "c"}, {"_id": "a", "x": true}]),
            t2(),
        );
        assert_eq!(
            doc.content,
            json!([{"_id": "b"}, {"_id": "a", "x": true}, {"_id": "c"}])
        );
    }

    #[test]
    fn missing_id_falls_back_to_whole_array() {
        let doc = merge(
            json!({"items": [{"id": "1"}, {"name": "no id"}]}),
            t2(),
            json!({"items": [{"id": "3"}]}),
            t1(),
        );
        // Local is newer, so it wins the whole array.
        assert_eq!(doc.content, json!({"items": [{"id": "1"}, {"name": "no id"}]}));
        assert_eq!(doc.updated_at, t2());
    }

    #[test]
    fn duplicate_ids_fall_back_to_whole_array() {
        let doc = merge(
            json!([{"id": 1}, {"id": 1}]),
            t1(),
            json!([{"id": 2}]),
            t2(),
        );
        assert_eq!(doc.content, json!([{"id": 2}]));
    }

    #[test]
    fn scalar_arrays_are_last_write_wins() {
        let doc = merge(json!({"tags": [1, 2]}), t1(), json!({"tags": [3]}), t2());
        assert_eq!(doc.content, json!({"tags": [3]}));
    }

    #[test]
    fn mismatched_kinds_take_newer_subtree() {
        let doc = merge(json!({"a": {"x": 1}}), t2(), json!({"a": 5}), t1());
        assert_eq!(doc.content, json!({"a": {"x": 1}}));

        let doc = merge(json!({"a": {"x": 1}}), t1(), json!({"a": 5}), t2());
        assert_eq!(doc.content, json!({"a": 5}));
    }

    #[test]
    fn differing_scalars_take_newer() {
        let doc = merge(json!({"a": "old"}), t2(), json!({"a": "new"}), t1());
        assert_eq!(doc.content, json!({"a": "old"}));
        assert_eq!(doc.updated_at, t2());
    }

    #[test]
    fn one_sided_keys_are_kept_regardless_of_age() {
        let doc = merge(json!({"a": 1}), t2(), json!({"b": 2}), t1());
        assert_eq!(doc.content, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn newer_delete_tombstones() {
        let local = Document::new("c", "k", json!({"a": 1}), t1());
        let remote = OplogEntry::delete("c", "k", t2());
        let doc = RecursiveMergeResolver
            .resolve(Some(&local), &remote)
            .merged_document
            .unwrap();

        assert!(doc.is_deleted);
        assert_eq!(doc.content, json!({}));
        assert_eq!(doc.updated_at, t2());
    }

    #[test]
    fn stale_delete_ignored() {
        let local = Document::new("c", "k", json!({"a": 1}), t2());
        let remote = OplogEntry::delete("c", "k", t1());
        assert!(!RecursiveMergeResolver.resolve(Some(&local), &remote).should_apply);
    }

    #[test]
    fn absent_local_applies_remote() {
        let remote = OplogEntry::put("c", "k", json!({"a": 1}), t1());
        let doc = RecursiveMergeResolver
            .resolve(None, &remote)
            .merged_document
            .unwrap();
        assert_eq!(doc.content, json!({"a": 1}));
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            (-50i64..50).prop_map(|n| json!(n)),
            "[a-z]{0,3}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 32, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::vec(
                    (0u8..4).prop_flat_map({
                        let inner = inner.clone();
                        move |id| inner.clone().prop_map(move |v| json!({"id": id, "v": v}))
                    }),
                    0..4
                )
                .prop_map(Value::Array),
                prop::collection::btree_map("[a-d]", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn merging_with_itself_is_identity(value in arb_json()) {
            let (older, newer) = (t1(), t2());
            let stamps = Stamps { local: &older, remote: &newer };
            prop_assert_eq!(merge_values(&value, &value, stamps), value);
        }

        #[test]
        fn applying_same_entry_twice_is_idempotent(local in arb_json(), remote in arb_json()) {
            let once = merge(local, t1(), remote.clone(), t2());
            let twice = merge(once.content.clone(), once.updated_at.clone(), remote, t2());
            prop_assert_eq!(twice.content, once.content);
            prop_assert_eq!(twice.updated_at, once.updated_at);
        }
    }
}
