//! Sync command implementation.

use super::{CliResult, NodeArgs};
use entgldb_core::PeerDatabase;
use entgldb_network::{EntglDbNode, SyncCycleResult};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Result of a one-shot sync.
#[derive(Debug, Serialize)]
pub struct SyncReport {
    /// Local node id.
    pub node_id: String,
    /// Number of peers contacted.
    pub peers_selected: usize,
    /// Per-peer transfer counts.
    pub synced: Vec<PeerReport>,
    /// Per-peer failures.
    pub failures: Vec<FailureReport>,
    /// Latest local oplog timestamp after the cycle.
    pub latest_timestamp: String,
    /// Live documents after the cycle (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documents: Option<Vec<DocumentReport>>,
}

/// Transfer counts for one peer.
#[derive(Debug, Serialize)]
pub struct PeerReport {
    /// Peer node id.
    pub node_id: String,
    /// Entries pulled from the peer.
    pub pulled: usize,
    /// Entries pushed to the peer.
    pub pushed: usize,
}

/// A failed peer session.
#[derive(Debug, Serialize)]
pub struct FailureReport {
    /// Peer node id.
    pub node_id: String,
    /// Error category.
    pub category: String,
    /// Error message.
    pub error: String,
}

/// A live document.
#[derive(Debug, Serialize)]
pub struct DocumentReport {
    /// Collection name.
    pub collection: String,
    /// Document key.
    pub key: String,
    /// Document content.
    pub content: Value,
    /// Timestamp of the winning write.
    pub updated_at: String,
}

/// Runs the sync command.
pub async fn run(
    args: &NodeArgs,
    wait: Duration,
    show_documents: bool,
    format: &str,
) -> CliResult<()> {
    let config = args.config()?;
    let database = args.open_database()?;
    let node = EntglDbNode::new(config, Arc::clone(&database))?;

    node.start().await?;
    if !wait.is_zero() {
        info!(?wait, "waiting for peers");
        tokio::time::sleep(wait).await;
    }
    let cycle = node.sync_now().await;
    node.stop().await;

    let report = build_report(&database, cycle, show_documents)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_text_output(&report),
    }
    Ok(())
}

fn build_report(
    database: &PeerDatabase,
    cycle: SyncCycleResult,
    show_documents: bool,
) -> CliResult<SyncReport> {
    let documents = if show_documents {
        let store = database.store();
        let mut documents = Vec::new();
        for collection in store.collections()? {
            for doc in store.documents(&collection)? {
                documents.push(DocumentReport {
                    collection: doc.collection,
                    key: doc.key,
                    content: doc.content,
                    updated_at: doc.updated_at.to_string(),
                });
            }
        }
        Some(documents)
    } else {
        None
    };

    Ok(SyncReport {
        node_id: database.node_id().to_string(),
        peers_selected: cycle.peers_selected,
        synced: cycle
            .synced
            .into_iter()
            .map(|outcome| PeerReport {
                node_id: outcome.node_id,
                pulled: outcome.pulled,
                pushed: outcome.pushed,
            })
            .collect(),
        failures: cycle
            .failures
            .into_iter()
            .map(|failure| FailureReport {
                node_id: failure.node_id,
                category: format!("{:?}", failure.category),
                error: failure.error,
            })
            .collect(),
        latest_timestamp: database.latest_timestamp()?.to_string(),
        documents,
    })
}

fn print_text_output(report: &SyncReport) {
    println!("Sync report for {}", report.node_id);
    println!("==================");
    println!("  Peers selected:   {}", report.peers_selected);
    println!("  Latest timestamp: {}", report.latest_timestamp);

    if !report.synced.is_empty() {
        println!();
        println!("Synced:");
        for peer in &report.synced {
            println!(
                "  {:<20} pulled {:>6}  pushed {:>6}",
                peer.node_id, peer.pulled, peer.pushed
            );
        }
    }

    if !report.failures.is_empty() {
        println!();
        println!("Failures:");
        for failure in &report.failures {
            println!(
                "  {:<20} [{}] {}",
                failure.node_id, failure.category, failure.error
            );
        }
    }

    if let Some(documents) = &report.documents {
        println!();
        println!("Documents:");
        for doc in documents {
            println!("  {}/{} = {}", doc.collection, doc.key, doc.content);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entgldb_core::MemoryPeerStore;
    use entgldb_network::{ErrorCategory, PeerSyncFailure, PeerSyncOutcome};
    use serde_json::json;

    #[test]
    fn report_lists_live_documents() {
        let database = PeerDatabase::open("a", Arc::new(MemoryPeerStore::default())).unwrap();
        let users = database.collection("users");
        users.put("u1", json!({"name": "Ada"})).unwrap();
        users.put("u2", json!({"name": "Bob"})).unwrap();
        users.delete("u2").unwrap();

        let cycle = SyncCycleResult {
            peers_selected: 2,
            synced: vec![PeerSyncOutcome {
                node_id: "b".into(),
                pulled: 1,
                pushed: 3,
            }],
            failures: vec![PeerSyncFailure {
                node_id: "c".into(),
                error: "connection refused".into(),
                category: ErrorCategory::Transport,
            }],
        };

        let report = build_report(&database, cycle, true).unwrap();
        assert_eq!(report.node_id, "a");
        assert_eq!(report.synced[0].pushed, 3);
        assert_eq!(report.failures[0].category, "Transport");

        let documents = report.documents.unwrap();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].key, "u1");
    }

    #[test]
    fn documents_are_omitted_unless_requested() {
        let database = PeerDatabase::open("a", Arc::new(MemoryPeerStore::default())).unwrap();
        let report = build_report(&database, SyncCycleResult::default(), false).unwrap();
        assert!(report.documents.is_none());

        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("documents").is_none());
        assert_eq!(json["peers_selected"], 0);
    }
}
