//! Run command implementation.

use super::{CliResult, NodeArgs};
use entgldb_network::EntglDbNode;
use std::sync::Arc;
use tracing::{info, warn};

/// Runs a node until Ctrl-C.
pub async fn run(args: &NodeArgs) -> CliResult<()> {
    let config = args.config()?;
    let database = args.open_database()?;
    let node = EntglDbNode::new(config, Arc::clone(&database))?;

    let addr = node.start().await?;
    info!(node_id = %node.node_id(), %addr, resolver = %args.resolver, "node running, press Ctrl-C to stop");

    let mut leadership = node.leadership();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for Ctrl-C");
                }
                break;
            }
            changed = leadership.changed() => {
                if changed.is_err() {
                    break;
                }
                let leader = *leadership.borrow_and_update();
                info!(leader, "leadership changed");
            }
        }
    }

    node.stop().await;
    let stats = node.stats();
    info!(
        cycles = stats.cycles_completed,
        peers_synced = stats.peers_synced,
        pulled = stats.entries_pulled,
        pushed = stats.entries_pushed,
        failures = stats.peer_failures,
        "node stopped"
    );
    Ok(())
}
