//! EntglDb CLI
//!
//! Command-line peer for an EntglDb mesh.
//!
//! # Commands
//!
//! - `run` - Start a node and keep syncing until Ctrl-C
//! - `sync` - Start a node, run one sync cycle and print a report

mod commands;

use clap::{Parser, Subcommand};
use commands::NodeArgs;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// EntglDb peer-to-peer sync node.
#[derive(Parser)]
#[command(name = "entgldb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node and keep syncing until Ctrl-C
    Run {
        #[command(flatten)]
        node: NodeArgs,
    },

    /// Start a node, run one sync cycle and print a report
    Sync {
        #[command(flatten)]
        node: NodeArgs,

        /// Seconds to wait for discovery before syncing
        #[arg(short, long, default_value = "0")]
        wait: u64,

        /// Include live documents in the report
        #[arg(short, long)]
        documents: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run { node } => commands::run::run(&node).await?,
        Commands::Sync {
            node,
            wait,
            documents,
            format,
        } => commands::sync::run(&node, Duration::from_secs(wait), documents, &format).await?,
        Commands::Version => {
            println!("EntglDb CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("EntglDb Core v{}", entgldb_core::VERSION);
        }
    }

    Ok(())
}
