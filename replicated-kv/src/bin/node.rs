//! Runs one node of the cluster.
//!
//! Every node reads the same property file and picks its own address by
//! number. Start a 3-node cluster with:
//! ```bash
//! # dkvs.properties
//! # servers_count=3
//! # timeout=1000
//! # node.1=127.0.0.1:7101
//! # node.2=127.0.0.1:7102
//! # node.3=127.0.0.1:7103
//!
//! cargo run --bin node -- --node 1
//! cargo run --bin node -- --node 2
//! cargo run --bin node -- --node 3
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueHint};
use tracing::info;

use replicated_kv::config::NodeConfig;
use replicated_kv::runtime::spawn_node;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a replicated key-value store node")]
struct Args {
    /// Cluster property file shared by every node
    #[arg(long, default_value = "dkvs.properties", value_hint = ValueHint::FilePath)]
    config: PathBuf,

    /// This node's number, starting from 1
    #[arg(long)]
    node: usize,

    /// Directory for the durable log and state files
    #[arg(long, default_value = ".", value_hint = ValueHint::DirPath)]
    data_dir: PathBuf,
}

fn main() -> Result<()> {
    replicated_kv::init_tracing();
    let args = Args::parse();

    let config = NodeConfig::load(&args.config, args.node, &args.data_dir)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    info!(
        node = config.number(),
        nodes = config.cluster.len(),
        timeout_ms = config.cluster.timeout.as_millis() as u64,
        data_dir = %config.data_dir.display(),
        "starting"
    );

    let handle = spawn_node(config)?;
    handle.join()
}
