//! Rusty Beacon node binary: key generation and a local cluster simulator.
//!
//! The simulator wires N nodes over the in-process transport, runs the
//! DKG and prints each round's randomness. Deploying over a network
//! transport is a matter of serving [`Node::inbox`] and
//! [`Node::public_api`] behind a wire protocol.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::info;

use rusty_beacon_net::{LocalBus, RelayConfig};
use rusty_beacon_node::{Node, NodeConfig};
use rusty_beacon_types::{GroupProposal, Scheme};

#[derive(Parser)]
#[command(name = "rusty-beacon", about = "Distributed randomness beacon node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a long-term keypair and print the node identity.
    Keygen {
        /// Node base directory.
        #[arg(long)]
        base_dir: PathBuf,
        /// Public dial address of this node.
        #[arg(long)]
        address: String,
        /// Advertise TLS.
        #[arg(long, default_value_t = false)]
        tls: bool,
    },
    /// Run an in-process cluster: DKG, then beacons at the given period.
    Simulate {
        #[arg(long, default_value_t = 5)]
        nodes: usize,
        #[arg(long, default_value_t = 3)]
        threshold: u32,
        /// Seconds per round.
        #[arg(long, default_value_t = 2)]
        period: u64,
        /// Rounds to print before exiting.
        #[arg(long, default_value_t = 5)]
        rounds: u64,
        /// Scheme id: chained, unchained or short-sig.
        #[arg(long, default_value = "chained")]
        scheme: String,
        /// Where node state lives; a temp directory by default.
        #[arg(long)]
        base_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    match Cli::parse().command {
        Command::Keygen {
            base_dir,
            address,
            tls,
        } => keygen(base_dir, address, tls).await,
        Command::Simulate {
            nodes,
            threshold,
            period,
            rounds,
            scheme,
            base_dir,
        } => simulate(nodes, threshold, period, rounds, &scheme, base_dir).await,
    }
}

async fn keygen(base_dir: PathBuf, address: String, tls: bool) -> Result<(), Box<dyn Error>> {
    let bus = LocalBus::new();
    let config = NodeConfig {
        address,
        tls,
        base_dir,
        relay: RelayConfig::default(),
    };
    let node = Node::start(config, Arc::new(bus)).await?;
    println!("{}", serde_json::to_string_pretty(&node.identity())?);
    node.shutdown().await?;
    Ok(())
}

async fn simulate(
    n: usize,
    threshold: u32,
    period: u64,
    rounds: u64,
    scheme: &str,
    base_dir: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let scheme = match scheme {
        "chained" => Scheme::Chained,
        "unchained" => Scheme::Unchained,
        "short-sig" => Scheme::ShortSig,
        other => return Err(format!("unknown scheme {other}").into()),
    };
    let base = match base_dir {
        Some(dir) => dir,
        None => std::env::temp_dir().join(format!("rusty-beacon-sim-{}", std::process::id())),
    };

    let bus = LocalBus::new();
    let transport: Arc<LocalBus> = Arc::new(bus);
    let mut nodes = Vec::with_capacity(n);
    for i in 0..n {
        let config = NodeConfig {
            address: format!("sim-{i}"),
            tls: false,
            base_dir: base.join(format!("node-{i}")),
            relay: RelayConfig::default(),
        };
        let node = Node::start(config, transport.clone()).await?;
        transport
            .register(node.address(), node.inbox(), node.public_api())
            .await;
        nodes.push(node);
    }

    let proposal = GroupProposal {
        nodes: nodes.iter().map(|n| n.identity()).collect(),
        threshold,
        period,
        genesis_time: rusty_beacon_node::time::now_unix() + 3,
        scheme,
        transition_time: None,
    };

    info!("running dkg across {n} nodes");
    let dkg_runs = nodes.iter().enumerate().map(|(i, node)| {
        let node = node.clone();
        let proposal = proposal.clone();
        async move {
            node.init_dkg(proposal, i == 0, Duration::from_secs(30))
                .await
        }
    });
    let mut group = None;
    for result in futures::future::join_all(dkg_runs).await {
        group = Some(result?);
    }
    let group = group.ok_or("no nodes to simulate")?;
    println!("group key: {}", hex::encode(group.public_key()));
    println!("chain hash: {}", hex::encode(group.chain_hash()));

    let mut feed = nodes[0].beacons();
    let mut seen = 0u64;
    while seen < rounds {
        let beacon = feed.recv().await?;
        println!(
            "round {:>4}  randomness {}",
            beacon.round,
            hex::encode(beacon.randomness())
        );
        seen += 1;
    }

    for node in &nodes {
        node.shutdown().await?;
        transport.unregister(node.address()).await;
    }
    Ok(())
}
