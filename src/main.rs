//! Demo driver: starts a four-node pool, registers a client and submits one
//! request, first with every node honest and then with `Beta` answering
//! clients with corrupted results.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bft_pool::client::{Client, ConsensusStatus};
use bft_pool::config::PoolConfig;
use bft_pool::consensus::faulty_reply;
use bft_pool::network::{LocalNetwork, NetworkError, Node, NodeHandle};
use bft_pool::{Error, Result};

const NODES: [&str; 4] = ["Alpha", "Beta", "Gamma", "Delta"];
const CLIENT_ID: &str = "my_client_id";

#[derive(Parser, Debug)]
#[command(name = "bft-pool")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run the nodes over TCP on localhost instead of in memory
    #[arg(long)]
    tcp: bool,

    /// Pool configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for persisted keys and ordering logs
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// How long the client waits for matching replies
    #[arg(long, default_value_t = 10_000)]
    deadline_ms: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("bft_pool={}", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), tcp = args.tcp, "starting pool demo");

    if let Err(err) = run(&args).await {
        tracing::error!(error = %err, "demo failed");
        std::process::exit(1);
    }
}

async fn run(args: &Args) -> Result<()> {
    let scenarios = [
        ("honest", None, json!({"life_answer": 42}), 9700),
        ("faulty_beta", Some("Beta"), json!({"type": "sell", "amount": 101}), 9800),
    ];
    for (scenario, faulty, payload, base_port) in scenarios {
        let mut config = match &args.config {
            Some(path) => PoolConfig::load(path)?,
            None if args.tcp => localhost_config(base_port),
            None => PoolConfig::with_names(NODES),
        };
        if let Some(dir) = &args.data_dir {
            config.data_dir = Some(dir.join(scenario));
        }
        run_scenario(scenario, config, faulty, payload, args).await?;
    }
    Ok(())
}

fn localhost_config(base_port: u16) -> PoolConfig {
    let mut config = PoolConfig::with_names(NODES);
    for (i, name) in config.names().into_iter().enumerate() {
        let offset = 2 * i as u16;
        config
            .node_reg
            .insert(name.clone(), SocketAddr::from(([127, 0, 0, 1], base_port + offset)));
        config
            .client_reg
            .insert(name, SocketAddr::from(([127, 0, 0, 1], base_port + offset + 1)));
    }
    config
}

async fn run_scenario(
    scenario: &str,
    config: PoolConfig,
    faulty: Option<&str>,
    payload: Value,
    args: &Args,
) -> Result<()> {
    tracing::info!(scenario, faulty = ?faulty, "running scenario");
    let network = LocalNetwork::new();

    let mut handles = Vec::new();
    for name in config.names() {
        let mut node = Node::new(name.as_str(), config.clone())?;
        if faulty == Some(name.as_str()) {
            node = node.with_behavior(faulty_reply());
        }
        let handle = if args.tcp {
            node.spawn_tcp().await?
        } else {
            node.spawn_local(&network)?
        };
        handles.push(handle);
    }

    for handle in &handles {
        handle.start_key_sharing()?;
    }
    let bootstrap_timeout = config.protocol.bootstrap_timeout();
    for handle in &handles {
        wait_ready(handle, bootstrap_timeout).await?;
    }

    let mut client_config = config.client_config();
    client_config.reply_deadline_ms = args.deadline_ms;
    let mut client = if args.tcp {
        Client::tcp(CLIENT_ID, &client_config)
    } else {
        Client::local(CLIENT_ID, &client_config, &network)
    };
    for handle in &handles {
        handle.add_client(client.identifier(), client.verification_key())?;
        client.add_node_key(handle.name(), handle.verification_key());
    }

    let request = client.submit(payload).await?;
    match client.get_reply(request.req_id).await? {
        ConsensusStatus::ReachedConsensus(result) => {
            tracing::info!(scenario, req_id = request.req_id, %result, "consensus reached");
        }
        status => {
            tracing::warn!(scenario, req_id = request.req_id, ?status, "no consensus");
        }
    }
    client.show_reply_details(request.req_id);

    for handle in handles {
        handle.shutdown().await?;
    }
    Ok(())
}

async fn wait_ready(handle: &NodeHandle, limit: Duration) -> Result<()> {
    match tokio::time::timeout(limit, handle.wait_ready()).await {
        Ok(status) => {
            let status = status?;
            tracing::info!(node = handle.name(), primary = %status.primary, "node ready");
            Ok(())
        }
        Err(_) => Err(Error::Network(NetworkError::Unavailable(format!(
            "{} did not finish key sharing",
            handle.name()
        )))),
    }
}
