//! QuorumSQL Server Binary
//!
//! Starts a QuorumSQL node with the bundled single-node consensus.

use std::sync::Arc;

use clap::Parser;
use quorumsql::consensus::LocalConsensus;
use quorumsql::network::Server;
use quorumsql::{Config, Node};
use tracing_subscriber::{fmt, EnvFilter};

/// QuorumSQL Server
#[derive(Parser, Debug)]
#[command(name = "quorumsql-server")]
#[command(about = "Replicated SQL database server")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./quorumsql_data")]
    data_dir: String,

    /// Listen address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:7450")]
    listen: String,

    /// Address advertised to peers and redirected clients; defaults to the
    /// listen address
    #[arg(short = 'a', long)]
    advertise: Option<String>,

    /// Numeric node id
    #[arg(short, long, default_value = "1")]
    node_id: u64,

    /// Maximum concurrent connections
    #[arg(short, long, default_value = "1024")]
    max_connections: usize,

    /// Commit wait timeout in milliseconds
    #[arg(long, default_value = "10000")]
    commit_timeout_ms: u64,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,quorumsql=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    let advertise = args.advertise.clone().unwrap_or_else(|| args.listen.clone());

    tracing::info!("QuorumSQL Server v{}", quorumsql::VERSION);
    tracing::info!("Data directory: {}", args.data_dir);
    tracing::info!("Listen address: {}", args.listen);

    // Build config from args
    let config = Config::builder()
        .node_id(args.node_id)
        .data_dir(&args.data_dir)
        .listen_addr(&args.listen)
        .advertise_addr(&advertise)
        .max_connections(args.max_connections)
        .commit_timeout_ms(args.commit_timeout_ms)
        .build();

    // Open the bundled consensus; recovery replays the durable logs
    let consensus = match LocalConsensus::open(&config.data_dir, &config.advertise_addr) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            tracing::error!("failed to open consensus logs: {e}");
            std::process::exit(1);
        }
    };

    // Attaching the node rebuilds every database image from the logs
    let node = Node::new(config.clone(), consensus);
    tracing::info!("node initialized");

    let mut server = Server::new(config, node);
    if let Err(e) = server.run() {
        tracing::error!("server error: {e}");
        std::process::exit(1);
    }

    tracing::info!("server stopped");
}
