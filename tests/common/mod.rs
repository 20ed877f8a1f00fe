//! Shared test fixtures
//!
//! Spins up a full node (consensus + TCP server) on an ephemeral port and
//! hands out connected clients.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use quorumsql::client::Client;
use quorumsql::config::ConfigBuilder;
use quorumsql::consensus::{Consensus, LocalConsensus};
use quorumsql::network::Server;
use quorumsql::{Config, Node};

/// A running QuorumSQL node bound to an ephemeral port
pub struct TestServer {
    pub addr: SocketAddr,
    pub node: Arc<Node>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    _data_dir: tempfile::TempDir,
}

impl TestServer {
    /// Start a single-node server with the bundled consensus and a fresh
    /// data directory
    pub fn start() -> Self {
        Self::start_with(|builder| builder)
    }

    /// Start with config overrides applied on top of the test defaults
    pub fn start_with(tweak: impl FnOnce(ConfigBuilder) -> ConfigBuilder) -> Self {
        Self::build(tweak, None)
    }

    /// Start on top of a caller-supplied consensus implementation
    pub fn start_with_consensus(consensus: Arc<dyn Consensus>) -> Self {
        Self::build(|builder| builder, Some(consensus))
    }

    fn build(
        tweak: impl FnOnce(ConfigBuilder) -> ConfigBuilder,
        consensus: Option<Arc<dyn Consensus>>,
    ) -> Self {
        let data_dir = tempfile::tempdir().expect("create temp dir");

        let builder = Config::builder()
            .data_dir(data_dir.path())
            .listen_addr("127.0.0.1:0")
            .commit_timeout_ms(5_000)
            .barrier_timeout_ms(5_000);
        let config = tweak(builder).build();

        let consensus = consensus.unwrap_or_else(|| {
            Arc::new(
                LocalConsensus::open(&config.data_dir, &config.advertise_addr)
                    .expect("open consensus"),
            )
        });
        let node = Node::new(config.clone(), consensus);

        let mut server = Server::new(config, Arc::clone(&node));
        let addr = server.bind().expect("bind listener");
        let shutdown = server.shutdown_handle();

        let handle = std::thread::spawn(move || {
            server.run().expect("server run");
        });

        Self {
            addr,
            node,
            shutdown,
            handle: Some(handle),
            _data_dir: data_dir,
        }
    }

    /// Connect a client and complete the handshake
    pub fn client(&self) -> Client {
        let mut client = Client::connect(self.addr).expect("connect");
        client.handshake().expect("handshake");
        client
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
