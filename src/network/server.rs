//! TCP Server
//!
//! Accepts connections and hands each one to a worker thread running the
//! connection gateway.

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::error::Result;
use crate::node::Node;

/// How long the accept loop sleeps between polls when idle
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// TCP server for a QuorumSQL node
pub struct Server {
    config: Config,
    node: Arc<Node>,
    listener: Option<TcpListener>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Create a new server for the given node
    pub fn new(config: Config, node: Arc<Node>) -> Self {
        Self {
            config,
            node,
            listener: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that, once set, makes `run` return after the current poll
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Bind the listen address, returning the bound address (useful when
    /// the configured port is 0)
    pub fn bind(&mut self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.config.listen_addr)?;
        // Non-blocking accepts so the shutdown flag is honored promptly
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        self.listener = Some(listener);
        Ok(addr)
    }

    /// Start the server (blocking until shutdown)
    pub fn run(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind()?;
        }
        let listener = self.listener.as_ref().expect("listener bound above");
        tracing::info!("listening on {}", listener.local_addr()?);

        let active = Arc::new(AtomicUsize::new(0));

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            match listener.accept() {
                Ok((stream, addr)) => {
                    if active.load(Ordering::Relaxed) >= self.config.max_connections {
                        tracing::warn!("connection limit reached, rejecting {addr}");
                        drop(stream);
                        continue;
                    }

                    // Accepted sockets must block; only the listener polls
                    stream.set_nonblocking(false)?;

                    active.fetch_add(1, Ordering::Relaxed);
                    let node = Arc::clone(&self.node);
                    let active = Arc::clone(&active);
                    thread::Builder::new()
                        .name(format!("conn-{addr}"))
                        .spawn(move || {
                            if let Err(e) = node.handle_connection(stream) {
                                tracing::warn!("connection {addr} ended with error: {e}");
                            }
                            active.fetch_sub(1, Ordering::Relaxed);
                        })?;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::info!("server stopped");
        Ok(())
    }
}
