//! Network Module
//!
//! TCP server and per-connection gateway.

mod server;
mod connection;

pub use server::Server;
pub use connection::Connection;
