//! # QuorumSQL
//!
//! A replicated SQL database server:
//! - Writes ordered through a consensus log, acknowledged only after commit
//! - Deterministic page-level apply (WAL frames), identical on every replica
//! - Snapshot capture/install for catching up lagging or new nodes
//! - TCP-based binary client protocol
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TCP Server                              │
//! │                  (Multiple Clients)                          │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                 Connection Gateway                           │
//! │          (strict request → response per client)              │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                 Leadership Router                            │
//! │        (leader-only writes, barrier/local reads)             │
//! └──────────┬──────────────────────────────┬───────────────────┘
//!            │ writes                       │ reads
//!            ▼                              ▼
//!   ┌─────────────────┐            ┌─────────────────┐
//!   │  Consensus Log  │── commit ─▶│  Database Image │
//!   │    (append)     │            │  (apply engine) │
//!   └─────────────────┘            └─────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod protocol;
pub mod engine;
pub mod consensus;
pub mod db;
pub mod router;
pub mod network;
pub mod node;
pub mod client;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Error, Result};
pub use config::Config;
pub use node::Node;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of QuorumSQL
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire protocol version negotiated during the handshake
pub const PROTOCOL_VERSION: u64 = 1;
