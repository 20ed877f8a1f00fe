//! Configuration for QuorumSQL
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

/// Main configuration for a QuorumSQL node
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Node Identity
    // -------------------------------------------------------------------------
    /// Numeric node id, unique within the cluster roster
    pub node_id: u64,

    /// Address other nodes and redirected clients should use to reach this
    /// node (reported in `NotLeader` responses when this node leads)
    pub advertise_addr: String,

    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files.
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── logs/            (per-database consensus log files)
    ///     └── snapshots/       (snapshot files written on demand)
    pub data_dir: PathBuf,

    // -------------------------------------------------------------------------
    // Network Configuration
    // -------------------------------------------------------------------------
    /// TCP listen address
    pub listen_addr: String,

    /// Max concurrent client connections
    pub max_connections: usize,

    /// Connection read timeout (milliseconds); 0 disables
    pub read_timeout_ms: u64,

    /// Connection write timeout (milliseconds); 0 disables
    pub write_timeout_ms: u64,

    /// Largest frame accepted or produced on the wire (bytes); row batches
    /// are flushed before crossing this bound
    pub max_frame_size: usize,

    // -------------------------------------------------------------------------
    // Replication Configuration
    // -------------------------------------------------------------------------
    /// How long a write waits for its log entry to commit before failing
    /// with `Timeout` (milliseconds)
    pub commit_timeout_ms: u64,

    /// How long a linearizable read waits for the barrier index to be
    /// applied locally (milliseconds)
    pub barrier_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: 1,
            advertise_addr: "127.0.0.1:7450".to_string(),
            data_dir: PathBuf::from("./quorumsql_data"),
            listen_addr: "127.0.0.1:7450".to_string(),
            max_connections: 1024,
            read_timeout_ms: 0,
            write_timeout_ms: 5000,
            max_frame_size: 1024 * 1024,
            commit_timeout_ms: 10_000,
            barrier_timeout_ms: 10_000,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the node id
    pub fn node_id(mut self, id: u64) -> Self {
        self.config.node_id = id;
        self
    }

    /// Set the advertised address
    pub fn advertise_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.advertise_addr = addr.into();
        self
    }

    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the TCP listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Set the maximum number of concurrent connections
    pub fn max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Set the read timeout (in milliseconds)
    pub fn read_timeout_ms(mut self, ms: u64) -> Self {
        self.config.read_timeout_ms = ms;
        self
    }

    /// Set the write timeout (in milliseconds)
    pub fn write_timeout_ms(mut self, ms: u64) -> Self {
        self.config.write_timeout_ms = ms;
        self
    }

    /// Set the maximum frame size (in bytes)
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.config.max_frame_size = bytes;
        self
    }

    /// Set the commit wait timeout (in milliseconds)
    pub fn commit_timeout_ms(mut self, ms: u64) -> Self {
        self.config.commit_timeout_ms = ms;
        self
    }

    /// Set the barrier wait timeout (in milliseconds)
    pub fn barrier_timeout_ms(mut self, ms: u64) -> Self {
        self.config.barrier_timeout_ms = ms;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
