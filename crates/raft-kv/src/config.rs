//! # config
//!
//! why: collect every knob of a node, the simulated network and the client in one serde tree
//! relations: consumed by node.rs, transport.rs, client.rs and cluster.rs
//! what: NodeConfig, NetworkConfig, ClientConfig, ClusterConfig (loadable from json)

use std::path::{Path, PathBuf};
use std::time::Duration;

use raft_core::RaftConfig;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Per-node runtime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub raft: RaftConfig,
    /// Bound on a single outbound RPC
    pub rpc_timeout_ms: u64,
    /// Directory for `FileStorage`; each node uses `<data_dir>/node-<id>`.
    /// `None` keeps state in memory.
    pub data_dir: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            raft: RaftConfig::default(),
            rpc_timeout_ms: 100,
            data_dir: None,
        }
    }
}

impl NodeConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.raft.heartbeat_interval)
    }

    pub fn validate(&self) -> Result<()> {
        self.raft.validate()?;
        if self.rpc_timeout_ms == 0 {
            return Err(Error::Config("rpc_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Behaviour of the in-process network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Each message is delayed by a random amount in `[0, max_latency_ms]`
    pub max_latency_ms: u64,
    /// Probability that a request or its reply is lost
    pub drop_rate: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_latency_ms: 5,
            drop_rate: 0.0,
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.drop_rate) {
            return Err(Error::Config(format!("drop_rate {} outside [0, 1)", self.drop_rate)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Bound on one attempt against one node
    pub attempt_timeout_ms: u64,
    /// Bound on the whole call, across retries
    pub deadline_ms: u64,
    /// Pause after a full sweep of the cluster failed
    pub retry_backoff_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 500,
            deadline_ms: 15_000,
            retry_backoff_ms: 20,
        }
    }
}

impl ClientConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Everything needed to stand up a simulated cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub client: ClientConfig,
}

impl ClusterConfig {
    /// Load from a json file; missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.node.validate()?;
        self.network.validate()
    }
}
