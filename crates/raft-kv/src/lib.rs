//! # raft-kv
//!
//! why: turn the sans-io consensus core into a running replicated key-value store
//! relations: drives raft-core's RaftNode, persists through raft-storage
//! what: kv state machine, async node runtime, client service, simulated network, client, cluster harness

pub mod client;
pub mod cluster;
pub mod command;
pub mod config;
pub mod error;
pub mod logging;
pub mod node;
pub mod service;
pub mod store;
pub mod transport;

pub use client::KvClient;
pub use cluster::{partition_by_size, Cluster};
pub use command::{KvCommand, KvOp, KvResult};
pub use config::{ClientConfig, ClusterConfig, NetworkConfig, NodeConfig};
pub use error::{Error, Result};
pub use node::{Node, NodeReport};
pub use service::KvService;
pub use store::KvStore;
pub use transport::{Network, NetworkEndpoint, RaftService, Transport};
