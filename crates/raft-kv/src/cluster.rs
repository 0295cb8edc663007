//! # cluster
//!
//! why: exercise a whole cluster in one process, with faults injected between nodes
//! relations: owns the Network from transport.rs and one Node per member; hands out KvClients
//! what: Cluster harness (leader checks, disconnect/partition controls, put/get checks, log matching)

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use raft_core::LogEntry;
use tokio::time::{self, Instant};
use tracing::info;

use crate::client::KvClient;
use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::node::Node;
use crate::service::KvService;
use crate::transport::Network;

const LEADER_POLLS: usize = 8;
const LEADER_POLL_INTERVAL: Duration = Duration::from_millis(150);

/// Split ids `0..n` into the first `size` nodes and the rest.
pub fn partition_by_size(n: usize, size: usize) -> (Vec<u64>, Vec<u64>) {
    let ids: Vec<u64> = (0..n as u64).collect();
    let size = size.min(n);
    (ids[..size].to_vec(), ids[size..].to_vec())
}

/// `n` nodes with ids `0..n` on a shared simulated network.
pub struct Cluster {
    network: Network,
    nodes: Vec<Arc<Node>>,
    /// Whether each node is currently linked to its peers
    connected: Mutex<Vec<bool>>,
    config: ClusterConfig,
}

impl Cluster {
    /// Must be called from within a tokio runtime.
    pub fn new(n: usize) -> Result<Self> {
        Self::with_config(n, ClusterConfig::default())
    }

    pub fn with_config(n: usize, config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let network = Network::new(config.network.clone());
        let ids: Vec<u64> = (0..n as u64).collect();

        let mut nodes = Vec::with_capacity(n);
        for &id in &ids {
            let node = Node::start(id, ids.clone(), config.node.clone(), Arc::new(network.endpoint(id)))?;
            network.register(id, node.clone());
            nodes.push(node);
        }
        info!(nodes = n, "cluster started");

        Ok(Self {
            network,
            nodes,
            connected: Mutex::new(vec![true; n]),
            config,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn node(&self, id: u64) -> Result<&Arc<Node>> {
        self.nodes
            .get(id as usize)
            .ok_or_else(|| Error::Check(format!("no node with id {id}")))
    }

    fn is_connected(&self, id: u64) -> bool {
        self.connected.lock().get(id as usize).copied().unwrap_or(false)
    }

    /// Whether `id` has working links both ways with a majority, itself included.
    fn reaches_quorum(&self, id: u64) -> bool {
        let n = self.nodes.len() as u64;
        let reachable = (0..n)
            .filter(|&other| other == id || (self.network.is_linked(id, other) && self.network.is_linked(other, id)))
            .count();
        reachable > self.nodes.len() / 2
    }

    /// Wait for exactly one leader among connected nodes.
    ///
    /// Only leaders that can still reach a majority count, so a leader left
    /// behind on the minority side of a partition is ignored. Two counted
    /// leaders in the same term is a safety violation. Right after a heal a
    /// stale leader can briefly reach a majority again; then the newest term
    /// wins.
    pub async fn check_single_leader(&self) -> Result<(u64, u64)> {
        for _ in 0..LEADER_POLLS {
            let mut leaders: BTreeMap<u64, u64> = BTreeMap::new();
            for node in &self.nodes {
                if !self.is_connected(node.id()) || !self.reaches_quorum(node.id()) {
                    continue;
                }
                let report = node.report();
                if !report.is_leader() {
                    continue;
                }
                if let Some(other) = leaders.insert(report.term, report.id) {
                    return Err(Error::Check(format!(
                        "nodes {other} and {} both lead term {}",
                        report.id, report.term
                    )));
                }
            }
            if let Some((&term, &id)) = leaders.iter().next_back() {
                return Ok((id, term));
            }
            time::sleep(LEADER_POLL_INTERVAL).await;
        }
        Err(Error::Check("no leader elected".into()))
    }

    /// No connected node may think it leads.
    pub fn check_no_leader(&self) -> Result<()> {
        for node in &self.nodes {
            if self.is_connected(node.id()) && node.report().is_leader() {
                return Err(Error::Check(format!("node {} is leader, expected none", node.id())));
            }
        }
        Ok(())
    }

    pub fn disconnect_from_peers(&self, id: u64) {
        info!(node = id, "disconnecting from peers");
        self.network.isolate(id);
        if let Some(flag) = self.connected.lock().get_mut(id as usize) {
            *flag = false;
        }
    }

    pub fn reconnect_to_peers(&self, id: u64) {
        info!(node = id, "reconnecting to peers");
        self.network.restore(id);
        if let Some(flag) = self.connected.lock().get_mut(id as usize) {
            *flag = true;
        }
    }

    pub fn disconnect_clusters(&self, left: &[u64], right: &[u64]) {
        self.network.partition(left, right);
    }

    pub fn reconnect_clusters(&self, left: &[u64], right: &[u64]) {
        self.network.heal(left, right);
    }

    /// A client that knows every node.
    pub fn new_client(&self) -> KvClient {
        let services = self.nodes.iter().cloned().map(KvService::new).collect();
        KvClient::new(services, self.config.client.clone())
    }

    pub async fn check_put(&self, client: &KvClient, key: &str, value: &str) -> Result<(String, bool)> {
        client.put(key, value).await
    }

    /// Read `key` through the log and require `want`.
    pub async fn check_get(&self, client: &KvClient, key: &str, want: &str) -> Result<()> {
        let (value, found) = client.get(key).await?;
        if !found || value != want {
            return Err(Error::Check(format!(
                "get({key}) returned ({value:?}, {found}), want ({want:?}, true)"
            )));
        }
        Ok(())
    }

    /// Committed prefixes agree, and equal (index, term) means equal command.
    pub fn check_log_matching(&self) -> Result<()> {
        let logs: Vec<(u64, u64, Vec<LogEntry>)> = self
            .nodes
            .iter()
            .map(|n| (n.id(), n.commit_index(), n.log_entries()))
            .collect();

        for (i, (id_a, commit_a, log_a)) in logs.iter().enumerate() {
            for (id_b, commit_b, log_b) in &logs[i + 1..] {
                let committed = (*commit_a).min(*commit_b) as usize;
                for (a, b) in log_a.iter().zip(log_b.iter()) {
                    let same_slot = a.term == b.term;
                    if (a.index as usize <= committed && a != b) || (same_slot && a.command != b.command) {
                        return Err(Error::Check(format!(
                            "nodes {id_a} and {id_b} disagree at index {} (terms {} and {})",
                            a.index, a.term, b.term
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Wait until every node has applied the same state.
    pub async fn wait_for_convergence(&self, within: Duration) -> Result<()> {
        let deadline = Instant::now() + within;
        loop {
            let max_commit = self.nodes.iter().map(|n| n.commit_index()).max().unwrap_or(0);
            let applied_all = self.nodes.iter().all(|n| n.last_applied() >= max_commit);
            if applied_all {
                let mut snapshots = self.nodes.iter().map(|n| n.kv_snapshot());
                if let Some(first) = snapshots.next() {
                    if snapshots.all(|s| s == first) {
                        return Ok(());
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Check(format!("nodes did not converge on commit index {max_commit}")));
            }
            time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Stop `id` and start it again from its data directory.
    ///
    /// The old instance's queued writes land before the new one loads them.
    /// Clients created before the restart keep talking to the old instance.
    pub async fn restart(&mut self, id: u64) -> Result<()> {
        if self.config.node.data_dir.is_none() {
            return Err(Error::Config("restart needs node.data_dir for durable storage".into()));
        }
        let ids: Vec<u64> = (0..self.nodes.len() as u64).collect();
        let slot = self
            .nodes
            .get_mut(id as usize)
            .ok_or_else(|| Error::Check(format!("no node with id {id}")))?;

        slot.shutdown();
        slot.stopped().await;
        self.network.deregister(id);
        let node = Node::start(id, ids, self.config.node.clone(), Arc::new(self.network.endpoint(id)))?;
        self.network.register(id, node.clone());
        *slot = node;
        info!(node = id, "node restarted");
        Ok(())
    }

    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
            self.network.deregister(node.id());
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}
