//! # transport
//!
//! why: nodes only ever talk through rpc; tests need to cut and restore those rpcs at will
//! relations: node.rs sends through `Transport` and serves `RaftService`; cluster.rs drives `Network`
//! what: Transport and RaftService traits, in-process Network with a blocked-link table

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use raft_core::{AppendEntries, AppendEntriesResponse, RaftMessage, VoteRequest, VoteResponse};
use tracing::{debug, info, trace};

use crate::config::NetworkConfig;
use crate::error::{Error, Result};

/// Outbound side of the peer rpcs, as seen by one node.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request_vote(&self, to: u64, req: VoteRequest) -> Result<VoteResponse>;

    async fn append_entries(&self, to: u64, req: AppendEntries) -> Result<AppendEntriesResponse>;
}

/// Inbound side: what a node does with a peer rpc.
///
/// A reply resolves only once the state it reflects is on stable storage.
#[async_trait]
pub trait RaftService: Send + Sync + 'static {
    async fn handle_request_vote(&self, req: VoteRequest) -> Result<VoteResponse>;

    async fn handle_append_entries(&self, req: AppendEntries) -> Result<AppendEntriesResponse>;

    /// Dispatch a request envelope to the matching handler.
    async fn handle(&self, msg: RaftMessage) -> Result<RaftMessage> {
        match msg {
            RaftMessage::VoteRequest(req) => Ok(self.handle_request_vote(req).await?.into()),
            RaftMessage::AppendEntries(req) => Ok(self.handle_append_entries(req).await?.into()),
            other => Err(Error::UnexpectedMessage { kind: other.kind() }),
        }
    }
}

#[derive(Default)]
struct Links {
    /// Directed (from, to) pairs that currently refuse delivery.
    blocked: HashSet<(u64, u64)>,
}

struct Shared {
    config: NetworkConfig,
    services: RwLock<HashMap<u64, Arc<dyn RaftService>>>,
    links: RwLock<Links>,
}

/// In-process network connecting every registered node.
///
/// Link state is consulted when an rpc is issued; calls already in flight
/// are not affected by later changes.
#[derive(Clone)]
pub struct Network {
    shared: Arc<Shared>,
}

impl Network {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                services: RwLock::new(HashMap::new()),
                links: RwLock::new(Links::default()),
            }),
        }
    }

    pub fn register(&self, id: u64, service: Arc<dyn RaftService>) {
        self.shared.services.write().insert(id, service);
    }

    pub fn deregister(&self, id: u64) {
        self.shared.services.write().remove(&id);
    }

    /// The transport capability handed to node `from`.
    pub fn endpoint(&self, from: u64) -> NetworkEndpoint {
        NetworkEndpoint { from, network: self.clone() }
    }

    fn members(&self) -> Vec<u64> {
        self.shared.services.read().keys().copied().collect()
    }

    /// Block both directions between `a` and `b`.
    pub fn disconnect(&self, a: u64, b: u64) {
        let mut links = self.shared.links.write();
        links.blocked.insert((a, b));
        links.blocked.insert((b, a));
    }

    pub fn connect(&self, a: u64, b: u64) {
        let mut links = self.shared.links.write();
        links.blocked.remove(&(a, b));
        links.blocked.remove(&(b, a));
    }

    /// Cut `id` off from every other member.
    pub fn isolate(&self, id: u64) {
        info!(node = id, "isolating node");
        for other in self.members().into_iter().filter(|&o| o != id) {
            self.disconnect(id, other);
        }
    }

    pub fn restore(&self, id: u64) {
        info!(node = id, "restoring node");
        self.shared.links.write().blocked.retain(|&(from, to)| from != id && to != id);
    }

    /// Block every link crossing between the two groups.
    pub fn partition(&self, left: &[u64], right: &[u64]) {
        info!(?left, ?right, "partitioning");
        for &a in left {
            for &b in right {
                self.disconnect(a, b);
            }
        }
    }

    pub fn heal(&self, left: &[u64], right: &[u64]) {
        info!(?left, ?right, "healing partition");
        for &a in left {
            for &b in right {
                self.connect(a, b);
            }
        }
    }

    /// True when `from` may currently send to `to`.
    pub fn is_linked(&self, from: u64, to: u64) -> bool {
        !self.shared.links.read().blocked.contains(&(from, to))
    }

    fn latency(&self) -> Duration {
        let max = self.shared.config.max_latency_ms;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max))
    }

    fn dropped(&self) -> bool {
        let rate = self.shared.config.drop_rate;
        rate > 0.0 && rand::random::<f64>() < rate
    }

    /// Carry one request to `to` and its reply back.
    ///
    /// A lost message never resolves; callers bound every rpc with a timeout.
    async fn deliver(&self, from: u64, to: u64, msg: RaftMessage) -> Result<RaftMessage> {
        if !self.is_linked(from, to) {
            return Err(Error::Unreachable { from, to });
        }
        let service = self
            .shared
            .services
            .read()
            .get(&to)
            .cloned()
            .ok_or(Error::Unreachable { from, to })?;

        let kind = msg.kind();
        if self.dropped() {
            debug!(from, to, kind, "request lost");
            return std::future::pending().await;
        }
        tokio::time::sleep(self.latency()).await;
        trace!(from, to, kind, term = msg.term(), "delivering");

        let reply = service.handle(msg).await?;

        if self.dropped() {
            debug!(from, to, kind, "reply lost");
            return std::future::pending().await;
        }
        tokio::time::sleep(self.latency()).await;
        Ok(reply)
    }
}

/// One node's handle on the [`Network`].
#[derive(Clone)]
pub struct NetworkEndpoint {
    from: u64,
    network: Network,
}

#[async_trait]
impl Transport for NetworkEndpoint {
    async fn request_vote(&self, to: u64, req: VoteRequest) -> Result<VoteResponse> {
        match self.network.deliver(self.from, to, req.into()).await? {
            RaftMessage::VoteResponse(resp) => Ok(resp),
            other => Err(Error::UnexpectedMessage { kind: other.kind() }),
        }
    }

    async fn append_entries(&self, to: u64, req: AppendEntries) -> Result<AppendEntriesResponse> {
        match self.network.deliver(self.from, to, req.into()).await? {
            RaftMessage::AppendEntriesResponse(resp) => Ok(resp),
            other => Err(Error::UnexpectedMessage { kind: other.kind() }),
        }
    }
}
