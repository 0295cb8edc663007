//! # node
//!
//! why: give the sans-io RaftNode timers, peers, durable storage and a state machine
//! relations: wraps raft-core's RaftNode, persists via raft-storage, talks through transport.rs
//! what: Node (election timer, per-peer replicators, storage writer, apply loop, rpc handlers, submit)
//!
//! All consensus state lives behind one mutex and no i/o happens while it is
//! held. Each step queues its log delta and hard state for a blocking storage
//! writer, in the order the steps happened. Rpc replies, vote requests and
//! client results wait until the writer reports that write stable, and the
//! leader only counts its own copy of an entry once it is on disk.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use raft_core::{
    AppendEntries, AppendEntriesResponse, HardState, LogDelta, LogEntry, NodeState, RaftConfig, RaftNode,
    VoteRequest, VoteResponse,
};
use raft_storage::{FileStorage, InMemoryStorage, Storage};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::command::{KvCommand, KvResult};
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::store::KvStore;
use crate::transport::{RaftService, Transport};

/// Role and term as seen from outside the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeReport {
    pub id: u64,
    pub term: u64,
    pub role: NodeState,
}

impl NodeReport {
    pub fn is_leader(&self) -> bool {
        self.role == NodeState::Leader
    }
}

/// A client request waiting for its entry to be applied.
struct Pending {
    term: u64,
    tx: oneshot::Sender<Result<KvResult>>,
}

/// Values compared before and after each step to decide what to wake.
#[derive(Clone, Copy)]
struct Mark {
    role: NodeState,
    commit: u64,
    last_index: u64,
}

/// One write for the storage writer, numbered in queue order.
struct PersistJob {
    seq: u64,
    delta: LogDelta,
    hard: Option<HardState>,
    /// Last log index once this job is written
    last_index: u64,
}

/// What the storage writer has made stable so far.
#[derive(Debug, Clone, Copy, Default)]
struct Durability {
    seq: u64,
    last_index: u64,
    failed: bool,
}

struct Inner {
    raft: RaftNode,
    /// Queue to the storage writer; dropped on shutdown
    writer: Option<mpsc::UnboundedSender<PersistJob>>,
    /// Sequence number of the last queued write
    queued: u64,
    /// Sequence number of the last write that truncated the log
    truncated_at: u64,
    /// Last hard state queued for storage
    persisted: HardState,
    /// Bumped on every election timer reset
    election_epoch: u64,
    election_deadline: Instant,
    pending: HashMap<u64, Pending>,
}

impl Inner {
    fn mark(&self) -> Mark {
        Mark {
            role: self.raft.role(),
            commit: self.raft.commit_index(),
            last_index: self.raft.last_log_index(),
        }
    }

    fn is_dead(&self) -> bool {
        self.raft.role() == NodeState::Dead
    }

    fn reset_election_timer(&mut self) {
        self.election_epoch += 1;
        self.election_deadline = Instant::now() + election_timeout(&self.raft.config);
    }

    /// Queue log changes and a moved hard state for the writer.
    ///
    /// Returns the sequence number that covers everything queued so far.
    fn persist(&mut self) -> Result<u64> {
        let delta = self.raft.log.take_unstable();
        let hard = self.raft.hard_state();
        let hard_moved = hard != self.persisted;
        if delta.is_empty() && !hard_moved {
            return Ok(self.queued);
        }
        let writer = self.writer.as_ref().ok_or(Error::Shutdown)?;

        let seq = self.queued + 1;
        if let Some(from) = delta.truncate_from {
            self.raft.forget_durable_from(from);
            self.truncated_at = seq;
        }
        let job = PersistJob {
            seq,
            delta,
            hard: hard_moved.then_some(hard),
            last_index: self.raft.last_log_index(),
        };
        writer.send(job).map_err(|_| Error::Shutdown)?;
        self.queued = seq;
        self.persisted = hard;
        Ok(seq)
    }

    /// Feed writer progress back into the consensus state.
    fn record_durable(&mut self, progress: Durability) {
        // a later write replaced part of what this one covered
        if progress.seq < self.truncated_at {
            return;
        }
        self.raft.mark_durable(progress.last_index);
    }

    fn fail_pending(&mut self, err: impl Fn() -> Error) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.tx.send(Err(err()));
        }
    }
}

fn election_timeout(config: &RaftConfig) -> Duration {
    let ms = rand::rng().random_range(config.election_timeout_min..config.election_timeout_max);
    Duration::from_millis(ms)
}

/// Bound a peer rpc. An elapsed limit becomes [`Error::RpcTimeout`].
async fn with_rpc_timeout<T>(peer: u64, limit: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    time::timeout(limit, call).await.map_err(|_| Error::RpcTimeout { to: peer })?
}

/// Drain persist jobs in order on a blocking thread.
///
/// Stops at the first failure; nothing after it is written.
fn run_storage_writer(
    id: u64,
    mut storage: Box<dyn Storage>,
    mut jobs: mpsc::UnboundedReceiver<PersistJob>,
    durable: watch::Sender<Durability>,
) {
    while let Some(job) = jobs.blocking_recv() {
        if let Err(err) = write_job(storage.as_mut(), &job) {
            error!(node = id, seq = job.seq, error = %err, "failed to persist raft state");
            durable.send_modify(|progress| progress.failed = true);
            return;
        }
        durable.send_replace(Durability { seq: job.seq, last_index: job.last_index, failed: false });
    }
    debug!(node = id, "storage writer drained");
}

fn write_job(storage: &mut dyn Storage, job: &PersistJob) -> raft_storage::Result<()> {
    // entries first: a stored commit index never points past the stored log
    if !job.delta.is_empty() {
        storage.apply_delta(&job.delta)?;
    }
    if let Some(hard) = &job.hard {
        storage.save_hard_state(hard)?;
    }
    Ok(())
}

/// One cluster member: consensus state, storage and state machine.
pub struct Node {
    id: u64,
    peers: Vec<u64>,
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    inner: Mutex<Inner>,
    store: Mutex<KvStore>,
    replicate: HashMap<u64, Notify>,
    apply: Notify,
    durable: watch::Receiver<Durability>,
    storage_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Node {
    /// Start a node with the storage its config asks for.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(id: u64, cluster: Vec<u64>, config: NodeConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        let storage: Box<dyn Storage> = match &config.data_dir {
            Some(dir) => Box::new(FileStorage::new(dir.join(format!("node-{id}")))?),
            None => Box::new(InMemoryStorage::new()),
        };
        Self::start_with_storage(id, cluster, config, transport, storage)
    }

    /// Start a node on top of existing storage, replaying whatever it holds.
    pub fn start_with_storage(
        id: u64,
        cluster: Vec<u64>,
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        storage: Box<dyn Storage>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let hard = storage.load_hard_state()?;
        let entries = storage.load_log()?;
        if hard.term > 0 || !entries.is_empty() {
            info!(node = id, term = hard.term, entries = entries.len(), commit = hard.commit_index, "restored state");
        }

        let raft = RaftNode::restore(id, cluster, config.raft, hard, entries);
        let peers: Vec<u64> = raft.peers().collect();
        let (shutdown_tx, _) = watch::channel(false);
        let (writer, jobs) = mpsc::unbounded_channel();
        let (durable_tx, durable) = watch::channel(Durability::default());
        let storage_task = tokio::task::spawn_blocking(move || run_storage_writer(id, storage, jobs, durable_tx));

        let mut inner = Inner {
            raft,
            writer: Some(writer),
            queued: 0,
            truncated_at: 0,
            persisted: hard,
            election_epoch: 0,
            election_deadline: Instant::now(),
            pending: HashMap::new(),
        };
        inner.reset_election_timer();

        let node = Arc::new(Self {
            id,
            replicate: peers.iter().map(|&p| (p, Notify::new())).collect(),
            peers,
            config,
            transport,
            inner: Mutex::new(inner),
            store: Mutex::new(KvStore::new()),
            apply: Notify::new(),
            durable,
            storage_task: Mutex::new(Some(storage_task)),
            shutdown_tx,
        });

        tokio::spawn(node.clone().run_election_timer(node.shutdown_tx.subscribe()));
        for &peer in &node.peers {
            tokio::spawn(node.clone().run_replicator(peer, node.shutdown_tx.subscribe()));
        }
        tokio::spawn(node.clone().run_durability_watch(node.durable.clone(), node.shutdown_tx.subscribe()));
        tokio::spawn(node.clone().run_apply_loop(node.shutdown_tx.subscribe()));
        // replay the committed prefix of a restored log
        node.apply.notify_one();

        debug!(node = id, peers = ?node.peers, "node started");
        Ok(node)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn report(&self) -> NodeReport {
        let inner = self.inner.lock();
        NodeReport {
            id: self.id,
            term: inner.raft.current_term,
            role: inner.raft.role(),
        }
    }

    pub fn leader_hint(&self) -> Option<u64> {
        self.inner.lock().raft.leader_id
    }

    pub fn commit_index(&self) -> u64 {
        self.inner.lock().raft.commit_index()
    }

    /// Copy of the whole log.
    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.inner.lock().raft.log.iter().cloned().collect()
    }

    pub fn last_applied(&self) -> u64 {
        self.store.lock().last_applied()
    }

    pub fn get_local(&self, key: &str) -> Option<String> {
        self.store.lock().get_local(key).map(str::to_owned)
    }

    pub fn kv_snapshot(&self) -> BTreeMap<String, String> {
        self.store.lock().snapshot()
    }

    pub fn is_dead(&self) -> bool {
        self.inner.lock().is_dead()
    }

    /// Stop all tasks. Waiting requests fail with `Shutdown`.
    ///
    /// Writes already queued still reach storage; see [`Node::stopped`].
    pub fn shutdown(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.is_dead() {
                return;
            }
            inner.raft.shutdown();
            inner.writer = None;
            inner.fail_pending(|| Error::Shutdown);
        }
        self.shutdown_tx.send_replace(true);
        info!(node = self.id, "node shut down");
    }

    /// Resolves once a shut down node's storage writer has drained its queue.
    pub async fn stopped(&self) {
        let task = self.storage_task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(node = self.id, error = %err, "storage writer panicked");
            }
        }
    }

    /// Append a command and wait until it is applied.
    ///
    /// Only the leader accepts commands. The result is the one computed by
    /// the state machine when the entry was applied.
    pub async fn submit(&self, cmd: KvCommand) -> Result<KvResult> {
        let command = cmd.encode()?;
        let rx = {
            let mut inner = self.inner.lock();
            if inner.is_dead() {
                return Err(Error::Shutdown);
            }
            let mark = inner.mark();
            let entry = inner.raft.propose(command)?;
            self.after_step(&mut inner, mark)?;

            let (tx, rx) = oneshot::channel();
            inner.pending.insert(entry.index, Pending { term: entry.term, tx });
            debug!(node = self.id, index = entry.index, term = entry.term, client = cmd.client_id, "proposed");
            rx
        };
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Queue the step for storage, then wake whoever it gave work to.
    ///
    /// Returns the write sequence number callers wait on before letting
    /// anything that depends on this step leave the node.
    fn after_step(&self, inner: &mut Inner, before: Mark) -> Result<u64> {
        let seq = inner.persist()?;
        let now = inner.mark();

        if before.role == NodeState::Leader && now.role != NodeState::Leader {
            let leader_hint = inner.raft.leader_id;
            inner.fail_pending(|| Error::NotLeader { leader_hint });
        }
        if now.commit > before.commit {
            self.apply.notify_one();
        }
        if now.role == NodeState::Leader
            && (before.role != NodeState::Leader || now.last_index > before.last_index || now.commit > before.commit)
        {
            for notify in self.replicate.values() {
                notify.notify_one();
            }
        }
        Ok(seq)
    }

    /// Wait until storage holds write `seq` and everything queued before it.
    async fn wait_durable(&self, seq: u64) -> Result<()> {
        let mut durable = self.durable.clone();
        let progress = durable
            .wait_for(|progress| progress.failed || progress.seq >= seq)
            .await
            .map(|progress| *progress)
            .map_err(|_| Error::Shutdown)?;
        if progress.seq >= seq {
            Ok(())
        } else {
            Err(Error::StorageFailed)
        }
    }

    // -- durability --

    async fn run_durability_watch(
        self: Arc<Self>,
        mut durable: watch::Receiver<Durability>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = durable.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = shutdown.changed() => return,
            }
            let progress = *durable.borrow_and_update();
            if progress.failed {
                error!(node = self.id, "storage writer failed, stopping node");
                self.shutdown();
                return;
            }

            let mut inner = self.inner.lock();
            if inner.is_dead() {
                return;
            }
            let mark = inner.mark();
            inner.record_durable(progress);
            let _ = self.after_step(&mut inner, mark);
        }
    }

    // -- election --

    async fn run_election_timer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let (epoch, deadline) = {
                let inner = self.inner.lock();
                if inner.is_dead() {
                    return;
                }
                (inner.election_epoch, inner.election_deadline)
            };

            tokio::select! {
                _ = time::sleep_until(deadline) => {}
                _ = shutdown.changed() => return,
            }

            let (request, seq) = {
                let mut inner = self.inner.lock();
                if inner.is_dead() {
                    return;
                }
                if inner.election_epoch != epoch {
                    // reset while we slept
                    continue;
                }
                inner.reset_election_timer();
                if inner.raft.is_leader() {
                    continue;
                }
                let mark = inner.mark();
                let request = inner.raft.start_election();
                match self.after_step(&mut inner, mark) {
                    Ok(seq) => (request, seq),
                    Err(_) => continue,
                }
            };

            // the new term and self-vote must survive a crash before anyone sees them
            if let Err(err) = self.wait_durable(seq).await {
                debug!(node = self.id, error = %err, "election abandoned");
                continue;
            }
            for &peer in &self.peers {
                tokio::spawn(self.clone().request_vote(peer, request.clone()));
            }
        }
    }

    async fn request_vote(self: Arc<Self>, peer: u64, request: VoteRequest) {
        let reply = with_rpc_timeout(peer, self.config.rpc_timeout(), self.transport.request_vote(peer, request)).await;
        let resp = match reply {
            Ok(resp) => resp,
            Err(err) => {
                debug!(node = self.id, peer, error = %err, "vote request failed");
                return;
            }
        };

        let mut inner = self.inner.lock();
        if inner.is_dead() {
            return;
        }
        let mark = inner.mark();
        inner.raft.handle_vote_response(peer, &resp);
        let _ = self.after_step(&mut inner, mark);
    }

    // -- replication --

    async fn run_replicator(self: Arc<Self>, peer: u64, mut shutdown: watch::Receiver<bool>) {
        let Some(notify) = self.replicate.get(&peer) else {
            return;
        };
        let mut heartbeat = time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {}
                _ = notify.notified() => {}
                _ = shutdown.changed() => return,
            }
            self.replicate_to(peer).await;
        }
    }

    /// Send AppendEntries to `peer` until it has nothing left to catch up on.
    async fn replicate_to(&self, peer: u64) {
        loop {
            let request = {
                let inner = self.inner.lock();
                match inner.raft.append_entries_for(peer) {
                    Some(request) => request,
                    None => return,
                }
            };

            let reply = with_rpc_timeout(peer, self.config.rpc_timeout(), self.transport.append_entries(peer, request)).await;
            let resp = match reply {
                Ok(resp) => resp,
                Err(err) => {
                    debug!(node = self.id, peer, error = %err, "append entries failed");
                    return;
                }
            };

            let mut inner = self.inner.lock();
            if inner.is_dead() {
                return;
            }
            let mark = inner.mark();
            inner.raft.handle_append_entries_response(peer, &resp);
            if self.after_step(&mut inner, mark).is_err() {
                return;
            }
            let mismatch = !resp.success && resp.term == inner.raft.current_term;
            if !inner.raft.is_leader() || !(mismatch || inner.raft.has_pending_for(peer)) {
                return;
            }
        }
    }

    // -- apply --

    async fn run_apply_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = self.apply.notified() => {}
                _ = shutdown.changed() => return,
            }

            let (entries, seq) = {
                let mut inner = self.inner.lock();
                if inner.is_dead() {
                    return;
                }
                (inner.raft.take_committed(), inner.queued)
            };
            if entries.is_empty() {
                continue;
            }
            // a follower may learn of a commit before its own copy is on disk
            if self.wait_durable(seq).await.is_err() {
                return;
            }

            for entry in entries {
                let applied = self.store.lock().apply_entry(&entry);
                let result = match applied {
                    Ok(Some(result)) => Ok(result),
                    Ok(None) => Err(Error::LeadershipLost { index: entry.index }),
                    Err(err) => {
                        warn!(node = self.id, index = entry.index, error = %err, "undecodable entry");
                        Err(err)
                    }
                };

                let waiting = self.inner.lock().pending.remove(&entry.index);
                if let Some(pending) = waiting {
                    let outcome = if pending.term == entry.term {
                        result
                    } else {
                        Err(Error::LeadershipLost { index: entry.index })
                    };
                    let _ = pending.tx.send(outcome);
                }
            }
        }
    }
}

#[async_trait]
impl RaftService for Node {
    async fn handle_request_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        let (resp, seq) = {
            let mut inner = self.inner.lock();
            if inner.is_dead() {
                return Err(Error::Shutdown);
            }
            let mark = inner.mark();
            let (resp, reset) = inner.raft.handle_vote_request(&req);
            if reset {
                inner.reset_election_timer();
            }
            (resp, self.after_step(&mut inner, mark)?)
        };
        self.wait_durable(seq).await?;
        Ok(resp)
    }

    async fn handle_append_entries(&self, req: AppendEntries) -> Result<AppendEntriesResponse> {
        let (resp, seq) = {
            let mut inner = self.inner.lock();
            if inner.is_dead() {
                return Err(Error::Shutdown);
            }
            let mark = inner.mark();
            let (resp, reset) = inner.raft.handle_append_entries(&req);
            if reset {
                inner.reset_election_timer();
            }
            (resp, self.after_step(&mut inner, mark)?)
        };
        self.wait_durable(seq).await?;
        Ok(resp)
    }
}
