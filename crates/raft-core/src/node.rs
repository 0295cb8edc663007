//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entry management
//! what: NodeState enum, RaftConfig, RaftNode with election and replication handlers
//!
//! The node never performs I/O. Every handler takes a message, mutates the
//! owned state and returns the reply plus a flag telling the caller whether
//! the election timer must be reset. Timers, networking and persistence live
//! in the runtime that drives it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{RaftError, Result};
use crate::log::{HardState, Log, LogEntry};
use crate::message::{AppendEntries, AppendEntriesResponse, VoteRequest, VoteResponse};

/// The possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
    /// Terminal state after shutdown
    Dead,
}

/// Timing parameters, all in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout
    pub election_timeout_min: u64,
    /// Upper bound (exclusive) of the randomized election timeout
    pub election_timeout_max: u64,
    /// Period between leader heartbeats
    pub heartbeat_interval: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
        }
    }
}

impl RaftConfig {
    /// Heartbeats must fire well inside the shortest election timeout.
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(RaftError::InvalidConfig(format!(
                "election_timeout_min ({}) must be below election_timeout_max ({})",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat_interval ({}) must be positive and below election_timeout_min ({})",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        Ok(())
    }
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: u64,
    /// Every member of the cluster, this node included
    pub cluster_nodes: Vec<u64>,
    /// Current state (Follower, Candidate, Leader or Dead)
    pub state: NodeState,
    /// Current term number
    pub current_term: u64,
    /// Node ID that received our vote in current term (if any)
    pub voted_for: Option<u64>,
    /// Leader of the current term, once known
    pub leader_id: Option<u64>,
    /// Replicated log and commit index
    pub log: Log,
    /// Apply cursor: highest index handed to the state machine
    pub last_applied: u64,
    /// Distinct voters that granted us their vote this term
    pub votes_received: Vec<u64>,
    /// Leader only: next index to send to each peer
    pub next_index: HashMap<u64, u64>,
    /// Leader only: highest index known replicated on each peer
    pub match_index: HashMap<u64, u64>,
    /// Highest local index known to be on stable storage. `None` when the
    /// embedder does not report durability; the whole log then counts.
    pub durable_index: Option<u64>,
    pub config: RaftConfig,
}

impl RaftNode {
    /// Create a new Raft node in Follower state
    pub fn new(id: u64, cluster_nodes: Vec<u64>) -> Self {
        Self::with_config(id, cluster_nodes, RaftConfig::default())
    }

    pub fn with_config(id: u64, cluster_nodes: Vec<u64>, config: RaftConfig) -> Self {
        Self {
            id,
            cluster_nodes,
            state: NodeState::Follower,
            current_term: 0,
            voted_for: None,
            leader_id: None,
            log: Log::new(),
            last_applied: 0,
            votes_received: Vec::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            durable_index: None,
            config,
        }
    }

    /// Rebuild a node from persisted state. The apply cursor starts at zero so
    /// the state machine is rebuilt by replaying the committed prefix.
    pub fn restore(
        id: u64,
        cluster_nodes: Vec<u64>,
        config: RaftConfig,
        hard_state: HardState,
        entries: Vec<LogEntry>,
    ) -> Self {
        let mut node = Self::with_config(id, cluster_nodes, config);
        node.current_term = hard_state.term;
        node.voted_for = hard_state.voted_for;
        node.log = Log::restore(entries, hard_state.commit_index);
        node.durable_index = Some(node.last_log_index());
        node
    }

    /// Cluster members other than this node
    pub fn peers(&self) -> impl Iterator<Item = u64> + '_ {
        self.cluster_nodes.iter().copied().filter(move |&n| n != self.id)
    }

    /// Strict majority of the configured cluster
    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    pub fn role(&self) -> NodeState {
        self.state
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    pub fn hard_state(&self) -> HardState {
        HardState {
            term: self.current_term,
            voted_for: self.voted_for,
            commit_index: self.log.commit_index(),
        }
    }

    pub fn commit_index(&self) -> u64 {
        self.log.commit_index()
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        self.log.get(index)
    }

    pub fn get_term_at(&self, index: u64) -> u64 {
        self.log.term_at(index)
    }

    // -- role transitions --

    /// Election timeout fired: become a candidate for the next term.
    pub fn start_election(&mut self) -> VoteRequest {
        debug_assert_ne!(self.state, NodeState::Dead, "dead nodes do not campaign");
        self.state = NodeState::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.leader_id = None;
        self.votes_received = vec![self.id];
        info!(node = self.id, term = self.current_term, "starting election");

        let request = VoteRequest {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };
        if self.has_quorum() {
            self.become_leader();
        }
        request
    }

    /// Revert to follower. A higher term also forgets the vote.
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            debug!(node = self.id, from = self.current_term, to = term, "adopting higher term");
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
        }
        if self.state != NodeState::Follower {
            info!(node = self.id, term = self.current_term, was = ?self.state, "becoming follower");
        }
        self.state = NodeState::Follower;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
    }

    /// Won the election. Peers are assumed to be caught up until they say
    /// otherwise, and a no-op for the new term lets earlier entries commit.
    pub fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();

        let next = self.last_log_index() + 1;
        let peers: Vec<u64> = self.peers().collect();
        self.next_index = peers.iter().map(|&p| (p, next)).collect();
        self.match_index = peers.iter().map(|&p| (p, 0)).collect();
        info!(node = self.id, term = self.current_term, "became leader");

        self.log.append(self.current_term, Vec::new());
        self.advance_commit_index();
    }

    pub fn shutdown(&mut self) {
        self.state = NodeState::Dead;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
    }

    // -- election rpcs --

    /// Returns the reply and whether the election timer should be reset.
    pub fn handle_vote_request(&mut self, req: &VoteRequest) -> (VoteResponse, bool) {
        if req.term > self.current_term {
            self.become_follower(req.term);
        }
        if req.term < self.current_term {
            return (VoteResponse { term: self.current_term, vote_granted: false }, false);
        }

        let free_to_vote = self.voted_for.map_or(true, |v| v == req.candidate_id);
        let log_ok = (req.last_log_term, req.last_log_index) >= (self.last_log_term(), self.last_log_index());
        let granted = free_to_vote && log_ok;
        if granted {
            self.voted_for = Some(req.candidate_id);
        }
        debug!(
            node = self.id,
            term = self.current_term,
            candidate = req.candidate_id,
            granted,
            "vote request"
        );
        (VoteResponse { term: self.current_term, vote_granted: granted }, granted)
    }

    /// Returns true if this response made us leader.
    pub fn handle_vote_response(&mut self, from: u64, resp: &VoteResponse) -> bool {
        if resp.term > self.current_term {
            self.become_follower(resp.term);
            return false;
        }
        if self.state != NodeState::Candidate || resp.term != self.current_term {
            return false;
        }
        if resp.vote_granted && !self.votes_received.contains(&from) {
            self.votes_received.push(from);
        }
        if self.has_quorum() {
            self.become_leader();
            return true;
        }
        false
    }

    // -- replication --

    /// Leader-side append of a client command.
    pub fn propose(&mut self, command: Vec<u8>) -> Result<LogEntry> {
        if self.state != NodeState::Leader {
            return Err(RaftError::NotLeader { leader_hint: self.leader_id });
        }
        let entry = self.log.append(self.current_term, command);
        self.advance_commit_index();
        Ok(entry)
    }

    /// The next AppendEntries for `peer`: everything from its next index,
    /// or a heartbeat when it is caught up. `None` unless leader.
    pub fn append_entries_for(&self, peer: u64) -> Option<AppendEntries> {
        if self.state != NodeState::Leader {
            return None;
        }
        let next = self.next_index.get(&peer).copied().unwrap_or(self.last_log_index() + 1).max(1);
        let prev_log_index = next - 1;
        Some(AppendEntries {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index),
            entries: self.log.entries_from(next),
            leader_commit: self.log.commit_index(),
        })
    }

    /// True while the leader still has entries `peer` has not been sent.
    pub fn has_pending_for(&self, peer: u64) -> bool {
        self.state == NodeState::Leader
            && self.next_index.get(&peer).is_some_and(|&next| next <= self.last_log_index())
    }

    /// Returns the reply and whether the election timer should be reset.
    pub fn handle_append_entries(&mut self, req: &AppendEntries) -> (AppendEntriesResponse, bool) {
        if req.term < self.current_term {
            return (self.reject_append(0), false);
        }
        if req.term > self.current_term || self.state != NodeState::Follower {
            self.become_follower(req.term);
        }
        self.leader_id = Some(req.leader_id);

        if !self.log.matches(req.prev_log_index, req.prev_log_term) {
            let conflict_index = if req.prev_log_index > self.last_log_index() {
                self.last_log_index() + 1
            } else {
                self.log.first_index_of_term(req.prev_log_index)
            };
            debug!(
                node = self.id,
                prev_index = req.prev_log_index,
                prev_term = req.prev_log_term,
                conflict_index,
                "log mismatch"
            );
            return (self.reject_append(conflict_index), true);
        }

        if let Err(err) = self.log.splice(req.entries.clone()) {
            warn!(node = self.id, error = %err, "rejecting append");
            let conflict_index = self.log.commit_index() + 1;
            return (self.reject_append(conflict_index), true);
        }

        let last_new = req.prev_log_index + req.entries.len() as u64;
        if req.leader_commit > self.log.commit_index() && self.log.commit_to(req.leader_commit.min(last_new)) {
            debug!(node = self.id, commit = self.log.commit_index(), "follower commit advanced");
        }

        let resp = AppendEntriesResponse {
            term: self.current_term,
            success: true,
            match_index: last_new,
            conflict_index: 0,
        };
        (resp, true)
    }

    fn reject_append(&self, conflict_index: u64) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success: false,
            match_index: 0,
            conflict_index,
        }
    }

    /// Returns true if the commit index advanced.
    pub fn handle_append_entries_response(&mut self, from: u64, resp: &AppendEntriesResponse) -> bool {
        if resp.term > self.current_term {
            self.become_follower(resp.term);
            return false;
        }
        if self.state != NodeState::Leader || resp.term < self.current_term {
            return false;
        }

        let matched = self.match_index.get(&from).copied().unwrap_or(0);
        let next = self.next_index.get(&from).copied().unwrap_or(self.last_log_index() + 1);

        if resp.success {
            let matched = matched.max(resp.match_index.min(self.last_log_index()));
            self.match_index.insert(from, matched);
            self.next_index.insert(from, next.max(matched + 1));
            self.advance_commit_index()
        } else {
            let backoff = next.saturating_sub(1).min(resp.conflict_index).max(matched + 1).max(1);
            self.next_index.insert(from, backoff);
            false
        }
    }

    /// Storage reports everything up to `index` written. Returns whether the
    /// commit index advanced, since the leader's own copy now counts.
    pub fn mark_durable(&mut self, index: u64) -> bool {
        self.durable_index = Some(index.min(self.last_log_index()));
        self.advance_commit_index()
    }

    /// Local entries from `index` on were replaced and are no longer durable.
    pub fn forget_durable_from(&mut self, index: u64) {
        if let Some(durable) = self.durable_index {
            self.durable_index = Some(durable.min(index.saturating_sub(1)));
        }
    }

    fn self_stores(&self, index: u64) -> bool {
        self.durable_index.map_or(true, |durable| durable >= index)
    }

    /// Commit the highest current-term index stored on a quorum.
    /// Entries from earlier terms only commit underneath one of these.
    fn advance_commit_index(&mut self) -> bool {
        if self.state != NodeState::Leader {
            return false;
        }
        let quorum = self.quorum_size();
        let mut n = self.last_log_index();
        while n > self.log.commit_index() {
            if self.log.term_at(n) != self.current_term {
                break;
            }
            let replicas = usize::from(self.self_stores(n)) + self.match_index.values().filter(|&&m| m >= n).count();
            if replicas >= quorum {
                let advanced = self.log.commit_to(n);
                if advanced {
                    debug!(node = self.id, term = self.current_term, commit = n, "leader commit advanced");
                }
                return advanced;
            }
            n -= 1;
        }
        false
    }

    /// Committed entries not yet handed to the state machine, in index order.
    pub fn take_committed(&mut self) -> Vec<LogEntry> {
        let entries = self.log.entries_between(self.last_applied, self.log.commit_index());
        if let Some(last) = entries.last() {
            self.last_applied = last.index;
        }
        entries
    }
}
