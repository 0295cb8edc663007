//! # store
//!
//! why: the deterministic state machine every node advances with committed entries
//! relations: fed by node.rs's apply loop, results handed back to waiting clients
//! what: KvStore with per-client sessions for exactly-once puts

use std::collections::{BTreeMap, HashMap};

use raft_core::LogEntry;
use tracing::debug;

use crate::command::{KvCommand, KvOp, KvResult};
use crate::error::Result;

/// Applied puts remembered per client. Older ids are forgotten once a
/// client has this many newer ones on record.
const SESSION_WINDOW: usize = 256;

/// Recent puts applied for one client, keyed by request id.
#[derive(Debug, Clone, Default)]
struct Session {
    applied: BTreeMap<u64, KvResult>,
}

impl Session {
    fn record(&mut self, request_id: u64, result: KvResult) {
        self.applied.insert(request_id, result);
        while self.applied.len() > SESSION_WINDOW {
            self.applied.pop_first();
        }
    }
}

#[derive(Debug, Default)]
pub struct KvStore {
    data: BTreeMap<String, String>,
    sessions: HashMap<u64, Session>,
    last_applied: u64,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one command.
    ///
    /// A put whose exact (client, request) pair was already applied is
    /// answered from the session without touching the map. Requests from one
    /// client may commit in any order.
    pub fn apply(&mut self, cmd: &KvCommand) -> KvResult {
        match &cmd.op {
            KvOp::Get { key } => KvResult::from_option(self.data.get(key).cloned()),
            KvOp::Put { key, value } => {
                let session = self.sessions.entry(cmd.client_id).or_default();
                if let Some(cached) = session.applied.get(&cmd.request_id) {
                    debug!(client = cmd.client_id, request = cmd.request_id, "duplicate put");
                    return cached.clone();
                }
                let result = KvResult::from_option(self.data.insert(key.clone(), value.clone()));
                session.record(cmd.request_id, result.clone());
                result
            }
        }
    }

    /// Apply the next committed log entry. No-ops yield `None`.
    pub fn apply_entry(&mut self, entry: &LogEntry) -> Result<Option<KvResult>> {
        debug_assert_eq!(entry.index, self.last_applied + 1, "entries must be applied in order");
        self.last_applied = entry.index;
        if entry.is_noop() {
            return Ok(None);
        }
        let cmd = KvCommand::decode(&entry.command)?;
        Ok(Some(self.apply(&cmd)))
    }

    pub fn get_local(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.clone()
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
