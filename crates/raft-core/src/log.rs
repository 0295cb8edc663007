//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: owned by node.rs, persisted via raft-storage
//! what: LogEntry, Log (entries + commit index), durability bookkeeping

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// The command to be applied to the state machine (empty for a leader no-op)
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: u64, index: u64, command: Vec<u8>) -> Self {
        Self { term, index, command }
    }

    /// True for the empty entry a leader appends when it takes office
    pub fn is_noop(&self) -> bool {
        self.command.is_empty()
    }
}

/// The state that must hit stable storage before a node answers an RPC
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<u64>,
    pub commit_index: u64,
}

/// Log changes not yet flushed to storage.
///
/// Apply `truncate_from` first (drop that index and everything after it),
/// then append `entries`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogDelta {
    pub truncate_from: Option<u64>,
    pub entries: Vec<LogEntry>,
}

impl LogDelta {
    pub fn is_empty(&self) -> bool {
        self.truncate_from.is_none() && self.entries.is_empty()
    }
}

/// Ordered sequence of entries plus the highest index known committed.
#[derive(Debug, Clone, Default)]
pub struct Log {
    entries: Vec<LogEntry>,
    commit_index: u64,
    /// Highest index already handed to storage.
    stable_index: u64,
    /// Lowest index truncated below `stable_index` since the last flush.
    truncated_from: Option<u64>,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from what storage returned after a restart.
    pub fn restore(entries: Vec<LogEntry>, commit_index: u64) -> Self {
        let last = entries.last().map_or(0, |e| e.index);
        Self {
            entries,
            commit_index: commit_index.min(last),
            stable_index: last,
            truncated_from: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map_or(0, |e| e.term)
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term of the entry at `index`, 0 when there is none.
    pub fn term_at(&self, index: u64) -> u64 {
        self.get(index).map_or(0, |e| e.term)
    }

    /// All entries from `index` (inclusive) to the end.
    pub fn entries_from(&self, index: u64) -> Vec<LogEntry> {
        let start = index.max(1) as usize - 1;
        self.entries.get(start..).map(<[LogEntry]>::to_vec).unwrap_or_default()
    }

    /// Entries in `(after, through]`.
    pub fn entries_between(&self, after: u64, through: u64) -> Vec<LogEntry> {
        let through = through.min(self.last_index());
        if through <= after {
            return Vec::new();
        }
        self.entries[after as usize..through as usize].to_vec()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Consistency check for AppendEntries. Index 0 always matches.
    pub fn matches(&self, prev_index: u64, prev_term: u64) -> bool {
        prev_index == 0 || (prev_index <= self.last_index() && self.term_at(prev_index) == prev_term)
    }

    /// First index holding the same term as `index`.
    pub fn first_index_of_term(&self, index: u64) -> u64 {
        let term = self.term_at(index);
        let mut first = index;
        while first > 1 && self.term_at(first - 1) == term {
            first -= 1;
        }
        first
    }

    /// Leader-side append of a new command in `term`.
    pub fn append(&mut self, term: u64, command: Vec<u8>) -> LogEntry {
        let entry = LogEntry::new(term, self.last_index() + 1, command);
        self.entries.push(entry.clone());
        entry
    }

    /// Follower-side merge of entries received from the leader.
    ///
    /// Entries already present with a matching term are skipped; the first
    /// conflicting entry truncates the local suffix.
    pub fn splice(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        let conflict = entries
            .iter()
            .find(|e| e.index <= self.last_index() && self.term_at(e.index) != e.term)
            .map(|e| e.index);
        if let Some(index) = conflict {
            if index <= self.commit_index {
                return Err(RaftError::CommittedConflict { index });
            }
            self.truncate_from(index);
        }

        for entry in entries {
            if entry.index <= self.last_index() {
                continue;
            }
            debug_assert_eq!(entry.index, self.last_index() + 1, "gap in spliced entries");
            self.entries.push(entry);
        }
        Ok(())
    }

    fn truncate_from(&mut self, index: u64) {
        self.entries.truncate((index - 1) as usize);
        if index <= self.stable_index {
            self.stable_index = index - 1;
            self.truncated_from = Some(self.truncated_from.map_or(index, |t| t.min(index)));
        }
    }

    /// Advance the commit index, never backwards and never past the log.
    /// Returns true if it moved.
    pub fn commit_to(&mut self, index: u64) -> bool {
        let target = index.min(self.last_index());
        if target > self.commit_index {
            self.commit_index = target;
            true
        } else {
            false
        }
    }

    /// Drain the changes storage has not seen yet.
    pub fn take_unstable(&mut self) -> LogDelta {
        let delta = LogDelta {
            truncate_from: self.truncated_from.take(),
            entries: self.entries[self.stable_index as usize..].to_vec(),
        };
        self.stable_index = self.last_index();
        delta
    }
}
