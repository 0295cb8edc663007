//! # error
//!
//! why: name the few ways the consensus core can refuse an operation
//! relations: returned by node.rs and log.rs, wrapped by raft-kv's error type
//! what: RaftError enum and Result alias

use thiserror::Error;

/// Errors surfaced by the consensus core.
///
/// Stale terms and log mismatches are not errors here: they are ordinary
/// negative RPC responses handled inside the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RaftError {
    /// A client command reached a node that is not the leader.
    #[error("node is not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<u64> },

    /// A leader asked this node to overwrite an entry it already committed.
    #[error("refusing to overwrite committed entry at index {index}")]
    CommittedConflict { index: u64 },

    /// The configured timing parameters cannot work together.
    #[error("invalid raft config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, RaftError>;
