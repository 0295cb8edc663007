//! # error
//!
//! why: one error type for everything a client, node or harness call can hit
//! relations: wraps raft-core and raft-storage errors
//! what: Error enum, Result alias, retry classification

use raft_core::RaftError;
use raft_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The contacted node cannot accept client requests.
    #[error("node is not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<u64> },

    /// Another entry was committed at the index the request was appended to.
    #[error("leadership lost before index {index} committed")]
    LeadershipLost { index: u64 },

    #[error("node is shut down")]
    Shutdown,

    /// The simulated network refused delivery on this directed link.
    #[error("node {to} is unreachable from node {from}")]
    Unreachable { from: u64, to: u64 },

    #[error("rpc to node {to} timed out")]
    RpcTimeout { to: u64 },

    /// A client gave up after exhausting its deadline.
    #[error("request timed out")]
    Timeout,

    /// A peer answered with the wrong kind of message.
    #[error("unexpected {kind} message")]
    UnexpectedMessage { kind: &'static str },

    /// A cluster-wide safety or liveness check did not hold.
    #[error("cluster check failed: {0}")]
    Check(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The node's storage writer hit an error and stopped accepting writes.
    #[error("storage writer failed; node no longer persists state")]
    StorageFailed,

    #[error(transparent)]
    Raft(RaftError),

    #[error("command codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Failures a client should answer by trying again, possibly elsewhere.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotLeader { .. }
                | Error::LeadershipLost { .. }
                | Error::Unreachable { .. }
                | Error::RpcTimeout { .. }
                | Error::Shutdown
                | Error::StorageFailed
        )
    }
}

impl From<RaftError> for Error {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::NotLeader { leader_hint } => Error::NotLeader { leader_hint },
            other => Error::Raft(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
