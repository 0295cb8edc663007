//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: driven by raft-kv's node runtime, persisted via raft-storage
//! what: state machine, election logic, log management, message types

pub mod error;
pub mod log;
pub mod message;
pub mod node;

pub use error::{RaftError, Result};
pub use log::{HardState, Log, LogDelta, LogEntry};
pub use message::{AppendEntries, AppendEntriesResponse, RaftMessage, VoteRequest, VoteResponse};
pub use node::{NodeState, RaftConfig, RaftNode};
