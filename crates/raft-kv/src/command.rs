//! # command
//!
//! why: define what goes into a log entry's payload and what comes back out of the store
//! relations: encoded by service.rs, decoded and applied by store.rs
//! what: KvCommand (session-tagged op), KvOp, KvResult

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvOp {
    Put { key: String, value: String },
    Get { key: String },
}

/// A client operation tagged with its session, so retries can be recognised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvCommand {
    pub client_id: u64,
    pub request_id: u64,
    pub op: KvOp,
}

impl KvCommand {
    pub fn put(client_id: u64, request_id: u64, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            client_id,
            request_id,
            op: KvOp::Put { key: key.into(), value: value.into() },
        }
    }

    pub fn get(client_id: u64, request_id: u64, key: impl Into<String>) -> Self {
        Self {
            client_id,
            request_id,
            op: KvOp::Get { key: key.into() },
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Put: the previous value. Get: the current value. `("", false)` when absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvResult {
    pub value: String,
    pub found: bool,
}

impl KvResult {
    pub fn from_option(value: Option<String>) -> Self {
        match value {
            Some(value) => Self { value, found: true },
            None => Self::default(),
        }
    }

    pub fn into_pair(self) -> (String, bool) {
        (self.value, self.found)
    }
}
