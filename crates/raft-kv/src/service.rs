//! # service
//!
//! why: clients speak put/get with (client id, request id), not raw log entries
//! relations: wraps one node.rs Node; client.rs holds one KvService per node
//! what: KvService turning Put/Get calls into submitted KvCommands

use std::sync::Arc;

use tracing::debug;

use crate::command::KvCommand;
use crate::error::Result;
use crate::node::Node;

/// What a client talks to on one node.
///
/// Both operations go through the log, so a read is answered only by a
/// leader that has applied everything committed before it.
#[derive(Clone)]
pub struct KvService {
    node: Arc<Node>,
}

impl KvService {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Returns the previous value and whether the key existed.
    pub async fn put(&self, client_id: u64, request_id: u64, key: &str, value: &str) -> Result<(String, bool)> {
        debug!(node = self.node.id(), client = client_id, request = request_id, key, "put");
        let result = self.node.submit(KvCommand::put(client_id, request_id, key, value)).await?;
        Ok(result.into_pair())
    }

    /// Returns the current value and whether the key exists.
    pub async fn get(&self, client_id: u64, request_id: u64, key: &str) -> Result<(String, bool)> {
        debug!(node = self.node.id(), client = client_id, request = request_id, key, "get");
        let result = self.node.submit(KvCommand::get(client_id, request_id, key)).await?;
        Ok(result.into_pair())
    }
}
