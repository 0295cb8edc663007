//! # client
//!
//! why: callers should not have to find the leader or survive leader changes themselves
//! relations: sends through service.rs on every node, configured by config.rs
//! what: KvClient with leader tracking, per-attempt timeouts and session-tagged retries

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::time::{self, Instant};
use tracing::debug;

use crate::command::KvOp;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::service::KvService;

pub struct KvClient {
    client_id: u64,
    next_request: AtomicU64,
    services: Vec<KvService>,
    /// Position in `services` of the last node that answered
    leader: Mutex<usize>,
    config: ClientConfig,
}

impl KvClient {
    pub fn new(services: Vec<KvService>, config: ClientConfig) -> Self {
        Self {
            client_id: rand::random(),
            next_request: AtomicU64::new(1),
            services,
            leader: Mutex::new(0),
            config,
        }
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Store `value` under `key`; returns the previous value and whether it existed.
    pub async fn put(&self, key: &str, value: &str) -> Result<(String, bool)> {
        self.call(KvOp::Put { key: key.to_owned(), value: value.to_owned() }).await
    }

    pub async fn get(&self, key: &str) -> Result<(String, bool)> {
        self.call(KvOp::Get { key: key.to_owned() }).await
    }

    /// Try nodes until one applies the request or the deadline passes.
    ///
    /// Every attempt reuses the same request id, so a put that committed
    /// on a leader we then lost contact with is not applied twice.
    async fn call(&self, op: KvOp) -> Result<(String, bool)> {
        if self.services.is_empty() {
            return Err(Error::Config("client has no nodes to talk to".into()));
        }
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + self.config.deadline();
        let mut target = *self.leader.lock();
        let mut attempts = 0usize;

        loop {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            let service = &self.services[target];
            let attempt = time::timeout(self.config.attempt_timeout(), self.attempt(service, request_id, &op)).await;

            let hint = match attempt {
                Ok(Ok(result)) => {
                    *self.leader.lock() = target;
                    return Ok(result);
                }
                Ok(Err(Error::NotLeader { leader_hint })) => leader_hint,
                Ok(Err(err)) if err.is_retryable() => {
                    debug!(client = self.client_id, node = service.node().id(), error = %err, "retrying");
                    None
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    debug!(client = self.client_id, node = service.node().id(), "attempt timed out");
                    None
                }
            };

            target = hint
                .and_then(|id| self.position_of(id))
                .filter(|&pos| pos != target)
                .unwrap_or((target + 1) % self.services.len());

            attempts += 1;
            if attempts % self.services.len() == 0 {
                time::sleep(self.config.retry_backoff()).await;
            }
        }
    }

    async fn attempt(&self, service: &KvService, request_id: u64, op: &KvOp) -> Result<(String, bool)> {
        match op {
            KvOp::Put { key, value } => service.put(self.client_id, request_id, key, value).await,
            KvOp::Get { key } => service.get(self.client_id, request_id, key).await,
        }
    }

    fn position_of(&self, node_id: u64) -> Option<usize> {
        self.services.iter().position(|s| s.node().id() == node_id)
    }
}
