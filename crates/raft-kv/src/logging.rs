//! # logging
//!
//! why: every node, replicator and harness step logs through tracing; something has to print it
//! relations: called by cluster tests and by binaries embedding the crate
//! what: init() installing an env-filtered fmt subscriber

use tracing_subscriber::{fmt, EnvFilter};

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).with_test_writer().try_init();
}
