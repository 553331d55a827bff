//! Logging setup for the rosd daemon.
//!
//! Human-readable logs on stdout, filtered by `RUST_LOG` when set and by the
//! `[log] level` of the config otherwise.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Call once, before any event is emitted.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
