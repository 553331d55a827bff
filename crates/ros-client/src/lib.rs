//! Client side of the remote object store.
//!
//! - [`Connection`]: one connection to a host: request ids, the two
//!   correlation tables and their drainer tasks, RPCs and one-sided
//!   remote-memory operations.
//! - [`CorrelationTable`] / [`PendingOp`]: matching completions back to the
//!   request that is waiting for them.
//! - [`Registry`]: routes a uid to the connection of its owning host.
//! - [`RemoteLock`]: the four lock protocols.
//! - [`RemoteObject`]: a cached, written-back-on-drop copy of a remote
//!   object.

mod config;
mod connection;
mod correlator;
mod error;
pub mod lock;
mod object;
mod registry;

#[cfg(test)]
mod tests;

pub use config::ClientConfig;
pub use connection::{Connection, PeerAnnounce};
pub use correlator::{
    CorrelationTable, Direction, PendingOp, Tables, UNTRACKED_WR_ID, drain_completions,
};
pub use error::ClientError;
pub use lock::{
    AcceleratedLock, AtomicLock, LockKind, PollLock, QueueLock, RemoteLock, new_lock,
};
pub use object::RemoteObject;
pub use registry::Registry;
