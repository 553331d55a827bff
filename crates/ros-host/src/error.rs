//! Error types for host operations.

use ros_transport::TransportError;
use ros_types::Uid;

/// Errors raised by the object pool and the agent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    /// The uid is already allocated.
    #[error("object {0} already exists")]
    Exists(Uid),

    /// No free slot is left in the pool.
    #[error("object pool exhausted ({capacity} slots)")]
    Exhausted {
        /// Pool capacity.
        capacity: usize,
    },

    /// The uid is not allocated.
    #[error("unknown object {0}")]
    UnknownObject(Uid),

    /// Accessing registered memory failed.
    #[error("memory error: {0}")]
    Memory(#[from] TransportError),
}
