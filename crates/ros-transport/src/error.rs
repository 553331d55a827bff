//! Error types for transport operations.

use crate::completion::AccessFlags;

/// Errors returned when posting work to a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection has been torn down.
    #[error("transport disconnected")]
    Disconnected,

    /// No registered region matches the key.
    #[error("unknown memory key {0:#x}")]
    UnknownKey(u32),

    /// The region exists but was not registered with the needed access.
    #[error("memory key {key:#x} lacks {needed:?} access")]
    AccessDenied {
        /// The offending key.
        key: u32,
        /// Access the operation required.
        needed: AccessFlags,
    },

    /// The requested range falls outside the registered region.
    #[error("range {addr:#x}+{len} outside registered region")]
    OutOfBounds {
        /// Start address of the access.
        addr: u64,
        /// Length of the access.
        len: usize,
    },

    /// Atomic operations need an 8-byte aligned target.
    #[error("atomic target {0:#x} is not 8-byte aligned")]
    Misaligned(u64),

    /// An inline send was larger than the transport allows.
    #[error("inline payload of {len} bytes exceeds limit of {max}")]
    InlineTooLarge {
        /// Payload length.
        len: usize,
        /// Configured inline limit.
        max: usize,
    },

    /// All receive slots are already posted.
    #[error("receive queue full ({0} buffers posted)")]
    ReceiveQueueFull(usize),

    /// Memory registration failed.
    #[error("memory registration failed: {0}")]
    Registration(String),
}
