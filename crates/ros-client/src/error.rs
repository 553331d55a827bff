//! Error types for client operations.

use ros_transport::{TransportError, WorkOpcode};
use ros_types::{HostId, RequestId, Uid};
use ros_wire::{Opcode, WireError};

/// Errors surfaced by connections, locks and object handles.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Posting work to the transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A work request completed with an error status.
    #[error("{opcode:?} work request failed: {reason}")]
    WorkFailed {
        /// Kind of work request.
        opcode: WorkOpcode,
        /// Transport-provided reason.
        reason: String,
    },

    /// The connection was torn down before the operation completed.
    #[error("connection closed")]
    ConnectionClosed,

    /// A response could not be decoded.
    #[error("protocol violation: {0}")]
    Protocol(#[from] WireError),

    /// A response carried the wrong opcode for the request.
    #[error("unexpected response: expected {expected:?}, got {got:?}")]
    UnexpectedResponse {
        /// Opcode the request expects in return.
        expected: Opcode,
        /// Opcode actually received.
        got: Opcode,
    },

    /// A lock response named a different lock than the request.
    #[error("lock response for {got:#x}, expected {expected:#x}")]
    LockMismatch {
        /// Lock id sent.
        expected: u64,
        /// Lock id received.
        got: u64,
    },

    /// A completion payload had the wrong shape.
    #[error("malformed completion: {0}")]
    Malformed(String),

    /// The operation does not exist for this lock variant.
    #[error("{operation} is not supported by the {variant} lock")]
    Unsupported {
        /// Operation attempted.
        operation: &'static str,
        /// Lock variant.
        variant: &'static str,
    },

    /// No connection is registered for the host.
    #[error("no connection to host {0}")]
    UnknownHost(HostId),

    /// The connection has not received its peer's announce yet.
    #[error("peer has not announced itself")]
    NotAnnounced,

    /// Every request slot of the connection is in use.
    #[error("too many requests in flight ({in_flight})")]
    RequestIdsExhausted {
        /// Requests currently outstanding.
        in_flight: usize,
    },

    /// A request id is still live in the correlation table.
    #[error("request id {0} already in flight")]
    RequestIdInUse(RequestId),

    /// The request was not answered in time.
    #[error("request {0} timed out")]
    Timeout(RequestId),

    /// A byte range does not fit the object.
    #[error("range {lo}..{hi} outside object of {size} bytes")]
    RangeOutOfBounds {
        /// Start of the range.
        lo: usize,
        /// End of the range (exclusive).
        hi: usize,
        /// Object size.
        size: usize,
    },

    /// A handle asked for more bytes than one pool slot holds.
    #[error("object {uid} handle of {size} bytes exceeds the object size {object_size}")]
    ObjectTooLarge {
        /// Object requested.
        uid: Uid,
        /// Size asked for.
        size: usize,
        /// Size of every object on the connection.
        object_size: usize,
    },

    /// The owning host does not know the object.
    #[error("object {0} not found")]
    ObjectNotFound(Uid),

    /// The owning host refused an allocation.
    #[error("allocation of {uid} failed with status {status}")]
    AllocFailed {
        /// Object requested.
        uid: Uid,
        /// Status reported by the host.
        status: u32,
    },

    /// The owning host refused to free an object.
    #[error("free of {uid} failed with status {status}")]
    FreeFailed {
        /// Object requested.
        uid: Uid,
        /// Status reported by the host.
        status: u32,
    },

    /// A queued lock was answered with a status other than granted.
    #[error("lock {lock_id:#x} answered with status {status}")]
    LockStatus {
        /// The lock.
        lock_id: u64,
        /// Status reported by the host.
        status: u32,
    },
}
