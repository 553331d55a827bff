//! Remote-memory transport boundary.
//!
//! The core never talks to a NIC directly. It posts work requests through
//! the [`Transport`] trait and learns about their outcome from two
//! completion streams ([`CompletionQueues`]): one for operations it
//! initiated (sends, reads, writes, atomics) and one for inbound messages
//! landing in posted receive buffers.
//!
//! [`loopback`] provides an in-process implementation with registered
//! memory, key checking and atomic compare-and-swap, used by the tests and
//! the demo daemon.

mod completion;
mod error;
pub mod loopback;

pub use completion::{
    AccessFlags, Completion, CompletionQueues, CompletionStatus, SendFlags, WorkOpcode,
};
pub use error::TransportError;

use bytes::Bytes;
use ros_types::{LocalKey, LockIdentity, RemoteAddr};

/// The operations the core needs from a remote-memory transport.
///
/// Every `post_*` call only queues work and returns immediately. Its
/// outcome, if any, arrives later as a [`Completion`] carrying the same
/// `wr_id`. An `Err` return means the work request was never queued and no
/// completion will follow.
pub trait Transport: Send + Sync {
    /// Send a message to the peer. Unsignaled sends produce no completion
    /// unless they fail.
    fn post_send(&self, wr_id: u64, payload: Bytes, flags: SendFlags)
    -> Result<(), TransportError>;

    /// Make a receive buffer of `len` bytes available for the next inbound
    /// message.
    fn post_receive(&self, wr_id: u64, len: usize) -> Result<(), TransportError>;

    /// Read `len` bytes at `remote` into the registered local buffer
    /// `local`. The completion payload holds the bytes read.
    fn post_read(
        &self,
        wr_id: u64,
        local: LocalKey,
        remote: RemoteAddr,
        len: usize,
    ) -> Result<(), TransportError>;

    /// Write `data`, staged in the registered local buffer `local`, to
    /// `remote`.
    fn post_write(
        &self,
        wr_id: u64,
        local: LocalKey,
        data: Bytes,
        remote: RemoteAddr,
        flags: SendFlags,
    ) -> Result<(), TransportError>;

    /// Atomically replace the 8-byte word at `remote` with `swap` if it
    /// equals `compare`. The completion payload is the value observed
    /// before the operation, as 8 big-endian bytes.
    fn post_atomic_cas(
        &self,
        wr_id: u64,
        remote: RemoteAddr,
        compare: u64,
        swap: u64,
    ) -> Result<(), TransportError>;

    /// Acquire the lock word at `lock` inside the transport itself. The
    /// completion is only produced once the lock is held.
    fn post_remote_lock(&self, wr_id: u64, lock: LockIdentity) -> Result<(), TransportError>;

    /// Release a lock acquired with [`Transport::post_remote_lock`].
    fn post_remote_unlock(&self, wr_id: u64, lock: LockIdentity) -> Result<(), TransportError>;

    /// Register a local buffer of `len` bytes and return its key.
    fn register_memory(&self, len: usize, access: AccessFlags) -> Result<LocalKey, TransportError>;

    /// Release a registration made by [`Transport::register_memory`].
    fn deregister_memory(&self, key: LocalKey) -> Result<(), TransportError>;

    /// Tear the connection down. Outstanding work is flushed to both
    /// completion queues with [`CompletionStatus::Flushed`] and every later
    /// post fails with [`TransportError::Disconnected`].
    fn disconnect(&self);
}
