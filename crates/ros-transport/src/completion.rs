//! Work completions, completion queues and access flags.

use bytes::Bytes;
use tokio::sync::mpsc;

bitflags::bitflags! {
    /// Access rights granted when registering memory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        /// The local transport may write into the buffer (reads land here).
        const LOCAL_WRITE = 1 << 0;
        /// Peers may read the region.
        const REMOTE_READ = 1 << 1;
        /// Peers may write the region.
        const REMOTE_WRITE = 1 << 2;
        /// Peers may run atomic operations on the region.
        const REMOTE_ATOMIC = 1 << 3;
    }
}

/// Flags on a send or write work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendFlags {
    /// Produce a completion when the work request finishes successfully.
    pub signaled: bool,
}

impl SendFlags {
    /// Flags requesting a completion.
    pub const SIGNALED: Self = Self { signaled: true };
    /// Flags suppressing the success completion.
    pub const UNSIGNALED: Self = Self { signaled: false };
}

/// Kind of work request a completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkOpcode {
    Send,
    Recv,
    Read,
    Write,
    CompareSwap,
    RemoteLock,
    RemoteUnlock,
}

/// Outcome of a work request, reduced to what the core interprets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    /// The work request failed; the connection may still be usable.
    Failed(String),
    /// The work request was flushed because the connection is closing.
    Flushed,
}

impl CompletionStatus {
    /// Whether the work request succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, CompletionStatus::Success)
    }
}

/// A completed work request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Identifier chosen by the poster.
    pub wr_id: u64,
    /// Kind of work request.
    pub opcode: WorkOpcode,
    /// Outcome.
    pub status: CompletionStatus,
    /// Received message, bytes read, or the prior value of an atomic.
    pub payload: Bytes,
}

impl Completion {
    /// A successful completion.
    pub fn success(wr_id: u64, opcode: WorkOpcode, payload: Bytes) -> Self {
        Self {
            wr_id,
            opcode,
            status: CompletionStatus::Success,
            payload,
        }
    }

    /// A failed completion.
    pub fn failed(wr_id: u64, opcode: WorkOpcode, reason: impl Into<String>) -> Self {
        Self {
            wr_id,
            opcode,
            status: CompletionStatus::Failed(reason.into()),
            payload: Bytes::new(),
        }
    }

    /// A flushed completion.
    pub fn flushed(wr_id: u64, opcode: WorkOpcode) -> Self {
        Self {
            wr_id,
            opcode,
            status: CompletionStatus::Flushed,
            payload: Bytes::new(),
        }
    }
}

/// The two completion streams of one connection.
#[derive(Debug)]
pub struct CompletionQueues {
    /// Completions for work this side initiated.
    pub send: mpsc::UnboundedReceiver<Completion>,
    /// Completions for posted receive buffers (inbound messages).
    pub recv: mpsc::UnboundedReceiver<Completion>,
}
