//! Remote locks.
//!
//! A lock lives in the memory of the host owning it and is named by its
//! [`LockIdentity`]. Four protocols acquire it, all behind [`RemoteLock`]:
//!
//! - [`PollLock`]: `LOCK_POLL` RPC; the host test-and-sets and answers at
//!   once, the client retries until granted.
//! - [`QueueLock`]: `LOCK_QUEUE` RPC; the host answers only once the lock
//!   is granted, so one round trip suffices.
//! - [`AtomicLock`]: remote compare-and-swap on the lock word, no host
//!   code involved.
//! - [`AcceleratedLock`]: the transport's own remote-lock primitive.
//!
//! Mutual exclusion is enforced by the host or the hardware, which do not
//! know which client holds a lock. The `held` flag of a lock object records
//! what this object last did, and `unlock` only releases when it is set.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use ros_types::LockIdentity;

use crate::connection::Connection;
use crate::error::ClientError;

mod accelerated;
mod atomic;
mod poll;
mod queue;

pub use accelerated::AcceleratedLock;
pub use atomic::AtomicLock;
pub use poll::PollLock;
pub use queue::QueueLock;

/// Capability set shared by every lock protocol.
///
/// Locks are not reentrant: locking a lock this object already holds waits
/// for itself.
#[async_trait]
pub trait RemoteLock: Send + Sync {
    /// Block until the lock is held.
    async fn lock(&self) -> Result<(), ClientError> {
        while !self.try_lock().await? {
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    /// Try once. `Ok(false)` means someone else holds the lock.
    async fn try_lock(&self) -> Result<bool, ClientError>;

    /// Release the lock if this object holds it. Failures are logged, never
    /// returned.
    async fn unlock(&self);

    /// Whether this object believes it holds the lock.
    fn is_held(&self) -> bool;

    /// The lock this object operates on.
    fn identity(&self) -> LockIdentity;

    /// The protocol this object speaks.
    fn kind(&self) -> LockKind;
}

/// The four lock protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    Poll,
    Queue,
    Atomic,
    Accelerated,
}

impl LockKind {
    /// Every kind, in a stable order.
    pub const ALL: [LockKind; 4] = [
        LockKind::Poll,
        LockKind::Queue,
        LockKind::Atomic,
        LockKind::Accelerated,
    ];

    /// Lower-case name.
    pub const fn as_str(self) -> &'static str {
        match self {
            LockKind::Poll => "poll",
            LockKind::Queue => "queue",
            LockKind::Atomic => "atomic",
            LockKind::Accelerated => "accelerated",
        }
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LockKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown lock kind '{s}' (poll, queue, atomic, accelerated)"))
    }
}

/// Build a lock of `kind` on `identity`, issuing through `conn`.
pub fn new_lock(
    kind: LockKind,
    conn: Arc<Connection>,
    identity: LockIdentity,
) -> Box<dyn RemoteLock> {
    match kind {
        LockKind::Poll => Box::new(PollLock::new(conn, identity)),
        LockKind::Queue => Box::new(QueueLock::new(conn, identity)),
        LockKind::Atomic => Box::new(AtomicLock::new(conn, identity)),
        LockKind::Accelerated => Box::new(AcceleratedLock::new(conn, identity)),
    }
}
