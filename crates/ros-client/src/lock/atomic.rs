//! Lock taken with remote compare-and-swap.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use ros_types::LockIdentity;
use tracing::warn;

use super::{LockKind, RemoteLock};
use crate::connection::Connection;
use crate::error::ClientError;

const UNLOCKED: u64 = 0;
const LOCKED: u64 = 1;

/// Swaps the lock word from 0 to 1 to acquire and back to release. No code
/// runs on the owning host.
pub struct AtomicLock {
    conn: Arc<Connection>,
    identity: LockIdentity,
    held: AtomicBool,
}

impl AtomicLock {
    /// Create an unheld lock object.
    pub fn new(conn: Arc<Connection>, identity: LockIdentity) -> Self {
        Self {
            conn,
            identity,
            held: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl RemoteLock for AtomicLock {
    async fn try_lock(&self) -> Result<bool, ClientError> {
        let prior = self
            .conn
            .compare_and_swap(self.identity.remote(), UNLOCKED, LOCKED)
            .await?;
        let acquired = prior == UNLOCKED;
        if acquired {
            self.held.store(true, Ordering::Release);
        }
        Ok(acquired)
    }

    async fn unlock(&self) {
        if !self.held.swap(false, Ordering::AcqRel) {
            warn!(lock = %self.identity, "unlock of a lock this handle does not hold");
            return;
        }
        match self
            .conn
            .compare_and_swap(self.identity.remote(), LOCKED, UNLOCKED)
            .await
        {
            Ok(LOCKED) => {}
            // The swap did nothing, the word is untouched.
            Ok(prior) => warn!(lock = %self.identity, prior, "released a lock that was not held"),
            Err(e) => warn!(lock = %self.identity, error = %e, "atomic lock release failed"),
        }
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    fn identity(&self) -> LockIdentity {
        self.identity
    }

    fn kind(&self) -> LockKind {
        LockKind::Atomic
    }
}
