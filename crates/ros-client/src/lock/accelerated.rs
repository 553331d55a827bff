//! Lock delegated to the transport's remote-lock primitive.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use ros_types::LockIdentity;
use tracing::warn;

use super::{LockKind, RemoteLock};
use crate::connection::Connection;
use crate::error::ClientError;

/// The transport acquires the lock word itself and completes only once it
/// holds it. The primitive always blocks, so there is no `try_lock`.
pub struct AcceleratedLock {
    conn: Arc<Connection>,
    identity: LockIdentity,
    held: AtomicBool,
}

impl AcceleratedLock {
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
impl RemoteLock for AcceleratedLock {
    async fn lock(&self) -> Result<(), ClientError> {
        self.conn.remote_lock(self.identity).await?;
        self.held.store(true, Ordering::Release);
        Ok(())
    }

    async fn try_lock(&self) -> Result<bool, ClientError> {
        Err(ClientError::Unsupported {
            operation: "try_lock",
            variant: "accelerated",
        })
    }

    async fn unlock(&self) {
        if !self.held.swap(false, Ordering::AcqRel) {
            warn!(lock = %self.identity, "unlock of a lock this handle does not hold");
            return;
        }
        match self.conn.remote_unlock(self.identity).await {
            Ok(1) => {}
            Ok(prior) => warn!(lock = %self.identity, prior, "released a lock that was not held"),
            Err(e) => warn!(lock = %self.identity, error = %e, "accelerated lock release failed"),
        }
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    fn identity(&self) -> LockIdentity {
        self.identity
    }

    fn kind(&self) -> LockKind {
        LockKind::Accelerated
    }
}
