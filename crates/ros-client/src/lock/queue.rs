//! Lock granted by the owning host's wait queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use ros_types::LockIdentity;
use ros_wire::{Body, LOCK_STATUS_ACQUIRED};
use tracing::{debug, warn};

use super::poll::unlock_rpc;
use super::{LockKind, RemoteLock};
use crate::connection::Connection;
use crate::error::ClientError;

/// Sends one `LOCK_QUEUE` and waits; the host replies once the lock is
/// ours. There is no non-blocking attempt.
pub struct QueueLock {
    conn: Arc<Connection>,
    identity: LockIdentity,
    held: AtomicBool,
}

impl QueueLock {
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
impl RemoteLock for QueueLock {
    async fn lock(&self) -> Result<(), ClientError> {
        let status = self
            .conn
            .acquire_request(Body::LockQueueRequest {
                lock: self.identity,
            })
            .await?;
        if status != LOCK_STATUS_ACQUIRED {
            return Err(ClientError::LockStatus {
                lock_id: self.identity.lock_id,
                status,
            });
        }
        self.held.store(true, Ordering::Release);
        debug!(lock = %self.identity, "queue lock granted");
        Ok(())
    }

    async fn try_lock(&self) -> Result<bool, ClientError> {
        Err(ClientError::Unsupported {
            operation: "try_lock",
            variant: "queue",
        })
    }

    async fn unlock(&self) {
        if !self.held.swap(false, Ordering::AcqRel) {
            warn!(lock = %self.identity, "unlock of a lock this handle does not hold");
            return;
        }
        if let Err(e) = unlock_rpc(&self.conn, self.identity).await {
            warn!(lock = %self.identity, error = %e, "queue lock release failed");
        }
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    fn identity(&self) -> LockIdentity {
        self.identity
    }

    fn kind(&self) -> LockKind {
        LockKind::Queue
    }
}
