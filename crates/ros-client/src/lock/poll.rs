//! Lock acquired by polling the owning host.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use ros_types::LockIdentity;
use ros_wire::{Body, LOCK_STATUS_ACQUIRED};
use tracing::{trace, warn};

use super::{LockKind, RemoteLock};
use crate::connection::Connection;
use crate::error::ClientError;

/// Sends `LOCK_POLL` until the host reports the lock granted.
pub struct PollLock {
    conn: Arc<Connection>,
    identity: LockIdentity,
    held: AtomicBool,
}

impl PollLock {
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
impl RemoteLock for PollLock {
    async fn try_lock(&self) -> Result<bool, ClientError> {
        let status = self
            .conn
            .acquire_request(Body::LockPollRequest {
                lock: self.identity,
            })
            .await?;
        let acquired = status == LOCK_STATUS_ACQUIRED;
        if acquired {
            self.held.store(true, Ordering::Release);
        }
        trace!(lock = %self.identity, status, "poll lock attempt");
        Ok(acquired)
    }

    async fn unlock(&self) {
        if !self.held.swap(false, Ordering::AcqRel) {
            warn!(lock = %self.identity, "unlock of a lock this handle does not hold");
            return;
        }
        if let Err(e) = unlock_rpc(&self.conn, self.identity).await {
            warn!(lock = %self.identity, error = %e, "poll lock release failed");
        }
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    fn identity(&self) -> LockIdentity {
        self.identity
    }

    fn kind(&self) -> LockKind {
        LockKind::Poll
    }
}

/// Send `UNLOCK` and check the host's answer. Shared by the RPC locks.
pub(super) async fn unlock_rpc(conn: &Connection, lock: LockIdentity) -> Result<(), ClientError> {
    let status = conn.lock_request(Body::UnlockRequest { lock }).await?;
    if status != LOCK_STATUS_ACQUIRED {
        warn!(%lock, status, "host reports lock was not held");
    }
    Ok(())
}
