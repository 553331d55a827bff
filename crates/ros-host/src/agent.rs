//! Request handling on the host.

use std::sync::Arc;

use bytes::Bytes;
use ros_transport::TransportError;
use ros_transport::loopback::{HostMemory, RequestHandler, Responder};
use ros_types::{ANNOUNCE_REQUEST_ID, LockIdentity, ObjectHeader, RemoteAddr, RequestId, Uid};
use ros_wire::{Body, LOCK_STATUS_ACQUIRED, LOCK_STATUS_BUSY, Message};
use tracing::{debug, info, trace, warn};

use crate::config::HostConfig;
use crate::error::HostError;
use crate::locks::{Enqueue, LockState, LockTable, Release};
use crate::pool::{
    ALLOC_STATUS_EXHAUSTED, ALLOC_STATUS_EXISTS, ALLOC_STATUS_OK, FREE_STATUS_OK,
    FREE_STATUS_UNKNOWN, ObjectPool, ROOT_OBJECT,
};

/// A requester queued on a lock, answered once the lock is handed over.
struct Waiter {
    req_id: RequestId,
    responder: Responder,
}

/// Answers client RPCs for one host.
pub struct HostAgent {
    config: HostConfig,
    pool: ObjectPool,
    locks: LockTable<Waiter>,
}

impl HostAgent {
    /// Register the object pool in `memory` and create the root object.
    pub fn new(config: HostConfig, memory: Arc<HostMemory>) -> Result<Self, HostError> {
        let pool = ObjectPool::new(memory, config.object_size, config.capacity);
        if config.capacity > 0 {
            pool.alloc(Uid::new(config.host_id, ROOT_OBJECT))?;
        }
        info!(
            host_id = %config.host_id,
            cluster_id = config.cluster_id,
            capacity = config.capacity,
            object_size = config.object_size,
            "host agent ready"
        );
        Ok(Self {
            config,
            pool,
            locks: LockTable::new(),
        })
    }

    /// This host's configuration.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// The object pool.
    pub fn pool(&self) -> &ObjectPool {
        &self.pool
    }

    /// The announce pushed to every client on connect.
    pub fn announce(&self) -> Message {
        Message::new(
            ANNOUNCE_REQUEST_ID,
            self.config.host_id,
            Body::Announce {
                rdma_ipv4_addr: self.config.rdma_ipv4_addr,
                cluster_id: self.config.cluster_id,
                pool_rkey: self.pool.pool_rkey(),
            },
        )
    }

    /// The header of `uid`, if allocated here.
    pub fn object_header(&self, uid: Uid) -> Option<ObjectHeader> {
        self.pool.lookup(uid)
    }

    /// State of the RPC lock `lock_id`.
    pub fn lock_state(&self, lock_id: u64) -> LockState {
        self.locks.state(lock_id)
    }

    fn send(&self, responder: &Responder, req_id: RequestId, body: Body) -> Result<(), TransportError> {
        let msg = Message::new(req_id, self.config.host_id, body);
        responder.reply(msg.encode().to_bytes())
    }

    fn answer(&self, responder: &Responder, req_id: RequestId, body: Body) {
        if let Err(e) = self.send(responder, req_id, body) {
            debug!(%req_id, conn = responder.connection_id(), error = %e, "client gone, dropping reply");
        }
    }

    /// Handle one decoded request.
    pub fn handle(&self, request: Message, responder: Responder) {
        let req_id = request.req_id;
        trace!(%req_id, from = %request.host_id, opcode = ?request.opcode(), "request");
        match request.body {
            Body::GetHdrRequest { uid } => {
                let body = match self.pool.lookup(uid) {
                    Some(header) => Body::GetHdrResponse {
                        uid,
                        remote: header.remote,
                        lock: header.lock,
                    },
                    None => {
                        debug!(%uid, "header requested for unknown object");
                        Body::GetHdrResponse {
                            uid,
                            remote: RemoteAddr::new(0, 0),
                            lock: LockIdentity::new(0, 0),
                        }
                    }
                };
                self.answer(&responder, req_id, body);
            }
            Body::AllocRequest { uid } => {
                let body = match self.pool.alloc(uid) {
                    Ok(header) => Body::AllocResponse {
                        status: ALLOC_STATUS_OK,
                        uid,
                        addr: header.remote.addr,
                        lock: header.lock,
                    },
                    Err(e) => {
                        let status = match e {
                            HostError::Exists(_) => ALLOC_STATUS_EXISTS,
                            _ => ALLOC_STATUS_EXHAUSTED,
                        };
                        debug!(%uid, error = %e, "allocation refused");
                        Body::AllocResponse {
                            status,
                            uid,
                            addr: 0,
                            lock: LockIdentity::new(0, 0),
                        }
                    }
                };
                self.answer(&responder, req_id, body);
            }
            Body::FreeRequest { uid } => {
                let status = match self.pool.free(uid) {
                    Ok(()) => FREE_STATUS_OK,
                    Err(_) => FREE_STATUS_UNKNOWN,
                };
                self.answer(&responder, req_id, Body::FreeResponse { status, uid });
            }
            Body::LockPollRequest { lock } => {
                let status = if self.locks.try_acquire(lock.lock_id) {
                    LOCK_STATUS_ACQUIRED
                } else {
                    LOCK_STATUS_BUSY
                };
                self.answer(
                    &responder,
                    req_id,
                    Body::LockResponse {
                        lock_id: lock.lock_id,
                        status,
                    },
                );
            }
            Body::LockQueueRequest { lock } => {
                let waiter = Waiter {
                    req_id,
                    responder: responder.clone(),
                };
                match self.locks.enqueue(lock.lock_id, waiter) {
                    Enqueue::Granted(waiter) => self.grant(lock.lock_id, waiter),
                    Enqueue::Queued => trace!(%lock, %req_id, "lock busy, requester queued"),
                }
            }
            Body::UnlockRequest { lock } => {
                let status = self.release(lock.lock_id);
                self.answer(
                    &responder,
                    req_id,
                    Body::LockResponse {
                        lock_id: lock.lock_id,
                        status,
                    },
                );
            }
            Body::QueryServers { .. }
            | Body::Announce { .. }
            | Body::GetHdrResponse { .. }
            | Body::AllocResponse { .. }
            | Body::FreeResponse { .. }
            | Body::LockResponse { .. } => {
                warn!(%req_id, opcode = ?request.opcode(), "ignoring message that is not a request");
            }
        }
    }

    /// Tell a queued waiter it holds the lock. If it has gone away, pass the
    /// lock on.
    fn grant(&self, lock_id: u64, waiter: Waiter) {
        let body = Body::LockResponse {
            lock_id,
            status: LOCK_STATUS_ACQUIRED,
        };
        if self.send(&waiter.responder, waiter.req_id, body).is_err() {
            debug!(lock_id, "queued requester disconnected, passing lock on");
            self.release(lock_id);
        }
    }

    /// Release `lock_id`; returns the status for the unlocking client.
    fn release(&self, lock_id: u64) -> u32 {
        match self.locks.release(lock_id) {
            Release::NotHeld => {
                debug!(lock_id, "unlock of a lock that is not held");
                LOCK_STATUS_BUSY
            }
            Release::Released => LOCK_STATUS_ACQUIRED,
            Release::HandedOver(next) => {
                self.grant(lock_id, next);
                LOCK_STATUS_ACQUIRED
            }
        }
    }
}

impl RequestHandler for HostAgent {
    fn on_connect(&self, responder: Responder) {
        debug!(conn = responder.connection_id(), "client connected, announcing");
        let announce = self.announce();
        self.answer(&responder, announce.req_id, announce.body);
    }

    fn on_message(&self, payload: Bytes, responder: Responder) {
        match Message::decode(&payload) {
            Ok(request) => self.handle(request, responder),
            Err(e) => warn!(
                conn = responder.connection_id(),
                error = %e,
                len = payload.len(),
                "dropping undecodable request"
            ),
        }
    }
}
