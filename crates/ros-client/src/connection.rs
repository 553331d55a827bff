//! Client state for one connection to a host.
//!
//! A [`Connection`] owns the transport endpoint, the two correlation tables
//! and the two drainer tasks resolving them. Requests are issued from any
//! task: [`Connection::call`] for RPCs answered by a message,
//! [`Connection::read`] / [`Connection::write`] / [`Connection::compare_and_swap`]
//! and the remote-lock primitives for one-sided work completing on the send
//! queue.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use bytes::Bytes;
use ros_transport::{AccessFlags, CompletionQueues, SendFlags, Transport};
use ros_types::{
    ANNOUNCE_REQUEST_ID, HostId, LocalKey, LockIdentity, ObjectHeader, RemoteAddr, RequestId, Uid,
};
use ros_wire::{Body, LOCK_STATUS_ACQUIRED, MAX_MESSAGE_LEN, Message, Opcode};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::correlator::{Direction, PendingOp, Tables, UNTRACKED_WR_ID, drain_completions};
use crate::error::ClientError;

/// What a host told us about itself when we connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAnnounce {
    /// The host's id, as carried in the announce header.
    pub host_id: HostId,
    /// Address the host serves remote memory on.
    pub rdma_ipv4_addr: Ipv4Addr,
    /// Cluster the host belongs to.
    pub cluster_id: u64,
    /// Access key of the host's object pool.
    pub pool_rkey: u32,
}

/// One connection to a host.
pub struct Connection {
    local_host: HostId,
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    tables: Tables,
    next_id: Mutex<u16>,
    announce_op: Mutex<Option<PendingOp>>,
    peer: OnceLock<PeerAnnounce>,
    drainers: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Set up client state on a freshly connected transport.
    ///
    /// Reserves request id 0 for the host's announce, posts the receive
    /// buffers and starts one drainer task per completion queue. Must be
    /// called from within a Tokio runtime.
    pub fn establish(
        transport: Arc<dyn Transport>,
        queues: CompletionQueues,
        local_host: HostId,
        config: ClientConfig,
    ) -> Result<Arc<Self>, ClientError> {
        let tables = Tables::new();
        let announce_op = tables.recv.register(ANNOUNCE_REQUEST_ID)?;

        for wr_id in 0..config.receive_depth as u64 {
            if let Err(e) = transport.post_receive(wr_id, MAX_MESSAGE_LEN) {
                transport.disconnect();
                return Err(e.into());
            }
        }

        let drainers = vec![
            tokio::spawn(drain_completions(
                queues.send,
                tables.clone(),
                Direction::Send,
                transport.clone(),
            )),
            tokio::spawn(drain_completions(
                queues.recv,
                tables.clone(),
                Direction::Recv,
                transport.clone(),
            )),
        ];

        debug!(%local_host, receive_depth = config.receive_depth, "connection established");
        Ok(Arc::new(Self {
            local_host,
            config,
            transport,
            tables,
            next_id: Mutex::new(1),
            announce_op: Mutex::new(Some(announce_op)),
            peer: OnceLock::new(),
            drainers: Mutex::new(drainers),
        }))
    }

    /// Wait for the host's announce and record it.
    ///
    /// Calling this again after it succeeded returns the recorded announce.
    pub async fn await_announce(&self) -> Result<PeerAnnounce, ClientError> {
        let op = self
            .announce_op
            .lock()
            .expect("announce lock poisoned")
            .take();
        let Some(op) = op else {
            return self.peer.get().copied().ok_or(ClientError::NotAnnounced);
        };
        let msg = Message::decode(&self.wait(op).await?)?;
        let Body::Announce {
            rdma_ipv4_addr,
            cluster_id,
            pool_rkey,
        } = msg.body
        else {
            return Err(unexpected(Opcode::Announce, &msg));
        };
        let announce = PeerAnnounce {
            host_id: msg.host_id,
            rdma_ipv4_addr,
            cluster_id,
            pool_rkey,
        };
        let announce = *self.peer.get_or_init(|| announce);
        info!(
            host_id = %announce.host_id,
            addr = %announce.rdma_ipv4_addr,
            cluster_id = announce.cluster_id,
            "host announced"
        );
        Ok(announce)
    }

    /// The announced host id, once known.
    pub fn host_id(&self) -> Option<HostId> {
        self.peer.get().map(|p| p.host_id)
    }

    /// The announced pool access key, once known.
    pub fn pool_rkey(&self) -> Option<u32> {
        self.peer.get().map(|p| p.pool_rkey)
    }

    /// This client's own host id, stamped on outgoing messages.
    pub fn local_host(&self) -> HostId {
        self.local_host
    }

    /// The configuration this connection was established with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Allocate a request id and register a pending operation for it in
    /// `direction`'s table.
    ///
    /// Ids are handed out in order, skipping 0 and any id still live in
    /// either table. Fails once the in-flight bound is reached.
    pub fn issue(&self, direction: Direction) -> Result<PendingOp, ClientError> {
        let mut next = self.next_id.lock().expect("request id lock poisoned");
        let in_flight = self.in_flight();
        if in_flight >= self.config.in_flight_limit() {
            return Err(ClientError::RequestIdsExhausted { in_flight });
        }
        loop {
            let id = RequestId::from(*next);
            *next = next.wrapping_add(1);
            if id == ANNOUNCE_REQUEST_ID || self.tables.send.contains(id) || self.tables.recv.contains(id)
            {
                continue;
            }
            return self.tables.get(direction).register(id);
        }
    }

    /// Operations outstanding on both tables.
    pub fn in_flight(&self) -> usize {
        self.tables.send.in_flight() + self.tables.recv.in_flight()
    }

    /// Whether the connection has been torn down.
    pub fn is_closed(&self) -> bool {
        self.tables.send.is_closed() || self.tables.recv.is_closed()
    }

    async fn wait(&self, op: PendingOp) -> Result<Bytes, ClientError> {
        match self.config.request_timeout {
            Some(limit) => op.wait_timeout(limit).await,
            None => op.wait().await,
        }
    }

    /// Post work for `op`; a post failure fails `op` through its table so
    /// the waiter sees it like any other failure.
    fn post(
        &self,
        op: &PendingOp,
        direction: Direction,
        post: impl FnOnce(u64) -> Result<(), ros_transport::TransportError>,
    ) {
        if let Err(e) = post(op.req_id().get() as u64) {
            self.tables.get(direction).fail(op.req_id(), e.into());
        }
    }

    /// Send `body` as a request and wait for the host's answer.
    pub async fn call(&self, body: Body) -> Result<Message, ClientError> {
        let op = self.issue(Direction::Recv)?;
        self.send_request(&op, body);
        let answer = Message::decode(&self.wait(op).await?)?;
        Ok(answer)
    }

    fn send_request(&self, op: &PendingOp, body: Body) {
        let msg = Message::new(op.req_id(), self.local_host, body);
        let payload = msg.encode().to_bytes();
        self.post(op, Direction::Recv, |wr_id| {
            self.transport
                .post_send(wr_id, payload, SendFlags::UNSIGNALED)
        });
    }

    /// Wait for a lock acquisition. If it times out, the request stays
    /// registered and a background task releases the lock should the grant
    /// still arrive.
    async fn wait_acquire(
        self: &Arc<Self>,
        op: PendingOp,
        grant: LateGrant,
    ) -> Result<Bytes, ClientError> {
        let Some(limit) = self.config.request_timeout else {
            return op.wait().await;
        };
        match op.wait_for(limit).await {
            Ok(result) => result,
            Err(op) => {
                let req_id = op.req_id();
                debug!(%req_id, ?limit, ?grant, "lock acquisition timed out");
                tokio::spawn(release_late_grant(Arc::downgrade(self), op, grant));
                Err(ClientError::Timeout(req_id))
            }
        }
    }

    /// Read `len` bytes at `remote` through the registered buffer `local`.
    pub async fn read(
        &self,
        local: LocalKey,
        remote: RemoteAddr,
        len: usize,
    ) -> Result<Bytes, ClientError> {
        let op = self.issue(Direction::Send)?;
        self.post(&op, Direction::Send, |wr_id| {
            self.transport.post_read(wr_id, local, remote, len)
        });
        let data = self.wait(op).await?;
        if data.len() != len {
            return Err(ClientError::Malformed(format!(
                "read of {len} bytes returned {}",
                data.len()
            )));
        }
        Ok(data)
    }

    /// Write `data`, staged in the registered buffer `local`, to `remote`.
    pub async fn write(
        &self,
        local: LocalKey,
        data: Bytes,
        remote: RemoteAddr,
    ) -> Result<(), ClientError> {
        let op = self.issue(Direction::Send)?;
        self.post(&op, Direction::Send, |wr_id| {
            self.transport
                .post_write(wr_id, local, data, remote, SendFlags::SIGNALED)
        });
        self.wait(op).await?;
        Ok(())
    }

    /// Post a write without waiting for it. Only a failure is reported,
    /// and only to the log.
    pub fn write_detached(
        &self,
        local: LocalKey,
        data: Bytes,
        remote: RemoteAddr,
    ) -> Result<(), ClientError> {
        self.transport
            .post_write(UNTRACKED_WR_ID, local, data, remote, SendFlags::UNSIGNALED)?;
        Ok(())
    }

    /// Compare-and-swap the 8-byte word at `remote`. Returns the value seen
    /// before the operation.
    pub async fn compare_and_swap(
        &self,
        remote: RemoteAddr,
        compare: u64,
        swap: u64,
    ) -> Result<u64, ClientError> {
        let op = self.issue(Direction::Send)?;
        self.post(&op, Direction::Send, |wr_id| {
            self.transport.post_atomic_cas(wr_id, remote, compare, swap)
        });
        prior_value(&self.wait(op).await?)
    }

    /// Acquire `lock` with the transport's own locking primitive. Returns
    /// once the lock is held.
    ///
    /// On timeout the lock is released as soon as the primitive completes.
    pub async fn remote_lock(self: &Arc<Self>, lock: LockIdentity) -> Result<(), ClientError> {
        let op = self.issue(Direction::Send)?;
        self.post(&op, Direction::Send, |wr_id| {
            self.transport.post_remote_lock(wr_id, lock)
        });
        self.wait_acquire(op, LateGrant::Word(lock)).await?;
        Ok(())
    }

    /// Release a lock taken with [`Connection::remote_lock`]. Returns the
    /// lock word's prior value.
    pub async fn remote_unlock(&self, lock: LockIdentity) -> Result<u64, ClientError> {
        let op = self.issue(Direction::Send)?;
        self.post(&op, Direction::Send, |wr_id| {
            self.transport.post_remote_unlock(wr_id, lock)
        });
        prior_value(&self.wait(op).await?)
    }

    /// Send a lock RPC and return the status of the host's `LOCK_RESP`.
    pub async fn lock_request(&self, body: Body) -> Result<u32, ClientError> {
        let lock = match body {
            Body::LockPollRequest { lock }
            | Body::LockQueueRequest { lock }
            | Body::UnlockRequest { lock } => lock,
            other => return Err(not_a_lock_request(&other)),
        };
        let answer = self.call(body).await?;
        lock_status(lock, &answer)
    }

    /// Send `LOCK_POLL` or `LOCK_QUEUE` and return the granted status.
    ///
    /// Unlike [`Connection::lock_request`], a timed-out request is not
    /// forgotten: if the host grants the lock afterwards, it is released
    /// again with `UNLOCK`.
    pub async fn acquire_request(self: &Arc<Self>, body: Body) -> Result<u32, ClientError> {
        let lock = match body {
            Body::LockPollRequest { lock } | Body::LockQueueRequest { lock } => lock,
            other => return Err(not_a_lock_request(&other)),
        };
        let op = self.issue(Direction::Recv)?;
        self.send_request(&op, body);
        let answer = Message::decode(&self.wait_acquire(op, LateGrant::Rpc(lock)).await?)?;
        lock_status(lock, &answer)
    }

    /// Ask the host to allocate `uid` in its pool.
    pub async fn alloc(&self, uid: Uid) -> Result<ObjectHeader, ClientError> {
        let pool_rkey = self.pool_rkey().ok_or(ClientError::NotAnnounced)?;
        let answer = self.call(Body::AllocRequest { uid }).await?;
        match answer.body {
            Body::AllocResponse {
                status: 0,
                uid: got,
                addr,
                lock,
            } => {
                debug!(%uid, addr = format_args!("{addr:#x}"), "allocated remote object");
                Ok(ObjectHeader {
                    uid: got,
                    remote: RemoteAddr::new(addr, pool_rkey),
                    lock,
                })
            }
            Body::AllocResponse { status, .. } => Err(ClientError::AllocFailed { uid, status }),
            _ => Err(unexpected(Opcode::AllocResp, &answer)),
        }
    }

    /// Ask the host to free `uid`.
    pub async fn free(&self, uid: Uid) -> Result<(), ClientError> {
        let answer = self.call(Body::FreeRequest { uid }).await?;
        match answer.body {
            Body::FreeResponse { status: 0, .. } => Ok(()),
            Body::FreeResponse { status, .. } => Err(ClientError::FreeFailed { uid, status }),
            _ => Err(unexpected(Opcode::FreeResp, &answer)),
        }
    }

    /// Fetch the header of `uid` from its owning host.
    pub async fn get_header(&self, uid: Uid) -> Result<ObjectHeader, ClientError> {
        let answer = self.call(Body::GetHdrRequest { uid }).await?;
        match answer.body {
            Body::GetHdrResponse { remote, .. } if remote.addr == 0 && remote.rkey == 0 => {
                Err(ClientError::ObjectNotFound(uid))
            }
            Body::GetHdrResponse {
                uid: got,
                remote,
                lock,
            } => Ok(ObjectHeader {
                uid: got,
                remote,
                lock,
            }),
            _ => Err(unexpected(Opcode::GetHdrResp, &answer)),
        }
    }

    /// Register a local buffer for reads and writes on this connection.
    pub fn register_buffer(&self, len: usize) -> Result<LocalKey, ClientError> {
        Ok(self
            .transport
            .register_memory(len, AccessFlags::LOCAL_WRITE)?)
    }

    /// Release a buffer registered with [`Connection::register_buffer`].
    pub fn deregister_buffer(&self, key: LocalKey) -> Result<(), ClientError> {
        Ok(self.transport.deregister_memory(key)?)
    }

    /// Tear the connection down and wait for both drainers to finish.
    ///
    /// Every outstanding operation fails with
    /// [`ClientError::ConnectionClosed`].
    pub async fn shutdown(&self) {
        self.transport.disconnect();
        let drainers = std::mem::take(&mut *self.drainers.lock().expect("drainer lock poisoned"));
        for handle in drainers {
            if let Err(e) = handle.await {
                warn!(error = %e, "completion drainer panicked");
            }
        }
        debug!(host_id = ?self.host_id(), "connection shut down");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("local_host", &self.local_host)
            .field("host_id", &self.host_id())
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // The drainers keep the transport alive; disconnecting ends them.
        self.transport.disconnect();
    }
}

/// A lock acquisition whose caller stopped waiting.
#[derive(Debug, Clone, Copy)]
enum LateGrant {
    /// Granted by a `LOCK_RESP`, released with `UNLOCK`.
    Rpc(LockIdentity),
    /// Taken by the transport's remote-lock primitive.
    Word(LockIdentity),
}

/// Wait out an abandoned acquisition and give back the lock if it was
/// granted after all.
async fn release_late_grant(conn: Weak<Connection>, op: PendingOp, grant: LateGrant) {
    let req_id = op.req_id();
    let Ok(payload) = op.wait().await else {
        return;
    };
    let Some(conn) = conn.upgrade() else {
        return;
    };
    match grant {
        LateGrant::Rpc(lock) => {
            let status = Message::decode(&payload)
                .map_err(ClientError::from)
                .and_then(|answer| lock_status(lock, &answer));
            if !matches!(status, Ok(LOCK_STATUS_ACQUIRED)) {
                return;
            }
            info!(%req_id, %lock, "releasing lock granted after timeout");
            match conn.lock_request(Body::UnlockRequest { lock }).await {
                Ok(LOCK_STATUS_ACQUIRED) => {}
                Ok(status) => warn!(%lock, status, "host reports lock was not held"),
                Err(e) => warn!(%lock, error = %e, "late lock release failed"),
            }
        }
        LateGrant::Word(lock) => {
            info!(%req_id, %lock, "releasing lock granted after timeout");
            if let Err(e) = conn.remote_unlock(lock).await {
                warn!(%lock, error = %e, "late lock release failed");
            }
        }
    }
}

fn lock_status(lock: LockIdentity, answer: &Message) -> Result<u32, ClientError> {
    match answer.body {
        Body::LockResponse { lock_id, status } if lock_id == lock.lock_id => Ok(status),
        Body::LockResponse { lock_id, .. } => Err(ClientError::LockMismatch {
            expected: lock.lock_id,
            got: lock_id,
        }),
        _ => Err(unexpected(Opcode::LockResp, answer)),
    }
}

fn not_a_lock_request(body: &Body) -> ClientError {
    ClientError::Malformed(format!("{:?} is not a lock request", body.opcode()))
}

fn unexpected(expected: Opcode, got: &Message) -> ClientError {
    ClientError::UnexpectedResponse {
        expected,
        got: got.opcode(),
    }
}

fn prior_value(payload: &[u8]) -> Result<u64, ClientError> {
    let bytes: [u8; 8] = payload.try_into().map_err(|_| {
        ClientError::Malformed(format!("atomic returned {} bytes", payload.len()))
    })?;
    Ok(u64::from_be_bytes(bytes))
}
