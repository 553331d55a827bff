//! In-process loopback fabric.
//!
//! A [`LoopbackHost`] stands in for a remote host: it owns registered
//! memory ([`HostMemory`]) that connected clients can read, write and run
//! atomics on, and it hands inbound messages to a [`RequestHandler`].
//! [`LoopbackHost::connect`] returns the client end of a connection as a
//! [`LoopbackTransport`] plus its [`CompletionQueues`].
//!
//! One-sided operations are executed synchronously against host memory
//! when posted and their completion is queued immediately. Messages sent
//! to the host are processed in order by a single task per connection.
//! Replies consume the client's posted receive buffers; a reply arriving
//! while none is posted waits in a backlog until one is.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use ros_types::{CACHE_LINE_SIZE, LocalKey, LockIdentity, PAGE_SIZE, RemoteAddr};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::Transport;
use crate::completion::{AccessFlags, Completion, CompletionQueues, SendFlags, WorkOpcode};
use crate::error::TransportError;

/// Tunables of a loopback connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackConfig {
    /// Largest payload accepted by `post_send`.
    pub max_inline: usize,
    /// Maximum number of receive buffers posted at once.
    pub receive_credits: usize,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            max_inline: CACHE_LINE_SIZE,
            receive_credits: 128,
        }
    }
}

// ---------------------------------------------------------------------------
// Host memory
// ---------------------------------------------------------------------------

struct Region {
    base: u64,
    access: AccessFlags,
    data: Mutex<Vec<u8>>,
}

impl Region {
    fn offset(&self, addr: u64, len: usize) -> Result<usize, TransportError> {
        let data_len = self.data.lock().expect("region lock poisoned").len();
        let start = addr
            .checked_sub(self.base)
            .ok_or(TransportError::OutOfBounds { addr, len })? as usize;
        match start.checked_add(len) {
            Some(end) if end <= data_len => Ok(start),
            _ => Err(TransportError::OutOfBounds { addr, len }),
        }
    }
}

/// Registered memory of a loopback host.
///
/// Regions are addressed by `(addr, rkey)`. Addresses are unique across the
/// host and page aligned; address 0 is never handed out. 8-byte words used
/// by atomics are stored little-endian.
pub struct HostMemory {
    regions: RwLock<HashMap<u32, Arc<Region>>>,
    next_key: AtomicU32,
    next_base: AtomicU64,
}

impl HostMemory {
    /// Create an empty memory space.
    pub fn new() -> Self {
        Self {
            regions: RwLock::new(HashMap::new()),
            next_key: AtomicU32::new(0x100),
            next_base: AtomicU64::new(PAGE_SIZE as u64),
        }
    }

    /// Register a zeroed region of `len` bytes and return its base address
    /// and rkey.
    pub fn register(&self, len: usize, access: AccessFlags) -> RemoteAddr {
        let pages = len.div_ceil(PAGE_SIZE).max(1) as u64;
        // One unmapped guard page between regions.
        let base = self
            .next_base
            .fetch_add((pages + 1) * PAGE_SIZE as u64, Ordering::Relaxed);
        let rkey = self.next_key.fetch_add(1, Ordering::Relaxed);
        let region = Region {
            base,
            access,
            data: Mutex::new(vec![0; len]),
        };
        self.regions
            .write()
            .expect("regions lock poisoned")
            .insert(rkey, Arc::new(region));
        debug!(base = format_args!("{base:#x}"), rkey, len, ?access, "registered host memory");
        RemoteAddr::new(base, rkey)
    }

    /// Drop a registration. Later accesses with `rkey` fail.
    pub fn deregister(&self, rkey: u32) -> Result<(), TransportError> {
        self.regions
            .write()
            .expect("regions lock poisoned")
            .remove(&rkey)
            .map(|_| ())
            .ok_or(TransportError::UnknownKey(rkey))
    }

    fn region(&self, rkey: u32, needed: AccessFlags) -> Result<Arc<Region>, TransportError> {
        let region = self
            .regions
            .read()
            .expect("regions lock poisoned")
            .get(&rkey)
            .cloned()
            .ok_or(TransportError::UnknownKey(rkey))?;
        if !region.access.contains(needed) {
            return Err(TransportError::AccessDenied { key: rkey, needed });
        }
        Ok(region)
    }

    fn read_with(
        &self,
        remote: RemoteAddr,
        len: usize,
        needed: AccessFlags,
    ) -> Result<Bytes, TransportError> {
        let region = self.region(remote.rkey, needed)?;
        let start = region.offset(remote.addr, len)?;
        let data = region.data.lock().expect("region lock poisoned");
        Ok(Bytes::copy_from_slice(&data[start..start + len]))
    }

    fn write_with(
        &self,
        remote: RemoteAddr,
        bytes: &[u8],
        needed: AccessFlags,
    ) -> Result<(), TransportError> {
        let region = self.region(remote.rkey, needed)?;
        let start = region.offset(remote.addr, bytes.len())?;
        let mut data = region.data.lock().expect("region lock poisoned");
        data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn cas_with(
        &self,
        remote: RemoteAddr,
        compare: u64,
        swap: u64,
        needed: AccessFlags,
    ) -> Result<u64, TransportError> {
        if remote.addr % 8 != 0 {
            return Err(TransportError::Misaligned(remote.addr));
        }
        let region = self.region(remote.rkey, needed)?;
        let start = region.offset(remote.addr, 8)?;
        let mut data = region.data.lock().expect("region lock poisoned");
        let word = &mut data[start..start + 8];
        let mut old = [0u8; 8];
        old.copy_from_slice(word);
        let old = u64::from_le_bytes(old);
        if old == compare {
            word.copy_from_slice(&swap.to_le_bytes());
        }
        Ok(old)
    }

    /// Owner-side read; bounds are checked, access flags are not.
    pub fn read(&self, remote: RemoteAddr, len: usize) -> Result<Bytes, TransportError> {
        self.read_with(remote, len, AccessFlags::empty())
    }

    /// Owner-side write.
    pub fn write(&self, remote: RemoteAddr, bytes: &[u8]) -> Result<(), TransportError> {
        self.write_with(remote, bytes, AccessFlags::empty())
    }

    /// Owner-side compare-and-swap of an 8-byte word. Returns the prior
    /// value.
    pub fn compare_and_swap(
        &self,
        remote: RemoteAddr,
        compare: u64,
        swap: u64,
    ) -> Result<u64, TransportError> {
        self.cas_with(remote, compare, swap, AccessFlags::empty())
    }

    /// Owner-side read of an 8-byte word.
    pub fn read_word(&self, remote: RemoteAddr) -> Result<u64, TransportError> {
        let bytes = self.read(remote, 8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(word))
    }
}

impl Default for HostMemory {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Request handling on the host side
// ---------------------------------------------------------------------------

/// Host-side logic driven by a loopback connection.
pub trait RequestHandler: Send + Sync + 'static {
    /// A client connected. Messages replied here are delivered before any
    /// response to the client's own requests.
    fn on_connect(&self, responder: Responder);

    /// A message arrived. The handler may reply immediately or keep the
    /// responder and reply later.
    fn on_message(&self, payload: Bytes, responder: Responder);
}

#[derive(Default)]
struct ReceiveQueue {
    posted: VecDeque<(u64, usize)>,
    backlog: VecDeque<Bytes>,
}

struct Shared {
    conn_id: u64,
    config: LoopbackConfig,
    closed: AtomicBool,
    send_cq: mpsc::UnboundedSender<Completion>,
    recv_cq: mpsc::UnboundedSender<Completion>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    receives: Mutex<ReceiveQueue>,
}

impl Shared {
    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Disconnected)
        } else {
            Ok(())
        }
    }

    fn complete(&self, completion: Completion) {
        // The receiver is gone only once the client has stopped draining.
        let _ = self.send_cq.send(completion);
    }

    fn deliver(&self, wr_id: u64, len: usize, payload: Bytes) {
        let completion = if payload.len() > len {
            Completion::failed(
                wr_id,
                WorkOpcode::Recv,
                format!("local length error: {} > {len}", payload.len()),
            )
        } else {
            Completion::success(wr_id, WorkOpcode::Recv, payload)
        };
        let _ = self.recv_cq.send(completion);
    }
}

/// Handle used by a [`RequestHandler`] to send messages back to one client.
#[derive(Clone)]
pub struct Responder {
    shared: Arc<Shared>,
}

impl Responder {
    /// Identifier of the connection this responder answers on.
    pub fn connection_id(&self) -> u64 {
        self.shared.conn_id
    }

    /// Whether the client end is still connected.
    pub fn is_connected(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire)
    }

    /// Send `payload` to the client.
    pub fn reply(&self, payload: Bytes) -> Result<(), TransportError> {
        self.shared.check_open()?;
        let mut receives = self.shared.receives.lock().expect("receive lock poisoned");
        match receives.posted.pop_front() {
            Some((wr_id, len)) => self.shared.deliver(wr_id, len, payload),
            None => {
                trace!(conn = self.shared.conn_id, "no receive posted, queueing reply");
                receives.backlog.push_back(payload);
            }
        }
        Ok(())
    }
}

/// A host reachable over loopback connections.
pub struct LoopbackHost {
    memory: Arc<HostMemory>,
    handler: Arc<dyn RequestHandler>,
    next_conn: AtomicU64,
}

impl LoopbackHost {
    /// Create a host serving `memory` and dispatching messages to `handler`.
    pub fn new(memory: Arc<HostMemory>, handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            memory,
            handler,
            next_conn: AtomicU64::new(1),
        }
    }

    /// The host's registered memory.
    pub fn memory(&self) -> &Arc<HostMemory> {
        &self.memory
    }

    /// Open a connection to this host.
    ///
    /// Must be called from within a Tokio runtime: the host side of the
    /// connection runs as a spawned task.
    pub fn connect(&self, config: LoopbackConfig) -> (LoopbackTransport, CompletionQueues) {
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (recv_tx, recv_rx) = mpsc::unbounded_channel();
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Bytes>();

        let shared = Arc::new(Shared {
            conn_id,
            config,
            closed: AtomicBool::new(false),
            send_cq: send_tx,
            recv_cq: recv_tx,
            inbound: Mutex::new(Some(inbound_tx)),
            receives: Mutex::new(ReceiveQueue::default()),
        });

        let responder = Responder {
            shared: shared.clone(),
        };
        self.handler.on_connect(responder.clone());

        let handler = self.handler.clone();
        let runtime = tokio::runtime::Handle::current();
        runtime.spawn(async move {
            while let Some(payload) = inbound_rx.recv().await {
                handler.on_message(payload, responder.clone());
            }
            debug!(conn = conn_id, "loopback connection closed on host side");
        });

        debug!(conn = conn_id, "loopback connection established");
        let transport = LoopbackTransport {
            shared,
            memory: self.memory.clone(),
            local: Mutex::new(HashMap::new()),
            next_local: AtomicU32::new(1),
            runtime,
        };
        (
            transport,
            CompletionQueues {
                send: send_rx,
                recv: recv_rx,
            },
        )
    }
}

// ---------------------------------------------------------------------------
// Client end
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct LocalRegion {
    len: usize,
    access: AccessFlags,
}

/// Client end of a loopback connection.
///
/// Dropping the transport disconnects it.
pub struct LoopbackTransport {
    shared: Arc<Shared>,
    memory: Arc<HostMemory>,
    local: Mutex<HashMap<u32, LocalRegion>>,
    next_local: AtomicU32,
    runtime: tokio::runtime::Handle,
}

impl LoopbackTransport {
    fn check_local(
        &self,
        key: LocalKey,
        len: usize,
        needed: AccessFlags,
    ) -> Result<(), TransportError> {
        let local = self.local.lock().expect("local key lock poisoned");
        let region = local
            .get(&key.get())
            .ok_or(TransportError::UnknownKey(key.get()))?;
        if !region.access.contains(needed) {
            return Err(TransportError::AccessDenied {
                key: key.get(),
                needed,
            });
        }
        if len > region.len {
            return Err(TransportError::OutOfBounds { addr: 0, len });
        }
        Ok(())
    }

    /// Number of receive buffers currently posted.
    pub fn posted_receives(&self) -> usize {
        self.shared
            .receives
            .lock()
            .expect("receive lock poisoned")
            .posted
            .len()
    }
}

impl Transport for LoopbackTransport {
    fn post_send(
        &self,
        wr_id: u64,
        payload: Bytes,
        flags: SendFlags,
    ) -> Result<(), TransportError> {
        self.shared.check_open()?;
        let max = self.shared.config.max_inline;
        if payload.len() > max {
            return Err(TransportError::InlineTooLarge {
                len: payload.len(),
                max,
            });
        }
        {
            let inbound = self.shared.inbound.lock().expect("inbound lock poisoned");
            let tx = inbound.as_ref().ok_or(TransportError::Disconnected)?;
            tx.send(payload).map_err(|_| TransportError::Disconnected)?;
        }
        if flags.signaled {
            self.shared
                .complete(Completion::success(wr_id, WorkOpcode::Send, Bytes::new()));
        }
        Ok(())
    }

    fn post_receive(&self, wr_id: u64, len: usize) -> Result<(), TransportError> {
        self.shared.check_open()?;
        let mut receives = self.shared.receives.lock().expect("receive lock poisoned");
        if let Some(payload) = receives.backlog.pop_front() {
            self.shared.deliver(wr_id, len, payload);
            return Ok(());
        }
        if receives.posted.len() >= self.shared.config.receive_credits {
            return Err(TransportError::ReceiveQueueFull(receives.posted.len()));
        }
        receives.posted.push_back((wr_id, len));
        Ok(())
    }

    fn post_read(
        &self,
        wr_id: u64,
        local: LocalKey,
        remote: RemoteAddr,
        len: usize,
    ) -> Result<(), TransportError> {
        self.shared.check_open()?;
        self.check_local(local, len, AccessFlags::LOCAL_WRITE)?;
        let completion = match self.memory.read_with(remote, len, AccessFlags::REMOTE_READ) {
            Ok(data) => Completion::success(wr_id, WorkOpcode::Read, data),
            Err(e) => Completion::failed(wr_id, WorkOpcode::Read, e.to_string()),
        };
        self.shared.complete(completion);
        Ok(())
    }

    fn post_write(
        &self,
        wr_id: u64,
        local: LocalKey,
        data: Bytes,
        remote: RemoteAddr,
        flags: SendFlags,
    ) -> Result<(), TransportError> {
        self.shared.check_open()?;
        self.check_local(local, data.len(), AccessFlags::empty())?;
        match self
            .memory
            .write_with(remote, &data, AccessFlags::REMOTE_WRITE)
        {
            Ok(()) if flags.signaled => self
                .shared
                .complete(Completion::success(wr_id, WorkOpcode::Write, Bytes::new())),
            Ok(()) => {}
            Err(e) => self
                .shared
                .complete(Completion::failed(wr_id, WorkOpcode::Write, e.to_string())),
        }
        Ok(())
    }

    fn post_atomic_cas(
        &self,
        wr_id: u64,
        remote: RemoteAddr,
        compare: u64,
        swap: u64,
    ) -> Result<(), TransportError> {
        self.shared.check_open()?;
        let completion =
            match self
                .memory
                .cas_with(remote, compare, swap, AccessFlags::REMOTE_ATOMIC)
            {
                Ok(old) => Completion::success(
                    wr_id,
                    WorkOpcode::CompareSwap,
                    Bytes::copy_from_slice(&old.to_be_bytes()),
                ),
                Err(e) => Completion::failed(wr_id, WorkOpcode::CompareSwap, e.to_string()),
            };
        self.shared.complete(completion);
        Ok(())
    }

    fn post_remote_lock(&self, wr_id: u64, lock: LockIdentity) -> Result<(), TransportError> {
        self.shared.check_open()?;
        let shared = self.shared.clone();
        let memory = self.memory.clone();
        self.runtime.spawn(async move {
            loop {
                if shared.closed.load(Ordering::Acquire) {
                    return;
                }
                match memory.cas_with(lock.remote(), 0, 1, AccessFlags::REMOTE_ATOMIC) {
                    Ok(0) => {
                        shared.complete(Completion::success(
                            wr_id,
                            WorkOpcode::RemoteLock,
                            Bytes::copy_from_slice(&0u64.to_be_bytes()),
                        ));
                        return;
                    }
                    Ok(_) => tokio::task::yield_now().await,
                    Err(e) => {
                        shared.complete(Completion::failed(
                            wr_id,
                            WorkOpcode::RemoteLock,
                            e.to_string(),
                        ));
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    fn post_remote_unlock(&self, wr_id: u64, lock: LockIdentity) -> Result<(), TransportError> {
        self.shared.check_open()?;
        let completion = match self
            .memory
            .cas_with(lock.remote(), 1, 0, AccessFlags::REMOTE_ATOMIC)
        {
            Ok(old) => Completion::success(
                wr_id,
                WorkOpcode::RemoteUnlock,
                Bytes::copy_from_slice(&old.to_be_bytes()),
            ),
            Err(e) => Completion::failed(wr_id, WorkOpcode::RemoteUnlock, e.to_string()),
        };
        self.shared.complete(completion);
        Ok(())
    }

    fn register_memory(&self, len: usize, access: AccessFlags) -> Result<LocalKey, TransportError> {
        self.shared.check_open()?;
        if len == 0 {
            return Err(TransportError::Registration(
                "cannot register an empty buffer".into(),
            ));
        }
        let key = self.next_local.fetch_add(1, Ordering::Relaxed);
        self.local
            .lock()
            .expect("local key lock poisoned")
            .insert(key, LocalRegion { len, access });
        trace!(key, len, "registered local buffer");
        Ok(LocalKey::from(key))
    }

    fn deregister_memory(&self, key: LocalKey) -> Result<(), TransportError> {
        self.local
            .lock()
            .expect("local key lock poisoned")
            .remove(&key.get())
            .map(|_| ())
            .ok_or(TransportError::UnknownKey(key.get()))
    }

    fn disconnect(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the inbound sender ends the host-side task.
        self.shared
            .inbound
            .lock()
            .expect("inbound lock poisoned")
            .take();

        // Every posted receive is flushed. Each queue gets at least one
        // flushed completion so its drainer notices the teardown.
        let mut receives = self.shared.receives.lock().expect("receive lock poisoned");
        receives.backlog.clear();
        let posted: Vec<_> = receives.posted.drain(..).collect();
        drop(receives);
        if posted.is_empty() {
            let _ = self
                .shared
                .recv_cq
                .send(Completion::flushed(0, WorkOpcode::Recv));
        }
        for (wr_id, _) in posted {
            let _ = self
                .shared
                .recv_cq
                .send(Completion::flushed(wr_id, WorkOpcode::Recv));
        }
        self.shared
            .complete(Completion::flushed(0, WorkOpcode::Send));

        if let Ok(local) = self.local.lock()
            && !local.is_empty()
        {
            warn!(
                conn = self.shared.conn_id,
                registered = local.len(),
                "disconnecting with local buffers still registered"
            );
        }
        debug!(conn = self.shared.conn_id, "loopback connection disconnected");
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
