//! The host's object pool.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use ros_transport::AccessFlags;
use ros_transport::loopback::HostMemory;
use ros_types::{LockIdentity, ObjectHeader, RemoteAddr, Uid};
use tracing::debug;

use crate::error::HostError;

/// `ALLOC_RESP` status: the object was allocated.
pub const ALLOC_STATUS_OK: u32 = 0;
/// `ALLOC_RESP` status: the uid is already allocated.
pub const ALLOC_STATUS_EXISTS: u32 = 1;
/// `ALLOC_RESP` status: no free slot.
pub const ALLOC_STATUS_EXHAUSTED: u32 = 2;
/// `FREE_RESP` status: the object was freed.
pub const FREE_STATUS_OK: u32 = 0;
/// `FREE_RESP` status: the uid is not allocated.
pub const FREE_STATUS_UNKNOWN: u32 = 1;

/// Host-local id of the root object every host creates at start-up.
pub const ROOT_OBJECT: u32 = 1;

const LOCK_WORD: usize = 8;

struct PoolState {
    objects: HashMap<Uid, usize>,
    free: BTreeSet<usize>,
}

/// Fixed-size object slots in registered memory.
///
/// Object bytes live in one region registered for remote read and write.
/// Each slot has an 8-byte lock word in a second region registered for
/// remote atomics; its address is the slot's lock id.
pub struct ObjectPool {
    memory: Arc<HostMemory>,
    data: RemoteAddr,
    locks: RemoteAddr,
    object_size: usize,
    capacity: usize,
    state: Mutex<PoolState>,
}

impl ObjectPool {
    /// Register the pool's regions in `memory`.
    pub fn new(memory: Arc<HostMemory>, object_size: usize, capacity: usize) -> Self {
        let data = memory.register(
            object_size * capacity,
            AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE,
        );
        let locks = memory.register(LOCK_WORD * capacity, AccessFlags::REMOTE_ATOMIC);
        debug!(object_size, capacity, pool = %data, locks = %locks, "object pool registered");
        Self {
            memory,
            data,
            locks,
            object_size,
            capacity,
            state: Mutex::new(PoolState {
                objects: HashMap::new(),
                free: (0..capacity).collect(),
            }),
        }
    }

    fn header(&self, uid: Uid, slot: usize) -> ObjectHeader {
        let lock = self.locks.offset((slot * LOCK_WORD) as u64);
        ObjectHeader {
            uid,
            remote: self.data.offset((slot * self.object_size) as u64),
            lock: LockIdentity::new(lock.addr, lock.rkey),
        }
    }

    /// Allocate a zeroed slot for `uid`, lowest free slot first.
    pub fn alloc(&self, uid: Uid) -> Result<ObjectHeader, HostError> {
        let slot = {
            let mut state = self.state.lock().expect("pool lock poisoned");
            if state.objects.contains_key(&uid) {
                return Err(HostError::Exists(uid));
            }
            let slot = state.free.pop_first().ok_or(HostError::Exhausted {
                capacity: self.capacity,
            })?;
            state.objects.insert(uid, slot);
            slot
        };
        let header = self.header(uid, slot);
        self.memory
            .write(header.remote, &vec![0; self.object_size])?;
        self.memory.write(header.lock.remote(), &[0; LOCK_WORD])?;
        debug!(%uid, slot, "allocated object");
        Ok(header)
    }

    /// Release the slot of `uid`.
    pub fn free(&self, uid: Uid) -> Result<(), HostError> {
        let mut state = self.state.lock().expect("pool lock poisoned");
        let slot = state
            .objects
            .remove(&uid)
            .ok_or(HostError::UnknownObject(uid))?;
        state.free.insert(slot);
        debug!(%uid, slot, "freed object");
        Ok(())
    }

    /// The header of `uid`, if allocated.
    pub fn lookup(&self, uid: Uid) -> Option<ObjectHeader> {
        let slot = *self
            .state
            .lock()
            .expect("pool lock poisoned")
            .objects
            .get(&uid)?;
        Some(self.header(uid, slot))
    }

    /// Access key of the object region, announced to clients.
    pub fn pool_rkey(&self) -> u32 {
        self.data.rkey
    }

    /// Size of every object.
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of allocated objects.
    pub fn len(&self) -> usize {
        self.state.lock().expect("pool lock poisoned").objects.len()
    }

    /// Whether no object is allocated.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The memory the pool lives in.
    pub fn memory(&self) -> &Arc<HostMemory> {
        &self.memory
    }
}
