//! Host side of the remote object store.
//!
//! A host exposes a pool of fixed-size objects in registered memory and
//! answers the RPCs clients cannot do with one-sided operations alone:
//! header lookups, allocation, and the poll and queue lock protocols.
//!
//! - [`HostAgent`]: decodes requests and replies; implements
//!   [`ros_transport::loopback::RequestHandler`].
//! - [`ObjectPool`]: slot allocation inside the registered pool.
//! - [`LockTable`]: per-lock state for the RPC lock protocols.

mod agent;
mod config;
mod error;
mod locks;
mod pool;


pub use agent::HostAgent;
pub use config::HostConfig;
pub use error::HostError;
pub use locks::{Enqueue, LockState, LockTable, Release};
pub use pool::{ALLOC_STATUS_EXHAUSTED, ALLOC_STATUS_EXISTS, ALLOC_STATUS_OK, FREE_STATUS_OK,
    FREE_STATUS_UNKNOWN, ObjectPool, ROOT_OBJECT};
