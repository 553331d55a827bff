//! Routing from object uids to host connections.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use ros_types::{HostId, Uid};
use tracing::{debug, info};

use crate::connection::Connection;
use crate::error::ClientError;

/// Connections to every known host, keyed by host id.
///
/// An object's owner is the high 32 bits of its uid, so the registry is all
/// a handle needs to route its requests. Populated from host announces.
#[derive(Default)]
pub struct Registry {
    connections: RwLock<HashMap<HostId, Arc<Connection>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for `conn`'s announce and register it under the announced host
    /// id. Returns that id.
    pub async fn attach(&self, conn: Arc<Connection>) -> Result<HostId, ClientError> {
        let announce = conn.await_announce().await?;
        if self.insert(announce.host_id, conn).is_some() {
            info!(host_id = %announce.host_id, "replaced existing connection");
        }
        Ok(announce.host_id)
    }

    /// Register `conn` for `host`, returning the connection it replaces.
    pub fn insert(&self, host: HostId, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        debug!(%host, "registering connection");
        self.connections
            .write()
            .expect("registry lock poisoned")
            .insert(host, conn)
    }

    /// The connection to the host owning `uid`.
    pub fn connection_for(&self, uid: Uid) -> Result<Arc<Connection>, ClientError> {
        self.connection(uid.host_id())
            .ok_or(ClientError::UnknownHost(uid.host_id()))
    }

    /// The connection to `host`, if registered.
    pub fn connection(&self, host: HostId) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .expect("registry lock poisoned")
            .get(&host)
            .cloned()
    }

    /// Unregister `host`, returning its connection.
    pub fn remove(&self, host: HostId) -> Option<Arc<Connection>> {
        self.connections
            .write()
            .expect("registry lock poisoned")
            .remove(&host)
    }

    /// Registered hosts.
    pub fn hosts(&self) -> Vec<HostId> {
        self.connections
            .read()
            .expect("registry lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.read().expect("registry lock poisoned").len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
