//! Handles to remote objects.

use std::sync::Arc;

use bytes::Bytes;
use ros_types::{LocalKey, LockIdentity, ObjectHeader, Uid};
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::ClientError;
use crate::registry::Registry;

struct Resolved {
    conn: Arc<Connection>,
    header: ObjectHeader,
    local: LocalKey,
    buf: Vec<u8>,
}

/// A locally cached copy of a fixed-size remote object.
///
/// The first access resolves the handle: the owning host is asked for the
/// object's header, a local buffer is registered and the whole object is
/// pulled into it. Afterwards [`RemoteObject::pull_range`] and
/// [`RemoteObject::push_range`] move byte ranges between the cache and the
/// remote copy, one round trip each.
///
/// Dropping a resolved handle writes the whole cache back. Use
/// [`RemoteObject::close`] to write back and observe the result.
///
/// The handle does not serialize access to the object. Coordinate
/// concurrent writers with a lock on [`RemoteObject::lock_identity`].
pub struct RemoteObject {
    uid: Uid,
    size: usize,
    registry: Arc<Registry>,
    state: Option<Resolved>,
}

impl RemoteObject {
    /// An unresolved handle to `uid`. `size` may not exceed the object
    /// size of the connection the handle resolves through.
    pub fn new(registry: Arc<Registry>, uid: Uid, size: usize) -> Self {
        Self {
            uid,
            size,
            registry,
            state: None,
        }
    }

    /// Allocate `uid` on its owning host, then resolve a handle to it.
    pub async fn create(registry: Arc<Registry>, uid: Uid, size: usize) -> Result<Self, ClientError> {
        let conn = registry.connection_for(uid)?;
        check_size(&conn, uid, size)?;
        conn.alloc(uid).await?;
        let mut object = Self::new(registry, uid, size);
        object.resolve().await?;
        Ok(object)
    }

    /// The object's uid.
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// The object's size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the header has been fetched and the bytes pulled.
    pub fn is_resolved(&self) -> bool {
        self.state.is_some()
    }

    /// Fetch the header and pull the whole object. Does nothing if already
    /// resolved.
    pub async fn resolve(&mut self) -> Result<(), ClientError> {
        if self.state.is_some() {
            return Ok(());
        }
        let conn = self.registry.connection_for(self.uid)?;
        check_size(&conn, self.uid, self.size)?;
        let header = conn.get_header(self.uid).await?;
        let local = conn.register_buffer(self.size)?;
        let data = match conn.read(local, header.remote, self.size).await {
            Ok(data) => data,
            Err(e) => {
                if let Err(dereg) = conn.deregister_buffer(local) {
                    warn!(uid = %self.uid, error = %dereg, "failed to release buffer");
                }
                return Err(e);
            }
        };
        debug!(uid = %self.uid, remote = %header.remote, "resolved remote object");
        self.state = Some(Resolved {
            conn,
            header,
            local,
            buf: data.to_vec(),
        });
        Ok(())
    }

    async fn resolved(&mut self) -> Result<&mut Resolved, ClientError> {
        self.resolve().await?;
        self.state.as_mut().ok_or(ClientError::ObjectNotFound(self.uid))
    }

    /// The cached bytes, resolving first if needed.
    pub async fn get(&mut self) -> Result<&[u8], ClientError> {
        Ok(self.resolved().await?.buf.as_slice())
    }

    /// The cached bytes for modification, resolving first if needed.
    /// Changes reach the remote copy on [`RemoteObject::push_range`], close
    /// or drop.
    pub async fn get_mut(&mut self) -> Result<&mut [u8], ClientError> {
        Ok(self.resolved().await?.buf.as_mut_slice())
    }

    fn check_range(&self, lo: usize, hi: usize) -> Result<(), ClientError> {
        if lo > hi || hi > self.size {
            return Err(ClientError::RangeOutOfBounds {
                lo,
                hi,
                size: self.size,
            });
        }
        Ok(())
    }

    /// Refresh `lo..hi` of the cache from the remote copy.
    pub async fn pull_range(&mut self, lo: usize, hi: usize) -> Result<(), ClientError> {
        self.check_range(lo, hi)?;
        let state = self.resolved().await?;
        if lo == hi {
            return Ok(());
        }
        let data = state
            .conn
            .read(state.local, state.header.remote.offset(lo as u64), hi - lo)
            .await?;
        state.buf[lo..hi].copy_from_slice(&data);
        Ok(())
    }

    /// Write `lo..hi` of the cache to the remote copy.
    pub async fn push_range(&mut self, lo: usize, hi: usize) -> Result<(), ClientError> {
        self.check_range(lo, hi)?;
        let state = self.resolved().await?;
        if lo == hi {
            return Ok(());
        }
        let data = Bytes::copy_from_slice(&state.buf[lo..hi]);
        state
            .conn
            .write(state.local, data, state.header.remote.offset(lo as u64))
            .await
    }

    /// The header, once resolved.
    pub fn header(&self) -> Option<ObjectHeader> {
        self.state.as_ref().map(|s| s.header)
    }

    /// The lock guarding this object, once resolved.
    pub fn lock_identity(&self) -> Option<LockIdentity> {
        self.state.as_ref().map(|s| s.header.lock)
    }

    /// The connection to the owning host, once resolved.
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.state.as_ref().map(|s| &s.conn)
    }

    /// Write the whole object back and release the handle.
    pub async fn close(mut self) -> Result<(), ClientError> {
        if self.state.is_none() {
            return Ok(());
        }
        let result = self.push_range(0, self.size).await;
        if let Some(state) = self.state.take() {
            state.conn.deregister_buffer(state.local)?;
        }
        result
    }
}

/// A handle covers at most one pool slot.
fn check_size(conn: &Connection, uid: Uid, size: usize) -> Result<(), ClientError> {
    let object_size = conn.config().object_size;
    if size > object_size {
        return Err(ClientError::ObjectTooLarge {
            uid,
            size,
            object_size,
        });
    }
    Ok(())
}

impl Drop for RemoteObject {
    fn drop(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        let data = Bytes::from(state.buf);
        if let Err(e) = state
            .conn
            .write_detached(state.local, data, state.header.remote)
        {
            warn!(uid = %self.uid, error = %e, "write-back on drop failed");
        }
        if let Err(e) = state.conn.deregister_buffer(state.local) {
            warn!(uid = %self.uid, error = %e, "failed to release buffer");
        }
    }
}
