//! Shared types and identifiers for the remote object store.
//!
//! This crate defines the identifiers every other crate agrees on:
//! hosts ([`HostId`]), objects ([`Uid`]), in-flight requests ([`RequestId`]),
//! remotely addressable memory ([`RemoteAddr`], [`LocalKey`]) and lock words
//! ([`LockIdentity`]), plus the protocol constants shared by both ends of a
//! connection.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Protocol constants
// ---------------------------------------------------------------------------

/// Size of a page, and the default size of a remote object.
pub const PAGE_SIZE: usize = 4096;

/// Cache line size. Message buffers are aligned to this boundary because
/// they are the source of zero-copy inline sends.
pub const CACHE_LINE_SIZE: usize = 64;

/// Wire protocol version carried in every message header.
pub const PROTOCOL_VERSION: u8 = 0;

/// Multicast group on which hosts announce their object pool.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 123, 45);

/// UDP port of the announce multicast group.
pub const MULTICAST_PORT: u16 = 9002;

/// Hard upper bound on requests in flight on one connection.
///
/// Request ids are 16 bits and wrap. Keeping fewer than 2^16 requests
/// outstanding guarantees a freshly allocated id never collides with a
/// live one.
pub const MAX_REQUESTS_IN_FLIGHT: usize = u16::MAX as usize;

/// Request id reserved for the unsolicited ANNOUNCE pushed on connect.
pub const ANNOUNCE_REQUEST_ID: RequestId = RequestId(0);

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident($inner:ty), $width:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name($inner);

        impl $name {
            /// Wrap a raw integer value. Usable in constants.
            pub const fn from_raw(v: $inner) -> Self {
                Self(v)
            }

            /// Return the raw integer value.
            pub const fn get(self) -> $inner {
                self.0
            }
        }

        impl From<$inner> for $name {
            fn from(v: $inner) -> Self {
                Self(v)
            }
        }

        impl From<$name> for $inner {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!("{:0", $width, "x}"), self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }
    };
}

define_id!(
    /// Identifier of a host in the cluster. Carried in every message header
    /// and in the high 32 bits of every [`Uid`] the host owns.
    HostId(u32),
    8
);

define_id!(
    /// Globally unique object identifier.
    ///
    /// The high 32 bits name the owning host; the low 32 bits are local to
    /// that host's pool.
    Uid(u64),
    16
);

define_id!(
    /// Per-connection request identifier. Allocated in send order and echoed
    /// back by the peer so a completion can be matched to its issuer.
    RequestId(u16),
    4
);

define_id!(
    /// Opaque key returned by local memory registration, authorizing the
    /// transport to use a local buffer.
    LocalKey(u32),
    8
);

impl Uid {
    /// Build a uid from its owning host and the host-local object number.
    pub const fn new(host: HostId, local: u32) -> Self {
        Self(((host.0 as u64) << 32) | local as u64)
    }

    /// The host owning this object.
    pub const fn host_id(self) -> HostId {
        HostId((self.0 >> 32) as u32)
    }

    /// The host-local part of the uid.
    pub const fn local_id(self) -> u32 {
        self.0 as u32
    }
}

impl RequestId {
    /// The id following this one, wrapping at 2^16.
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

// ---------------------------------------------------------------------------
// Remote memory
// ---------------------------------------------------------------------------

/// A remotely addressable location: an address inside a registered region
/// together with the access key (rkey) authorizing remote access to it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteAddr {
    /// Address inside the peer's registered memory.
    pub addr: u64,
    /// Remote access key of the region containing `addr`.
    pub rkey: u32,
}

impl RemoteAddr {
    /// Create a remote address.
    pub const fn new(addr: u64, rkey: u32) -> Self {
        Self { addr, rkey }
    }

    /// The same region, `bytes` further in.
    pub const fn offset(self, bytes: u64) -> Self {
        Self {
            addr: self.addr + bytes,
            rkey: self.rkey,
        }
    }
}

impl fmt::Debug for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteAddr({:#x}, rkey={:#x})", self.addr, self.rkey)
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}/{:#x}", self.addr, self.rkey)
    }
}

/// Identity of a remote lock: the address of the lock word and the key
/// authorizing remote access to it.
///
/// The authoritative lock state is the word at `lock_id` in the owning
/// host's memory; any local flag is only a cache of it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockIdentity {
    /// Remote address of the lock word.
    pub lock_id: u64,
    /// Access key of the lock word's region.
    pub lock_key: u32,
}

impl LockIdentity {
    /// Create a lock identity.
    pub const fn new(lock_id: u64, lock_key: u32) -> Self {
        Self { lock_id, lock_key }
    }

    /// The lock word as a remote address, for atomic operations.
    pub const fn remote(self) -> RemoteAddr {
        RemoteAddr::new(self.lock_id, self.lock_key)
    }
}

impl fmt::Debug for LockIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LockIdentity({:#x}, key={:#x})",
            self.lock_id, self.lock_key
        )
    }
}

impl fmt::Display for LockIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}/{:#x}", self.lock_id, self.lock_key)
    }
}

/// Header of a remote object as reported by its owning host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectHeader {
    /// The object's uid.
    pub uid: Uid,
    /// Where the object's bytes live.
    pub remote: RemoteAddr,
    /// The lock word guarding the object.
    pub lock: LockIdentity,
}
