//! Message layout, encoding and decoding.

use std::fmt;
use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes};
use ros_types::{HostId, LockIdentity, PROTOCOL_VERSION, RemoteAddr, RequestId, Uid};

use crate::error::WireError;

/// Length of the fixed message header.
pub const HEADER_LEN: usize = 8;

/// Length of the largest message body plus header.
pub const MAX_MESSAGE_LEN: usize = 40;

/// `LOCK_RESP` status: the lock was granted (or released, for unlock).
pub const LOCK_STATUS_ACQUIRED: u32 = 0;

/// `LOCK_RESP` status: the lock is held by someone else (or, for unlock,
/// was not held).
pub const LOCK_STATUS_BUSY: u32 = 1;

/// One-byte operation codes. Values are stable across the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    QueryServers = 0,
    Announce = 1,
    GetHdrReq = 2,
    GetHdrResp = 3,
    AllocReq = 4,
    AllocResp = 5,
    FreeReq = 6,
    FreeResp = 7,
    LockPollReq = 8,
    LockQueueReq = 9,
    UnlockReq = 10,
    LockResp = 11,
}

impl Opcode {
    /// Total encoded length (header included) of a message with this opcode.
    pub const fn wire_len(self) -> usize {
        match self {
            Opcode::QueryServers => 24,
            Opcode::Announce => 32,
            Opcode::GetHdrReq | Opcode::AllocReq | Opcode::FreeReq => 16,
            Opcode::GetHdrResp | Opcode::AllocResp => 40,
            Opcode::FreeResp
            | Opcode::LockPollReq
            | Opcode::LockQueueReq
            | Opcode::UnlockReq
            | Opcode::LockResp => 24,
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = WireError;

    fn try_from(v: u8) -> Result<Self, WireError> {
        Ok(match v {
            0 => Opcode::QueryServers,
            1 => Opcode::Announce,
            2 => Opcode::GetHdrReq,
            3 => Opcode::GetHdrResp,
            4 => Opcode::AllocReq,
            5 => Opcode::AllocResp,
            6 => Opcode::FreeReq,
            7 => Opcode::FreeResp,
            8 => Opcode::LockPollReq,
            9 => Opcode::LockQueueReq,
            10 => Opcode::UnlockReq,
            11 => Opcode::LockResp,
            other => return Err(WireError::UnknownOpcode(other)),
        })
    }
}

/// The 8-byte header at the front of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub version: u8,
    pub opcode: Opcode,
    pub req_id: RequestId,
    pub host_id: HostId,
}

/// Read the header of an encoded message without decoding its body.
///
/// The completion path uses this to find the echoed request id.
pub fn peek_header(buf: &[u8]) -> Result<MessageHeader, WireError> {
    if buf.len() < HEADER_LEN {
        return Err(WireError::Truncated {
            opcode: None,
            need: HEADER_LEN,
            have: buf.len(),
        });
    }
    let mut b = buf;
    let version = b.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    let opcode = Opcode::try_from(b.get_u8())?;
    let req_id = RequestId::from(b.get_u16());
    let host_id = HostId::from(b.get_u32());
    Ok(MessageHeader {
        version,
        opcode,
        req_id,
        host_id,
    })
}

/// Opcode-specific message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Body {
    /// Multicast query for hosts serving a cluster.
    QueryServers { cluster_id: u64 },
    /// A host advertising its pool.
    Announce {
        rdma_ipv4_addr: Ipv4Addr,
        cluster_id: u64,
        pool_rkey: u32,
    },
    GetHdrRequest { uid: Uid },
    GetHdrResponse {
        uid: Uid,
        remote: RemoteAddr,
        lock: LockIdentity,
    },
    AllocRequest { uid: Uid },
    /// Allocation result. The object's rkey is the pool rkey from the
    /// owning host's announce.
    AllocResponse {
        status: u32,
        uid: Uid,
        addr: u64,
        lock: LockIdentity,
    },
    FreeRequest { uid: Uid },
    FreeResponse { status: u32, uid: Uid },
    LockPollRequest { lock: LockIdentity },
    LockQueueRequest { lock: LockIdentity },
    UnlockRequest { lock: LockIdentity },
    LockResponse { lock_id: u64, status: u32 },
}

impl Body {
    /// The opcode this body is sent under.
    pub const fn opcode(&self) -> Opcode {
        match self {
            Body::QueryServers { .. } => Opcode::QueryServers,
            Body::Announce { .. } => Opcode::Announce,
            Body::GetHdrRequest { .. } => Opcode::GetHdrReq,
            Body::GetHdrResponse { .. } => Opcode::GetHdrResp,
            Body::AllocRequest { .. } => Opcode::AllocReq,
            Body::AllocResponse { .. } => Opcode::AllocResp,
            Body::FreeRequest { .. } => Opcode::FreeReq,
            Body::FreeResponse { .. } => Opcode::FreeResp,
            Body::LockPollRequest { .. } => Opcode::LockPollReq,
            Body::LockQueueRequest { .. } => Opcode::LockQueueReq,
            Body::UnlockRequest { .. } => Opcode::UnlockReq,
            Body::LockResponse { .. } => Opcode::LockResp,
        }
    }

    fn put(&self, out: &mut impl BufMut) {
        match *self {
            Body::QueryServers { cluster_id } => {
                out.put_u32(0);
                out.put_u32(0);
                out.put_u64(cluster_id);
            }
            Body::Announce {
                rdma_ipv4_addr,
                cluster_id,
                pool_rkey,
            } => {
                out.put_u32(u32::from(rdma_ipv4_addr));
                out.put_u32(0);
                out.put_u64(cluster_id);
                out.put_u32(pool_rkey);
                out.put_u32(0);
            }
            Body::GetHdrRequest { uid } | Body::AllocRequest { uid } | Body::FreeRequest { uid } => {
                out.put_u64(uid.get());
            }
            Body::GetHdrResponse { uid, remote, lock } => {
                out.put_u64(uid.get());
                out.put_u64(remote.addr);
                out.put_u32(remote.rkey);
                out.put_u32(lock.lock_key);
                out.put_u64(lock.lock_id);
            }
            Body::AllocResponse {
                status,
                uid,
                addr,
                lock,
            } => {
                out.put_u32(status);
                out.put_u32(lock.lock_key);
                out.put_u64(uid.get());
                out.put_u64(addr);
                out.put_u64(lock.lock_id);
            }
            Body::FreeResponse { status, uid } => {
                out.put_u32(status);
                out.put_u32(0);
                out.put_u64(uid.get());
            }
            Body::LockPollRequest { lock }
            | Body::LockQueueRequest { lock }
            | Body::UnlockRequest { lock } => {
                out.put_u64(lock.lock_id);
                out.put_u32(lock.lock_key);
                out.put_u32(0);
            }
            Body::LockResponse { lock_id, status } => {
                out.put_u64(lock_id);
                out.put_u32(status);
                out.put_u32(0);
            }
        }
    }

    fn get(opcode: Opcode, mut b: &[u8]) -> Self {
        match opcode {
            Opcode::QueryServers => {
                b.advance(8);
                Body::QueryServers {
                    cluster_id: b.get_u64(),
                }
            }
            Opcode::Announce => {
                let rdma_ipv4_addr = Ipv4Addr::from(b.get_u32());
                b.advance(4);
                let cluster_id = b.get_u64();
                let pool_rkey = b.get_u32();
                Body::Announce {
                    rdma_ipv4_addr,
                    cluster_id,
                    pool_rkey,
                }
            }
            Opcode::GetHdrReq => Body::GetHdrRequest {
                uid: Uid::from(b.get_u64()),
            },
            Opcode::AllocReq => Body::AllocRequest {
                uid: Uid::from(b.get_u64()),
            },
            Opcode::FreeReq => Body::FreeRequest {
                uid: Uid::from(b.get_u64()),
            },
            Opcode::GetHdrResp => {
                let uid = Uid::from(b.get_u64());
                let addr = b.get_u64();
                let rkey = b.get_u32();
                let lock_key = b.get_u32();
                let lock_id = b.get_u64();
                Body::GetHdrResponse {
                    uid,
                    remote: RemoteAddr::new(addr, rkey),
                    lock: LockIdentity::new(lock_id, lock_key),
                }
            }
            Opcode::AllocResp => {
                let status = b.get_u32();
                let lock_key = b.get_u32();
                let uid = Uid::from(b.get_u64());
                let addr = b.get_u64();
                let lock_id = b.get_u64();
                Body::AllocResponse {
                    status,
                    uid,
                    addr,
                    lock: LockIdentity::new(lock_id, lock_key),
                }
            }
            Opcode::FreeResp => {
                let status = b.get_u32();
                b.advance(4);
                Body::FreeResponse {
                    status,
                    uid: Uid::from(b.get_u64()),
                }
            }
            Opcode::LockPollReq | Opcode::LockQueueReq | Opcode::UnlockReq => {
                let lock_id = b.get_u64();
                let lock_key = b.get_u32();
                let lock = LockIdentity::new(lock_id, lock_key);
                match opcode {
                    Opcode::LockPollReq => Body::LockPollRequest { lock },
                    Opcode::LockQueueReq => Body::LockQueueRequest { lock },
                    _ => Body::UnlockRequest { lock },
                }
            }
            Opcode::LockResp => {
                let lock_id = b.get_u64();
                let status = b.get_u32();
                Body::LockResponse { lock_id, status }
            }
        }
    }
}

/// A complete message: header fields plus body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub req_id: RequestId,
    pub host_id: HostId,
    pub body: Body,
}

impl Message {
    /// Create a message.
    pub fn new(req_id: RequestId, host_id: HostId, body: Body) -> Self {
        Self {
            req_id,
            host_id,
            body,
        }
    }

    /// The opcode this message is sent under.
    pub fn opcode(&self) -> Opcode {
        self.body.opcode()
    }

    /// Header as it appears on the wire.
    pub fn header(&self) -> MessageHeader {
        MessageHeader {
            version: PROTOCOL_VERSION,
            opcode: self.opcode(),
            req_id: self.req_id,
            host_id: self.host_id,
        }
    }

    /// Encode into a cache-line aligned buffer.
    pub fn encode(&self) -> MessageBuf {
        let mut buf = MessageBuf::zeroed();
        let len = self.opcode().wire_len();
        {
            let mut out = &mut buf.bytes[..len];
            out.put_u8(PROTOCOL_VERSION);
            out.put_u8(self.opcode() as u8);
            out.put_u16(self.req_id.get());
            out.put_u32(self.host_id.get());
            self.body.put(&mut out);
        }
        buf.len = len as u8;
        buf
    }

    /// Decode a message, validating version, opcode and length.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let header = peek_header(buf)?;
        let need = header.opcode.wire_len();
        if buf.len() < need {
            return Err(WireError::Truncated {
                opcode: Some(header.opcode),
                need,
                have: buf.len(),
            });
        }
        let body = Body::get(header.opcode, &buf[HEADER_LEN..need]);
        Ok(Self {
            req_id: header.req_id,
            host_id: header.host_id,
            body,
        })
    }
}

/// A message buffer aligned on a cache-line boundary.
///
/// Sends are posted inline straight out of this buffer, so it must not
/// straddle more cache lines than necessary.
#[repr(C, align(64))]
#[derive(Clone)]
pub struct MessageBuf {
    bytes: [u8; MAX_MESSAGE_LEN],
    len: u8,
}

impl MessageBuf {
    fn zeroed() -> Self {
        Self {
            bytes: [0; MAX_MESSAGE_LEN],
            len: 0,
        }
    }

    /// The encoded message.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Encoded length in bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the buffer holds no message.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy the encoded message into an owned, reference-counted buffer.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl fmt::Debug for MessageBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBuf")
            .field("len", &self.len)
            .field("bytes", &self.as_bytes())
            .finish()
    }
}
