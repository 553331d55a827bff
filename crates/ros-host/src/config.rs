//! Host configuration.

use std::net::Ipv4Addr;

use ros_types::{HostId, PAGE_SIZE};

/// Settings of one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostConfig {
    /// This host's id; the high 32 bits of every uid it owns.
    pub host_id: HostId,
    /// Cluster the host announces itself in.
    pub cluster_id: u64,
    /// Address announced for remote memory access.
    pub rdma_ipv4_addr: Ipv4Addr,
    /// Size of every object in the pool.
    pub object_size: usize,
    /// Number of object slots.
    pub capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host_id: HostId::from_raw(0x1234_5678),
            cluster_id: 0,
            rdma_ipv4_addr: Ipv4Addr::LOCALHOST,
            object_size: PAGE_SIZE,
            capacity: 64,
        }
    }
}
