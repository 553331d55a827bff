//! TOML configuration for the rosd daemon.
//!
//! Every section is optional. Without a config file the daemon runs with
//! the same defaults as the library configs.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use anyhow::anyhow;
use ros_client::{ClientConfig, LockKind};
use ros_host::HostConfig;
use ros_types::{HostId, PAGE_SIZE};
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Host identity and announced address.
    pub node: NodeSection,
    /// Object pool geometry.
    pub pool: PoolSection,
    /// Per-connection client settings.
    pub client: ClientSection,
    /// Workload run by `rosd demo`.
    pub demo: DemoSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Host id; the high 32 bits of every uid the host owns.
    pub host_id: u32,
    /// Cluster announced to clients.
    pub cluster_id: u64,
    /// Address announced for remote memory access.
    pub rdma_ipv4_addr: Ipv4Addr,
}

impl Default for NodeSection {
    fn default() -> Self {
        let host = HostConfig::default();
        Self {
            host_id: host.host_id.get(),
            cluster_id: host.cluster_id,
            rdma_ipv4_addr: host.rdma_ipv4_addr,
        }
    }
}

/// `[pool]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    /// Size of every object in bytes.
    pub object_size: usize,
    /// Number of object slots.
    pub capacity: usize,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            object_size: PAGE_SIZE,
            capacity: 64,
        }
    }
}

/// `[client]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// Requests allowed in flight per connection.
    pub max_in_flight: usize,
    /// Receive buffers kept posted per connection.
    pub receive_depth: usize,
    /// Fail requests not answered within this many milliseconds. Unset
    /// waits until the connection is torn down.
    pub request_timeout_ms: Option<u64>,
}

impl Default for ClientSection {
    fn default() -> Self {
        let client = ClientConfig::default();
        Self {
            max_in_flight: client.max_in_flight,
            receive_depth: client.receive_depth,
            request_timeout_ms: None,
        }
    }
}

/// `[demo]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DemoSection {
    /// Concurrent clients, each on its own connection.
    pub clients: usize,
    /// Critical sections entered by every client per lock kind.
    pub iterations: usize,
    /// Lock protocols to exercise, by name.
    pub lock_kinds: Vec<String>,
    /// Degree of the demo B-tree.
    pub tree_degree: usize,
    /// Keys inserted into the demo B-tree.
    pub tree_count: u32,
}

impl Default for DemoSection {
    fn default() -> Self {
        Self {
            clients: 4,
            iterations: 50,
            lock_kinds: LockKind::ALL.iter().map(|k| k.to_string()).collect(),
            tree_degree: 6,
            tree_count: 64,
        }
    }
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. "info", "debug", "ros_client=trace").
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if `path` is `None`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let contents = std::fs::read_to_string(p)?;
                let config: CliConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (for testing).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Settings of the in-process host.
    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            host_id: HostId::from(self.node.host_id),
            cluster_id: self.node.cluster_id,
            rdma_ipv4_addr: self.node.rdma_ipv4_addr,
            object_size: self.pool.object_size,
            capacity: self.pool.capacity,
        }
    }

    /// Settings of every client connection.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            max_in_flight: self.client.max_in_flight,
            receive_depth: self.client.receive_depth,
            object_size: self.pool.object_size,
            request_timeout: self.client.request_timeout_ms.map(Duration::from_millis),
        }
    }

    /// The demo's lock kinds, parsed.
    pub fn lock_kinds(&self) -> anyhow::Result<Vec<LockKind>> {
        self.demo
            .lock_kinds
            .iter()
            .map(|name| name.parse::<LockKind>().map_err(|e| anyhow!(e)))
            .collect()
    }
}
