//! Shared test harness for remote object store integration tests.
//!
//! Provides [`LoopbackCluster`]: M hosts on the loopback fabric and N
//! clients, each client connected to every host through one registry.

use std::sync::Arc;

use ros_client::{ClientConfig, Connection, Registry};
use ros_host::{HostAgent, HostConfig, ROOT_OBJECT};
use ros_transport::loopback::{HostMemory, LoopbackConfig, LoopbackHost};
use ros_types::{HostId, LockIdentity, ObjectHeader, Uid};

/// Object size used by every test host.
pub const OBJECT_SIZE: usize = 16 * 1024;

/// Object slots per test host.
pub const CAPACITY: usize = 16;

/// A host agent and the loopback endpoint clients connect to.
pub struct TestHost {
    pub agent: Arc<HostAgent>,
    pub loopback: LoopbackHost,
}

impl TestHost {
    fn new(host_id: HostId) -> Self {
        let memory = Arc::new(HostMemory::new());
        let config = HostConfig {
            host_id,
            cluster_id: 1,
            object_size: OBJECT_SIZE,
            capacity: CAPACITY,
            ..HostConfig::default()
        };
        let agent = Arc::new(HostAgent::new(config, memory.clone()).unwrap());
        let loopback = LoopbackHost::new(memory, agent.clone());
        Self { agent, loopback }
    }

    pub fn host_id(&self) -> HostId {
        self.agent.config().host_id
    }

    pub fn memory(&self) -> &Arc<HostMemory> {
        self.loopback.memory()
    }

    /// Header of `uid` as the host sees it.
    pub fn header(&self, uid: Uid) -> ObjectHeader {
        self.agent
            .object_header(uid)
            .unwrap_or_else(|| panic!("{uid} not allocated on {}", self.host_id()))
    }

    /// The object's bytes, straight from host memory.
    pub fn object_bytes(&self, uid: Uid) -> Vec<u8> {
        self.memory()
            .read(self.header(uid).remote, OBJECT_SIZE)
            .unwrap()
            .to_vec()
    }
}

/// A client: one registry routing to a connection per host.
pub struct TestClient {
    pub registry: Arc<Registry>,
    /// `conns[i]` is the connection to host `i`.
    pub conns: Vec<Arc<Connection>>,
}

impl TestClient {
    /// The connection to host `i`.
    pub fn conn(&self, host: usize) -> &Arc<Connection> {
        &self.conns[host]
    }
}

/// M hosts and N clients on the loopback fabric.
pub struct LoopbackCluster {
    hosts: Vec<TestHost>,
    clients: Vec<TestClient>,
    client_config: ClientConfig,
}

impl LoopbackCluster {
    /// Start `hosts` hosts and connect `clients` clients to all of them.
    pub async fn new(hosts: usize, clients: usize) -> Self {
        Self::with_config(hosts, clients, ClientConfig::default()).await
    }

    /// Like [`LoopbackCluster::new`] with custom client settings. The
    /// object size is always [`OBJECT_SIZE`].
    pub async fn with_config(hosts: usize, clients: usize, config: ClientConfig) -> Self {
        assert!(hosts >= 1, "need at least one host");
        let client_config = ClientConfig {
            object_size: OBJECT_SIZE,
            ..config
        };
        let mut cluster = Self {
            hosts: (0..hosts).map(|i| TestHost::new(host_id(i))).collect(),
            clients: Vec::with_capacity(clients),
            client_config,
        };
        for _ in 0..clients {
            cluster.add_client().await;
        }
        cluster
    }

    /// Connect one more client to every host. Returns its index.
    pub async fn add_client(&mut self) -> usize {
        let index = self.clients.len();
        let registry = Arc::new(Registry::new());
        let mut conns = Vec::with_capacity(self.hosts.len());
        for host in &self.hosts {
            let conn = self.connect(host, index);
            let announced = registry.attach(conn.clone()).await.unwrap();
            assert_eq!(announced, host.host_id());
            conns.push(conn);
        }
        self.clients.push(TestClient { registry, conns });
        index
    }

    /// Open a fresh connection from client `client` to host `host`,
    /// without registering it anywhere.
    pub async fn reconnect(&self, client: usize, host: usize) -> Arc<Connection> {
        let conn = self.connect(&self.hosts[host], client);
        conn.await_announce().await.unwrap();
        conn
    }

    fn connect(&self, host: &TestHost, client: usize) -> Arc<Connection> {
        let (transport, queues) = host.loopback.connect(LoopbackConfig::default());
        let local = HostId::from_raw(0x1000 + client as u32);
        Connection::establish(Arc::new(transport), queues, local, self.client_config).unwrap()
    }

    pub fn host(&self, i: usize) -> &TestHost {
        &self.hosts[i]
    }

    pub fn client(&self, i: usize) -> &TestClient {
        &self.clients[i]
    }

    pub fn clients(&self) -> &[TestClient] {
        &self.clients
    }

    /// Uid of object `local` on host `host`.
    pub fn uid(&self, host: usize, local: u32) -> Uid {
        Uid::new(self.hosts[host].host_id(), local)
    }

    /// The lock guarding host `host`'s root object.
    pub fn root_lock(&self, host: usize) -> LockIdentity {
        self.hosts[host].header(self.uid(host, ROOT_OBJECT)).lock
    }

    /// Shut every client connection down.
    pub async fn shutdown(&self) {
        for client in &self.clients {
            for conn in &client.conns {
                conn.shutdown().await;
            }
        }
    }
}

/// Id of the `i`th test host.
pub fn host_id(i: usize) -> HostId {
    HostId::from_raw(0x0a00_0000 + i as u32)
}

/// Generate deterministic, non-repeating test data.
pub fn test_data(size: usize) -> Vec<u8> {
    test_data_seeded(size, 0xDEAD_BEEF)
}

/// Generate test data with a specific seed (for unique objects).
pub fn test_data_seeded(size: usize, seed: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    let mut state: u32 = seed;
    for _ in 0..size {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        data.push((state >> 16) as u8);
    }
    data
}
