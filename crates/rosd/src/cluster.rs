//! An in-process cluster: one host agent on the loopback fabric and a set
//! of clients, each with its own connection and registry.

use std::sync::Arc;

use anyhow::{Context, Result};
use ros_client::{ClientConfig, Connection, Registry};
use ros_host::{HostAgent, HostConfig};
use ros_transport::loopback::{HostMemory, LoopbackConfig, LoopbackHost};
use ros_types::HostId;
use tracing::info;

/// One client: its connection to the host and the registry routing to it.
pub struct Client {
    pub registry: Arc<Registry>,
    pub conn: Arc<Connection>,
}

pub struct LocalCluster {
    agent: Arc<HostAgent>,
    clients: Vec<Client>,
}

impl LocalCluster {
    /// Start the host and connect `clients` clients to it. Returns once
    /// every client has received the host's announce.
    pub async fn start(
        host_config: HostConfig,
        client_config: ClientConfig,
        clients: usize,
    ) -> Result<Self> {
        let memory = Arc::new(HostMemory::new());
        let agent = Arc::new(
            HostAgent::new(host_config, memory.clone()).context("failed to start host agent")?,
        );
        let host = LoopbackHost::new(memory, agent.clone());

        let mut connected = Vec::with_capacity(clients);
        for i in 0..clients {
            let (transport, queues) = host.connect(LoopbackConfig::default());
            let local = HostId::from(i as u32 + 1);
            let conn = Connection::establish(Arc::new(transport), queues, local, client_config)
                .with_context(|| format!("client {i} failed to connect"))?;
            let registry = Arc::new(Registry::new());
            registry
                .attach(conn.clone())
                .await
                .with_context(|| format!("client {i} got no announce"))?;
            connected.push(Client { registry, conn });
        }

        info!(
            host_id = %host_config.host_id,
            clients,
            object_size = host_config.object_size,
            "local cluster up"
        );
        Ok(Self {
            agent,
            clients: connected,
        })
    }

    pub fn host_id(&self) -> HostId {
        self.agent.config().host_id
    }

    pub fn object_size(&self) -> usize {
        self.agent.config().object_size
    }

    pub fn agent(&self) -> &Arc<HostAgent> {
        &self.agent
    }

    pub fn clients(&self) -> &[Client] {
        &self.clients
    }

    /// Client `i`.
    pub fn client(&self, i: usize) -> Result<&Client> {
        self.clients
            .get(i)
            .with_context(|| format!("cluster has {} clients", self.clients.len()))
    }

    /// Tear every connection down.
    pub async fn shutdown(self) {
        for client in &self.clients {
            client.conn.shutdown().await;
        }
        info!(clients = self.clients.len(), "local cluster stopped");
    }
}
