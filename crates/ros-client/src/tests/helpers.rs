//! Shared test utilities for ros-client tests.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use ros_host::{HostAgent, HostConfig};
use ros_transport::loopback::{
    HostMemory, LoopbackConfig, LoopbackHost, RequestHandler, Responder,
};
use ros_transport::{
    AccessFlags, Completion, CompletionQueues, SendFlags, Transport, TransportError,
};
use ros_types::{HostId, LocalKey, LockIdentity, RemoteAddr};
use tokio::sync::mpsc;

use crate::{ClientConfig, Connection, Registry};

pub const HOST: HostId = HostId::from_raw(0x0000_0042);
pub const CLIENT: HostId = HostId::from_raw(0x0000_0001);
pub const OBJECT_SIZE: usize = 512;

/// Generate deterministic, non-repeating test data.
pub fn test_data(size: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    let mut state: u32 = 0xDEAD_BEEF;
    for _ in 0..size {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        data.push((state >> 16) as u8);
    }
    data
}

pub fn client_config() -> ClientConfig {
    ClientConfig {
        object_size: OBJECT_SIZE,
        ..ClientConfig::default()
    }
}

/// A host agent reachable over loopback.
pub struct TestHost {
    pub agent: Arc<HostAgent>,
    pub loopback: LoopbackHost,
}

impl TestHost {
    pub fn new() -> Self {
        let memory = Arc::new(HostMemory::new());
        let config = HostConfig {
            host_id: HOST,
            object_size: OBJECT_SIZE,
            capacity: 16,
            ..HostConfig::default()
        };
        let agent = Arc::new(HostAgent::new(config, memory.clone()).unwrap());
        let loopback = LoopbackHost::new(memory, agent.clone());
        Self { agent, loopback }
    }

    pub fn memory(&self) -> &Arc<HostMemory> {
        self.loopback.memory()
    }

    /// Connect without waiting for the announce.
    pub fn establish(&self, config: ClientConfig) -> Arc<Connection> {
        let (transport, queues) = self.loopback.connect(LoopbackConfig::default());
        Connection::establish(Arc::new(transport), queues, CLIENT, config).unwrap()
    }

    /// Connect, wait for the announce and register the connection.
    pub async fn client(&self) -> (Arc<Registry>, Arc<Connection>) {
        let conn = self.establish(client_config());
        let registry = Arc::new(Registry::new());
        registry.attach(conn.clone()).await.unwrap();
        (registry, conn)
    }

    /// The lock guarding the root object.
    pub fn root_lock(&self) -> LockIdentity {
        self.agent
            .object_header(ros_types::Uid::new(HOST, ros_host::ROOT_OBJECT))
            .unwrap()
            .lock
    }
}

/// A host that never answers anything, not even with an announce.
pub struct SilentHandler;

impl RequestHandler for SilentHandler {
    fn on_connect(&self, _responder: Responder) {}

    fn on_message(&self, _payload: Bytes, _responder: Responder) {}
}

pub fn silent_connection(config: ClientConfig) -> Arc<Connection> {
    let host = LoopbackHost::new(Arc::new(HostMemory::new()), Arc::new(SilentHandler));
    let (transport, queues) = host.connect(LoopbackConfig::default());
    Connection::establish(Arc::new(transport), queues, CLIENT, config).unwrap()
}

/// A transport that accepts every post and never completes anything on
/// its own. Tests inject completions through the returned senders.
#[derive(Default)]
pub struct ScriptedTransport {
    pub receives: Mutex<Vec<u64>>,
    pub sends: Mutex<Vec<u64>>,
}

pub struct Injector {
    pub send: mpsc::UnboundedSender<Completion>,
    pub recv: mpsc::UnboundedSender<Completion>,
}

pub fn scripted() -> (Arc<ScriptedTransport>, CompletionQueues, Injector) {
    let (send_tx, send_rx) = mpsc::unbounded_channel();
    let (recv_tx, recv_rx) = mpsc::unbounded_channel();
    (
        Arc::new(ScriptedTransport::default()),
        CompletionQueues {
            send: send_rx,
            recv: recv_rx,
        },
        Injector {
            send: send_tx,
            recv: recv_tx,
        },
    )
}

impl Transport for ScriptedTransport {
    fn post_send(&self, wr_id: u64, _payload: Bytes, _flags: SendFlags) -> Result<(), TransportError> {
        self.sends.lock().unwrap().push(wr_id);
        Ok(())
    }

    fn post_receive(&self, wr_id: u64, _len: usize) -> Result<(), TransportError> {
        self.receives.lock().unwrap().push(wr_id);
        Ok(())
    }

    fn post_read(
        &self,
        wr_id: u64,
        _local: LocalKey,
        _remote: RemoteAddr,
        _len: usize,
    ) -> Result<(), TransportError> {
        self.sends.lock().unwrap().push(wr_id);
        Ok(())
    }

    fn post_write(
        &self,
        wr_id: u64,
        _local: LocalKey,
        _data: Bytes,
        _remote: RemoteAddr,
        _flags: SendFlags,
    ) -> Result<(), TransportError> {
        self.sends.lock().unwrap().push(wr_id);
        Ok(())
    }

    fn post_atomic_cas(
        &self,
        wr_id: u64,
        _remote: RemoteAddr,
        _compare: u64,
        _swap: u64,
    ) -> Result<(), TransportError> {
        self.sends.lock().unwrap().push(wr_id);
        Ok(())
    }

    fn post_remote_lock(&self, wr_id: u64, _lock: LockIdentity) -> Result<(), TransportError> {
        self.sends.lock().unwrap().push(wr_id);
        Ok(())
    }

    fn post_remote_unlock(&self, wr_id: u64, _lock: LockIdentity) -> Result<(), TransportError> {
        self.sends.lock().unwrap().push(wr_id);
        Ok(())
    }

    fn register_memory(&self, _len: usize, _access: AccessFlags) -> Result<LocalKey, TransportError> {
        Ok(LocalKey::from_raw(1))
    }

    fn deregister_memory(&self, _key: LocalKey) -> Result<(), TransportError> {
        Ok(())
    }

    fn disconnect(&self) {}
}
