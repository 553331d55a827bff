//! Integration test: connection teardown.
//!
//! Tearing a connection down must fail everything still waiting on it,
//! leave the host's lock state usable by the remaining clients, and let the
//! client reconnect.

use std::time::Duration;

use ros_client::{ClientError, LockKind, RemoteObject, new_lock};
use ros_host::ROOT_OBJECT;
use ros_integration_tests::{LoopbackCluster, OBJECT_SIZE, test_data};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_fails_every_waiting_operation() {
    let c = LoopbackCluster::new(1, 2).await;
    let lock_id = c.root_lock(0);
    let agent = c.host(0).agent.clone();

    // Client 0 holds the lock both on the host and in the lock word.
    let rpc_holder = new_lock(LockKind::Queue, c.client(0).conn(0).clone(), lock_id);
    let word_holder = new_lock(LockKind::Atomic, c.client(0).conn(0).clone(), lock_id);
    rpc_holder.lock().await.unwrap();
    word_holder.lock().await.unwrap();

    // Client 1 blocks on both mechanisms.
    let conn = c.client(1).conn(0).clone();
    let mut waiting = Vec::new();
    for kind in [LockKind::Queue, LockKind::Queue, LockKind::Queue, LockKind::Accelerated] {
        let lock = new_lock(kind, conn.clone(), lock_id);
        waiting.push(tokio::spawn(async move { lock.lock().await }));
    }
    while agent.lock_state(lock_id.lock_id).waiters < 3 || conn.in_flight() < 4 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    conn.shutdown().await;
    assert!(conn.is_closed());
    for task in waiting {
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("waiter not failed by shutdown")
            .unwrap();
        assert_eq!(result, Err(ClientError::ConnectionClosed));
    }
    assert_eq!(conn.in_flight(), 0);

    // The dead waiters are skipped when the holder lets go.
    rpc_holder.unlock().await;
    word_holder.unlock().await;
    let state = agent.lock_state(lock_id.lock_id);
    assert!(!state.held);
    assert_eq!(state.waiters, 0);
    assert_eq!(c.host(0).memory().read_word(lock_id.remote()).unwrap(), 0);
}

#[tokio::test]
async fn test_operations_after_shutdown_fail_fast() {
    let c = LoopbackCluster::new(1, 1).await;
    let uid = c.uid(0, 2);
    let conn = c.client(0).conn(0).clone();

    let mut object = RemoteObject::create(c.client(0).registry.clone(), uid, OBJECT_SIZE)
        .await
        .unwrap();
    object.get_mut().await.unwrap().fill(1);

    conn.shutdown().await;

    assert_eq!(
        conn.get_header(uid).await.unwrap_err(),
        ClientError::ConnectionClosed
    );
    assert_eq!(conn.alloc(c.uid(0, 3)).await.unwrap_err(), ClientError::ConnectionClosed);
    assert_eq!(
        object.push_range(0, 16).await.unwrap_err(),
        ClientError::ConnectionClosed
    );
    // The cached bytes are still there; the write-back on drop only logs.
    assert!(object.get().await.unwrap().iter().all(|&b| b == 1));
    drop(object);

    assert!(c.host(0).object_bytes(uid).iter().all(|&b| b == 0));
    assert_eq!(conn.in_flight(), 0);
}

#[tokio::test]
async fn test_reconnect_replaces_closed_connection() {
    let c = LoopbackCluster::new(2, 1).await;
    let client = c.client(0);
    let uid = c.uid(0, 2);
    let data = test_data(OBJECT_SIZE);

    let mut object = RemoteObject::create(client.registry.clone(), uid, OBJECT_SIZE)
        .await
        .unwrap();
    object.get_mut().await.unwrap().copy_from_slice(&data);
    object.close().await.unwrap();

    client.conn(0).shutdown().await;
    let mut stale = RemoteObject::new(client.registry.clone(), uid, OBJECT_SIZE);
    assert_eq!(stale.resolve().await.unwrap_err(), ClientError::ConnectionClosed);
    assert!(!stale.is_resolved());

    // The other host is unaffected.
    client
        .conn(1)
        .get_header(c.uid(1, ROOT_OBJECT))
        .await
        .unwrap();

    let fresh = c.reconnect(0, 0).await;
    assert_eq!(
        client.registry.attach(fresh.clone()).await.unwrap(),
        c.host(0).host_id()
    );
    assert!(!fresh.is_closed());

    let mut object = RemoteObject::new(client.registry.clone(), uid, OBJECT_SIZE);
    assert_eq!(object.get().await.unwrap(), data.as_slice());
    assert!(std::sync::Arc::ptr_eq(object.connection().unwrap(), &fresh));
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let c = LoopbackCluster::new(1, 2).await;
    c.shutdown().await;
    c.shutdown().await;
    for client in c.clients() {
        assert!(client.conn(0).is_closed());
        assert_eq!(client.conn(0).in_flight(), 0);
    }
}
