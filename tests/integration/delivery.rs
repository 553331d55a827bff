//! Integration test: completion delivery.
//!
//! Many operations share one connection. Each must be resolved exactly
//! once with its own result and request ids must survive wrapping. A lock
//! granted to a request that already timed out is released again instead
//! of being stranded.

use std::sync::Arc;
use std::time::Duration;

use ros_client::{ClientConfig, ClientError, LockKind, RemoteObject, new_lock};
use ros_integration_tests::{LoopbackCluster, OBJECT_SIZE, test_data};
use ros_host::ROOT_OBJECT;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reads_each_get_their_own_bytes() {
    let c = LoopbackCluster::new(1, 1).await;
    let uid = c.uid(0, 2);
    let data = test_data(OBJECT_SIZE);
    let mut object = RemoteObject::create(c.client(0).registry.clone(), uid, OBJECT_SIZE)
        .await
        .unwrap();
    object.get_mut().await.unwrap().copy_from_slice(&data);
    let header = object.header().unwrap();
    object.close().await.unwrap();

    let conn = c.client(0).conn(0).clone();
    let local = conn.register_buffer(OBJECT_SIZE).unwrap();
    let data = Arc::new(data);

    let mut tasks = Vec::new();
    for i in 0..256usize {
        let conn = conn.clone();
        let data = data.clone();
        tasks.push(tokio::spawn(async move {
            let offset = (i * 61) % (OBJECT_SIZE - 64);
            let len = 1 + i % 64;
            let got = conn
                .read(local, header.remote.offset(offset as u64), len)
                .await
                .unwrap();
            assert_eq!(&got[..], &data[offset..offset + len], "read {i}");
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(conn.in_flight(), 0);
    conn.deregister_buffer(local).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_rpcs_match_their_answers() {
    let c = LoopbackCluster::new(1, 1).await;
    let conn = c.client(0).conn(0).clone();

    for local in 2..10 {
        conn.alloc(c.uid(0, local)).await.unwrap();
    }

    let mut tasks = Vec::new();
    for round in 0..20 {
        for local in 2..10u32 {
            let conn = conn.clone();
            let uid = c.uid(0, local);
            let expected = c.host(0).header(uid);
            tasks.push(tokio::spawn(async move {
                let header = conn.get_header(uid).await.unwrap();
                assert_eq!(header, expected, "round {round}");
            }));
        }
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(conn.in_flight(), 0);
}

#[tokio::test]
async fn test_request_ids_wrap_without_collision() {
    let c = LoopbackCluster::new(1, 1).await;
    let conn = c.client(0).conn(0);
    let lock = c.root_lock(0);

    // More operations than there are request ids. A compare that never
    // matches leaves the word alone and returns it.
    for _ in 0..(u16::MAX as usize + 500) {
        assert_eq!(conn.compare_and_swap(lock.remote(), 7, 9).await.unwrap(), 0);
    }
    let header = conn.get_header(c.uid(0, ROOT_OBJECT)).await.unwrap();
    assert_eq!(header.lock, lock);
    assert_eq!(conn.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lock_granted_after_timeout_is_given_back() {
    let config = ClientConfig {
        request_timeout: Some(Duration::from_millis(100)),
        ..ClientConfig::default()
    };
    let c = LoopbackCluster::with_config(1, 2, config).await;
    let lock_id = c.root_lock(0);
    let agent = c.host(0).agent.clone();

    let holder = new_lock(LockKind::Queue, c.client(0).conn(0).clone(), lock_id);
    holder.lock().await.unwrap();

    // The host queues this request and answers only after the holder
    // unlocks, long after the waiter gave up.
    let late_conn = c.client(1).conn(0).clone();
    let late = new_lock(LockKind::Queue, late_conn.clone(), lock_id);
    let err = late.lock().await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)), "{err}");
    assert!(!late.is_held());
    assert_eq!(late_conn.in_flight(), 1);
    assert_eq!(agent.lock_state(lock_id.lock_id).waiters, 1);

    // The grant reaches the abandoned request, which hands the lock back.
    holder.unlock().await;
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let state = agent.lock_state(lock_id.lock_id);
            if !state.held && state.waiters == 0 && late_conn.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("late grant was never released");

    let next = new_lock(LockKind::Queue, c.client(0).conn(0).clone(), lock_id);
    next.lock().await.unwrap();
    next.unlock().await;

    // The connection still matches new answers correctly.
    for _ in 0..10 {
        let header = late_conn.get_header(c.uid(0, ROOT_OBJECT)).await.unwrap();
        assert_eq!(header.lock, lock_id);
    }
    assert!(!late_conn.is_closed());
    assert_eq!(late_conn.in_flight(), 0);
}

#[tokio::test]
async fn test_in_flight_bound_enforced_per_connection() {
    let config = ClientConfig {
        max_in_flight: 2,
        ..ClientConfig::default()
    };
    let c = LoopbackCluster::with_config(1, 2, config).await;
    let lock_id = c.root_lock(0);
    let agent = c.host(0).agent.clone();

    let holder = new_lock(LockKind::Queue, c.client(0).conn(0).clone(), lock_id);
    holder.lock().await.unwrap();

    // Two queued lock requests fill client 1's connection.
    let conn = c.client(1).conn(0).clone();
    let mut waiters = Vec::new();
    for _ in 0..2 {
        let lock = new_lock(LockKind::Queue, conn.clone(), lock_id);
        waiters.push(tokio::spawn(async move {
            lock.lock().await.unwrap();
            lock.unlock().await;
        }));
    }
    while agent.lock_state(lock_id.lock_id).waiters < 2 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(conn.in_flight(), 2);
    assert!(matches!(
        conn.get_header(c.uid(0, ROOT_OBJECT)).await,
        Err(ClientError::RequestIdsExhausted { in_flight: 2 })
    ));

    // Client 0 is unaffected.
    c.client(0)
        .conn(0)
        .get_header(c.uid(0, ROOT_OBJECT))
        .await
        .unwrap();

    holder.unlock().await;
    for waiter in waiters {
        waiter.await.unwrap();
    }
    assert_eq!(conn.in_flight(), 0);
}
