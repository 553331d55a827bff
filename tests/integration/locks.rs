//! Integration test: remote locks.
//!
//! Several clients increment a counter object under a lock, each on its own
//! connection. Every protocol must keep the counter exact, and protocols
//! sharing a lock mechanism must exclude each other.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ros_client::{LockKind, RemoteLock, RemoteObject, new_lock};
use ros_integration_tests::{LoopbackCluster, OBJECT_SIZE};
use ros_types::Uid;

const COUNTER: u32 = 0x40;

/// Read-modify-write the first 8 bytes of `uid` through a fresh handle.
async fn bump(registry: Arc<ros_client::Registry>, uid: Uid) {
    let mut object = RemoteObject::new(registry, uid, OBJECT_SIZE);
    object.pull_range(0, 8).await.unwrap();
    let bytes = object.get_mut().await.unwrap();
    let value = u64::from_be_bytes(bytes[..8].try_into().unwrap()) + 1;
    bytes[..8].copy_from_slice(&value.to_be_bytes());
    object.close().await.unwrap();
}

fn counter_value(c: &LoopbackCluster, host: usize, uid: Uid) -> u64 {
    let bytes = c.host(host).object_bytes(uid);
    u64::from_be_bytes(bytes[..8].try_into().unwrap())
}

/// Every client runs `iterations` critical sections with the lock kind
/// `kinds[client % kinds.len()]`. Returns the most clients seen inside at
/// once.
async fn run_contention(
    c: &LoopbackCluster,
    host: usize,
    uid: Uid,
    kinds: &[LockKind],
    iterations: usize,
) -> usize {
    let lock_id = c.host(host).header(uid).lock;
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for (i, client) in c.clients().iter().enumerate() {
        let kind = kinds[i % kinds.len()];
        let lock = new_lock(kind, client.conn(host).clone(), lock_id);
        let registry = client.registry.clone();
        let inside = inside.clone();
        let max_inside = max_inside.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..iterations {
                lock.lock().await.unwrap();
                assert!(lock.is_held());
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                bump(registry.clone(), uid).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                lock.unlock().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    max_inside.load(Ordering::SeqCst)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_lock_kind_keeps_counter_exact() {
    let c = LoopbackCluster::new(2, 4).await;

    for (n, kind) in LockKind::ALL.into_iter().enumerate() {
        // Alternate hosts so both pools see traffic.
        let host = n % 2;
        let uid = c.uid(host, COUNTER + n as u32);
        c.client(0).conn(host).alloc(uid).await.unwrap();

        let max_inside = run_contention(&c, host, uid, &[kind], 20).await;
        assert_eq!(max_inside, 1, "{kind} let two clients in");
        assert_eq!(counter_value(&c, host, uid), 80, "{kind} lost increments");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_poll_and_queue_share_the_host_lock() {
    let c = LoopbackCluster::new(1, 4).await;
    let uid = c.uid(0, COUNTER);
    c.client(0).conn(0).alloc(uid).await.unwrap();

    let max_inside = run_contention(&c, 0, uid, &[LockKind::Poll, LockKind::Queue], 25).await;
    assert_eq!(max_inside, 1);
    assert_eq!(counter_value(&c, 0, uid), 100);

    let lock = c.host(0).header(uid).lock;
    let state = c.host(0).agent.lock_state(lock.lock_id);
    assert!(!state.held);
    assert_eq!(state.waiters, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_atomic_and_accelerated_share_the_lock_word() {
    let c = LoopbackCluster::new(1, 4).await;
    let uid = c.uid(0, COUNTER);
    c.client(0).conn(0).alloc(uid).await.unwrap();

    let max_inside =
        run_contention(&c, 0, uid, &[LockKind::Atomic, LockKind::Accelerated], 25).await;
    assert_eq!(max_inside, 1);
    assert_eq!(counter_value(&c, 0, uid), 100);

    // The lock word is back to free.
    let lock = c.host(0).header(uid).lock;
    assert_eq!(c.host(0).memory().read_word(lock.remote()).unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queue_lock_skips_disconnected_waiter() {
    let c = LoopbackCluster::new(1, 3).await;
    let lock_id = c.root_lock(0);
    let agent = c.host(0).agent.clone();

    let holder = new_lock(LockKind::Queue, c.client(0).conn(0).clone(), lock_id);
    holder.lock().await.unwrap();

    // Client 1 queues, then goes away while still waiting.
    let gone = c.client(1).conn(0).clone();
    let gone_lock = new_lock(LockKind::Queue, gone.clone(), lock_id);
    let gone_wait = tokio::spawn(async move { gone_lock.lock().await });
    while agent.lock_state(lock_id.lock_id).waiters < 1 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // Client 2 queues behind it.
    let next = new_lock(LockKind::Queue, c.client(2).conn(0).clone(), lock_id);
    let next = Arc::new(next);
    let next_wait = {
        let next = next.clone();
        tokio::spawn(async move { next.lock().await })
    };
    while agent.lock_state(lock_id.lock_id).waiters < 2 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    gone.shutdown().await;
    assert!(gone_wait.await.unwrap().is_err());

    holder.unlock().await;
    tokio::time::timeout(Duration::from_secs(5), next_wait)
        .await
        .expect("lock never reached the live waiter")
        .unwrap()
        .unwrap();
    assert!(next.is_held());

    let state = agent.lock_state(lock_id.lock_id);
    assert!(state.held);
    assert_eq!(state.waiters, 0);
    next.unlock().await;
    assert!(!agent.lock_state(lock_id.lock_id).held);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queue_lock_grants_in_request_order() {
    let c = LoopbackCluster::new(1, 4).await;
    let lock_id = c.root_lock(0);
    let agent = c.host(0).agent.clone();

    let holder = new_lock(LockKind::Queue, c.client(0).conn(0).clone(), lock_id);
    holder.lock().await.unwrap();

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut tasks = Vec::new();
    for i in 1..4 {
        let lock = new_lock(LockKind::Queue, c.client(i).conn(0).clone(), lock_id);
        let order = order.clone();
        tasks.push(tokio::spawn(async move {
            lock.lock().await.unwrap();
            order.lock().unwrap().push(i);
            lock.unlock().await;
        }));
        // Queue strictly one after another.
        while agent.lock_state(lock_id.lock_id).waiters < i {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    holder.unlock().await;
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_try_lock_sees_holder_on_other_connection() {
    let c = LoopbackCluster::new(1, 2).await;
    let lock_id = c.root_lock(0);

    for kind in [LockKind::Poll, LockKind::Atomic] {
        let a = new_lock(kind, c.client(0).conn(0).clone(), lock_id);
        let b = new_lock(kind, c.client(1).conn(0).clone(), lock_id);

        assert!(a.try_lock().await.unwrap(), "{kind}");
        assert!(!b.try_lock().await.unwrap(), "{kind}");
        assert!(!b.is_held());
        a.unlock().await;
        assert!(b.try_lock().await.unwrap(), "{kind}");
        b.unlock().await;
    }
}
