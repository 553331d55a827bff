//! Integration test: remote objects.
//!
//! Two hosts, several clients. Objects are routed to their owning host by
//! uid, written back on close and drop, and can carry a whole versioned
//! B-tree that another client reads back with its history intact.

use ros_btree::{Index, VersionedTree};
use ros_client::{ClientError, RemoteObject};
use ros_integration_tests::{LoopbackCluster, OBJECT_SIZE, test_data_seeded};

#[tokio::test]
async fn test_uids_route_to_owning_host() {
    let c = LoopbackCluster::new(2, 1).await;
    let registry = c.client(0).registry.clone();

    for host in 0..2 {
        let uid = c.uid(host, 7);
        let data = test_data_seeded(OBJECT_SIZE, host as u32 + 1);
        let mut object = RemoteObject::create(registry.clone(), uid, OBJECT_SIZE)
            .await
            .unwrap();
        object.get_mut().await.unwrap().copy_from_slice(&data);
        object.close().await.unwrap();

        assert_eq!(c.host(host).object_bytes(uid), data);
    }

    // Same local id, different owners: neither host knows the other's uid.
    assert!(c.host(0).agent.object_header(c.uid(1, 7)).is_none());
    assert!(c.host(1).agent.object_header(c.uid(0, 7)).is_none());
}

#[tokio::test]
async fn test_drop_writes_back_for_next_reader() {
    let c = LoopbackCluster::new(1, 2).await;
    let uid = c.uid(0, 3);
    let data = test_data_seeded(OBJECT_SIZE, 99);

    {
        let mut writer = RemoteObject::create(c.client(0).registry.clone(), uid, OBJECT_SIZE)
            .await
            .unwrap();
        writer.get_mut().await.unwrap().copy_from_slice(&data);
        // Dropped without close.
    }

    let mut reader = RemoteObject::new(c.client(1).registry.clone(), uid, OBJECT_SIZE);
    assert_eq!(reader.get().await.unwrap(), data.as_slice());
}

#[tokio::test]
async fn test_pull_range_sees_other_clients_push() {
    let c = LoopbackCluster::new(1, 2).await;
    let uid = c.uid(0, 4);
    let mut a = RemoteObject::create(c.client(0).registry.clone(), uid, OBJECT_SIZE)
        .await
        .unwrap();
    let mut b = RemoteObject::new(c.client(1).registry.clone(), uid, OBJECT_SIZE);
    b.resolve().await.unwrap();

    a.get_mut().await.unwrap()[100..108].copy_from_slice(b"rosstore");
    a.push_range(100, 108).await.unwrap();

    // b's cache is stale until it pulls.
    assert_eq!(&b.get().await.unwrap()[100..108], &[0; 8]);
    b.pull_range(96, 112).await.unwrap();
    assert_eq!(&b.get().await.unwrap()[100..108], b"rosstore");
    assert_eq!(b.header(), a.header());
}

#[tokio::test]
async fn test_free_then_alloc_again_is_zeroed() {
    let c = LoopbackCluster::new(1, 1).await;
    let conn = c.client(0).conn(0);
    let uid = c.uid(0, 5);

    let mut object = RemoteObject::create(c.client(0).registry.clone(), uid, OBJECT_SIZE)
        .await
        .unwrap();
    object.get_mut().await.unwrap().fill(0xab);
    object.close().await.unwrap();

    conn.free(uid).await.unwrap();
    assert!(matches!(
        conn.get_header(uid).await,
        Err(ClientError::ObjectNotFound(u)) if u == uid
    ));
    assert!(matches!(
        conn.free(uid).await,
        Err(ClientError::FreeFailed { .. })
    ));

    conn.alloc(uid).await.unwrap();
    assert!(c.host(0).object_bytes(uid).iter().all(|&b| b == 0));
}

#[tokio::test]
async fn test_pool_exhaustion_reported() {
    let c = LoopbackCluster::new(1, 1).await;
    let conn = c.client(0).conn(0);
    let capacity = c.host(0).agent.pool().capacity();

    // The root object already takes one slot.
    for local in 2..=capacity as u32 {
        conn.alloc(c.uid(0, local)).await.unwrap();
    }
    let err = conn.alloc(c.uid(0, 1000)).await.unwrap_err();
    assert!(matches!(err, ClientError::AllocFailed { status: 2, .. }));
}

// -----------------------------------------------------------------------
// B-tree in a remote object
// -----------------------------------------------------------------------

fn frame(encoded: &[u8]) -> Vec<u8> {
    assert!(encoded.len() + 4 <= OBJECT_SIZE, "tree too large for one object");
    let mut framed = vec![0; OBJECT_SIZE];
    framed[..4].copy_from_slice(&(encoded.len() as u32).to_be_bytes());
    framed[4..4 + encoded.len()].copy_from_slice(encoded);
    framed
}

fn unframe(bytes: &[u8]) -> &[u8] {
    let len = u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize;
    &bytes[4..4 + len]
}

#[tokio::test]
async fn test_versioned_tree_readable_by_other_client() {
    let c = LoopbackCluster::new(2, 2).await;
    let uid = c.uid(1, 0x30);

    let mut tree = VersionedTree::new(4).unwrap();
    for key in 0..20u32 {
        tree.insert(key).unwrap();
    }
    let full = tree.version();
    assert!(tree.erase(&19).unwrap());
    let latest = tree.version();

    let mut object = RemoteObject::create(c.client(0).registry.clone(), uid, OBJECT_SIZE)
        .await
        .unwrap();
    object
        .get_mut()
        .await
        .unwrap()
        .copy_from_slice(&frame(&tree.encode().unwrap()));
    object.close().await.unwrap();

    let mut reader = RemoteObject::new(c.client(1).registry.clone(), uid, OBJECT_SIZE);
    let loaded: VersionedTree<u32> =
        VersionedTree::decode(unframe(reader.get().await.unwrap())).unwrap();

    assert_eq!(loaded.version(), latest);
    assert!(loaded.exists_at(&19, full).unwrap());
    assert!(!loaded.exists(&19));
    assert_eq!(loaded.keys_at(full).unwrap(), (0..20).collect::<Vec<_>>());
    assert_eq!(loaded.keys_at(latest).unwrap(), (0..19).collect::<Vec<_>>());
    for version in 1..=latest {
        loaded.check_invariants_at(version).unwrap();
        assert_eq!(
            loaded.output_at(version).unwrap(),
            tree.output_at(version).unwrap()
        );
    }
}

#[tokio::test]
async fn test_tree_updates_under_lock_stay_consistent() {
    use ros_client::{LockKind, new_lock};

    let c = LoopbackCluster::new(1, 3).await;
    let uid = c.uid(0, 0x31);
    let empty: VersionedTree<u32> = VersionedTree::new(5).unwrap();
    let mut object = RemoteObject::create(c.client(0).registry.clone(), uid, OBJECT_SIZE)
        .await
        .unwrap();
    object
        .get_mut()
        .await
        .unwrap()
        .copy_from_slice(&frame(&empty.encode().unwrap()));
    let lock_id = object.lock_identity().unwrap();
    object.close().await.unwrap();

    let mut tasks = Vec::new();
    for (i, client) in c.clients().iter().enumerate() {
        let registry = client.registry.clone();
        let lock = new_lock(LockKind::Atomic, client.conn(0).clone(), lock_id);
        tasks.push(tokio::spawn(async move {
            for n in 0..10u32 {
                lock.lock().await.unwrap();
                let mut object = RemoteObject::new(registry.clone(), uid, OBJECT_SIZE);
                let mut tree: VersionedTree<u32> =
                    VersionedTree::decode(unframe(object.get().await.unwrap())).unwrap();
                tree.insert(i as u32 * 100 + n).unwrap();
                let framed = frame(&tree.encode().unwrap());
                object.get_mut().await.unwrap().copy_from_slice(&framed);
                object.close().await.unwrap();
                lock.unlock().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut object = RemoteObject::new(c.client(0).registry.clone(), uid, OBJECT_SIZE);
    let tree: VersionedTree<u32> =
        VersionedTree::decode(unframe(object.get().await.unwrap())).unwrap();
    assert_eq!(tree.version(), 30);
    assert_eq!(tree.keys_at(30).unwrap().len(), 30);
    tree.check_invariants().unwrap();
}
