//! Workloads run against a [`LocalCluster`]: lock contention on a shared
//! counter object, and a versioned B-tree stored as a remote object.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail, ensure};
use ros_btree::{Index, Tree, TreeError, Version, VersionedTree};
use ros_client::{LockKind, Registry, RemoteObject, new_lock};
use ros_types::Uid;
use tracing::{debug, info};

use crate::cluster::LocalCluster;

/// Bytes in front of an encoded tree holding its length, big-endian.
const LEN_PREFIX: usize = 4;

// -----------------------------------------------------------------------
// Lock contention
// -----------------------------------------------------------------------

/// Outcome of one [`contend`] run.
#[derive(Debug, Clone)]
pub struct LockReport {
    pub kind: LockKind,
    pub clients: usize,
    pub iterations: usize,
    /// Final value of the shared counter.
    pub counter: u64,
    /// Most clients seen inside the critical section at once.
    pub max_inside: usize,
    pub elapsed: Duration,
}

impl LockReport {
    /// Counter value if no increment was lost.
    pub fn expected(&self) -> u64 {
        (self.clients * self.iterations) as u64
    }

    pub fn is_exclusive(&self) -> bool {
        self.counter == self.expected() && self.max_inside <= 1
    }
}

fn read_counter(bytes: &[u8]) -> Result<u64> {
    let word: [u8; 8] = bytes
        .get(..8)
        .context("object too small for a counter")?
        .try_into()?;
    Ok(u64::from_be_bytes(word))
}

/// Pull the counter object, increment it and write it back.
async fn bump(registry: Arc<Registry>, uid: Uid, size: usize) -> Result<()> {
    let mut object = RemoteObject::new(registry, uid, size);
    let bytes = object.get_mut().await?;
    let counter = read_counter(bytes)? + 1;
    bytes[..8].copy_from_slice(&counter.to_be_bytes());
    object.close().await?;
    Ok(())
}

/// Have every client of `cluster` increment a counter object `iterations`
/// times, each increment under a `kind` lock on that object.
///
/// The counter lives in a fresh object `local_id` on the host, freed again
/// before returning. A lost increment shows up as a short counter.
pub async fn contend(
    cluster: &LocalCluster,
    kind: LockKind,
    iterations: usize,
    local_id: u32,
) -> Result<LockReport> {
    let uid = Uid::new(cluster.host_id(), local_id);
    let size = cluster.object_size();
    let owner = cluster.client(0)?;
    let header = owner
        .conn
        .alloc(uid)
        .await
        .with_context(|| format!("failed to allocate counter {uid}"))?;

    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let mut tasks = Vec::with_capacity(cluster.clients().len());
    for client in cluster.clients() {
        let lock = new_lock(kind, client.conn.clone(), header.lock);
        let registry = client.registry.clone();
        let inside = inside.clone();
        let max_inside = max_inside.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..iterations {
                lock.lock().await?;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                let result = bump(registry.clone(), uid, size).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                lock.unlock().await;
                result?;
            }
            anyhow::Ok(())
        }));
    }
    for task in tasks {
        task.await??;
    }
    let elapsed = start.elapsed();

    let mut object = RemoteObject::new(owner.registry.clone(), uid, size);
    let counter = read_counter(object.get().await?)?;
    object.close().await?;
    owner.conn.free(uid).await?;

    let report = LockReport {
        kind,
        clients: cluster.clients().len(),
        iterations,
        counter,
        max_inside: max_inside.load(Ordering::SeqCst),
        elapsed,
    };
    info!(
        %kind,
        clients = report.clients,
        iterations,
        counter,
        max_inside = report.max_inside,
        elapsed_ms = elapsed.as_millis() as u64,
        "lock contention finished"
    );
    Ok(report)
}

// -----------------------------------------------------------------------
// B-tree
// -----------------------------------------------------------------------

/// What [`build_tree`] did to a tree.
#[derive(Debug, Clone, Default)]
pub struct TreeReport {
    pub degree: usize,
    pub inserted: usize,
    pub erased: usize,
    /// Erases refused because they would have emptied a node.
    pub refused: usize,
    /// Version right after the last insert.
    pub built: Version,
    pub version: Version,
    pub height: usize,
    /// Live keys at the newest version.
    pub keys: usize,
}

/// The keys of a `count`-key workload, spread over the whole u32 range.
pub fn tree_keys(count: u32) -> impl Iterator<Item = u32> {
    (0..count).map(|i| i.wrapping_mul(0x9E37_79B1))
}

/// Erase every third of `keys`. Refused erases are counted, not treated
/// as failures. Returns `(erased, refused)`.
fn erase_every_third<I: Index<u32>>(index: &mut I, keys: &[u32]) -> Result<(usize, usize)> {
    let (mut erased, mut refused) = (0, 0);
    for key in keys.iter().step_by(3) {
        match index.erase(key) {
            Ok(true) => erased += 1,
            Ok(false) => {}
            Err(TreeError::Unsupported(reason)) => {
                debug!(key, reason, "erase refused");
                refused += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    index.check_invariants()?;
    Ok((erased, refused))
}

/// Build a base tree over the `count`-key workload.
pub fn build_base_tree(degree: usize, count: u32) -> Result<(Tree<u32>, TreeReport)> {
    let keys: Vec<u32> = tree_keys(count).collect();
    let mut tree = Tree::new(degree)?;
    for key in &keys {
        tree.insert(*key)?;
    }
    let built = tree.version();
    let (erased, refused) = erase_every_third(&mut tree, &keys)?;
    let report = TreeReport {
        degree,
        inserted: keys.len(),
        erased,
        refused,
        built,
        version: tree.version(),
        height: tree.height(),
        keys: tree.keys().len(),
    };
    Ok((tree, report))
}

/// Build a versioned tree over the `count`-key workload and check that the
/// version taken after the inserts still sees every key.
pub fn build_tree(degree: usize, count: u32) -> Result<(VersionedTree<u32>, TreeReport)> {
    let keys: Vec<u32> = tree_keys(count).collect();
    let mut tree = VersionedTree::new(degree)?;
    for key in &keys {
        tree.insert(*key)?;
    }
    let built = tree.version();
    let (erased, refused) = erase_every_third(&mut tree, &keys)?;

    for key in &keys {
        ensure!(
            tree.exists_at(key, built)?,
            "key {key} missing from version {built}"
        );
    }
    let report = TreeReport {
        degree,
        inserted: keys.len(),
        erased,
        refused,
        built,
        version: tree.version(),
        height: tree.height(),
        keys: tree.keys_at(tree.version())?.len(),
    };
    Ok((tree, report))
}

/// Frame an encoded tree into an object of `size` bytes.
fn frame(encoded: &[u8], size: usize) -> Result<Vec<u8>> {
    if encoded.len() + LEN_PREFIX > size {
        bail!(
            "encoded tree is {} bytes, object holds {}",
            encoded.len(),
            size - LEN_PREFIX.min(size)
        );
    }
    let mut framed = vec![0; size];
    framed[..LEN_PREFIX].copy_from_slice(&(encoded.len() as u32).to_be_bytes());
    framed[LEN_PREFIX..LEN_PREFIX + encoded.len()].copy_from_slice(encoded);
    Ok(framed)
}

fn unframe(bytes: &[u8]) -> Result<&[u8]> {
    let prefix: [u8; LEN_PREFIX] = bytes
        .get(..LEN_PREFIX)
        .context("object too small for a tree")?
        .try_into()?;
    let len = u32::from_be_bytes(prefix) as usize;
    bytes
        .get(LEN_PREFIX..LEN_PREFIX + len)
        .with_context(|| format!("tree length {len} exceeds the object"))
}

/// Allocate object `uid` and write `tree` into it. Returns the encoded
/// length.
pub async fn store_tree(
    registry: Arc<Registry>,
    uid: Uid,
    size: usize,
    tree: &VersionedTree<u32>,
) -> Result<usize> {
    let encoded = tree.encode()?;
    let framed = frame(&encoded, size)?;
    let mut object = RemoteObject::create(registry, uid, size).await?;
    object.get_mut().await?.copy_from_slice(&framed);
    object.close().await?;
    debug!(%uid, len = encoded.len(), version = tree.version(), "stored tree");
    Ok(encoded.len())
}

/// Read the tree stored in object `uid`.
pub async fn load_tree(registry: Arc<Registry>, uid: Uid, size: usize) -> Result<VersionedTree<u32>> {
    let mut object = RemoteObject::new(registry, uid, size);
    let tree = VersionedTree::decode(unframe(object.get().await?)?)?;
    object.close().await?;
    Ok(tree)
}

/// Outcome of [`tree_roundtrip`].
#[derive(Debug, Clone)]
pub struct StoredTree {
    pub report: TreeReport,
    /// Nodes freed by pruning the history before storing.
    pub pruned: usize,
    pub encoded_len: usize,
}

/// Build a versioned tree, store it in object `local_id` through the first
/// client and read it back through the last one.
///
/// History is pruned up to the newest version first so the tree fits one
/// object. The object is freed before returning.
pub async fn tree_roundtrip(
    cluster: &LocalCluster,
    degree: usize,
    count: u32,
    local_id: u32,
) -> Result<StoredTree> {
    let (mut tree, report) = build_tree(degree, count)?;
    let pruned = tree.prune(tree.version())?;

    let uid = Uid::new(cluster.host_id(), local_id);
    let size = cluster.object_size();
    let writer = cluster.client(0)?;
    let reader = cluster.client(cluster.clients().len().saturating_sub(1))?;

    let encoded_len = store_tree(writer.registry.clone(), uid, size, &tree).await?;
    let loaded = load_tree(reader.registry.clone(), uid, size).await?;
    ensure!(
        loaded.version() == tree.version(),
        "loaded version {} differs from stored {}",
        loaded.version(),
        tree.version()
    );
    ensure!(
        loaded.keys_at(loaded.version())? == tree.keys_at(tree.version())?,
        "loaded tree holds different keys"
    );
    writer.conn.free(uid).await?;

    info!(
        %uid,
        degree,
        keys = report.keys,
        version = report.version,
        encoded_len,
        pruned,
        "tree stored and read back"
    );
    Ok(StoredTree {
        report,
        pruned,
        encoded_len,
    })
}
