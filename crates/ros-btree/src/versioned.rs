//! Multiversion B-tree.
//!
//! Nodes live in an arena and are never changed in place once written,
//! except for their child slots. A slot holds the history of edges to its
//! child, each visible over a half-open version range `[min, max)`. When a
//! child is rewritten only the slot changes: the live edge is closed at the
//! new version and an edge to the rewritten child is appended. When a
//! node's own keys change (split, promoted separator, leaf insert or
//! erase) the node is copied and the change moves one level up. Readers at
//! an older version keep following the closed edges, so every retained
//! version reads as an ordinary B-tree.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    INDENT, Index, TreeError, UNDERFLOW, Version, check_degree, check_keys, check_leaf_depth,
    max_keys,
};

/// Index of a node in the tree's arena.
pub type NodeId = u32;

/// A child pointer visible for versions in `[min, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub target: NodeId,
    pub min: Version,
    pub max: Version,
}

impl Edge {
    /// Upper bound of an edge that has not been closed.
    pub const OPEN: Version = Version::MAX;

    fn new(target: NodeId, min: Version) -> Self {
        Self {
            target,
            min,
            max: Self::OPEN,
        }
    }

    /// Whether a reader at `version` follows this edge.
    pub fn visible_at(&self, version: Version) -> bool {
        self.min <= version && version < self.max
    }

    /// Whether the edge is visible in the newest version.
    pub fn is_live(&self) -> bool {
        self.max == Self::OPEN
    }
}

/// An arena slot. A slot without keys is free.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node<T> {
    keys: Vec<T>,
    /// Empty for a leaf, otherwise one per child position.
    slots: Vec<Vec<Edge>>,
}

impl<T> Node<T> {
    fn is_leaf(&self) -> bool {
        self.slots.is_empty()
    }

    fn is_free(&self) -> bool {
        self.keys.is_empty()
    }
}

/// What a mutation did to a subtree.
enum Change<T> {
    /// Nothing: the key was already present, or absent on erase.
    None,
    /// Only child slots below or at this node were relinked.
    InPlace,
    /// The node was copied; its parent must point at the copy.
    Replaced(NodeId),
    /// The node was copied and split around the median.
    Split(NodeId, T, NodeId),
    /// The root leaf lost its last key.
    Emptied,
}

#[derive(Clone, Copy)]
enum End {
    First,
    Last,
}

/// A B-tree whose every version since the prune horizon stays readable.
///
/// Each successful insert or erase creates the next version. Reads at a
/// version follow only the edges visible at it. Untouched subtrees are
/// shared between versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedTree<T> {
    degree: usize,
    version: Version,
    horizon: Version,
    nodes: Vec<Node<T>>,
    free: Vec<NodeId>,
    roots: Vec<Edge>,
}

impl<T> VersionedTree<T> {
    /// Create an empty tree at version 0. `degree` must be at least 3.
    pub fn new(degree: usize) -> Result<Self, TreeError> {
        check_degree(degree)?;
        Ok(Self {
            degree,
            version: 0,
            horizon: 0,
            nodes: Vec::new(),
            free: Vec::new(),
            roots: Vec::new(),
        })
    }

    /// Maximum children per node.
    pub fn degree(&self) -> usize {
        self.degree
    }

    /// The newest version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The oldest version still readable.
    pub fn horizon(&self) -> Version {
        self.horizon
    }

    /// Nodes currently held in the arena, across all retained versions.
    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| !n.is_free()).count()
    }

    fn node(&self, id: NodeId) -> Result<&Node<T>, TreeError> {
        self.nodes
            .get(id as usize)
            .filter(|n| !n.is_free())
            .ok_or_else(|| TreeError::Invariant(format!("edge to missing node {id}")))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node<T>, TreeError> {
        self.nodes
            .get_mut(id as usize)
            .filter(|n| !n.is_free())
            .ok_or_else(|| TreeError::Invariant(format!("edge to missing node {id}")))
    }

    fn check_readable(&self, version: Version) -> Result<(), TreeError> {
        if version > self.version {
            return Err(TreeError::FutureVersion {
                requested: version,
                current: self.version,
            });
        }
        if version < self.horizon {
            return Err(TreeError::VersionPruned {
                requested: version,
                horizon: self.horizon,
            });
        }
        Ok(())
    }

    fn root_at(&self, version: Version) -> Option<NodeId> {
        self.roots
            .iter()
            .find(|e| e.visible_at(version))
            .map(|e| e.target)
    }

    fn child_at(&self, id: NodeId, pos: usize, version: Version) -> Result<NodeId, TreeError> {
        self.node(id)?
            .slots
            .get(pos)
            .and_then(|slot| slot.iter().find(|e| e.visible_at(version)))
            .map(|e| e.target)
            .ok_or_else(|| {
                TreeError::Invariant(format!(
                    "node {id} has no child {pos} visible at version {version}"
                ))
            })
    }

    fn live_root(&self) -> Option<NodeId> {
        self.roots.iter().find(|e| e.is_live()).map(|e| e.target)
    }

    fn live_child(&self, id: NodeId, pos: usize) -> Result<NodeId, TreeError> {
        self.child_at(id, pos, self.version)
    }

    fn live_children(&self, id: NodeId) -> Result<Vec<NodeId>, TreeError> {
        let slots = self.node(id)?.slots.len();
        (0..slots).map(|pos| self.live_child(id, pos)).collect()
    }

    /// Number of levels at `version`.
    pub fn height_at(&self, version: Version) -> Result<usize, TreeError> {
        self.check_readable(version)?;
        let mut height = 0;
        let mut current = self.root_at(version);
        while let Some(id) = current {
            height += 1;
            current = if self.node(id)?.is_leaf() {
                None
            } else {
                Some(self.child_at(id, 0, version)?)
            };
        }
        Ok(height)
    }

    fn alloc(&mut self, keys: Vec<T>, children: Vec<NodeId>, version: Version) -> NodeId {
        let node = Node {
            keys,
            slots: children
                .into_iter()
                .map(|target| vec![Edge::new(target, version)])
                .collect(),
        };
        match self.free.pop() {
            Some(id) => {
                self.nodes[id as usize] = node;
                id
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as NodeId
            }
        }
    }

    /// Point slot `pos` of `id` at `target` from `version` on.
    fn relink(
        &mut self,
        id: NodeId,
        pos: usize,
        target: NodeId,
        version: Version,
    ) -> Result<(), TreeError> {
        let slot = self
            .node_mut(id)?
            .slots
            .get_mut(pos)
            .ok_or_else(|| TreeError::Invariant(format!("node {id} has no slot {pos}")))?;
        if let Some(live) = slot.iter_mut().find(|e| e.is_live()) {
            live.max = version;
        }
        slot.push(Edge::new(target, version));
        Ok(())
    }

    fn relink_root(&mut self, target: Option<NodeId>, version: Version) {
        if let Some(live) = self.roots.iter_mut().find(|e| e.is_live()) {
            live.max = version;
        }
        if let Some(target) = target {
            self.roots.push(Edge::new(target, version));
        }
    }

    /// Drop every edge that closed at or before `before` and free the
    /// nodes no longer reachable. Versions older than `before` become
    /// unreadable. Returns the number of nodes freed.
    pub fn prune(&mut self, before: Version) -> Result<usize, TreeError> {
        if before > self.version {
            return Err(TreeError::FutureVersion {
                requested: before,
                current: self.version,
            });
        }
        if before <= self.horizon {
            return Ok(0);
        }
        self.horizon = before;

        let retained = |e: &Edge| e.max > before;
        self.roots.retain(retained);
        for node in &mut self.nodes {
            for slot in &mut node.slots {
                slot.retain(retained);
            }
        }

        let mut reachable = vec![false; self.nodes.len()];
        let mut stack: Vec<NodeId> = self.roots.iter().map(|e| e.target).collect();
        while let Some(id) = stack.pop() {
            let Some(seen) = reachable.get_mut(id as usize) else {
                return Err(TreeError::Invariant(format!("edge to missing node {id}")));
            };
            if *seen {
                continue;
            }
            *seen = true;
            for slot in &self.nodes[id as usize].slots {
                stack.extend(slot.iter().map(|e| e.target));
            }
        }

        let mut freed = 0;
        for (id, node) in self.nodes.iter_mut().enumerate() {
            if !reachable[id] && !node.is_free() {
                node.keys.clear();
                node.slots.clear();
                self.free.push(id as NodeId);
                freed += 1;
            }
        }
        debug!(before, freed, live = self.nodes.len() - self.free.len(), "pruned tree versions");
        Ok(freed)
    }
}

impl<T: Ord + Clone> VersionedTree<T> {
    /// Whether `value` is present at `version`.
    pub fn exists_at(&self, value: &T, version: Version) -> Result<bool, TreeError> {
        self.check_readable(version)?;
        let mut current = self.root_at(version);
        while let Some(id) = current {
            let node = self.node(id)?;
            match node.keys.binary_search(value) {
                Ok(_) => return Ok(true),
                Err(_) if node.is_leaf() => return Ok(false),
                Err(pos) => current = Some(self.child_at(id, pos, version)?),
            }
        }
        Ok(false)
    }

    /// All keys visible at `version`, ascending.
    pub fn keys_at(&self, version: Version) -> Result<Vec<T>, TreeError> {
        self.check_readable(version)?;
        let mut out = Vec::new();
        if let Some(root) = self.root_at(version) {
            self.collect(root, version, &mut out)?;
        }
        Ok(out)
    }

    fn collect(&self, id: NodeId, version: Version, out: &mut Vec<T>) -> Result<(), TreeError> {
        let node = self.node(id)?;
        for (i, key) in node.keys.iter().enumerate() {
            if !node.is_leaf() {
                self.collect(self.child_at(id, i, version)?, version, out)?;
            }
            out.push(key.clone());
        }
        if !node.is_leaf() {
            self.collect(self.child_at(id, node.keys.len(), version)?, version, out)?;
        }
        Ok(())
    }

    /// Keys `keys` and children `children` (empty for a leaf) form the new
    /// contents of a node; copy them in, splitting if they overflow.
    fn rebuild(&mut self, mut keys: Vec<T>, mut children: Vec<NodeId>, version: Version) -> Change<T> {
        let max = max_keys(self.degree);
        if keys.len() <= max {
            return Change::Replaced(self.alloc(keys, children, version));
        }
        let mid = max / 2;
        let mut upper = keys.split_off(mid);
        let median = upper.remove(0);
        let upper_children = if children.is_empty() {
            Vec::new()
        } else {
            children.split_off(mid + 1)
        };
        let left = self.alloc(keys, children, version);
        let right = self.alloc(upper, upper_children, version);
        Change::Split(left, median, right)
    }

    fn insert_in(&mut self, id: NodeId, value: T, version: Version) -> Result<Change<T>, TreeError> {
        let node = self.node(id)?;
        let pos = match node.keys.binary_search(&value) {
            Ok(_) => return Ok(Change::None),
            Err(pos) => pos,
        };
        if node.is_leaf() {
            let mut keys = node.keys.clone();
            keys.insert(pos, value);
            return Ok(self.rebuild(keys, Vec::new(), version));
        }
        let child = self.live_child(id, pos)?;
        match self.insert_in(child, value, version)? {
            Change::Replaced(copy) => {
                self.relink(id, pos, copy, version)?;
                Ok(Change::InPlace)
            }
            Change::Split(left, median, right) => {
                let mut keys = self.node(id)?.keys.clone();
                keys.insert(pos, median);
                let mut children = self.live_children(id)?;
                children[pos] = left;
                children.insert(pos + 1, right);
                Ok(self.rebuild(keys, children, version))
            }
            other => Ok(other),
        }
    }

    fn erase_in(
        &mut self,
        id: NodeId,
        value: &T,
        version: Version,
        is_root: bool,
    ) -> Result<Change<T>, TreeError> {
        let node = self.node(id)?;
        match node.keys.binary_search(value) {
            Ok(pos) if node.is_leaf() => {
                if node.keys.len() == 1 {
                    return if is_root {
                        Ok(Change::Emptied)
                    } else {
                        Err(TreeError::Unsupported(UNDERFLOW))
                    };
                }
                let mut keys = node.keys.clone();
                keys.remove(pos);
                Ok(Change::Replaced(self.alloc(keys, Vec::new(), version)))
            }
            Ok(pos) => {
                let right = self.live_child(id, pos + 1)?;
                let left = self.live_child(id, pos)?;
                let (side, (replacement, change)) = if self.leaf_len(right, End::First)? > 1 {
                    (pos + 1, self.take(right, End::First, version)?)
                } else if self.leaf_len(left, End::Last)? > 1 {
                    (pos, self.take(left, End::Last, version)?)
                } else {
                    return Err(TreeError::Unsupported(UNDERFLOW));
                };
                let mut keys = self.node(id)?.keys.clone();
                keys[pos] = replacement;
                let mut children = self.live_children(id)?;
                if let Change::Replaced(copy) = change {
                    children[side] = copy;
                }
                Ok(Change::Replaced(self.alloc(keys, children, version)))
            }
            Err(_) if node.is_leaf() => Ok(Change::None),
            Err(pos) => {
                let child = self.live_child(id, pos)?;
                match self.erase_in(child, value, version, false)? {
                    Change::Replaced(copy) => {
                        self.relink(id, pos, copy, version)?;
                        Ok(Change::InPlace)
                    }
                    other => Ok(other),
                }
            }
        }
    }

    /// Key count of the leaf at the `end` edge of the subtree under `id`.
    fn leaf_len(&self, id: NodeId, end: End) -> Result<usize, TreeError> {
        let mut id = id;
        loop {
            let node = self.node(id)?;
            if node.is_leaf() {
                return Ok(node.keys.len());
            }
            let pos = match end {
                End::First => 0,
                End::Last => node.keys.len(),
            };
            id = self.live_child(id, pos)?;
        }
    }

    /// Remove and return the smallest or largest key under `id`.
    fn take(&mut self, id: NodeId, end: End, version: Version) -> Result<(T, Change<T>), TreeError> {
        let node = self.node(id)?;
        if node.is_leaf() {
            let mut keys = node.keys.clone();
            let key = match end {
                End::First => keys.remove(0),
                End::Last => keys.remove(keys.len() - 1),
            };
            return Ok((key, Change::Replaced(self.alloc(keys, Vec::new(), version))));
        }
        let pos = match end {
            End::First => 0,
            End::Last => node.keys.len(),
        };
        let child = self.live_child(id, pos)?;
        let (key, change) = self.take(child, end, version)?;
        if let Change::Replaced(copy) = change {
            self.relink(id, pos, copy, version)?;
        }
        Ok((key, Change::InPlace))
    }

    fn commit(&mut self, change: Change<T>, version: Version) -> bool {
        match change {
            Change::None => return false,
            Change::InPlace => {}
            Change::Replaced(root) => self.relink_root(Some(root), version),
            Change::Split(left, median, right) => {
                let root = self.alloc(vec![median], vec![left, right], version);
                self.relink_root(Some(root), version);
            }
            Change::Emptied => self.relink_root(None, version),
        }
        self.version = version;
        trace!(version, "committed tree version");
        true
    }
}

impl<T: Ord + Clone + fmt::Debug> VersionedTree<T> {
    /// Verify that the edges visible at `version` form a valid B-tree.
    pub fn check_invariants_at(&self, version: Version) -> Result<(), TreeError> {
        self.check_readable(version)?;
        match self.root_at(version) {
            Some(root) => self.check_node(root, None, None, version, 0, &mut None),
            None => Ok(()),
        }
    }

    fn check_node(
        &self,
        id: NodeId,
        lo: Option<&T>,
        hi: Option<&T>,
        version: Version,
        depth: usize,
        leaf_depth: &mut Option<usize>,
    ) -> Result<(), TreeError> {
        let node = self.node(id)?;
        check_keys(&node.keys, lo, hi, max_keys(self.degree))?;
        if node.is_leaf() {
            return check_leaf_depth(depth, leaf_depth);
        }
        if node.slots.len() != node.keys.len() + 1 {
            return Err(TreeError::Invariant(format!(
                "node {id} with {} keys has {} child slots",
                node.keys.len(),
                node.slots.len()
            )));
        }
        for (pos, slot) in node.slots.iter().enumerate() {
            let mut visible = slot.iter().filter(|e| e.visible_at(version));
            let (Some(edge), None) = (visible.next(), visible.next()) else {
                return Err(TreeError::Invariant(format!(
                    "node {id} slot {pos} needs exactly one edge visible at {version}"
                )));
            };
            let lo = if pos == 0 { lo } else { Some(&node.keys[pos - 1]) };
            let hi = node.keys.get(pos).or(hi);
            self.check_node(edge.target, lo, hi, version, depth + 1, leaf_depth)?;
        }
        Ok(())
    }
}

impl<T: fmt::Display> VersionedTree<T> {
    /// The structure visible at `version`, one key per line indented three
    /// spaces per level.
    pub fn output_at(&self, version: Version) -> Result<String, TreeError> {
        self.check_readable(version)?;
        let mut out = String::new();
        if let Some(root) = self.root_at(version) {
            self.output_node(root, version, 0, &mut out)?;
        }
        Ok(out)
    }

    fn output_node(
        &self,
        id: NodeId,
        version: Version,
        level: usize,
        out: &mut String,
    ) -> Result<(), TreeError> {
        use std::fmt::Write;

        let node = self.node(id)?;
        if !node.is_leaf() {
            self.output_node(self.child_at(id, 0, version)?, version, level + 1, out)?;
        }
        for (j, key) in node.keys.iter().enumerate() {
            // Writing to a String cannot fail.
            let _ = writeln!(out, "{}{key}", INDENT.repeat(level));
            if !node.is_leaf() {
                self.output_node(self.child_at(id, j + 1, version)?, version, level + 1, out)?;
            }
        }
        Ok(())
    }
}

impl<T: Serialize> VersionedTree<T> {
    /// Serialize the whole tree, history included.
    pub fn encode(&self) -> Result<Vec<u8>, TreeError> {
        postcard::to_allocvec(self).map_err(|e| TreeError::Serialization(e.to_string()))
    }
}

impl<T: DeserializeOwned + Ord + Clone + fmt::Debug> VersionedTree<T> {
    /// Deserialize a tree written by [`VersionedTree::encode`] and verify
    /// its structure.
    pub fn decode(bytes: &[u8]) -> Result<Self, TreeError> {
        let tree: Self =
            postcard::from_bytes(bytes).map_err(|e| TreeError::Serialization(e.to_string()))?;
        check_degree(tree.degree)?;
        if tree.horizon > tree.version {
            return Err(TreeError::Invariant(format!(
                "horizon {} ahead of version {}",
                tree.horizon, tree.version
            )));
        }
        let len = tree.nodes.len();
        let dangling = tree
            .roots
            .iter()
            .chain(tree.nodes.iter().flat_map(|n| n.slots.iter().flatten()))
            .find(|e| e.target as usize >= len);
        if let Some(edge) = dangling {
            return Err(TreeError::Invariant(format!(
                "edge to node {} of {len}",
                edge.target
            )));
        }
        if tree.free.iter().any(|&id| id as usize >= len) {
            return Err(TreeError::Invariant("free list out of range".into()));
        }
        tree.check_invariants_at(tree.version)?;
        Ok(tree)
    }
}

impl<T: Ord + Clone + fmt::Debug> Index<T> for VersionedTree<T> {
    fn insert(&mut self, value: T) -> Result<bool, TreeError> {
        let version = self.version + 1;
        let change = match self.live_root() {
            Some(root) => self.insert_in(root, value, version)?,
            None => Change::Replaced(self.alloc(vec![value], Vec::new(), version)),
        };
        Ok(self.commit(change, version))
    }

    fn erase(&mut self, value: &T) -> Result<bool, TreeError> {
        let Some(root) = self.live_root() else {
            return Ok(false);
        };
        let version = self.version + 1;
        let change = self.erase_in(root, value, version, true)?;
        Ok(self.commit(change, version))
    }

    fn exists(&self, value: &T) -> bool {
        matches!(self.exists_at(value, self.version), Ok(true))
    }

    fn height(&self) -> usize {
        self.height_at(self.version).unwrap_or(0)
    }

    fn is_empty(&self) -> bool {
        self.live_root().is_none()
    }

    fn check_invariants(&self) -> Result<(), TreeError> {
        self.check_invariants_at(self.version)
    }
}

impl<T: fmt::Display> fmt::Display for VersionedTree<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let out = self.output_at(self.version).map_err(|_| fmt::Error)?;
        f.write_str(&out)
    }
}
