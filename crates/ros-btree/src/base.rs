//! B-tree with owned nodes.

use std::fmt;

use tracing::trace;

use crate::{
    INDENT, Index, TreeError, UNDERFLOW, Version, check_degree, check_keys, check_leaf_depth,
    max_keys,
};

struct Node<T> {
    keys: Vec<T>,
    /// Empty for a leaf, otherwise one more than `keys`.
    children: Vec<Node<T>>,
}

enum Insertion<T> {
    Present,
    Absorbed,
    /// The node split; the median moves up and the new node goes to its
    /// right.
    Split(T, Node<T>),
}

impl<T: Ord> Node<T> {
    fn leaf(keys: Vec<T>) -> Self {
        Self {
            keys,
            children: Vec::new(),
        }
    }

    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    fn exists(&self, value: &T) -> bool {
        let mut node = self;
        loop {
            match node.keys.binary_search(value) {
                Ok(_) => return true,
                Err(_) if node.is_leaf() => return false,
                Err(pos) => node = &node.children[pos],
            }
        }
    }

    fn height(&self) -> usize {
        1 + self.children.first().map_or(0, Node::height)
    }

    fn insert(&mut self, value: T, max: usize) -> Insertion<T> {
        let pos = match self.keys.binary_search(&value) {
            Ok(_) => return Insertion::Present,
            Err(pos) => pos,
        };
        if self.is_leaf() {
            self.keys.insert(pos, value);
        } else {
            match self.children[pos].insert(value, max) {
                Insertion::Split(median, right) => {
                    self.keys.insert(pos, median);
                    self.children.insert(pos + 1, right);
                }
                other => return other,
            }
        }
        if self.keys.len() <= max {
            return Insertion::Absorbed;
        }
        let (median, right) = self.split(max / 2);
        Insertion::Split(median, right)
    }

    /// Split an overfull node at `mid`: keys before it stay, the key at it
    /// is returned as the median and the rest move to a new right node.
    fn split(&mut self, mid: usize) -> (T, Node<T>) {
        let mut upper = self.keys.split_off(mid);
        let median = upper.remove(0);
        let children = if self.is_leaf() {
            Vec::new()
        } else {
            self.children.split_off(mid + 1)
        };
        (
            median,
            Node {
                keys: upper,
                children,
            },
        )
    }

    fn erase(&mut self, value: &T, is_root: bool) -> Result<bool, TreeError> {
        match self.keys.binary_search(value) {
            Ok(pos) if self.is_leaf() => {
                if self.keys.len() == 1 && !is_root {
                    return Err(TreeError::Unsupported(UNDERFLOW));
                }
                self.keys.remove(pos);
                Ok(true)
            }
            Ok(pos) => {
                // Borrow the in-order successor if its leaf can spare a key,
                // else the predecessor.
                let replacement = if self.children[pos + 1].first_leaf_len() > 1 {
                    self.children[pos + 1].pop_first()
                } else if self.children[pos].last_leaf_len() > 1 {
                    self.children[pos].pop_last()
                } else {
                    return Err(TreeError::Unsupported(UNDERFLOW));
                };
                self.keys[pos] = replacement;
                Ok(true)
            }
            Err(_) if self.is_leaf() => Ok(false),
            Err(pos) => self.children[pos].erase(value, false),
        }
    }

    fn first_leaf_len(&self) -> usize {
        match self.children.first() {
            Some(child) => child.first_leaf_len(),
            None => self.keys.len(),
        }
    }

    fn last_leaf_len(&self) -> usize {
        match self.children.last() {
            Some(child) => child.last_leaf_len(),
            None => self.keys.len(),
        }
    }

    fn pop_first(&mut self) -> T {
        match self.children.first_mut() {
            Some(child) => child.pop_first(),
            None => self.keys.remove(0),
        }
    }

    fn pop_last(&mut self) -> T {
        match self.children.last_mut() {
            Some(child) => child.pop_last(),
            None => self.keys.remove(self.keys.len() - 1),
        }
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a T>) {
        for (i, key) in self.keys.iter().enumerate() {
            if let Some(child) = self.children.get(i) {
                child.collect(out);
            }
            out.push(key);
        }
        if let Some(child) = self.children.get(self.keys.len()) {
            child.collect(out);
        }
    }
}

impl<T: Ord + fmt::Debug> Node<T> {
    fn check(
        &self,
        lo: Option<&T>,
        hi: Option<&T>,
        max: usize,
        depth: usize,
        leaf_depth: &mut Option<usize>,
    ) -> Result<(), TreeError> {
        check_keys(&self.keys, lo, hi, max)?;
        if self.is_leaf() {
            return check_leaf_depth(depth, leaf_depth);
        }
        if self.children.len() != self.keys.len() + 1 {
            return Err(TreeError::Invariant(format!(
                "node with {} keys has {} children",
                self.keys.len(),
                self.children.len()
            )));
        }
        for (i, child) in self.children.iter().enumerate() {
            let lo = if i == 0 { lo } else { Some(&self.keys[i - 1]) };
            let hi = self.keys.get(i).or(hi);
            child.check(lo, hi, max, depth + 1, leaf_depth)?;
        }
        Ok(())
    }
}

impl<T: fmt::Display> Node<T> {
    fn output(&self, f: &mut fmt::Formatter<'_>, level: usize) -> fmt::Result {
        if let Some(child) = self.children.first() {
            child.output(f, level + 1)?;
        }
        for (j, key) in self.keys.iter().enumerate() {
            writeln!(f, "{}{key}", INDENT.repeat(level))?;
            if let Some(child) = self.children.get(j + 1) {
                child.output(f, level + 1)?;
            }
        }
        Ok(())
    }
}

/// A B-tree of degree `degree`: every node holds at most `degree - 1` keys.
///
/// The version counter advances with every insert or erase that changes
/// the tree.
pub struct Tree<T> {
    degree: usize,
    root: Option<Node<T>>,
    version: Version,
}

impl<T: Ord> Tree<T> {
    /// Create an empty tree. `degree` must be at least 3.
    pub fn new(degree: usize) -> Result<Self, TreeError> {
        check_degree(degree)?;
        Ok(Self {
            degree,
            root: None,
            version: 0,
        })
    }

    /// Maximum children per node.
    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Number of successful mutations so far.
    pub fn version(&self) -> Version {
        self.version
    }

    /// All keys in ascending order.
    pub fn keys(&self) -> Vec<&T> {
        let mut out = Vec::new();
        if let Some(root) = &self.root {
            root.collect(&mut out);
        }
        out
    }
}

impl<T: Ord + fmt::Debug> Index<T> for Tree<T> {
    fn insert(&mut self, value: T) -> Result<bool, TreeError> {
        let Some(root) = self.root.as_mut() else {
            self.root = Some(Node::leaf(vec![value]));
            self.version += 1;
            return Ok(true);
        };
        match root.insert(value, max_keys(self.degree)) {
            Insertion::Present => return Ok(false),
            Insertion::Absorbed => {}
            Insertion::Split(median, right) => {
                if let Some(left) = self.root.take() {
                    self.root = Some(Node {
                        keys: vec![median],
                        children: vec![left, right],
                    });
                    trace!(height = self.height(), "root split");
                }
            }
        }
        self.version += 1;
        Ok(true)
    }

    fn erase(&mut self, value: &T) -> Result<bool, TreeError> {
        let Some(root) = self.root.as_mut() else {
            return Ok(false);
        };
        if !root.erase(value, true)? {
            return Ok(false);
        }
        if root.keys.is_empty() {
            self.root = None;
        }
        self.version += 1;
        Ok(true)
    }

    fn exists(&self, value: &T) -> bool {
        self.root.as_ref().is_some_and(|root| root.exists(value))
    }

    fn height(&self) -> usize {
        self.root.as_ref().map_or(0, Node::height)
    }

    fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    fn check_invariants(&self) -> Result<(), TreeError> {
        match &self.root {
            Some(root) => root.check(None, None, max_keys(self.degree), 0, &mut None),
            None => Ok(()),
        }
    }
}

/// One key per line, in order, indented three spaces per level below the
/// root.
impl<T: fmt::Display> fmt::Display for Tree<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.root {
            Some(root) => root.output(f, 0),
            None => Ok(()),
        }
    }
}
