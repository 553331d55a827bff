//! B-tree indexes over ordered keys.
//!
//! Two variants share the [`Index`] interface:
//!
//! - [`Tree`]: a plain B-tree with owned nodes.
//! - [`VersionedTree`]: every child edge carries the half-open range of
//!   tree versions it is visible in, so any retained version can be read
//!   while the tree keeps changing. The whole tree encodes to bytes and can
//!   be stored as a remote object.
//!
//! Neither variant merges or redistributes nodes on erase. An erase that
//! would leave a non-root node without keys is refused with
//! [`TreeError::Unsupported`] and changes nothing.

use std::fmt;

mod base;
mod error;
mod versioned;

#[cfg(test)]
mod tests;

pub use base::Tree;
pub use error::TreeError;
pub use versioned::{Edge, NodeId, VersionedTree};

/// Tree version number. Every successful mutation of a tree creates the
/// next version.
pub type Version = u64;

/// Operations common to both tree variants. On a [`VersionedTree`] they act
/// on the newest version.
pub trait Index<T> {
    /// Insert `value`. Returns `Ok(false)` if it was already present.
    fn insert(&mut self, value: T) -> Result<bool, TreeError>;

    /// Remove `value`. Returns `Ok(false)` if it was not present.
    fn erase(&mut self, value: &T) -> Result<bool, TreeError>;

    /// Whether `value` is present.
    fn exists(&self, value: &T) -> bool;

    /// Number of node levels; 0 for an empty tree.
    fn height(&self) -> usize;

    /// Whether the tree holds no keys.
    fn is_empty(&self) -> bool;

    /// Verify key order, fan-out bounds and equal leaf depth.
    fn check_invariants(&self) -> Result<(), TreeError>;
}

/// Largest number of keys a node of a degree-`degree` tree may hold.
pub(crate) fn max_keys(degree: usize) -> usize {
    degree - 1
}

pub(crate) fn check_degree(degree: usize) -> Result<(), TreeError> {
    if degree < 3 {
        return Err(TreeError::InvalidDegree(degree));
    }
    Ok(())
}

/// Indentation per tree level in the textual output.
pub(crate) const INDENT: &str = "   ";

/// Reason reported when an erase would leave a node without keys.
pub(crate) const UNDERFLOW: &str = "erase would empty a non-root node, rebalancing is not implemented";

/// Check one node's keys: count within `1..=max`, strictly ascending and
/// strictly between the bounds handed down by the parent.
pub(crate) fn check_keys<T: Ord + fmt::Debug>(
    keys: &[T],
    lo: Option<&T>,
    hi: Option<&T>,
    max: usize,
) -> Result<(), TreeError> {
    if keys.is_empty() || keys.len() > max {
        return Err(TreeError::Invariant(format!(
            "node holds {} keys, expected 1..={max}",
            keys.len()
        )));
    }
    if let Some(pair) = keys.windows(2).find(|pair| pair[0] >= pair[1]) {
        return Err(TreeError::Invariant(format!(
            "keys out of order: {:?} then {:?}",
            pair[0], pair[1]
        )));
    }
    if let (Some(lo), Some(first)) = (lo, keys.first())
        && first <= lo
    {
        return Err(TreeError::Invariant(format!(
            "key {first:?} not above parent bound {lo:?}"
        )));
    }
    if let (Some(hi), Some(last)) = (hi, keys.last())
        && last >= hi
    {
        return Err(TreeError::Invariant(format!(
            "key {last:?} not below parent bound {hi:?}"
        )));
    }
    Ok(())
}

/// Record the depth of a leaf, failing if an earlier leaf sat elsewhere.
pub(crate) fn check_leaf_depth(depth: usize, seen: &mut Option<usize>) -> Result<(), TreeError> {
    match *seen {
        None => {
            *seen = Some(depth);
            Ok(())
        }
        Some(expected) if expected == depth => Ok(()),
        Some(expected) => Err(TreeError::Invariant(format!(
            "leaf at depth {depth}, expected {expected}"
        ))),
    }
}
