//! Shared test utilities for ros-btree tests.

use crate::{Index, Tree, VersionedTree};

pub fn base_tree(degree: usize, keys: impl IntoIterator<Item = i32>) -> Tree<i32> {
    let mut tree = Tree::new(degree).unwrap();
    for key in keys {
        tree.insert(key).unwrap();
    }
    tree
}

pub fn versioned_tree(degree: usize, keys: impl IntoIterator<Item = i32>) -> VersionedTree<i32> {
    let mut tree = VersionedTree::new(degree).unwrap();
    for key in keys {
        tree.insert(key).unwrap();
    }
    tree
}
