use std::collections::BTreeSet;

use super::helpers::{base_tree, versioned_tree};
use crate::{Index, TreeError, VersionedTree};

#[test]
fn test_read_stability_across_erase() {
    let mut tree = versioned_tree(5, [1, 2, 3]);
    let v1 = tree.version();
    let before = tree.output_at(v1).unwrap();

    assert!(tree.erase(&2).unwrap());
    let v2 = tree.version();
    assert_eq!(v2, v1 + 1);

    assert!(tree.exists_at(&2, v1).unwrap());
    assert!(!tree.exists_at(&2, v2).unwrap());
    assert_eq!(tree.keys_at(v1).unwrap(), vec![1, 2, 3]);
    assert_eq!(tree.keys_at(v2).unwrap(), vec![1, 3]);
    assert_eq!(tree.output_at(v1).unwrap(), before);
    tree.check_invariants_at(v1).unwrap();
    tree.check_invariants_at(v2).unwrap();
}

#[test]
fn test_every_version_of_two_three_tree() {
    let tree = versioned_tree(3, 1..=5);
    assert_eq!(tree.version(), 5);
    assert_eq!(tree.height(), 2);
    assert_eq!(tree.to_string(), base_tree(3, 1..=5).to_string());

    for version in 0..=5 {
        tree.check_invariants_at(version).unwrap();
        let expected: Vec<i32> = (1..=version as i32).collect();
        assert_eq!(tree.keys_at(version).unwrap(), expected);
    }
    assert_eq!(tree.height_at(0).unwrap(), 0);
    assert_eq!(tree.height_at(2).unwrap(), 1);
    assert_eq!(tree.height_at(3).unwrap(), 2);
}

#[test]
fn test_version_advances_only_on_change() {
    let mut tree = versioned_tree(4, [1, 2]);
    assert_eq!(tree.version(), 2);
    assert!(!tree.insert(2).unwrap());
    assert!(!tree.erase(&9).unwrap());
    assert_eq!(tree.version(), 2);
}

#[test]
fn test_untouched_nodes_are_shared() {
    let mut tree = versioned_tree(3, 1..=5);
    let nodes = tree.node_count();
    // Only the leaf holding 5 is copied; the root is relinked in place.
    tree.insert(6).unwrap();
    assert_eq!(tree.node_count(), nodes + 1);
    assert_eq!(tree.keys_at(5).unwrap(), vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_history_matches_snapshots() {
    let mut tree = VersionedTree::new(4).unwrap();
    let mut model = BTreeSet::new();
    let mut snapshots = vec![model.clone()];

    for key in 0..60 {
        tree.insert(key).unwrap();
        model.insert(key);
        snapshots.push(model.clone());
    }
    for key in (0..60).step_by(3) {
        match tree.erase(&key) {
            Ok(true) => {
                model.remove(&key);
                snapshots.push(model.clone());
            }
            Ok(false) => panic!("{key} should be present"),
            Err(TreeError::Unsupported(_)) => {}
            Err(e) => panic!("unexpected error {e}"),
        }
    }
    assert_eq!(tree.version() as usize, snapshots.len() - 1);
    for (version, snapshot) in snapshots.iter().enumerate() {
        let keys: Vec<i32> = snapshot.iter().copied().collect();
        assert_eq!(tree.keys_at(version as u64).unwrap(), keys, "version {version}");
        tree.check_invariants_at(version as u64).unwrap();
    }
}

#[test]
fn test_erasing_last_key_closes_root() {
    let mut tree = versioned_tree(3, [4]);
    assert!(tree.erase(&4).unwrap());
    assert!(tree.is_empty());
    assert_eq!(tree.height(), 0);
    assert!(tree.exists_at(&4, 1).unwrap());

    tree.insert(5).unwrap();
    assert_eq!(tree.keys_at(3).unwrap(), vec![5]);
    assert!(tree.keys_at(2).unwrap().is_empty());
}

#[test]
fn test_underflow_is_refused_and_changes_nothing() {
    let mut tree = versioned_tree(3, 1..=5);
    let nodes = tree.node_count();
    assert!(matches!(tree.erase(&3), Err(TreeError::Unsupported(_))));
    assert_eq!(tree.version(), 5);
    assert_eq!(tree.node_count(), nodes);
    tree.check_invariants().unwrap();
}

#[test]
fn test_reads_outside_retained_range() {
    let mut tree = versioned_tree(5, [1, 2, 3]);
    assert_eq!(
        tree.exists_at(&1, 4),
        Err(TreeError::FutureVersion {
            requested: 4,
            current: 3
        })
    );

    // Versions 1 and 2 each had their own root leaf.
    assert_eq!(tree.prune(3).unwrap(), 2);
    assert_eq!(tree.horizon(), 3);
    assert_eq!(tree.node_count(), 1);
    assert_eq!(
        tree.keys_at(2),
        Err(TreeError::VersionPruned {
            requested: 2,
            horizon: 3
        })
    );
    assert_eq!(tree.keys_at(3).unwrap(), vec![1, 2, 3]);

    // Pruning again below the horizon does nothing.
    assert_eq!(tree.prune(1).unwrap(), 0);
    assert!(matches!(tree.prune(9), Err(TreeError::FutureVersion { .. })));
}

#[test]
fn test_prune_keeps_later_versions_intact() {
    let mut tree = versioned_tree(3, 0..30);
    let expected: Vec<Vec<i32>> = (20..=30).map(|v| tree.keys_at(v).unwrap()).collect();

    let freed = tree.prune(20).unwrap();
    assert!(freed > 0);
    for (i, keys) in expected.iter().enumerate() {
        let version = 20 + i as u64;
        assert_eq!(&tree.keys_at(version).unwrap(), keys);
        tree.check_invariants_at(version).unwrap();
    }

    // Freed arena slots are reused.
    let before = tree.node_count();
    tree.insert(100).unwrap();
    assert!(tree.node_count() > before);
    tree.check_invariants().unwrap();
}

#[test]
fn test_encoded_tree_keeps_history() {
    let mut tree = versioned_tree(4, 0..20);
    assert!(tree.erase(&19).unwrap());
    let bytes = tree.encode().unwrap();

    let decoded: VersionedTree<i32> = VersionedTree::decode(&bytes).unwrap();
    assert_eq!(decoded.version(), tree.version());
    for version in 0..=tree.version() {
        assert_eq!(decoded.keys_at(version), tree.keys_at(version));
    }
    assert_eq!(decoded.to_string(), tree.to_string());
}

#[test]
fn test_decode_rejects_garbage() {
    assert!(matches!(
        VersionedTree::<i32>::decode(&[0xff, 0xff, 0xff]),
        Err(TreeError::Serialization(_))
    ));
}
