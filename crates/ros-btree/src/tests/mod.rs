//! Tests for the ros-btree crate.

mod helpers;

mod versioned;
