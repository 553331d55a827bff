//! Tests for the ros-client crate.

mod helpers;
