//! Error types for the B-tree indexes.

use crate::Version;

/// Errors that can occur in index operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    /// A B-tree needs room for at least two keys per node.
    #[error("invalid degree {0}, must be at least 3")]
    InvalidDegree(usize),

    /// The operation would need rebalancing that is not implemented. The
    /// tree is left unchanged.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// The requested version is older than the prune horizon.
    #[error("version {requested} was pruned (horizon {horizon})")]
    VersionPruned { requested: Version, horizon: Version },

    /// The requested version has not been written yet.
    #[error("version {requested} is ahead of the tree (current {current})")]
    FutureVersion { requested: Version, current: Version },

    /// A structural invariant does not hold.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Encoding or decoding the tree failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}
