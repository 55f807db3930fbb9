//! Failure kinds surfaced by tree operations.
//!
//! Structural invariants are intact whenever an error is returned: detection
//! always precedes mutation, so no operation partially mutates and then fails.

use thiserror::Error;

/// The error type for fallible tree operations.
///
/// Non-error signals (a rejected duplicate insert, an update or delete
/// applied to a path that is not on an entry) are reported through the
/// returned path's `on`-flag or a boolean, not through this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TreeError {
    /// The supplied path was stamped by an earlier version of the tree.
    ///
    /// Every committed mutation increments the tree's version counter, which
    /// invalidates all previously issued paths. Path-consuming operations
    /// check the stamp first and fail fast.
    #[error("path version {path_version} does not match tree version {tree_version}")]
    InvalidPath {
        /// The version the path was stamped with when it was issued.
        path_version: u64,
        /// The tree's current version.
        tree_version: u64,
    },

    /// The injected comparator contradicted itself.
    ///
    /// Whenever a comparison returns a nonzero ordering, the reversed
    /// comparison is cross-checked; any disagreement reports this error
    /// before anything is mutated.
    #[error("comparator is inconsistent: compare(a, b) and compare(b, a) disagree")]
    InconsistentComparator,
}
