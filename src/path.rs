//! Paths: root-to-leaf cursors with version stamps.
//!
//! A [`TreePath`] records the descent from the root to one leaf position: the
//! branch visited at every level together with the child index taken, then
//! the leaf and an index into its entries. The `on`-flag distinguishes a path
//! pointing *at* an entry from one lying in a crack (between two entries,
//! before the first, or after the last).
//!
//! Paths are the universal currency of the tree API: searches produce them,
//! iteration advances them, and mutations consume them. Every path carries
//! the tree version it was issued under; a single integer comparison against
//! the tree's current version decides validity, replacing any broader
//! iterator-invalidation convention.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

use smallvec::SmallVec;

use crate::ReferenceCounter;
use crate::node::{BranchLink, BranchNode, LeafLink, LeafNode, NodeLink};

// =============================================================================
// Segments
// =============================================================================

/// One level of a path: the branch visited and the child index taken.
pub(crate) struct PathSegment<K, T> {
    pub(crate) branch: BranchLink<K, T>,
    pub(crate) child_index: usize,
}

impl<K, T> Clone for PathSegment<K, T> {
    fn clone(&self) -> Self {
        Self {
            branch: self.branch.clone(),
            child_index: self.child_index,
        }
    }
}

/// Branch segments, inline up to the height any realistic tree reaches.
pub(crate) type PathSegments<K, T> = SmallVec<[PathSegment<K, T>; 8]>;

// =============================================================================
// Remapping
// =============================================================================

/// Old-identity to new-link map built while the copy-on-write engine clones a
/// chain of nodes, and applied to outstanding paths so they keep pointing at
/// the private copies.
pub(crate) struct NodeRemap<K, T> {
    leaves: HashMap<*const RefCell<LeafNode<T>>, LeafLink<T>>,
    branches: HashMap<*const RefCell<BranchNode<K, T>>, BranchLink<K, T>>,
}

impl<K, T> NodeRemap<K, T> {
    pub(crate) fn new() -> Self {
        Self {
            leaves: HashMap::new(),
            branches: HashMap::new(),
        }
    }

    pub(crate) fn record_leaf(&mut self, old: &LeafLink<T>, new: LeafLink<T>) {
        self.leaves.insert(ReferenceCounter::as_ptr(old), new);
    }

    pub(crate) fn record_branch(&mut self, old: &BranchLink<K, T>, new: BranchLink<K, T>) {
        self.branches.insert(ReferenceCounter::as_ptr(old), new);
    }

    pub(crate) fn leaf_for(&self, link: &LeafLink<T>) -> Option<LeafLink<T>> {
        self.leaves.get(&ReferenceCounter::as_ptr(link)).cloned()
    }

    pub(crate) fn branch_for(&self, link: &BranchLink<K, T>) -> Option<BranchLink<K, T>> {
        self.branches.get(&ReferenceCounter::as_ptr(link)).cloned()
    }
}

// =============================================================================
// TreePath
// =============================================================================

/// A cursor into a [`CowTree`](crate::CowTree).
///
/// A path either points at an entry (`is_on_entry()` returns `true`) or lies
/// in a crack. Stepping from a crack lands on the nearest entry in the
/// direction of motion. Paths are cheap to clone: cloning duplicates the
/// segment bookkeeping while sharing all node references.
///
/// A path is valid only for the tree version it was stamped with; any
/// committed mutation invalidates every outstanding path, and path-consuming
/// operations report [`TreeError::InvalidPath`](crate::TreeError::InvalidPath)
/// for stale ones.
pub struct TreePath<K, T> {
    pub(crate) branches: PathSegments<K, T>,
    pub(crate) leaf: Option<LeafLink<T>>,
    pub(crate) leaf_index: usize,
    pub(crate) on_entry: bool,
    pub(crate) version: u64,
}

impl<K, T> TreePath<K, T> {
    /// A path into a tree with no effective root.
    pub(crate) const fn vacant(version: u64) -> Self {
        Self {
            branches: SmallVec::new_const(),
            leaf: None,
            leaf_index: 0,
            on_entry: false,
            version,
        }
    }

    /// Whether this path currently points at an entry.
    ///
    /// `false` means the path lies in a crack: between two entries, before
    /// the first, or after the last. A path returned by a mutation that did
    /// not place an entry (for example a rejected duplicate insert) is always
    /// off-entry.
    #[must_use]
    pub const fn is_on_entry(&self) -> bool {
        self.on_entry
    }

    /// The tree version this path was stamped with.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Rewrites branch and leaf references through `remap`, leaving links
    /// without a recorded replacement untouched.
    pub(crate) fn remap(&mut self, remap: &NodeRemap<K, T>) {
        for segment in &mut self.branches {
            if let Some(replacement) = remap.branch_for(&segment.branch) {
                segment.branch = replacement;
            }
        }
        let replacement = self.leaf.as_ref().and_then(|leaf| remap.leaf_for(leaf));
        if let Some(leaf) = replacement {
            self.leaf = Some(leaf);
        }
    }

    /// Whether two paths reference the same leaf position, ignoring the
    /// version stamp and the `on`-flag.
    pub(crate) fn same_position(&self, other: &Self) -> bool {
        let same_leaf = match (&self.leaf, &other.leaf) {
            (Some(left), Some(right)) => ReferenceCounter::ptr_eq(left, right),
            (None, None) => true,
            _ => false,
        };
        same_leaf && self.leaf_index == other.leaf_index
    }

    // -------------------------------------------------------------------------
    // Structural navigation
    //
    // Stepping never consults the tree: the recorded branch stack is enough to
    // climb out of an exhausted leaf and descend into the adjacent subtree.
    // Version checking is the tree's concern, not the path's.
    // -------------------------------------------------------------------------

    /// Extends this path from `node` down the leftmost spine, landing on the
    /// subtree's first entry (off-entry only when the subtree is empty).
    pub(crate) fn descend_to_first(&mut self, node: NodeLink<K, T>) {
        let mut current = node;
        loop {
            match current {
                NodeLink::Branch(branch) => {
                    let child = branch.borrow().children[0].clone();
                    self.branches.push(PathSegment {
                        branch,
                        child_index: 0,
                    });
                    current = child;
                }
                NodeLink::Leaf(leaf) => {
                    self.leaf_index = 0;
                    self.on_entry = !leaf.borrow().entries.is_empty();
                    self.leaf = Some(leaf);
                    return;
                }
            }
        }
    }

    /// Extends this path from `node` down the rightmost spine, landing on the
    /// subtree's last entry.
    pub(crate) fn descend_to_last(&mut self, node: NodeLink<K, T>) {
        let mut current = node;
        loop {
            match current {
                NodeLink::Branch(branch) => {
                    let child_index = branch.borrow().children.len() - 1;
                    let child = branch.borrow().children[child_index].clone();
                    self.branches.push(PathSegment {
                        branch,
                        child_index,
                    });
                    current = child;
                }
                NodeLink::Leaf(leaf) => {
                    let length = leaf.borrow().entries.len();
                    self.leaf_index = length.saturating_sub(1);
                    self.on_entry = length > 0;
                    self.leaf = Some(leaf);
                    return;
                }
            }
        }
    }

    /// Advances to the next entry in key order.
    ///
    /// From a crack this lands on the upcoming entry. Past the last entry the
    /// path settles on the end crack (off-entry, index at leaf length) and
    /// stays there.
    pub(crate) fn step_next(&mut self) {
        let Some(leaf) = self.leaf.clone() else {
            return;
        };
        let length = leaf.borrow().entries.len();
        if !self.on_entry && self.leaf_index < length {
            self.on_entry = true;
            return;
        }
        if self.leaf_index + 1 < length {
            self.leaf_index += 1;
            self.on_entry = true;
            return;
        }
        // Climb past every exhausted level, then descend leftmost into the
        // next subtree over.
        let mut keep = self.branches.len();
        while keep > 0 {
            let segment = &self.branches[keep - 1];
            if segment.child_index + 1 < segment.branch.borrow().children.len() {
                break;
            }
            keep -= 1;
        }
        if keep == 0 {
            self.on_entry = false;
            self.leaf_index = length;
            return;
        }
        self.branches.truncate(keep);
        let next = {
            let segment = &mut self.branches[keep - 1];
            segment.child_index += 1;
            segment.branch.borrow().children[segment.child_index].clone()
        };
        self.descend_to_first(next);
    }

    /// Advances to the prior entry in key order; the mirror of
    /// [`TreePath::step_next`]. Before the first entry the path settles on
    /// the start crack (off-entry, index zero).
    pub(crate) fn step_prior(&mut self) {
        if self.leaf.is_none() {
            return;
        }
        if self.leaf_index > 0 {
            self.leaf_index -= 1;
            self.on_entry = true;
            return;
        }
        let mut keep = self.branches.len();
        while keep > 0 {
            if self.branches[keep - 1].child_index > 0 {
                break;
            }
            keep -= 1;
        }
        if keep == 0 {
            self.on_entry = false;
            self.leaf_index = 0;
            return;
        }
        self.branches.truncate(keep);
        let prior = {
            let segment = &mut self.branches[keep - 1];
            segment.child_index -= 1;
            segment.branch.borrow().children[segment.child_index].clone()
        };
        self.descend_to_last(prior);
    }
}

impl<K, T> Clone for TreePath<K, T> {
    fn clone(&self) -> Self {
        Self {
            branches: self.branches.clone(),
            leaf: self.leaf.clone(),
            leaf_index: self.leaf_index,
            on_entry: self.on_entry,
            version: self.version,
        }
    }
}

/// Path equality compares leaf identity, leaf index, the `on`-flag, and the
/// version stamp.
///
/// Including the version means two cursors at the same position taken from
/// different snapshots of the tree compare unequal. This is deliberate:
/// equality answers "do these cursors name the same position in the same
/// tree state", not merely "the same key".
impl<K, T> PartialEq for TreePath<K, T> {
    fn eq(&self, other: &Self) -> bool {
        self.same_position(other)
            && self.on_entry == other.on_entry
            && self.version == other.version
    }
}

impl<K, T> Eq for TreePath<K, T> {}

impl<K, T> fmt::Debug for TreePath<K, T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TreePath")
            .field("depth", &self.branches.len())
            .field("leaf_index", &self.leaf_index)
            .field("on_entry", &self.on_entry)
            .field("version", &self.version)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReferenceCounter;
    use crate::node::{LeafNode, TreeIdentity};
    use rstest::rstest;

    fn single_leaf_path(values: &[i32]) -> TreePath<i32, i32> {
        let owner = ReferenceCounter::new(TreeIdentity);
        let entries = values
            .iter()
            .map(|value| ReferenceCounter::new(*value))
            .collect();
        let leaf = LeafNode::new(owner, entries).into_link();
        let mut path = TreePath::vacant(0);
        path.descend_to_first(NodeLink::Leaf(leaf));
        path
    }

    #[rstest]
    fn test_vacant_path_is_off_entry_and_stays_put() {
        let mut path: TreePath<i32, i32> = TreePath::vacant(3);
        assert!(!path.is_on_entry());
        assert_eq!(path.version(), 3);

        path.step_next();
        assert!(!path.is_on_entry());
        path.step_prior();
        assert!(!path.is_on_entry());
    }

    #[rstest]
    fn test_step_next_walks_leaf_then_settles_on_end_crack() {
        let mut path = single_leaf_path(&[1, 2, 3]);
        assert!(path.is_on_entry());
        assert_eq!(path.leaf_index, 0);

        path.step_next();
        assert_eq!(path.leaf_index, 1);
        path.step_next();
        assert_eq!(path.leaf_index, 2);
        path.step_next();
        assert!(!path.is_on_entry());
        assert_eq!(path.leaf_index, 3);

        // The end crack is absorbing for forward steps but not backward ones.
        path.step_next();
        assert!(!path.is_on_entry());
        path.step_prior();
        assert!(path.is_on_entry());
        assert_eq!(path.leaf_index, 2);
    }

    #[rstest]
    fn test_step_prior_from_start_crack_stays_off_entry() {
        let mut path = single_leaf_path(&[1, 2]);
        path.on_entry = false;
        path.step_prior();
        assert!(!path.is_on_entry());
        assert_eq!(path.leaf_index, 0);
    }

    #[rstest]
    fn test_crack_step_lands_on_upcoming_entry() {
        let mut path = single_leaf_path(&[1, 2, 3]);
        path.leaf_index = 1;
        path.on_entry = false;

        path.step_next();
        assert!(path.is_on_entry());
        assert_eq!(path.leaf_index, 1);
    }

    #[rstest]
    fn test_clone_shares_nodes_but_moves_independently() {
        let mut path = single_leaf_path(&[1, 2, 3]);
        let snapshot = path.clone();
        assert_eq!(path, snapshot);

        path.step_next();
        assert_ne!(path, snapshot);
        assert_eq!(snapshot.leaf_index, 0);
    }

    #[rstest]
    fn test_equality_includes_version_stamp() {
        let path = single_leaf_path(&[1]);
        let mut stale = path.clone();
        stale.version = path.version + 1;

        assert!(path.same_position(&stale));
        assert_ne!(path, stale);
    }

    #[rstest]
    fn test_remap_rewrites_only_recorded_links() {
        let mut path = single_leaf_path(&[1, 2]);
        let original = path.leaf.clone().expect("path has a leaf");
        let replacement = original
            .borrow()
            .clone_for(ReferenceCounter::new(TreeIdentity))
            .into_link();

        let mut remap = NodeRemap::new();
        remap.record_leaf(&original, replacement.clone());
        path.remap(&remap);

        let remapped = path.leaf.clone().expect("path has a leaf");
        assert!(ReferenceCounter::ptr_eq(&remapped, &replacement));

        // A second remap through an empty map changes nothing.
        path.remap(&NodeRemap::new());
        let unchanged = path.leaf.clone().expect("path has a leaf");
        assert!(ReferenceCounter::ptr_eq(&unchanged, &replacement));
    }
}
