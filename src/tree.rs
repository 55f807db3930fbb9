//! The copy-on-write B+ tree.
//!
//! This module provides [`CowTree`], an in-memory ordered container of
//! opaque entries whose keys are derived by an injected extractor and ordered
//! by an injected comparator.
//!
//! # Overview
//!
//! A `CowTree` is a B+-like tree: leaves hold the entries, branches hold
//! partition keys routing between children. On top of the classic structure
//! it layers a copy-on-write overlay: a *derived* tree constructed with
//! [`CowTree::derive`] observes all of its base's entries while sharing the
//! base's nodes by reference. The first mutation the derived tree performs
//! clones only the nodes along the touched path, re-pointing new copies from
//! the edited node up to a fresh derived-local root; the base is never
//! perturbed.
//!
//! Every node carries an owner token, so deciding "already private" versus
//! "foreign, must clone" is a single pointer comparison. Every committed
//! mutation bumps the tree's version counter exactly once, which invalidates
//! all outstanding [`TreePath`] cursors; path-consuming operations check the
//! stamp first and fail fast with [`TreeError::InvalidPath`].
//!
//! - O(log N) find / insert / update / delete
//! - O(1) amortised cursor stepping
//! - O(N / fill) counting by leaf walk
//!
//! # Examples
//!
//! ```rust
//! use cowbtree::CowTree;
//!
//! let mut base = CowTree::new(|entry: &(i32, &str)| entry.0);
//! base.insert((10, "ten")).unwrap();
//! base.insert((20, "twenty")).unwrap();
//!
//! // A derived tree observes the base and diverges privately.
//! let mut derived = base.derive();
//! derived.insert((15, "fifteen")).unwrap();
//!
//! assert_eq!(derived.get_count(), 3);
//! assert_eq!(base.get_count(), 2);
//! assert_eq!(base.get(&15).unwrap(), None);
//! ```

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Bound, RangeBounds};

use crate::ReferenceCounter;
use crate::error::TreeError;
use crate::iter::{
    CowTreeAscendingIterator, CowTreeDescendingIterator, CowTreeEntryIterator,
    CowTreeRangeIterator,
};
use crate::node::{
    BranchLink, BranchNode, HALF_CAPACITY, LeafLink, LeafNode, NODE_CAPACITY, NodeLink,
    OwnerToken, TreeIdentity,
};
use crate::path::{NodeRemap, PathSegment, TreePath};

/// Shared handle to an entry stored in a tree.
///
/// Entries are frozen from the tree's perspective: the tree never mutates an
/// entry in place, and replacing one (via update or upsert) swaps the handle
/// rather than the payload. Handles obtained from one tree remain valid after
/// any number of mutations.
pub type EntryHandle<T> = ReferenceCounter<T>;

type KeyExtractor<K, T> = dyn Fn(&T) -> K;
type KeyComparator<K> = dyn Fn(&K, &K) -> Ordering;

/// The slot a tree's local root lives in.
///
/// Derived trees keep a handle to their base's slot, so a base installing a
/// new root (its first materialisation, a root split, a root collapse) stays
/// observable until the derived tree materialises its own root or calls
/// [`CowTree::clear_base`].
type RootSlot<K, T> = ReferenceCounter<RefCell<Option<NodeLink<K, T>>>>;

/// One link of a derived tree's view onto its base lineage: the base's root
/// slot plus the chain the base itself was derived over, captured at
/// derivation time.
struct BaseChain<K, T> {
    slot: RootSlot<K, T>,
    parent: Option<ReferenceCounter<BaseChain<K, T>>>,
}

// =============================================================================
// CowTree Definition
// =============================================================================

/// An in-memory ordered container with a copy-on-write overlay.
///
/// Entries are opaque payloads; their keys are derived by the extractor
/// supplied at construction and ordered by the comparator (defaulting to
/// [`Ord`]). Keys are unique: inserting a duplicate is rejected, reported
/// through the returned path's `on`-flag rather than an error.
///
/// All positional operations speak [`TreePath`]: searches produce paths,
/// iteration advances them, mutations consume them. Any committed mutation
/// invalidates every outstanding path.
///
/// A tree derived with [`CowTree::derive`] observes its base until it is
/// mutated; mutations clone the touched nodes only. The base must outlive
/// the derived tree unless [`CowTree::clear_base`] is called. The container
/// is single-threaded by construction; exactly one logical actor may mutate
/// a tree at a time.
///
/// # Examples
///
/// ```rust
/// use cowbtree::CowTree;
///
/// let mut tree = CowTree::new(|entry: &(i32, &str)| entry.0);
/// tree.insert((2, "two")).unwrap();
/// tree.insert((1, "one")).unwrap();
///
/// let keys: Vec<i32> = tree.iter().map(|entry| entry.0).collect();
/// assert_eq!(keys, vec![1, 2]);
/// ```
pub struct CowTree<K, T> {
    root: RootSlot<K, T>,
    base: Option<ReferenceCounter<BaseChain<K, T>>>,
    owner: OwnerToken,
    version: u64,
    key_of: ReferenceCounter<KeyExtractor<K, T>>,
    comparator: ReferenceCounter<KeyComparator<K>>,
}

// =============================================================================
// Construction
// =============================================================================

impl<K, T> CowTree<K, T> {
    /// Creates an empty tree whose keys are ordered by [`Ord`].
    ///
    /// # Arguments
    ///
    /// * `key_of` - Derives the key of an entry. Two entries with equal keys
    ///   are the same logical record; keys are unique within a tree.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use cowbtree::CowTree;
    ///
    /// let mut tree = CowTree::new(|entry: &(u32, String)| entry.0);
    /// tree.insert((7, "seven".to_string())).unwrap();
    /// assert!(tree.get(&7).unwrap().is_some());
    /// ```
    #[must_use]
    pub fn new<F>(key_of: F) -> Self
    where
        K: Ord,
        F: Fn(&T) -> K + 'static,
    {
        Self::with_comparator(key_of, |left: &K, right: &K| left.cmp(right))
    }

    /// Creates an empty tree with a custom key comparator.
    ///
    /// The comparator must be total and antisymmetric. It is cross-checked at
    /// every nonzero comparison; a comparator that disagrees with its own
    /// reversal makes operations fail with
    /// [`TreeError::InconsistentComparator`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// use cowbtree::CowTree;
    ///
    /// // Largest key first.
    /// let mut tree = CowTree::with_comparator(|entry: &i32| *entry, |a, b| b.cmp(a));
    /// tree.insert(1).unwrap();
    /// tree.insert(3).unwrap();
    /// tree.insert(2).unwrap();
    ///
    /// let order: Vec<i32> = tree.iter().map(|entry| *entry).collect();
    /// assert_eq!(order, vec![3, 2, 1]);
    /// ```
    #[must_use]
    pub fn with_comparator<F, C>(key_of: F, comparator: C) -> Self
    where
        F: Fn(&T) -> K + 'static,
        C: Fn(&K, &K) -> Ordering + 'static,
    {
        Self {
            root: ReferenceCounter::new(RefCell::new(None)),
            base: None,
            owner: ReferenceCounter::new(TreeIdentity),
            version: 0,
            key_of: ReferenceCounter::new(key_of),
            comparator: ReferenceCounter::new(comparator),
        }
    }

    /// Creates a tree that observes this tree's entries until it is mutated.
    ///
    /// The derived tree shares this tree's nodes by reference. Its mutations
    /// clone only the nodes they touch, never perturbing this tree. A derived
    /// tree may itself serve as base to a further derived tree.
    ///
    /// This tree must outlive the derived tree's use of shared structure
    /// until the derived tree calls [`CowTree::clear_base`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// use cowbtree::CowTree;
    ///
    /// let mut base = CowTree::new(|entry: &i32| *entry);
    /// base.insert(1).unwrap();
    ///
    /// let mut derived = base.derive();
    /// derived.insert(2).unwrap();
    ///
    /// assert_eq!(base.get_count(), 1);
    /// assert_eq!(derived.get_count(), 2);
    /// ```
    #[must_use]
    pub fn derive(&self) -> Self {
        Self {
            root: ReferenceCounter::new(RefCell::new(None)),
            base: Some(ReferenceCounter::new(BaseChain {
                slot: self.root.clone(),
                parent: self.base.clone(),
            })),
            owner: ReferenceCounter::new(TreeIdentity),
            version: 0,
            key_of: self.key_of.clone(),
            comparator: self.comparator.clone(),
        }
    }

    /// Captures the current effective root as this tree's own root and drops
    /// the base reference.
    ///
    /// Afterwards the former base can no longer surface a new root through
    /// this tree; structural sharing of individual nodes continues to exist
    /// in memory. A tree that is empty through its whole base lineage
    /// materialises an empty private leaf. No nodes are modified and the
    /// version is not bumped, so outstanding paths stay valid.
    pub fn clear_base(&mut self) {
        let needs_capture = self.root.borrow().is_none();
        if needs_capture {
            let captured = self.effective_root().unwrap_or_else(|| {
                NodeLink::Leaf(LeafNode::new(self.owner.clone(), Vec::new()).into_link())
            });
            *self.root.borrow_mut() = Some(captured);
        }
        self.base = None;
    }
}

// =============================================================================
// Search and Navigation
// =============================================================================

impl<K, T> CowTree<K, T> {
    /// A path to the first entry in key order; off-entry iff the tree is
    /// empty.
    #[must_use]
    pub fn first(&self) -> TreePath<K, T> {
        let mut path = TreePath::vacant(self.version);
        if let Some(root) = self.effective_root() {
            path.descend_to_first(root);
        }
        path
    }

    /// A path to the last entry in key order; off-entry iff the tree is
    /// empty.
    #[must_use]
    pub fn last(&self) -> TreePath<K, T> {
        let mut path = TreePath::vacant(self.version);
        if let Some(root) = self.effective_root() {
            path.descend_to_last(root);
        }
        path
    }

    /// Descends to `key`.
    ///
    /// When the key is present the returned path is on the entry; when absent
    /// it lies in the crack at the key's insertion point.
    ///
    /// # Errors
    ///
    /// [`TreeError::InconsistentComparator`] when the comparator contradicts
    /// itself on a pair of keys compared during the descent.
    pub fn find(&self, key: &K) -> Result<TreePath<K, T>, TreeError> {
        self.find_path(key)
    }

    /// The entry stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// [`TreeError::InconsistentComparator`] as for [`CowTree::find`].
    pub fn get(&self, key: &K) -> Result<Option<EntryHandle<T>>, TreeError> {
        let path = self.find_path(key)?;
        self.at(&path)
    }

    /// The entry the path points at, or `None` when the path is in a crack.
    ///
    /// # Errors
    ///
    /// [`TreeError::InvalidPath`] when the path is stale.
    pub fn at(&self, path: &TreePath<K, T>) -> Result<Option<EntryHandle<T>>, TreeError> {
        self.ensure_valid(path)?;
        if !path.on_entry {
            return Ok(None);
        }
        Ok(path
            .leaf
            .as_ref()
            .and_then(|leaf| leaf.borrow().entries.get(path.leaf_index).cloned()))
    }

    /// Whether the path was issued by this tree's current version.
    #[must_use]
    pub fn is_valid(&self, path: &TreePath<K, T>) -> bool {
        path.version == self.version
    }

    /// Advances the path to the next entry in key order, in place.
    ///
    /// From a crack the path lands on the upcoming entry; past the last entry
    /// it settles off-entry on the end crack.
    ///
    /// # Errors
    ///
    /// [`TreeError::InvalidPath`] when the path is stale.
    pub fn move_next(&self, path: &mut TreePath<K, T>) -> Result<(), TreeError> {
        self.ensure_valid(path)?;
        path.step_next();
        Ok(())
    }

    /// Moves the path to the prior entry in key order, in place; the mirror
    /// of [`CowTree::move_next`].
    ///
    /// # Errors
    ///
    /// [`TreeError::InvalidPath`] when the path is stale.
    pub fn move_prior(&self, path: &mut TreePath<K, T>) -> Result<(), TreeError> {
        self.ensure_valid(path)?;
        path.step_prior();
        Ok(())
    }

    /// A new path one entry past the given one.
    ///
    /// # Errors
    ///
    /// [`TreeError::InvalidPath`] when the path is stale.
    pub fn next(&self, path: &TreePath<K, T>) -> Result<TreePath<K, T>, TreeError> {
        let mut advanced = path.clone();
        self.move_next(&mut advanced)?;
        Ok(advanced)
    }

    /// A new path one entry before the given one.
    ///
    /// # Errors
    ///
    /// [`TreeError::InvalidPath`] when the path is stale.
    pub fn prior(&self, path: &TreePath<K, T>) -> Result<TreePath<K, T>, TreeError> {
        let mut moved = path.clone();
        self.move_prior(&mut moved)?;
        Ok(moved)
    }

    /// Counts every entry by walking the leaves.
    ///
    /// No length field is maintained; counting costs O(N / fill).
    #[must_use]
    pub fn get_count(&self) -> usize {
        self.count_from_path(&self.first())
    }

    /// Counts the entries from the path's position (inclusive) to the end of
    /// the tree.
    ///
    /// # Errors
    ///
    /// [`TreeError::InvalidPath`] when the path is stale.
    pub fn get_count_from(&self, path: &TreePath<K, T>) -> Result<usize, TreeError> {
        self.ensure_valid(path)?;
        Ok(self.count_from_path(path))
    }

    /// Whether the tree holds no entries. Costs a descent, not O(1).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.first().on_entry
    }

    /// A lazy iterator over every entry in ascending key order.
    ///
    /// The iterator borrows the tree, so the borrow checker rules out
    /// mutation while it is alive.
    #[must_use]
    pub fn iter(&self) -> CowTreeEntryIterator<'_, K, T> {
        CowTreeEntryIterator {
            path: self.first(),
            started: false,
            marker: PhantomData,
        }
    }

    /// A lazy cursor sequence walking ascending from `path`.
    ///
    /// The first yielded path is `path` itself when on an entry, otherwise
    /// the nearest entry forward of its crack.
    ///
    /// # Errors
    ///
    /// [`TreeError::InvalidPath`] when the path is stale.
    pub fn ascending(
        &self,
        path: &TreePath<K, T>,
    ) -> Result<CowTreeAscendingIterator<'_, K, T>, TreeError> {
        self.ensure_valid(path)?;
        Ok(CowTreeAscendingIterator {
            path: path.clone(),
            started: false,
            marker: PhantomData,
        })
    }

    /// A lazy cursor sequence walking descending from `path`; the mirror of
    /// [`CowTree::ascending`].
    ///
    /// # Errors
    ///
    /// [`TreeError::InvalidPath`] when the path is stale.
    pub fn descending(
        &self,
        path: &TreePath<K, T>,
    ) -> Result<CowTreeDescendingIterator<'_, K, T>, TreeError> {
        self.ensure_valid(path)?;
        Ok(CowTreeDescendingIterator {
            path: path.clone(),
            started: false,
            marker: PhantomData,
        })
    }

    /// A lazy cursor sequence over the entries within `bounds`, ascending.
    ///
    /// Both endpoints are resolved when the iterator is constructed; the walk
    /// itself is purely structural.
    ///
    /// # Errors
    ///
    /// [`TreeError::InconsistentComparator`] when resolving an endpoint
    /// trips the comparator cross-check.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use cowbtree::CowTree;
    ///
    /// let mut tree = CowTree::new(|entry: &i32| *entry);
    /// for key in 0..10 {
    ///     tree.insert(key).unwrap();
    /// }
    ///
    /// let keys: Vec<i32> = tree
    ///     .range(3..=6)
    ///     .unwrap()
    ///     .map(|path| *tree.at(&path).unwrap().unwrap())
    ///     .collect();
    /// assert_eq!(keys, vec![3, 4, 5, 6]);
    /// ```
    pub fn range<R>(&self, bounds: R) -> Result<CowTreeRangeIterator<'_, K, T>, TreeError>
    where
        R: RangeBounds<K>,
    {
        let current = self.range_ceiling(bounds.start_bound())?;
        let end = self.range_floor(bounds.end_bound())?;
        self.range_iterator(current, end, false)
    }

    /// A lazy cursor sequence over the entries within `bounds`, descending.
    ///
    /// # Errors
    ///
    /// As for [`CowTree::range`].
    pub fn range_rev<R>(&self, bounds: R) -> Result<CowTreeRangeIterator<'_, K, T>, TreeError>
    where
        R: RangeBounds<K>,
    {
        let current = self.range_floor(bounds.end_bound())?;
        let end = self.range_ceiling(bounds.start_bound())?;
        self.range_iterator(current, end, true)
    }

    // -------------------------------------------------------------------------
    // Internal search plumbing
    // -------------------------------------------------------------------------

    fn extract_key(&self, entry: &T) -> K {
        (self.key_of)(entry)
    }

    /// Compares two keys, cross-checking the comparator whenever the forward
    /// comparison is nonzero.
    fn compare(&self, left: &K, right: &K) -> Result<Ordering, TreeError> {
        let forward = (self.comparator)(left, right);
        if forward != Ordering::Equal {
            let reverse = (self.comparator)(right, left);
            if reverse != forward.reverse() {
                return Err(TreeError::InconsistentComparator);
            }
        }
        Ok(forward)
    }

    /// The root this tree currently observes: its own when set, otherwise the
    /// first root surfaced along the captured base lineage.
    fn effective_root(&self) -> Option<NodeLink<K, T>> {
        if let Some(root) = self.root.borrow().as_ref() {
            return Some(root.clone());
        }
        let mut chain = self.base.as_deref();
        while let Some(link) = chain {
            if let Some(root) = link.slot.borrow().as_ref() {
                return Some(root.clone());
            }
            chain = link.parent.as_deref();
        }
        None
    }

    fn install_root(&self, root: NodeLink<K, T>) {
        *self.root.borrow_mut() = Some(root);
    }

    fn ensure_valid(&self, path: &TreePath<K, T>) -> Result<(), TreeError> {
        if path.version == self.version {
            Ok(())
        } else {
            Err(TreeError::InvalidPath {
                path_version: path.version,
                tree_version: self.version,
            })
        }
    }

    fn find_path(&self, key: &K) -> Result<TreePath<K, T>, TreeError> {
        let mut path = TreePath::vacant(self.version);
        let Some(mut current) = self.effective_root() else {
            return Ok(path);
        };
        loop {
            match current {
                NodeLink::Branch(branch) => {
                    let child_index = self.locate_child(&branch, key)?;
                    let child = branch.borrow().children[child_index].clone();
                    path.branches.push(PathSegment {
                        branch,
                        child_index,
                    });
                    current = child;
                }
                NodeLink::Leaf(leaf) => {
                    let (found, entry_index) = self.locate_entry(&leaf, key)?;
                    path.leaf = Some(leaf);
                    path.leaf_index = entry_index;
                    path.on_entry = found;
                    return Ok(path);
                }
            }
        }
    }

    /// The child a key belongs under: binary search over the partitions, with
    /// an equal key steering right (the match is at least that far).
    fn locate_child(&self, branch: &BranchLink<K, T>, key: &K) -> Result<usize, TreeError> {
        let node = branch.borrow();
        let mut low = 0;
        let mut high = node.partitions.len();
        while low < high {
            let middle = low + (high - low) / 2;
            if self.compare(key, &node.partitions[middle])? == Ordering::Less {
                high = middle;
            } else {
                low = middle + 1;
            }
        }
        Ok(low)
    }

    /// Binary search within a leaf: `(true, position)` for a hit, otherwise
    /// `(false, insertion_point)`.
    fn locate_entry(&self, leaf: &LeafLink<T>, key: &K) -> Result<(bool, usize), TreeError> {
        let node = leaf.borrow();
        let mut low = 0;
        let mut high = node.entries.len();
        while low < high {
            let middle = low + (high - low) / 2;
            let middle_key = self.extract_key(&node.entries[middle]);
            if self.compare(&middle_key, key)? == Ordering::Less {
                low = middle + 1;
            } else {
                high = middle;
            }
        }
        if low < node.entries.len() {
            let candidate = self.extract_key(&node.entries[low]);
            if self.compare(&candidate, key)? == Ordering::Equal {
                return Ok((true, low));
            }
        }
        Ok((false, low))
    }

    fn key_at(&self, path: &TreePath<K, T>) -> Option<K> {
        path.leaf.as_ref().and_then(|leaf| {
            leaf.borrow()
                .entries
                .get(path.leaf_index)
                .map(|entry| self.extract_key(entry))
        })
    }

    /// The least entry admitted by a lower bound, normalised onto an entry
    /// when one exists.
    fn range_ceiling(&self, bound: Bound<&K>) -> Result<TreePath<K, T>, TreeError> {
        match bound {
            Bound::Unbounded => Ok(self.first()),
            Bound::Included(key) => {
                let mut path = self.find_path(key)?;
                if !path.on_entry {
                    path.step_next();
                }
                Ok(path)
            }
            Bound::Excluded(key) => {
                let mut path = self.find_path(key)?;
                path.step_next();
                Ok(path)
            }
        }
    }

    /// The greatest entry admitted by an upper bound; the mirror of
    /// [`CowTree::range_ceiling`].
    fn range_floor(&self, bound: Bound<&K>) -> Result<TreePath<K, T>, TreeError> {
        match bound {
            Bound::Unbounded => Ok(self.last()),
            Bound::Included(key) => {
                let mut path = self.find_path(key)?;
                if !path.on_entry {
                    path.step_prior();
                }
                Ok(path)
            }
            Bound::Excluded(key) => {
                let mut path = self.find_path(key)?;
                path.step_prior();
                Ok(path)
            }
        }
    }

    fn range_iterator(
        &self,
        current: TreePath<K, T>,
        end: TreePath<K, T>,
        descending: bool,
    ) -> Result<CowTreeRangeIterator<'_, K, T>, TreeError> {
        let exhausted = if current.on_entry && end.on_entry {
            let current_key = self.key_at(&current);
            let end_key = self.key_at(&end);
            match (current_key, end_key) {
                (Some(current_key), Some(end_key)) => {
                    let relation = self.compare(&current_key, &end_key)?;
                    if descending {
                        relation == Ordering::Less
                    } else {
                        relation == Ordering::Greater
                    }
                }
                _ => true,
            }
        } else {
            true
        };
        Ok(CowTreeRangeIterator {
            current,
            end,
            descending,
            exhausted,
            marker: PhantomData,
        })
    }

    fn count_from_path(&self, path: &TreePath<K, T>) -> usize {
        let Some(leaf) = path.leaf.as_ref() else {
            return 0;
        };
        let mut total = leaf.borrow().entries.len().saturating_sub(path.leaf_index);
        let mut walker = path.clone();
        loop {
            // Hop to the next leaf by pushing the cursor onto its end crack
            // and stepping over it.
            let length = walker
                .leaf
                .as_ref()
                .map_or(0, |leaf| leaf.borrow().entries.len());
            walker.leaf_index = length;
            walker.on_entry = false;
            walker.step_next();
            if !walker.on_entry {
                return total;
            }
            total += walker
                .leaf
                .as_ref()
                .map_or(0, |leaf| leaf.borrow().entries.len());
        }
    }
}

// =============================================================================
// Mutation
// =============================================================================

impl<K: Clone, T> CowTree<K, T> {
    /// Inserts an entry under its derived key.
    ///
    /// On success the returned path points at the inserted entry
    /// (`is_on_entry()` is `true`) and is stamped with the bumped version.
    /// When the key is already present nothing changes, no version bump
    /// occurs, and the returned path reports `is_on_entry() == false` at the
    /// existing entry's position.
    ///
    /// # Errors
    ///
    /// [`TreeError::InconsistentComparator`] when the comparator trips the
    /// cross-check during the descent.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use cowbtree::CowTree;
    ///
    /// let mut tree = CowTree::new(|entry: &(i32, &str)| entry.0);
    /// let placed = tree.insert((1, "one")).unwrap();
    /// assert!(placed.is_on_entry());
    ///
    /// let rejected = tree.insert((1, "uno")).unwrap();
    /// assert!(!rejected.is_on_entry());
    /// assert_eq!(tree.get(&1).unwrap().unwrap().1, "one");
    /// ```
    pub fn insert(&mut self, entry: T) -> Result<TreePath<K, T>, TreeError> {
        let key = self.extract_key(&entry);
        let mut path = self.find_path(&key)?;
        if path.on_entry {
            path.on_entry = false;
            return Ok(path);
        }
        self.insert_entry_at(&mut path, ReferenceCounter::new(entry));
        path.version = self.commit();
        path.on_entry = true;
        Ok(path)
    }

    /// Replaces the entry the path points at.
    ///
    /// When the new entry's key equals the old one, the entry is overwritten
    /// in place (under copy-on-write) and `was_update` is `true`. When the
    /// key changed, the operation devolves to inserting the new entry and
    /// deleting the old one; `was_update` is `false` and the returned path is
    /// freshly resolved at the new entry. If the changed key collides with an
    /// existing entry nothing happens and the returned path is off-entry.
    ///
    /// A path that is not on an entry updates nothing, yet still reports
    /// `was_update == true` with the path returned off-entry unchanged. This
    /// mirrors the behaviour the API was specified with; callers should test
    /// the path's `on`-flag, not only the boolean.
    ///
    /// # Errors
    ///
    /// [`TreeError::InvalidPath`] for a stale path,
    /// [`TreeError::InconsistentComparator`] for a comparator cross-check
    /// failure.
    pub fn update_at(
        &mut self,
        path: &TreePath<K, T>,
        entry: T,
    ) -> Result<(TreePath<K, T>, bool), TreeError> {
        self.ensure_valid(path)?;
        if !path.on_entry {
            return Ok((path.clone(), true));
        }
        let Some(old_entry) = path
            .leaf
            .as_ref()
            .and_then(|leaf| leaf.borrow().entries.get(path.leaf_index).cloned())
        else {
            return Ok((path.clone(), true));
        };
        let new_key = self.extract_key(&entry);
        let old_key = self.extract_key(&old_entry);
        if self.compare(&new_key, &old_key)? == Ordering::Equal {
            let mut working = path.clone();
            let leaf = self.mutable_leaf(&mut working);
            leaf.borrow_mut().entries[working.leaf_index] = ReferenceCounter::new(entry);
            working.version = self.commit();
            working.on_entry = true;
            return Ok((working, true));
        }
        // The key changed: place the new entry first, then drop the old one.
        let mut insert_path = self.find_path(&new_key)?;
        if insert_path.on_entry {
            insert_path.on_entry = false;
            return Ok((insert_path, false));
        }
        self.insert_entry_at(&mut insert_path, ReferenceCounter::new(entry));
        let mut stale = self.find_path(&old_key)?;
        if stale.on_entry {
            self.delete_entry_at(&mut stale);
        }
        self.commit();
        let fresh = self.find_path(&new_key)?;
        Ok((fresh, false))
    }

    /// Inserts the entry, or overwrites the entry already stored under the
    /// same key.
    ///
    /// The returned path reports `is_on_entry() == true` when an existing
    /// entry was overwritten and `false` when the entry was newly inserted:
    /// the flag answers "was the key already present", a convention retained
    /// from the API this container was specified against. Either way the
    /// path's position is the entry's and the stamp is current.
    ///
    /// # Errors
    ///
    /// [`TreeError::InconsistentComparator`] on a comparator cross-check
    /// failure.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use cowbtree::CowTree;
    ///
    /// let mut tree = CowTree::new(|entry: &(i32, &str)| entry.0);
    /// let inserted = tree.upsert((1, "one")).unwrap();
    /// assert!(!inserted.is_on_entry());
    ///
    /// let overwritten = tree.upsert((1, "uno")).unwrap();
    /// assert!(overwritten.is_on_entry());
    /// assert_eq!(tree.get(&1).unwrap().unwrap().1, "uno");
    /// ```
    pub fn upsert(&mut self, entry: T) -> Result<TreePath<K, T>, TreeError> {
        let key = self.extract_key(&entry);
        let mut path = self.find_path(&key)?;
        if path.on_entry {
            let leaf = self.mutable_leaf(&mut path);
            leaf.borrow_mut().entries[path.leaf_index] = ReferenceCounter::new(entry);
        } else {
            self.insert_entry_at(&mut path, ReferenceCounter::new(entry));
        }
        path.version = self.commit();
        Ok(path)
    }

    /// Inserts the entry, or rewrites the existing entry through `updater`.
    ///
    /// When the key is present, `updater` receives the stored entry and its
    /// result replaces it via the update machinery (so a key-changing result
    /// devolves to delete-and-insert, reported through `was_update ==
    /// false`). When absent, `entry` itself is inserted and `was_update` is
    /// `false`.
    ///
    /// # Errors
    ///
    /// [`TreeError::InvalidPath`], [`TreeError::InconsistentComparator`] as
    /// for [`CowTree::update_at`].
    pub fn merge<F>(&mut self, entry: T, updater: F) -> Result<(TreePath<K, T>, bool), TreeError>
    where
        F: FnOnce(&T) -> T,
    {
        let key = self.extract_key(&entry);
        let mut path = self.find_path(&key)?;
        if path.on_entry
            && let Some(existing) = self.at(&path)?
        {
            let updated = updater(existing.as_ref());
            return self.update_at(&path, updated);
        }
        self.insert_entry_at(&mut path, ReferenceCounter::new(entry));
        path.version = self.commit();
        Ok((path, false))
    }

    /// Deletes the entry the path points at.
    ///
    /// Returns `false` (and changes nothing) when the path is not on an
    /// entry. On success the path is maintained through the copy-on-write
    /// remap and any rebalancing, left off-entry in the crack where the entry
    /// used to be, and re-stamped with the bumped version.
    ///
    /// # Errors
    ///
    /// [`TreeError::InvalidPath`] when the path is stale.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use cowbtree::CowTree;
    ///
    /// let mut tree = CowTree::new(|entry: &i32| *entry);
    /// tree.insert(1).unwrap();
    ///
    /// let mut path = tree.find(&1).unwrap();
    /// assert!(tree.delete_at(&mut path).unwrap());
    /// assert!(!path.is_on_entry());
    /// assert_eq!(tree.get_count(), 0);
    /// ```
    pub fn delete_at(&mut self, path: &mut TreePath<K, T>) -> Result<bool, TreeError> {
        self.ensure_valid(path)?;
        if !path.on_entry {
            return Ok(false);
        }
        self.delete_entry_at(path);
        path.version = self.commit();
        path.on_entry = false;
        Ok(true)
    }

    fn commit(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    // -------------------------------------------------------------------------
    // Copy-on-write engine
    //
    // The only place node identity ever changes. A mutation first funnels its
    // path through `mutable_leaf`/`mutable_branch`; everything the rebalancing
    // layer touches afterwards is guaranteed private.
    // -------------------------------------------------------------------------

    /// A private handle to the path's leaf, cloning the leaf and every
    /// foreign branch above it when needed.
    ///
    /// The clone walk records every replaced identity and remaps the path, so
    /// the caller's cursor keeps pointing at the private chain. Idempotent on
    /// already-private chains. On a tree with no effective root this
    /// materialises an empty private leaf as the root.
    fn mutable_leaf(&mut self, path: &mut TreePath<K, T>) -> LeafLink<T> {
        let Some(leaf) = path.leaf.clone() else {
            let leaf = LeafNode::new(self.owner.clone(), Vec::new()).into_link();
            self.install_root(NodeLink::Leaf(leaf.clone()));
            path.leaf = Some(leaf.clone());
            path.leaf_index = 0;
            return leaf;
        };
        if ReferenceCounter::ptr_eq(&leaf.borrow().owner, &self.owner) {
            return leaf;
        }
        let cloned = leaf.borrow().clone_for(self.owner.clone()).into_link();
        let mut remap = NodeRemap::new();
        remap.record_leaf(&leaf, cloned.clone());
        if path.branches.is_empty() {
            self.install_root(NodeLink::Leaf(cloned.clone()));
        } else {
            let parent_depth = path.branches.len() - 1;
            let child_index = path.branches[parent_depth].child_index;
            let parent = self.privatize_branch(path, parent_depth, &mut remap);
            parent.borrow_mut().children[child_index] = NodeLink::Leaf(cloned.clone());
        }
        path.remap(&remap);
        cloned
    }

    /// A private handle to the branch at `depth` of the path, privatizing the
    /// chain above it as needed; the branch-terminated twin of
    /// [`CowTree::mutable_leaf`].
    fn mutable_branch(&mut self, path: &mut TreePath<K, T>, depth: usize) -> BranchLink<K, T> {
        let mut remap = NodeRemap::new();
        let branch = self.privatize_branch(path, depth, &mut remap);
        path.remap(&remap);
        branch
    }

    /// Clones the branch at `depth` (and, recursively, every foreign ancestor)
    /// into this tree's ownership, swapping each clone into its parent. The
    /// walk stops at the first already-private branch; above that point the
    /// chain is private already. Reaching the top installs the uppermost
    /// clone as the tree's new root.
    fn privatize_branch(
        &mut self,
        path: &TreePath<K, T>,
        depth: usize,
        remap: &mut NodeRemap<K, T>,
    ) -> BranchLink<K, T> {
        let branch = path.branches[depth].branch.clone();
        if ReferenceCounter::ptr_eq(&branch.borrow().owner, &self.owner) {
            return branch;
        }
        let cloned = branch.borrow().clone_for(self.owner.clone()).into_link();
        remap.record_branch(&branch, cloned.clone());
        if depth == 0 {
            self.install_root(NodeLink::Branch(cloned.clone()));
        } else {
            let child_index = path.branches[depth - 1].child_index;
            let parent = self.privatize_branch(path, depth - 1, remap);
            parent.borrow_mut().children[child_index] = NodeLink::Branch(cloned.clone());
        }
        cloned
    }

    /// A private handle to `parent.children[index]`, which must be a leaf.
    /// The parent is private by the time siblings are touched, so the swap
    /// needs no remapping.
    fn mutable_leaf_child(&self, parent: &BranchLink<K, T>, index: usize) -> LeafLink<T> {
        let child = parent.borrow().children[index].expect_leaf();
        if ReferenceCounter::ptr_eq(&child.borrow().owner, &self.owner) {
            return child;
        }
        let cloned = child.borrow().clone_for(self.owner.clone()).into_link();
        parent.borrow_mut().children[index] = NodeLink::Leaf(cloned.clone());
        cloned
    }

    /// A private handle to `parent.children[index]`, which must be a branch.
    fn mutable_branch_child(&self, parent: &BranchLink<K, T>, index: usize) -> BranchLink<K, T> {
        let child = parent.borrow().children[index].expect_branch();
        if ReferenceCounter::ptr_eq(&child.borrow().owner, &self.owner) {
            return child;
        }
        let cloned = child.borrow().clone_for(self.owner.clone()).into_link();
        parent.borrow_mut().children[index] = NodeLink::Branch(cloned.clone());
        cloned
    }

    // -------------------------------------------------------------------------
    // Insert machinery
    // -------------------------------------------------------------------------

    /// Splices `entry` into the leaf at the path's crack position, splitting
    /// up the spine as needed. Leaves the path pointing at the placed entry
    /// with its `on`-flag untouched; versioning is the caller's concern.
    fn insert_entry_at(&mut self, path: &mut TreePath<K, T>, entry: EntryHandle<T>) {
        let leaf = self.mutable_leaf(path);
        let full = leaf.borrow().entries.len() == NODE_CAPACITY;
        if !full {
            leaf.borrow_mut().entries.insert(path.leaf_index, entry);
            return;
        }
        // Split the full leaf around its midpoint, then place the incoming
        // entry into whichever half the cursor index selects.
        let middle = (NODE_CAPACITY + 1) / 2;
        let right_entries = leaf.borrow_mut().entries.split_off(middle);
        let split_key = self.extract_key(&right_entries[0]);
        let right = LeafNode::new(self.owner.clone(), right_entries).into_link();
        let index_delta = if path.leaf_index <= middle {
            leaf.borrow_mut().entries.insert(path.leaf_index, entry);
            0
        } else {
            right
                .borrow_mut()
                .entries
                .insert(path.leaf_index - middle, entry);
            path.leaf = Some(right.clone());
            path.leaf_index -= middle;
            1
        };
        let depth = path.branches.len();
        self.place_split(
            path,
            depth,
            split_key,
            NodeLink::Leaf(leaf),
            NodeLink::Leaf(right),
            index_delta,
        );
    }

    /// Splices a freshly split-off right node into the branch above `depth`,
    /// recursing upward while branches overflow; at the top a new root branch
    /// adopts both halves. `child_delta` is 1 when the cursor moved into the
    /// right half.
    fn place_split(
        &mut self,
        path: &mut TreePath<K, T>,
        depth: usize,
        split_key: K,
        left: NodeLink<K, T>,
        right: NodeLink<K, T>,
        child_delta: usize,
    ) {
        if depth == 0 {
            let root = BranchNode {
                owner: self.owner.clone(),
                partitions: vec![split_key],
                children: vec![left, right],
            }
            .into_link();
            self.install_root(NodeLink::Branch(root.clone()));
            path.branches.insert(
                0,
                PathSegment {
                    branch: root,
                    child_index: child_delta,
                },
            );
            return;
        }
        let level = depth - 1;
        let branch = path.branches[level].branch.clone();
        let position = path.branches[level].child_index;
        {
            let mut node = branch.borrow_mut();
            node.partitions.insert(position, split_key);
            node.children.insert(position + 1, right);
        }
        path.branches[level].child_index = position + child_delta;
        let overflowed = branch.borrow().children.len() > NODE_CAPACITY;
        if !overflowed {
            return;
        }
        // Split the overflowing branch, promoting its middle partition.
        let middle = branch.borrow().partitions.len() / 2;
        let (promoted, right_branch) = {
            let mut node = branch.borrow_mut();
            let mut right_partitions = node.partitions.split_off(middle);
            let promoted = right_partitions.remove(0);
            let right_children = node.children.split_off(middle + 1);
            (
                promoted,
                BranchNode {
                    owner: self.owner.clone(),
                    partitions: right_partitions,
                    children: right_children,
                }
                .into_link(),
            )
        };
        let cursor_index = path.branches[level].child_index;
        let delta = if cursor_index <= middle {
            0
        } else {
            path.branches[level].branch = right_branch.clone();
            path.branches[level].child_index = cursor_index - (middle + 1);
            1
        };
        self.place_split(
            path,
            level,
            promoted,
            NodeLink::Branch(branch),
            NodeLink::Branch(right_branch),
            delta,
        );
    }

    // -------------------------------------------------------------------------
    // Delete machinery
    // -------------------------------------------------------------------------

    /// Splices out the entry under the path, rebalancing underflowing nodes
    /// and propagating a changed first key to the partition that routes it.
    /// Versioning and the path's `on`-flag are the caller's concern.
    fn delete_entry_at(&mut self, path: &mut TreePath<K, T>) {
        let leaf = self.mutable_leaf(path);
        leaf.borrow_mut().entries.remove(path.leaf_index);
        let removed_first = path.leaf_index == 0;
        let underflowed = leaf.borrow().entries.len() < HALF_CAPACITY;
        if underflowed && !path.branches.is_empty() {
            self.rebalance_leaf(path, &leaf);
        }
        if removed_first {
            self.refresh_partition_for_first(path);
        }
    }

    /// Restores the minimum fill of the path's leaf: borrow from the right
    /// sibling, else borrow from the left, else merge with whichever sibling
    /// exists; merging recurses into branch rebalancing at the parent.
    fn rebalance_leaf(&mut self, path: &mut TreePath<K, T>, leaf: &LeafLink<T>) {
        let parent_depth = path.branches.len() - 1;
        let parent = self.mutable_branch(path, parent_depth);
        let leaf_position = path.branches[parent_depth].child_index;

        let (right_length, left_length) = {
            let node = parent.borrow();
            let right = node
                .children
                .get(leaf_position + 1)
                .map(|link| link.expect_leaf().borrow().entries.len());
            let left = (leaf_position > 0)
                .then(|| node.children[leaf_position - 1].expect_leaf().borrow().entries.len());
            (right, left)
        };

        // Borrow the right sibling's first entry.
        if let Some(right_length) = right_length
            && right_length > HALF_CAPACITY
        {
            let right = self.mutable_leaf_child(&parent, leaf_position + 1);
            let moved = right.borrow_mut().entries.remove(0);
            leaf.borrow_mut().entries.push(moved);
            let new_first = self.extract_key(&right.borrow().entries[0]);
            parent.borrow_mut().partitions[leaf_position] = new_first;
            return;
        }

        // Borrow the left sibling's last entry; the cursor shifts right.
        if let Some(left_length) = left_length
            && left_length > HALF_CAPACITY
        {
            let left = self.mutable_leaf_child(&parent, leaf_position - 1);
            let last_index = left.borrow().entries.len() - 1;
            let moved = left.borrow_mut().entries.remove(last_index);
            let moved_key = self.extract_key(&moved);
            leaf.borrow_mut().entries.insert(0, moved);
            parent.borrow_mut().partitions[leaf_position - 1] = moved_key;
            path.leaf_index += 1;
            return;
        }

        // Merge the right sibling into this leaf. The absorbed sibling is
        // only read, so a foreign sibling stays untouched in its owner.
        if let Some(right_length) = right_length
            && leaf.borrow().entries.len() + right_length <= NODE_CAPACITY
        {
            let right = parent.borrow().children[leaf_position + 1].expect_leaf();
            let absorbed = right.borrow().entries.clone();
            leaf.borrow_mut().entries.extend(absorbed);
            {
                let mut node = parent.borrow_mut();
                node.partitions.remove(leaf_position);
                node.children.remove(leaf_position + 1);
            }
            self.rebalance_branch(path, parent_depth);
            return;
        }

        // Merge this leaf into the left sibling; the cursor follows its entry
        // into the survivor.
        if let Some(left_length) = left_length
            && left_length + leaf.borrow().entries.len() <= NODE_CAPACITY
        {
            let left = self.mutable_leaf_child(&parent, leaf_position - 1);
            path.leaf_index += left.borrow().entries.len();
            let absorbed = leaf.borrow().entries.clone();
            left.borrow_mut().entries.extend(absorbed);
            {
                let mut node = parent.borrow_mut();
                node.partitions.remove(leaf_position - 1);
                node.children.remove(leaf_position);
            }
            path.leaf = Some(left);
            path.branches[parent_depth].child_index = leaf_position - 1;
            self.rebalance_branch(path, parent_depth);
        }
    }

    /// Restores the minimum child count of the branch at `depth`, moving a
    /// partition through the parent on borrows and pulling the separating
    /// partition down on merges; recurses toward the root. At depth zero a
    /// partition-less root collapses into its sole child.
    fn rebalance_branch(&mut self, path: &mut TreePath<K, T>, depth: usize) {
        if depth == 0 {
            self.collapse_root(path);
            return;
        }
        let node = path.branches[depth].branch.clone();
        if node.borrow().children.len() >= HALF_CAPACITY {
            return;
        }
        let parent_depth = depth - 1;
        let parent = self.mutable_branch(path, parent_depth);
        let position = path.branches[parent_depth].child_index;

        let (right_count, left_count) = {
            let above = parent.borrow();
            let right = above
                .children
                .get(position + 1)
                .map(|link| link.expect_branch().borrow().children.len());
            let left = (position > 0)
                .then(|| above.children[position - 1].expect_branch().borrow().children.len());
            (right, left)
        };

        // Rotate the right sibling's first child through the parent.
        if let Some(right_count) = right_count
            && right_count > HALF_CAPACITY
        {
            let right = self.mutable_branch_child(&parent, position + 1);
            let raised = right.borrow_mut().partitions.remove(0);
            let lowered =
                std::mem::replace(&mut parent.borrow_mut().partitions[position], raised);
            let adopted = right.borrow_mut().children.remove(0);
            let mut inner = node.borrow_mut();
            inner.partitions.push(lowered);
            inner.children.push(adopted);
            return;
        }

        // Rotate the left sibling's last child through the parent; the
        // cursor's child index shifts right.
        if let Some(left_count) = left_count
            && left_count > HALF_CAPACITY
        {
            let left = self.mutable_branch_child(&parent, position - 1);
            let last_partition = left.borrow().partitions.len() - 1;
            let raised = left.borrow_mut().partitions.remove(last_partition);
            let lowered =
                std::mem::replace(&mut parent.borrow_mut().partitions[position - 1], raised);
            let last_child = left.borrow().children.len() - 1;
            let adopted = left.borrow_mut().children.remove(last_child);
            {
                let mut inner = node.borrow_mut();
                inner.partitions.insert(0, lowered);
                inner.children.insert(0, adopted);
            }
            path.branches[depth].child_index += 1;
            return;
        }

        // Merge the right sibling in, pulling the separating partition down
        // between the joined partition lists.
        if let Some(right_count) = right_count
            && node.borrow().children.len() + right_count <= NODE_CAPACITY
        {
            let right = parent.borrow().children[position + 1].expect_branch();
            let separator = parent.borrow_mut().partitions.remove(position);
            {
                let absorbed = right.borrow();
                let mut inner = node.borrow_mut();
                inner.partitions.push(separator);
                inner.partitions.extend(absorbed.partitions.iter().cloned());
                inner.children.extend(absorbed.children.iter().cloned());
            }
            parent.borrow_mut().children.remove(position + 1);
            self.rebalance_branch(path, parent_depth);
            return;
        }

        // Merge this branch into the left sibling; the cursor follows.
        if let Some(left_count) = left_count
            && left_count + node.borrow().children.len() <= NODE_CAPACITY
        {
            let left = self.mutable_branch_child(&parent, position - 1);
            path.branches[depth].child_index += left.borrow().children.len();
            let separator = parent.borrow_mut().partitions.remove(position - 1);
            {
                let absorbed = node.borrow();
                let mut survivor = left.borrow_mut();
                survivor.partitions.push(separator);
                survivor.partitions.extend(absorbed.partitions.iter().cloned());
                survivor.children.extend(absorbed.children.iter().cloned());
            }
            parent.borrow_mut().children.remove(position);
            path.branches[depth].branch = left;
            path.branches[parent_depth].child_index = position - 1;
            self.rebalance_branch(path, parent_depth);
        }
    }

    /// Replaces a partition-less root branch with its sole child, cascading
    /// while the new root is itself a collapsible branch.
    fn collapse_root(&mut self, path: &mut TreePath<K, T>) {
        loop {
            let Some(root) = path.branches.first().map(|segment| segment.branch.clone())
            else {
                return;
            };
            if !root.borrow().partitions.is_empty() {
                return;
            }
            let only_child = root.borrow().children[0].clone();
            self.install_root(only_child);
            path.branches.remove(0);
        }
    }

    /// After the first entry of the path's leaf changed, rewrites the
    /// partition of the first ancestor whose child index is nonzero. On the
    /// left spine there is no such ancestor and nothing to update.
    fn refresh_partition_for_first(&self, path: &TreePath<K, T>) {
        let Some(first_key) = path.leaf.as_ref().and_then(|leaf| {
            leaf.borrow()
                .entries
                .first()
                .map(|entry| self.extract_key(entry))
        }) else {
            return;
        };
        if let Some(segment) = path
            .branches
            .iter()
            .rev()
            .find(|segment| segment.child_index > 0)
        {
            segment.branch.borrow_mut().partitions[segment.child_index - 1] = first_key;
        }
    }
}

// =============================================================================
// Standard Trait Implementations
// =============================================================================

impl<K, T: fmt::Debug> fmt::Debug for CowTree<K, T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_list().entries(self.iter()).finish()
    }
}

impl<'a, K, T> IntoIterator for &'a CowTree<K, T> {
    type Item = EntryHandle<T>;
    type IntoIter = CowTreeEntryIterator<'a, K, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// =============================================================================
// Serde Support
// =============================================================================

/// Serializes the tree as its ascending entry sequence.
///
/// There is deliberately no `Deserialize` counterpart: a tree cannot be
/// reconstructed without re-attaching its key extractor and comparator.
/// Deserialize into a `Vec` of entries and insert them instead.
#[cfg(feature = "serde")]
impl<K, T> serde::Serialize for CowTree<K, T>
where
    T: serde::Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeSeq;
        let mut sequence = serializer.serialize_seq(Some(self.get_count()))?;
        for entry in self.iter() {
            sequence.serialize_element(entry.as_ref())?;
        }
        sequence.end()
    }
}

// =============================================================================
// Tests
// =============================================================================
