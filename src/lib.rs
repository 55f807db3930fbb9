//! # cowbtree
//!
//! An in-memory ordered container built as a B+-like tree with a
//! copy-on-write overlay.
//!
//! ## Overview
//!
//! A [`CowTree`] stores opaque entries whose keys are derived by an injected
//! extractor and ordered by an injected comparator. On top of the classic
//! B+-tree machinery (split, borrow, and merge rebalancing) it layers two
//! less common capabilities:
//!
//! - **Derived trees**: [`CowTree::derive`] constructs a child tree that
//!   observes all of its base's entries while sharing the base's nodes by
//!   reference. Mutating the child clones only the nodes along the touched
//!   path; the base is never perturbed. Ownership labels on every node make
//!   the "mine or foreign" decision a single pointer comparison.
//! - **Versioned cursors**: every positional operation speaks [`TreePath`],
//!   a root-to-leaf cursor stamped with the tree version it was issued
//!   under. Any committed mutation bumps the version exactly once, and every
//!   path-consuming operation checks the stamp first, so stale cursors fail
//!   fast instead of misbehaving.
//!
//! ## Example
//!
//! ```rust
//! use cowbtree::CowTree;
//!
//! let mut base = CowTree::new(|entry: &(i32, &str)| entry.0);
//! base.insert((10, "ten")).unwrap();
//! base.insert((20, "twenty")).unwrap();
//! base.insert((30, "thirty")).unwrap();
//!
//! // Derive an overlay, mutate it freely: the base never changes.
//! let mut overlay = base.derive();
//! overlay.insert((15, "fifteen")).unwrap();
//! let mut doomed = overlay.find(&30).unwrap();
//! overlay.delete_at(&mut doomed).unwrap();
//!
//! let overlay_keys: Vec<i32> = overlay.iter().map(|entry| entry.0).collect();
//! assert_eq!(overlay_keys, vec![10, 15, 20]);
//!
//! let base_keys: Vec<i32> = base.iter().map(|entry| entry.0).collect();
//! assert_eq!(base_keys, vec![10, 20, 30]);
//! ```
//!
//! ## Feature Flags
//!
//! - `serde`: `Serialize` support for trees (as their ascending entry
//!   sequence). There is no `Deserialize`: a tree cannot be reconstructed
//!   without re-attaching its key extractor.
//!
//! ## Concurrency
//!
//! The container is single-threaded by construction (`Rc` + `RefCell`);
//! exactly one logical actor may mutate a tree at a time. Iterators borrow
//! the tree, so the borrow checker rules out mutation mid-iteration; paths
//! held across mutations are invalidated by the version stamp instead.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Reference-counted smart pointer used for all shared structure.
///
/// The tree is single-threaded by design, so this is `std::rc::Rc`
/// throughout; nodes, entries, and the injected callbacks all share through
/// it.
pub(crate) type ReferenceCounter<T> = std::rc::Rc<T>;

mod error;
mod iter;
mod node;
mod path;
mod tree;

pub use error::TreeError;
pub use iter::{
    CowTreeAscendingIterator, CowTreeDescendingIterator, CowTreeEntryIterator,
    CowTreeRangeIterator,
};
pub use path::TreePath;
pub use tree::{CowTree, EntryHandle};
