//! Integration tests for the public `CowTree` surface.
//!
//! The scenarios here exercise the copy-on-write overlay from the outside:
//! base/derived isolation, `clear_base` independence, the documented update
//! and upsert conventions, and a scripted random workload checked against a
//! shadow map.

use cowbtree::{CowTree, TreeError};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::Rng;
use rstest::rstest;
use std::collections::BTreeMap;

type Record = (i32, &'static str);

fn record_tree() -> CowTree<i32, Record> {
    CowTree::new(|entry: &Record| entry.0)
}

fn get_all(tree: &CowTree<i32, Record>) -> Vec<Record> {
    tree.iter().map(|entry| *entry).collect()
}

/// The seeded base of the derivation scenarios.
fn seeded_base() -> CowTree<i32, Record> {
    let mut base = record_tree();
    for entry in [(10, "t"), (20, "w"), (30, "h"), (5, "f")] {
        base.insert(entry).unwrap();
    }
    base
}

// =============================================================================
// Derivation Scenarios
// =============================================================================

#[rstest]
fn test_derived_tree_observes_every_base_entry() {
    let base = seeded_base();
    let derived = base.derive();

    assert_eq!(
        get_all(&derived),
        vec![(5, "f"), (10, "t"), (20, "w"), (30, "h")]
    );
    assert_eq!(derived.get(&20).unwrap().as_deref(), Some(&(20, "w")));
    assert_eq!(base.get(&20).unwrap().as_deref(), Some(&(20, "w")));
}

#[rstest]
fn test_derived_mutations_never_perturb_the_base() {
    let base = seeded_base();
    let mut derived = base.derive();

    derived.insert((15, "x")).unwrap();
    let mut doomed = derived.find(&10).unwrap();
    assert!(derived.delete_at(&mut doomed).unwrap());
    let thirty = derived.find(&30).unwrap();
    derived.update_at(&thirty, (30, "H")).unwrap();
    derived.insert((25, "y")).unwrap();

    assert_eq!(
        get_all(&derived),
        vec![(5, "f"), (15, "x"), (20, "w"), (25, "y"), (30, "H")]
    );
    assert_eq!(
        get_all(&base),
        vec![(5, "f"), (10, "t"), (20, "w"), (30, "h")]
    );
}

#[rstest]
fn test_clear_base_makes_both_directions_independent() {
    let mut base = seeded_base();
    let mut derived = base.derive();

    derived.insert((1, "a")).unwrap();
    let twenty = derived.find(&20).unwrap();
    derived.update_at(&twenty, (20, "W")).unwrap();
    let mut five = derived.find(&5).unwrap();
    assert!(derived.delete_at(&mut five).unwrap());
    derived.clear_base();

    // The former base keeps evolving; none of it surfaces in the derived
    // tree any more.
    base.insert((100, "b")).unwrap();
    let mut ten = base.find(&10).unwrap();
    assert!(base.delete_at(&mut ten).unwrap());
    let thirty = base.find(&30).unwrap();
    base.update_at(&thirty, (30, "H2")).unwrap();

    assert_eq!(
        get_all(&derived),
        vec![(1, "a"), (10, "t"), (20, "W"), (30, "h")]
    );
    assert_eq!(
        get_all(&base),
        vec![(5, "f"), (20, "w"), (30, "H2"), (100, "b")]
    );
}

#[rstest]
fn test_derivation_chains_stack() {
    let base = seeded_base();
    let middle = base.derive();
    let mut leafmost = middle.derive();

    leafmost.insert((40, "q")).unwrap();
    let mut five = leafmost.find(&5).unwrap();
    assert!(leafmost.delete_at(&mut five).unwrap());

    assert_eq!(
        get_all(&leafmost),
        vec![(10, "t"), (20, "w"), (30, "h"), (40, "q")]
    );
    assert_eq!(
        get_all(&middle),
        vec![(5, "f"), (10, "t"), (20, "w"), (30, "h")]
    );
    assert_eq!(get_all(&middle), get_all(&base));
}

#[rstest]
fn test_an_empty_base_surfaces_its_first_root_to_the_derived_tree() {
    let mut base = record_tree();
    let derived = base.derive();

    base.insert((1, "a")).unwrap();
    assert_eq!(derived.get(&1).unwrap().as_deref(), Some(&(1, "a")));
    assert_eq!(derived.get_count(), 1);
}

// =============================================================================
// API Conventions
// =============================================================================

#[rstest]
fn test_insert_signals_duplicates_through_the_on_flag() {
    let mut tree = record_tree();
    assert!(tree.insert((1, "one")).unwrap().is_on_entry());
    assert!(!tree.insert((1, "uno")).unwrap().is_on_entry());
    assert_eq!(tree.get(&1).unwrap().unwrap().1, "one");
}

#[rstest]
fn test_upsert_reports_whether_the_key_was_present() {
    let mut tree = record_tree();
    assert!(!tree.upsert((1, "one")).unwrap().is_on_entry());
    assert!(tree.upsert((1, "uno")).unwrap().is_on_entry());
    assert_eq!(tree.get(&1).unwrap().unwrap().1, "uno");
}

#[rstest]
fn test_update_at_off_entry_reports_true_but_changes_nothing() {
    let mut tree = seeded_base();
    let crack = tree.find(&11).unwrap();
    assert!(!crack.is_on_entry());

    let (returned, was_update) = tree.update_at(&crack, (11, "z")).unwrap();
    assert!(was_update);
    assert!(!returned.is_on_entry());
    assert_eq!(tree.get(&11).unwrap(), None);
}

#[rstest]
fn test_update_at_key_change_reports_a_devolved_update() {
    let mut tree = seeded_base();
    let path = tree.find(&5).unwrap();

    let (moved, was_update) = tree.update_at(&path, (6, "f")).unwrap();
    assert!(!was_update);
    assert!(moved.is_on_entry());
    assert_eq!(tree.get(&5).unwrap(), None);
    assert_eq!(tree.get(&6).unwrap().as_deref(), Some(&(6, "f")));
}

#[rstest]
fn test_merge_applies_the_updater_to_the_stored_entry() {
    let mut tree = seeded_base();
    let (_, was_update) = tree
        .merge((20, "unused"), |existing| (existing.0, "W"))
        .unwrap();
    assert!(was_update);
    assert_eq!(tree.get(&20).unwrap().unwrap().1, "W");

    let (_, was_update) = tree.merge((50, "new"), |existing| *existing).unwrap();
    assert!(!was_update);
    assert_eq!(tree.get(&50).unwrap().unwrap().1, "new");
}

#[rstest]
fn test_every_path_consumer_rejects_a_stale_path() {
    let mut tree = seeded_base();
    let stale = tree.find(&20).unwrap();
    tree.insert((60, "s")).unwrap();

    assert!(!tree.is_valid(&stale));
    assert!(matches!(
        tree.at(&stale),
        Err(TreeError::InvalidPath { .. })
    ));
    assert!(matches!(
        tree.ascending(&stale).map(|_| ()),
        Err(TreeError::InvalidPath { .. })
    ));
    assert!(matches!(
        tree.delete_at(&mut stale.clone()),
        Err(TreeError::InvalidPath { .. })
    ));
}

#[rstest]
fn test_paths_refresh_after_every_committed_mutation() {
    let mut tree = record_tree();
    let placed = tree.insert((1, "one")).unwrap();
    assert!(tree.is_valid(&placed));
    assert_eq!(tree.at(&placed).unwrap().as_deref(), Some(&(1, "one")));

    let upserted = tree.upsert((2, "two")).unwrap();
    assert!(!tree.is_valid(&placed));
    assert!(tree.is_valid(&upserted));
}

#[rstest]
fn test_range_iteration_works_on_a_derived_tree() {
    let base = seeded_base();
    let mut derived = base.derive();
    derived.insert((15, "x")).unwrap();

    let keys: Vec<i32> = derived
        .range(10..=20)
        .unwrap()
        .map(|path| derived.at(&path).unwrap().unwrap().0)
        .collect();
    assert_eq!(keys, vec![10, 15, 20]);

    let reversed: Vec<i32> = derived
        .range_rev(10..=20)
        .unwrap()
        .map(|path| derived.at(&path).unwrap().unwrap().0)
        .collect();
    assert_eq!(reversed, vec![20, 15, 10]);
}

#[rstest]
fn test_get_count_from_measures_the_remaining_walk() {
    let tree = seeded_base();
    let from_twenty = tree.find(&20).unwrap();
    assert_eq!(tree.get_count_from(&from_twenty).unwrap(), 2);
    assert_eq!(tree.get_count(), 4);
}

// =============================================================================
// Scripted Random Workload
// =============================================================================

/// 2000 random operations against a derived tree, with a shadow map checked
/// at every 10% checkpoint; the base must still equal its initial snapshot at
/// the end.
#[rstest]
fn test_random_workload_against_a_shadow_map() {
    let mut rng = StdRng::seed_from_u64(0xB7EE);
    let mut base: CowTree<i32, (i32, i32)> = CowTree::new(|entry: &(i32, i32)| entry.0);
    let mut initial = BTreeMap::new();
    while initial.len() < 50 {
        let key = rng.random_range(0..1000);
        let value = rng.random_range(0..1_000_000);
        if base.insert((key, value)).unwrap().is_on_entry() {
            initial.insert(key, value);
        }
    }
    let snapshot: Vec<(i32, i32)> = base.iter().map(|entry| *entry).collect();

    let mut derived = base.derive();
    let mut shadow = initial.clone();
    for step in 1..=2000 {
        let key = rng.random_range(0..1000);
        let value = rng.random_range(0..1_000_000);
        match rng.random_range(0..4) {
            0 => {
                let placed = derived.insert((key, value)).unwrap();
                assert_eq!(placed.is_on_entry(), !shadow.contains_key(&key));
                shadow.entry(key).or_insert(value);
            }
            1 => {
                let mut path = derived.find(&key).unwrap();
                let deleted = derived.delete_at(&mut path).unwrap();
                assert_eq!(deleted, shadow.remove(&key).is_some());
            }
            2 => {
                derived.upsert((key, value)).unwrap();
                shadow.insert(key, value);
            }
            _ => {
                let path = derived.find(&key).unwrap();
                if path.is_on_entry() {
                    let (_, was_update) = derived.update_at(&path, (key, value)).unwrap();
                    assert!(was_update);
                    shadow.insert(key, value);
                }
            }
        }

        if step % 200 == 0 {
            let collected: Vec<(i32, i32)> = derived.iter().map(|entry| *entry).collect();
            let expected: Vec<(i32, i32)> =
                shadow.iter().map(|(key, value)| (*key, *value)).collect();
            assert_eq!(collected, expected, "checkpoint at step {step}");
        }
    }

    let base_now: Vec<(i32, i32)> = base.iter().map(|entry| *entry).collect();
    assert_eq!(base_now, snapshot);
}
