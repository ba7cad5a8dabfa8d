//! Set difference for link rows and keyed collections.
//!
//! Neither many-to-many link rows nor turning points have an update path:
//! synchronising a collection is always "delete what went away, insert what
//! is new".

use std::collections::HashSet;
use std::hash::Hash;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDiff<T> {
    /// In `existing` but not desired.
    pub removed: Vec<T>,
    /// Desired but not in `existing`.
    pub added: Vec<T>,
}

impl<T> SetDiff<T> {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// `removed = existing - desired`, `added = desired - existing`, each in
/// first-seen order without duplicates.
pub fn id_set_diff<T>(existing: &[T], desired: &[T]) -> SetDiff<T>
where
    T: Eq + Hash + Clone,
{
    let existing_set: HashSet<&T> = existing.iter().collect();
    let desired_set: HashSet<&T> = desired.iter().collect();

    let mut seen = HashSet::new();
    let removed = existing
        .iter()
        .filter(|v| !desired_set.contains(v) && seen.insert(*v))
        .cloned()
        .collect();

    let mut seen = HashSet::new();
    let added = desired
        .iter()
        .filter(|v| !existing_set.contains(v) && seen.insert(*v))
        .cloned()
        .collect();

    SetDiff { removed, added }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionDiff<T, K> {
    /// Incoming items without a key.
    pub to_insert: Vec<T>,
    /// Keys of existing items absent from the incoming list.
    pub to_delete: Vec<K>,
}

/// Diff a keyed collection: incoming items without a key are new, existing
/// keys not mentioned by any incoming item are deleted, everything else is
/// left alone.
pub fn collection_diff<T, K, F>(existing_keys: &[K], incoming: Vec<T>, key_of: F) -> CollectionDiff<T, K>
where
    K: Eq + Hash + Clone,
    F: Fn(&T) -> Option<K>,
{
    let kept: HashSet<K> = incoming.iter().filter_map(&key_of).collect();
    let to_delete = existing_keys
        .iter()
        .filter(|k| !kept.contains(k))
        .cloned()
        .collect();
    let to_insert = incoming.into_iter().filter(|item| key_of(item).is_none()).collect();
    CollectionDiff { to_insert, to_delete }
}
