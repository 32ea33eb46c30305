//! Deletion registry and label↔id map for the hybrid index.
//!
//! Two identifier spaces meet here. External labels are stable for the
//! index lifetime; internal disk ids are dense per build and die with every
//! merge. `deleted_labels` is therefore the durable tombstone record, and
//! `disk_deleted_ids` is a projection of it through the current label map,
//! thrown away and rebuilt on every disk reload.

use crate::Label;
use std::collections::{HashMap, HashSet};

/// Bidirectional label → internal-id map for the currently open disk index.
#[derive(Debug, Default)]
pub struct LabelMap {
    label_to_id: HashMap<Label, u32>,
}

impl LabelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a row-ordered label list: row `i` gets internal id `i`.
    pub fn from_rows(labels: &[Label]) -> Self {
        Self {
            label_to_id: labels
                .iter()
                .enumerate()
                .map(|(id, &label)| (label, id as u32))
                .collect(),
        }
    }

    pub fn insert(&mut self, label: Label, id: u32) {
        self.label_to_id.insert(label, id);
    }

    pub fn get(&self, label: Label) -> Option<u32> {
        self.label_to_id.get(&label).copied()
    }

    pub fn contains(&self, label: Label) -> bool {
        self.label_to_id.contains_key(&label)
    }

    pub fn len(&self) -> usize {
        self.label_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.label_to_id.is_empty()
    }

    pub fn clear(&mut self) {
        self.label_to_id.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (Label, u32)> + '_ {
        self.label_to_id.iter().map(|(&label, &id)| (label, id))
    }
}

/// Tombstones over both substrates: logically removed labels plus the
/// on-disk internal ids currently masked from beam search.
///
/// Owns no vectors; purely a filter.
#[derive(Debug, Default)]
pub struct DeletionRegistry {
    deleted_labels: HashSet<Label>,
    disk_deleted_ids: HashSet<u32>,
}

impl DeletionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a logical delete. Returns true when the label was newly
    /// tombstoned.
    pub fn mark_deleted(&mut self, label: Label) -> bool {
        self.deleted_labels.insert(label)
    }

    /// Clear a tombstone (re-insertion). Returns true when it existed.
    pub fn unmark_deleted(&mut self, label: Label) -> bool {
        self.deleted_labels.remove(&label)
    }

    pub fn is_deleted(&self, label: Label) -> bool {
        self.deleted_labels.contains(&label)
    }

    /// Mask an on-disk internal id from beam search.
    pub fn mark_disk_id(&mut self, id: u32) {
        self.disk_deleted_ids.insert(id);
    }

    pub fn unmark_disk_id(&mut self, id: u32) {
        self.disk_deleted_ids.remove(&id);
    }

    pub fn is_disk_id_deleted(&self, id: u32) -> bool {
        self.disk_deleted_ids.contains(&id)
    }

    /// The current beam-search mask.
    pub fn disk_mask(&self) -> &HashSet<u32> {
        &self.disk_deleted_ids
    }

    pub fn deleted_labels(&self) -> impl Iterator<Item = Label> + '_ {
        self.deleted_labels.iter().copied()
    }

    pub fn num_deleted(&self) -> usize {
        self.deleted_labels.len()
    }

    /// Rebuild the id projection from scratch against a fresh label map.
    /// Internal ids are not stable across rebuilds; the label set is the
    /// source of truth.
    pub fn reproject(&mut self, map: &LabelMap) {
        self.disk_deleted_ids.clear();
        for &label in &self.deleted_labels {
            if let Some(id) = map.get(label) {
                self.disk_deleted_ids.insert(id);
            }
        }
    }

    /// Drop tombstones whose rows were physically removed by a purging
    /// merge. Their ids must already be gone from the projection.
    pub fn discard_labels<I: IntoIterator<Item = Label>>(&mut self, labels: I) {
        for label in labels {
            self.deleted_labels.remove(&label);
        }
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Tombstoning is idempotent.
        #[test]
        fn prop_mark_idempotent(label in 0u32..10_000) {
            let mut registry = DeletionRegistry::new();
            prop_assert!(registry.mark_deleted(label));
            prop_assert!(!registry.mark_deleted(label));
            prop_assert!(registry.is_deleted(label));
            prop_assert_eq!(registry.num_deleted(), 1);
        }

        /// After reprojection, exactly the deleted labels present in the
        /// map are masked, and the mask is a subset of the map's ids.
        #[test]
        fn prop_reproject_consistent(
            deletions in proptest::collection::hash_set(0u32..200, 0..40),
            rows in proptest::collection::vec(0u32..200, 0..60),
        ) {
            let mut registry = DeletionRegistry::new();
            for &label in &deletions {
                registry.mark_deleted(label);
            }

            let map = LabelMap::from_rows(&rows);
            registry.reproject(&map);

            for &label in &deletions {
                match map.get(label) {
                    Some(id) => prop_assert!(registry.is_disk_id_deleted(id)),
                    None => {}
                }
            }
            let map_ids: std::collections::HashSet<u32> =
                map.iter().map(|(_, id)| id).collect();
            for &id in registry.disk_mask() {
                prop_assert!(map_ids.contains(&id));
            }
        }

        /// Unmarking restores searchability bookkeeping completely.
        #[test]
        fn prop_unmark_roundtrip(labels in proptest::collection::vec(0u32..500, 1..50)) {
            let mut registry = DeletionRegistry::new();
            for &label in &labels {
                registry.mark_deleted(label);
            }
            for &label in &labels {
                registry.unmark_deleted(label);
            }
            prop_assert_eq!(registry.num_deleted(), 0);
        }
    }
}
