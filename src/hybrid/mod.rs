//! Hybrid mutable index: an in-memory delta over an on-disk base corpus.
//!
//! # Architecture
//!
//! ```text
//! insert / remove            search
//!       │                      │
//!       ▼                      ▼
//! ┌───────────────────────────────────────┐
//! │ HybridIndex (one reader–writer lock)  │
//! │   ├── memory index   (fresh delta)    │
//! │   ├── disk index     (merged base)    │
//! │   ├── deletion registry (tombstones)  │
//! │   └── label map      (label → id)     │
//! └──────────────────┬────────────────────┘
//!                    ▼ (at threshold)
//!              merge: fold delta into a
//!              rebuilt disk index
//! ```
//!
//! Queries run against both substrates and merge by label, tombstones
//! filtering both sides. Mutations serialize under the writer lock; the
//! merge holds it across the whole rebuild, so writers and readers stall
//! for its duration.
//!
//! The memory delta is not crash-durable: points inserted since the last
//! merge die with the process.

pub mod merge;
pub mod tombstones;

use crate::config::HybridConfig;
use crate::disk::DiskIndex;
use crate::error::Result;
use crate::format::{self, Element};
use crate::mem::{FreshVamana, MemIndex};
use crate::{Label, Neighbor};
use merge::MergeStats;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::ffi::OsString;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tombstones::{DeletionRegistry, LabelMap};
use tracing::{debug, warn};

/// Hybrid index over the default substrates.
pub type DefaultHybridIndex<T> = HybridIndex<T, FreshVamana<T>, crate::disk::PqDiskIndex<T>>;

/// Counters exposed by [`HybridIndex::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HybridStats {
    /// Live points in the memory delta.
    pub mem_points: usize,
    /// Points in the currently open disk index (0 when memory-only).
    pub disk_points: usize,
    /// Labels currently tombstoned.
    pub deleted_labels: usize,
    /// Merges completed since construction.
    pub merges: u64,
}

pub(crate) struct Inner<T: Element, M, D> {
    pub(crate) config: HybridConfig,
    pub(crate) threshold: usize,
    pub(crate) mem: M,
    pub(crate) disk: Option<D>,
    pub(crate) registry: DeletionRegistry,
    pub(crate) label_map: LabelMap,
    pub(crate) data_path: PathBuf,
    pub(crate) prefix: PathBuf,
    pub(crate) merges: u64,
    pub(crate) _marker: PhantomData<T>,
}

/// The labels sidecar next to the index artifacts: `<prefix>_labels.txt`.
pub(crate) fn labels_path(prefix: &Path) -> PathBuf {
    let mut name = OsString::from(prefix.as_os_str());
    name.push("_labels.txt");
    PathBuf::from(name)
}

/// Prefix for memory-delta temp files: `<prefix>_temp_mem.index`.
pub(crate) fn temp_prefix(prefix: &Path) -> PathBuf {
    let mut name = OsString::from(prefix.as_os_str());
    name.push("_temp_mem.index");
    PathBuf::from(name)
}

impl<T: Element, M: MemIndex<T>, D: DiskIndex<T>> Inner<T, M, D> {
    /// (Re)open the disk index and rebuild the label map and tombstone
    /// projection. A missing or corrupt index is recovered: the index
    /// operates memory-only until the next merge.
    pub(crate) fn reload_disk(&mut self) {
        self.disk = None;
        self.label_map.clear();

        match D::open(&self.prefix) {
            Ok(disk) => {
                self.label_map = self.build_label_map(&disk);
                self.disk = Some(disk);
            }
            Err(e) => {
                debug!("disk index unavailable, operating memory-only: {}", e);
            }
        }
        self.registry.reproject(&self.label_map);
    }

    /// Sidecar labels are authoritative when they cover every disk point;
    /// otherwise fall back to the index's embedded labels, skipping points
    /// whose label is unreadable.
    fn build_label_map(&self, disk: &D) -> LabelMap {
        let num_points = disk.num_points();
        match format::read_labels_text(&labels_path(&self.prefix)) {
            Ok(labels) if labels.len() == num_points => LabelMap::from_rows(&labels),
            Ok(labels) => {
                if !labels.is_empty() {
                    warn!(
                        sidecar = labels.len(),
                        disk = num_points,
                        "labels sidecar out of step with disk index, using embedded labels"
                    );
                }
                let mut map = LabelMap::new();
                let mut misses = 0usize;
                for id in 0..num_points as u32 {
                    match disk.label_of(id) {
                        Some(label) => map.insert(label, id),
                        None => misses += 1,
                    }
                }
                if misses > 0 {
                    warn!(misses, "disk points without readable labels are unreachable by label");
                }
                map
            }
            Err(e) => {
                warn!("labels sidecar unreadable: {}", e);
                LabelMap::new()
            }
        }
    }
}

/// Mutable ANN index spanning a memory delta and an on-disk base.
///
/// All state sits behind one reader–writer lock: any number of concurrent
/// searches, at most one mutation. After `remove(label)` returns, no search
/// returns that label until a later `insert` under the same label succeeds.
pub struct HybridIndex<T: Element, M: MemIndex<T>, D: DiskIndex<T>> {
    inner: RwLock<Inner<T, M, D>>,
}

impl<T: Element> HybridIndex<T, FreshVamana<T>, crate::disk::PqDiskIndex<T>> {
    /// Open over the default substrates, creating the memory index from
    /// the configuration.
    pub fn open(config: HybridConfig, data_path: &Path, prefix: &Path) -> Result<Self> {
        let mem = FreshVamana::new(config.dimension, config.write_params.clone());
        Self::with_substrate(config, data_path, prefix, mem)
    }
}

impl<T: Element, M: MemIndex<T>, D: DiskIndex<T>> HybridIndex<T, M, D> {
    /// Open with a caller-provided memory substrate.
    pub fn with_substrate(
        config: HybridConfig,
        data_path: &Path,
        prefix: &Path,
        mem: M,
    ) -> Result<Self> {
        let threshold = config.resolved_threshold(T::SIZE)?;
        let mut inner = Inner {
            config,
            threshold,
            mem,
            disk: None,
            registry: DeletionRegistry::new(),
            label_map: LabelMap::new(),
            data_path: data_path.to_path_buf(),
            prefix: prefix.to_path_buf(),
            merges: 0,
            _marker: PhantomData,
        };
        inner.reload_disk();
        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    /// Insert `point` under `label`, resurrecting a tombstoned label.
    ///
    /// A memory-index rejection is logged and swallowed; any tombstone
    /// state cleared for the resurrection is restored first, so the old
    /// disk row stays invisible. A merge triggered by the capacity
    /// threshold runs synchronously and its fatal errors surface here.
    pub fn insert(&self, point: &[T], label: Label) -> Result<()> {
        let trigger = {
            let mut inner = self.inner.write();

            // Re-insertion resurrection: clear the tombstone so the new
            // point becomes visible. The old disk row also unmasks; the
            // planner's dedup keeps the nearer of the two rows.
            let was_tombstoned = inner.registry.unmark_deleted(label);
            let masked_id = inner.label_map.get(label).filter(|_| was_tombstoned);
            if let Some(id) = masked_id {
                inner.registry.unmark_disk_id(id);
            }

            if let Err(e) = inner.mem.insert(point, label) {
                warn!(label, "insert rejected by memory index: {}", e);
                if was_tombstoned {
                    inner.registry.mark_deleted(label);
                    if let Some(id) = masked_id {
                        inner.registry.mark_disk_id(id);
                    }
                }
                return Ok(());
            }

            inner.mem.len() >= inner.threshold
        };

        if trigger {
            self.merge()?;
        }
        Ok(())
    }

    /// Tombstone `label` across both substrates. Removing an absent label
    /// is a no-op besides the tombstone record.
    pub fn remove(&self, label: Label) -> Result<()> {
        let mut inner = self.inner.write();
        inner.registry.mark_deleted(label);
        if let Some(id) = inner.label_map.get(label) {
            inner.registry.mark_disk_id(id);
        }
        // The label may live only on disk; a miss here is valid.
        let _ = inner.mem.lazy_delete(label);
        Ok(())
    }

    /// Search both substrates for the `k` nearest neighbors.
    ///
    /// Returns exactly `k` entries, nearest first; unfilled slots carry
    /// `label 0` and infinite distance. Results never contain duplicates
    /// or tombstoned labels.
    pub fn search(&self, query: &[T], k: usize, l_search: usize) -> Result<Vec<Neighbor>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let inner = self.inner.read();

        let mut candidates: Vec<Neighbor> = Vec::with_capacity(2 * k);
        for neighbor in inner.mem.search(query, k, l_search) {
            if !inner.registry.is_deleted(neighbor.label) {
                candidates.push(neighbor);
            }
        }

        if let Some(disk) = &inner.disk {
            let mask = inner.registry.disk_mask();
            for (id, distance) in disk.beam_search(query, k, l_search, Some(mask)) {
                if !distance.is_finite() {
                    continue;
                }
                // Unresolvable labels are dropped; a resolvable label that
                // is tombstoned is dropped too, guarding against any skew
                // between the mask and the registry.
                match disk.label_of(id) {
                    Some(label) if !inner.registry.is_deleted(label) => {
                        candidates.push(Neighbor { label, distance });
                    }
                    _ => {}
                }
            }
        }

        // Stable sort, then first-wins dedup by label: when a label lives
        // in both substrates the nearer copy (normally the fresh memory
        // point) survives.
        candidates.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        let mut seen: HashSet<Label> = HashSet::with_capacity(candidates.len());
        candidates.retain(|n| seen.insert(n.label));

        candidates.truncate(k);
        candidates.resize(
            k,
            Neighbor {
                label: 0,
                distance: f32::INFINITY,
            },
        );
        Ok(candidates)
    }

    /// Fold the memory delta into a rebuilt disk index.
    ///
    /// Runs under the writer lock for its entire duration, including the
    /// rebuild. On failure the index keeps operating; depending on the
    /// failed phase it may be memory-only until a later merge succeeds.
    pub fn merge(&self) -> Result<MergeStats> {
        let mut inner = self.inner.write();
        inner.merge()
    }

    /// Current substrate sizes and tombstone count.
    pub fn stats(&self) -> HybridStats {
        let inner = self.inner.read();
        HybridStats {
            mem_points: inner.mem.len(),
            disk_points: inner.disk.as_ref().map_or(0, |d| d.num_points()),
            deleted_labels: inner.registry.num_deleted(),
            merges: inner.merges,
        }
    }

    /// The resolved merge threshold.
    pub fn mem_threshold(&self) -> usize {
        self.inner.read().threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildParams, WriteParams};
    use crate::error::IndexError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    // ==== mock substrates ====================================================
    //
    // The memory mock is brute force over a HashMap with a switchable
    // rejection mode; the disk mock serves exact search straight from the
    // base data file and sidecar, so coordinator semantics are tested
    // without graph approximation noise.

    struct MockMem {
        dimension: usize,
        points: std::collections::HashMap<Label, Vec<f32>>,
        deleted: HashSet<Label>,
        reject: Arc<AtomicBool>,
    }

    impl MockMem {
        fn new(dimension: usize, reject: Arc<AtomicBool>) -> Self {
            Self {
                dimension,
                points: Default::default(),
                deleted: Default::default(),
                reject,
            }
        }
    }

    fn l2(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
    }

    impl MemIndex<f32> for MockMem {
        fn clear(&mut self) {
            self.points.clear();
            self.deleted.clear();
        }

        fn insert(&mut self, point: &[f32], label: Label) -> Result<()> {
            if self.reject.load(Ordering::Relaxed) {
                return Err(IndexError::Insertion("mock rejection".into()));
            }
            self.deleted.remove(&label);
            self.points.insert(label, point.to_vec());
            Ok(())
        }

        fn lazy_delete(&mut self, label: Label) -> bool {
            if self.points.contains_key(&label) && self.deleted.insert(label) {
                return true;
            }
            false
        }

        fn consolidate(&mut self, _params: &WriteParams) -> usize {
            let removed = self.deleted.len();
            for label in self.deleted.drain() {
                self.points.remove(&label);
            }
            removed
        }

        fn search(&self, query: &[f32], k: usize, _l: usize) -> Vec<Neighbor> {
            let mut all: Vec<Neighbor> = self
                .points
                .iter()
                .filter(|&(label, _)| !self.deleted.contains(label))
                .map(|(&label, v)| Neighbor {
                    label,
                    distance: l2(query, v),
                })
                .collect();
            all.sort_by(|a, b| a.distance.total_cmp(&b.distance));
            all.truncate(k);
            all
        }

        fn len(&self) -> usize {
            self.points.len() - self.deleted.len()
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        fn save_delta(&self, prefix: &Path) -> Result<crate::mem::DeltaFiles> {
            let mut labels: Vec<Label> = self
                .points
                .keys()
                .filter(|&l| !self.deleted.contains(l))
                .copied()
                .collect();
            labels.sort_unstable();
            let mut data = Vec::new();
            for label in &labels {
                data.extend_from_slice(&self.points[label]);
            }
            let data_path = prefix.with_extension("data");
            let tags_path = prefix.with_extension("tags");
            format::write_bin_file(&data_path, &data, labels.len(), self.dimension)?;
            format::write_tags_file(&tags_path, &labels)?;
            Ok(crate::mem::DeltaFiles {
                data: data_path,
                tags: tags_path,
                count: labels.len(),
            })
        }
    }

    struct MockDisk {
        data: Vec<f32>,
        dimension: usize,
        labels: Vec<Label>,
    }

    impl DiskIndex<f32> for MockDisk {
        fn open(prefix: &Path) -> Result<Self> {
            let marker = labels_path(prefix).with_extension("built");
            if !marker.exists() {
                return Err(IndexError::Load("mock index not built".into()));
            }
            let data_path: PathBuf = std::fs::read_to_string(&marker)?.into();
            let (data, _, dimension) = format::read_bin_file::<f32>(&data_path)?;
            let labels = format::read_labels_text(&labels_path(prefix))?;
            Ok(Self {
                data,
                dimension,
                labels,
            })
        }

        fn num_points(&self) -> usize {
            self.labels.len()
        }

        fn label_of(&self, id: u32) -> Option<Label> {
            self.labels.get(id as usize).copied()
        }

        fn beam_search(
            &self,
            query: &[f32],
            k: usize,
            _l: usize,
            mask: Option<&HashSet<u32>>,
        ) -> Vec<(u32, f32)> {
            let mut all: Vec<(u32, f32)> = (0..self.labels.len() as u32)
                .filter(|id| !mask.is_some_and(|m| m.contains(id)))
                .map(|id| {
                    let at = id as usize * self.dimension;
                    (id, l2(query, &self.data[at..at + self.dimension]))
                })
                .collect();
            all.sort_by(|a, b| a.1.total_cmp(&b.1));
            all.truncate(k);
            all
        }

        fn rebuild(
            data_path: &Path,
            _labels_path: &Path,
            prefix: &Path,
            _params: &BuildParams,
        ) -> Result<()> {
            let marker = labels_path(prefix).with_extension("built");
            std::fs::write(marker, data_path.display().to_string())?;
            Ok(())
        }

        fn purge_artifacts(_prefix: &Path) -> Result<()> {
            Ok(())
        }

        fn write_tags(_prefix: &Path, _labels: &[Label]) -> Result<()> {
            Ok(())
        }
    }

    type MockHybrid = HybridIndex<f32, MockMem, MockDisk>;

    fn config(threshold: usize) -> HybridConfig {
        HybridConfig {
            dimension: 2,
            mem_threshold: threshold,
            ..Default::default()
        }
    }

    fn mock_index(dir: &Path, threshold: usize) -> (MockHybrid, Arc<AtomicBool>) {
        let reject = Arc::new(AtomicBool::new(false));
        let index = MockHybrid::with_substrate(
            config(threshold),
            &dir.join("base.data"),
            &dir.join("idx"),
            MockMem::new(2, reject.clone()),
        )
        .unwrap();
        (index, reject)
    }

    fn labels_of(results: &[Neighbor]) -> Vec<Label> {
        results
            .iter()
            .filter(|n| n.distance.is_finite())
            .map(|n| n.label)
            .collect()
    }

    #[test]
    fn test_fresh_index_pads_results() {
        let dir = tempfile::tempdir().unwrap();
        let (index, _) = mock_index(dir.path(), 100);

        let results = index.search(&[0.0, 0.0], 5, 20).unwrap();
        assert_eq!(results.len(), 5);
        assert!(results
            .iter()
            .all(|n| n.label == 0 && n.distance == f32::INFINITY));
    }

    #[test]
    fn test_insert_remove_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let (index, _) = mock_index(dir.path(), 100);

        index.insert(&[1.0, 2.0], 7).unwrap();
        let results = index.search(&[1.0, 2.0], 3, 20).unwrap();
        assert_eq!(results[0].label, 7);
        assert!(results[0].distance < 1e-6);

        index.remove(7).unwrap();
        let results = index.search(&[1.0, 2.0], 3, 20).unwrap();
        assert!(!labels_of(&results).contains(&7));
    }

    #[test]
    fn test_merge_moves_delta_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (index, _) = mock_index(dir.path(), 100);

        for i in 0..10u32 {
            index.insert(&[i as f32, 0.0], 100 + i).unwrap();
        }
        let stats = index.merge().unwrap();
        assert_eq!(stats.appended, 10);
        assert_eq!(stats.disk_points, 10);

        let stats = index.stats();
        assert_eq!(stats.mem_points, 0);
        assert_eq!(stats.disk_points, 10);

        // Every label still resolves, now from disk.
        for i in 0..10u32 {
            let results = index.search(&[i as f32, 0.0], 1, 20).unwrap();
            assert_eq!(results[0].label, 100 + i);
        }
    }

    #[test]
    fn test_auto_merge_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let (index, _) = mock_index(dir.path(), 5);

        for i in 0..5u32 {
            index.insert(&[i as f32, 1.0], i).unwrap();
        }
        let stats = index.stats();
        assert_eq!(stats.merges, 1);
        assert_eq!(stats.mem_points, 0);
        assert_eq!(stats.disk_points, 5);
    }

    #[test]
    fn test_delete_disk_resident_label() {
        let dir = tempfile::tempdir().unwrap();
        let (index, _) = mock_index(dir.path(), 100);

        for i in 0..6u32 {
            index.insert(&[i as f32, 0.0], 10 + i).unwrap();
        }
        index.merge().unwrap();

        index.remove(12).unwrap();
        let results = index.search(&[2.0, 0.0], 6, 20).unwrap();
        assert!(!labels_of(&results).contains(&12));
    }

    #[test]
    fn test_resurrection_prefers_fresh_point() {
        let dir = tempfile::tempdir().unwrap();
        let (index, _) = mock_index(dir.path(), 100);

        index.insert(&[0.0, 0.0], 42).unwrap();
        index.merge().unwrap();
        index.remove(42).unwrap();

        // Reinsert under the same label at a new position.
        index.insert(&[5.0, 5.0], 42).unwrap();

        let results = index.search(&[5.0, 5.0], 3, 20).unwrap();
        assert_eq!(results[0].label, 42);
        assert!(results[0].distance < 1e-6);

        // The label appears once even though both substrates hold a row.
        let labels = labels_of(&index.search(&[2.5, 2.5], 10, 20).unwrap());
        assert_eq!(labels.iter().filter(|&&l| l == 42).count(), 1);
    }

    #[test]
    fn test_rejected_resurrection_restores_tombstone() {
        let dir = tempfile::tempdir().unwrap();
        let (index, reject) = mock_index(dir.path(), 100);

        index.insert(&[3.0, 3.0], 9).unwrap();
        index.merge().unwrap();
        index.remove(9).unwrap();

        // The memory index rejects the resurrecting insert; the tombstone
        // must be restored so the stale disk row stays hidden.
        reject.store(true, Ordering::Relaxed);
        index.insert(&[4.0, 4.0], 9).unwrap();
        reject.store(false, Ordering::Relaxed);

        let results = index.search(&[3.0, 3.0], 5, 20).unwrap();
        assert!(!labels_of(&results).contains(&9));
    }

    #[test]
    fn test_no_duplicate_labels_across_substrates() {
        let dir = tempfile::tempdir().unwrap();
        let (index, _) = mock_index(dir.path(), 100);

        for i in 0..8u32 {
            index.insert(&[i as f32, 0.0], i).unwrap();
        }
        index.merge().unwrap();
        // Overwrite half the labels in memory.
        for i in 0..4u32 {
            index.insert(&[i as f32 + 0.25, 0.0], i).unwrap();
        }

        let results = index.search(&[2.0, 0.0], 8, 20).unwrap();
        let labels = labels_of(&results);
        let unique: HashSet<_> = labels.iter().collect();
        assert_eq!(unique.len(), labels.len());
        assert_eq!(labels.len(), 8);
    }

    #[test]
    fn test_search_zero_k() {
        let dir = tempfile::tempdir().unwrap();
        let (index, _) = mock_index(dir.path(), 100);
        assert!(index.search(&[0.0, 0.0], 0, 20).unwrap().is_empty());
    }
}
