//! In-memory incremental Vamana index for the fresh delta.
//!
//! Absorbs inserts and lazy deletes between merges. Points are linked into
//! the graph one at a time: a greedy search collects candidates, alpha
//! pruning picks diverse neighbors, and reverse edges are added with
//! prune-on-overflow. Deleted points stay in the graph as traversal hops
//! until [`MemIndex::consolidate`] rebuilds the graph over survivors.

use crate::config::WriteParams;
use crate::error::{IndexError, Result};
use crate::format::{self, Element};
use crate::{Label, Neighbor};
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// The coordinator's memory-substrate seam.
///
/// Implementations hold the mutable delta: tag-addressed points with lazy
/// deletion, compaction, and delta serialization for the merge path.
pub trait MemIndex<T: Element> {
    /// Drop all points and edges, keeping configuration.
    fn clear(&mut self);

    /// Insert a point under `label`, overwriting any live point with the
    /// same label.
    fn insert(&mut self, point: &[T], label: Label) -> Result<()>;

    /// Mark `label` deleted. Returns false when no live point carries the
    /// tag (the label may exist only on disk, which is valid).
    fn lazy_delete(&mut self, label: Label) -> bool;

    /// Compact lazily deleted points out of the graph. Returns how many
    /// points were physically removed.
    fn consolidate(&mut self, params: &WriteParams) -> usize;

    /// Greedy beam search. Returns up to `k` live neighbors, nearest first.
    fn search(&self, query: &[T], k: usize, l_search: usize) -> Vec<Neighbor>;

    /// Number of live points.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Vector dimension.
    fn dimension(&self) -> usize;

    /// Serialize live points to `<prefix>.data` / `<prefix>.tags`.
    fn save_delta(&self, prefix: &Path) -> Result<DeltaFiles>;
}

/// Paths produced by [`MemIndex::save_delta`].
#[derive(Debug, Clone)]
pub struct DeltaFiles {
    pub data: PathBuf,
    pub tags: PathBuf,
    /// Rows written.
    pub count: usize,
}

/// Incremental in-memory Vamana graph with label tags.
pub struct FreshVamana<T: Element> {
    dimension: usize,
    params: WriteParams,
    // Flat row-major storage; slot i occupies [i*d, (i+1)*d).
    vectors: Vec<T>,
    labels: Vec<Label>,
    label_to_slot: HashMap<Label, u32>,
    deleted: HashSet<u32>,
    adj: Vec<SmallVec<[u32; 32]>>,
    entry: Option<u32>,
}

#[derive(Clone, Copy)]
struct Candidate {
    slot: u32,
    dist: f32,
}

impl<T: Element> FreshVamana<T> {
    pub fn new(dimension: usize, params: WriteParams) -> Self {
        Self {
            dimension,
            params,
            vectors: Vec::new(),
            labels: Vec::new(),
            label_to_slot: HashMap::new(),
            deleted: HashSet::new(),
            adj: Vec::new(),
            entry: None,
        }
    }

    fn vector(&self, slot: u32) -> &[T] {
        let start = slot as usize * self.dimension;
        &self.vectors[start..start + self.dimension]
    }

    // Squared L2, promoted to f32 elementwise.
    fn dist(a: &[T], b: &[T]) -> f32 {
        a.iter()
            .zip(b.iter())
            .map(|(&x, &y)| {
                let d = x.to_f32() - y.to_f32();
                d * d
            })
            .sum()
    }

    fn entry_slot(&self) -> Option<u32> {
        match self.entry {
            Some(e) if !self.deleted.contains(&e) => Some(e),
            _ => (0..self.adj.len() as u32).find(|s| !self.deleted.contains(s)),
        }
    }

    /// Greedy search keeping the `l_size` best candidates seen so far.
    /// Deleted slots are traversed but callers filter them from results.
    fn greedy_search(&self, query: &[T], l_size: usize, start: u32) -> Vec<Candidate> {
        let mut visited = HashSet::new();
        let mut retset: Vec<Candidate> = Vec::with_capacity(l_size + 1);

        retset.push(Candidate {
            slot: start,
            dist: Self::dist(query, self.vector(start)),
        });
        visited.insert(start);

        let mut current = 0;
        while current < retset.len() {
            let expand = retset[current];
            current += 1;

            for &neighbor in &self.adj[expand.slot as usize] {
                if !visited.insert(neighbor) {
                    continue;
                }
                retset.push(Candidate {
                    slot: neighbor,
                    dist: Self::dist(query, self.vector(neighbor)),
                });
            }

            retset.sort_by(|a, b| a.dist.total_cmp(&b.dist));
            if retset.len() > l_size {
                retset.truncate(l_size);
                current = current.min(l_size);
            }
        }

        retset
    }

    /// Alpha pruning: keep candidates not already covered by a closer kept
    /// neighbor, scaled by `alpha`.
    fn robust_prune(&self, slot: u32, candidates: &[u32], alpha: f32) -> SmallVec<[u32; 32]> {
        let own = self.vector(slot);
        let mut pool: Vec<Candidate> = candidates
            .iter()
            .chain(self.adj[slot as usize].iter())
            .filter(|&&c| c != slot)
            .map(|&c| Candidate {
                slot: c,
                dist: Self::dist(own, self.vector(c)),
            })
            .collect();
        pool.sort_by(|a, b| a.dist.total_cmp(&b.dist));
        pool.dedup_by_key(|c| c.slot);

        let mut kept: SmallVec<[u32; 32]> = SmallVec::new();
        for cand in pool {
            if kept.len() >= self.params.max_degree {
                break;
            }
            let covered = kept.iter().any(|&k| {
                alpha * Self::dist(self.vector(k), self.vector(cand.slot)) <= cand.dist
            });
            if !covered {
                kept.push(cand.slot);
            }
        }
        kept
    }

    /// Link `slot` into the graph and add pruned reverse edges.
    fn link(&mut self, slot: u32, entry: u32) {
        let point: Vec<T> = self.vector(slot).to_vec();
        let visited: Vec<u32> = self
            .greedy_search(&point, self.params.search_list_size, entry)
            .iter()
            .map(|c| c.slot)
            .collect();
        let neighbors = self.robust_prune(slot, &visited, self.params.alpha);
        self.adj[slot as usize] = neighbors.clone();

        for neighbor in neighbors {
            let list = &mut self.adj[neighbor as usize];
            if !list.contains(&slot) {
                list.push(slot);
            }
            if self.adj[neighbor as usize].len() > self.params.max_degree {
                let pool: Vec<u32> = self.adj[neighbor as usize].to_vec();
                self.adj[neighbor as usize] = self.robust_prune(neighbor, &pool, self.params.alpha);
            }
        }
    }
}

impl<T: Element> MemIndex<T> for FreshVamana<T> {
    fn clear(&mut self) {
        self.vectors.clear();
        self.labels.clear();
        self.label_to_slot.clear();
        self.deleted.clear();
        self.adj.clear();
        self.entry = None;
    }

    fn insert(&mut self, point: &[T], label: Label) -> Result<()> {
        if point.len() != self.dimension {
            return Err(IndexError::Insertion(format!(
                "point has dimension {}, index expects {}",
                point.len(),
                self.dimension
            )));
        }

        if let Some(&slot) = self.label_to_slot.get(&label) {
            // Overwrite in place and relink around the new position.
            let start = slot as usize * self.dimension;
            self.vectors[start..start + self.dimension].copy_from_slice(point);
            self.adj[slot as usize].clear();
            if let Some(entry) = self.entry_slot().filter(|&e| e != slot) {
                self.link(slot, entry);
            }
            return Ok(());
        }

        let slot = self.adj.len() as u32;
        self.vectors.extend_from_slice(point);
        self.labels.push(label);
        self.adj.push(SmallVec::new());
        self.label_to_slot.insert(label, slot);

        match self.entry_slot().filter(|&e| e != slot) {
            Some(entry) => self.link(slot, entry),
            None => self.entry = Some(slot),
        }
        Ok(())
    }

    fn lazy_delete(&mut self, label: Label) -> bool {
        match self.label_to_slot.remove(&label) {
            Some(slot) => {
                self.deleted.insert(slot);
                true
            }
            None => false,
        }
    }

    fn consolidate(&mut self, params: &WriteParams) -> usize {
        let removed = self.deleted.len();
        if removed == 0 {
            return 0;
        }
        debug!(removed, "consolidating memory index");

        let survivors: Vec<u32> = (0..self.adj.len() as u32)
            .filter(|s| !self.deleted.contains(s))
            .collect();

        let mut vectors = Vec::with_capacity(survivors.len() * self.dimension);
        let mut labels = Vec::with_capacity(survivors.len());
        for &slot in &survivors {
            vectors.extend_from_slice(self.vector(slot));
            labels.push(self.labels[slot as usize]);
        }

        self.vectors = vectors;
        self.labels = labels;
        self.deleted.clear();
        self.label_to_slot = self
            .labels
            .iter()
            .enumerate()
            .map(|(slot, &label)| (label, slot as u32))
            .collect();
        self.adj = vec![SmallVec::new(); self.labels.len()];
        self.entry = if self.labels.is_empty() { None } else { Some(0) };

        // Relink survivors one at a time; small deltas make a full relink
        // cheaper than graph surgery.
        let saved = std::mem::replace(&mut self.params, params.clone());
        for slot in 1..self.adj.len() as u32 {
            self.link(slot, 0);
        }
        self.params = saved;

        removed
    }

    fn search(&self, query: &[T], k: usize, l_search: usize) -> Vec<Neighbor> {
        let Some(entry) = self.entry_slot() else {
            return Vec::new();
        };
        if query.len() != self.dimension {
            return Vec::new();
        }
        let l = l_search.max(k);
        self.greedy_search(query, l, entry)
            .into_iter()
            .filter(|c| !self.deleted.contains(&c.slot))
            .take(k)
            .map(|c| Neighbor {
                label: self.labels[c.slot as usize],
                distance: c.dist,
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.adj.len() - self.deleted.len()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn save_delta(&self, prefix: &Path) -> Result<DeltaFiles> {
        let mut data = Vec::with_capacity(self.len() * self.dimension);
        let mut tags = Vec::with_capacity(self.len());
        for slot in 0..self.adj.len() as u32 {
            if self.deleted.contains(&slot) {
                continue;
            }
            data.extend_from_slice(self.vector(slot));
            tags.push(self.labels[slot as usize]);
        }

        let data_path = prefix.with_extension("data");
        let tags_path = prefix.with_extension("tags");
        format::write_bin_file(&data_path, &data, tags.len(), self.dimension)?;
        format::write_tags_file(&tags_path, &tags)?;
        Ok(DeltaFiles {
            data: data_path,
            tags: tags_path,
            count: tags.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> WriteParams {
        WriteParams {
            max_degree: 8,
            search_list_size: 16,
            alpha: 1.2,
        }
    }

    fn grid_index(n: usize) -> FreshVamana<f32> {
        let mut index = FreshVamana::new(2, params());
        for i in 0..n {
            index
                .insert(&[i as f32, (i * i % 7) as f32], 100 + i as Label)
                .unwrap();
        }
        index
    }

    #[test]
    fn test_self_query_rank_zero() {
        let index = grid_index(30);
        let results = index.search(&[4.0, 2.0], 5, 16);
        assert_eq!(results[0].label, 104);
        assert!(results[0].distance < 1e-6);
    }

    #[test]
    fn test_empty_search() {
        let index = FreshVamana::<f32>::new(2, params());
        assert!(index.search(&[0.0, 0.0], 5, 16).is_empty());
    }

    #[test]
    fn test_dimension_rejected() {
        let mut index = FreshVamana::<f32>::new(4, params());
        let err = index.insert(&[1.0, 2.0], 1).unwrap_err();
        assert!(matches!(err, IndexError::Insertion(_)));
    }

    #[test]
    fn test_lazy_delete_hides_point() {
        let mut index = grid_index(20);
        assert!(index.lazy_delete(104));
        assert!(!index.lazy_delete(104)); // tag already gone
        let results = index.search(&[4.0, 2.0], 5, 16);
        assert!(results.iter().all(|n| n.label != 104));
        assert_eq!(index.len(), 19);
    }

    #[test]
    fn test_reinsert_overwrites() {
        let mut index = grid_index(10);
        index.insert(&[50.0, 50.0], 103).unwrap();
        assert_eq!(index.len(), 10);
        let results = index.search(&[50.0, 50.0], 1, 16);
        assert_eq!(results[0].label, 103);
        assert!(results[0].distance < 1e-6);
    }

    #[test]
    fn test_consolidate_compacts() {
        let mut index = grid_index(25);
        for label in [101, 105, 110] {
            index.lazy_delete(label);
        }
        let removed = index.consolidate(&params());
        assert_eq!(removed, 3);
        assert_eq!(index.len(), 22);

        // Survivors remain findable after the rebuild.
        let results = index.search(&[7.0, 0.0], 3, 16);
        assert_eq!(results[0].label, 107);
        // Deleted labels never surface.
        let all = index.search(&[0.0, 0.0], 22, 64);
        assert!(all.iter().all(|n| ![101, 105, 110].contains(&n.label)));
    }

    #[test]
    fn test_save_delta_skips_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = grid_index(6);
        index.lazy_delete(102);

        let delta = index.save_delta(&dir.path().join("delta")).unwrap();
        assert_eq!(delta.count, 5);

        let tags = format::read_tags_file(&delta.tags).unwrap();
        assert_eq!(tags.len(), 5);
        assert!(!tags.contains(&102));

        let (data, n, d) = format::read_bin_file::<f32>(&delta.data).unwrap();
        assert_eq!((n, d), (5, 2));
        assert_eq!(data.len(), 10);
    }

    #[test]
    fn test_u8_elements() {
        let mut index = FreshVamana::<u8>::new(3, params());
        index.insert(&[10, 20, 30], 1).unwrap();
        index.insert(&[200, 10, 0], 2).unwrap();
        let results = index.search(&[9, 21, 29], 1, 8);
        assert_eq!(results[0].label, 1);
    }
}
