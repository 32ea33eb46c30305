//! Merge/compaction: fold the memory delta into a rebuilt disk index.
//!
//! Phases, all under the coordinator's writer lock:
//!
//! - **A** consolidate lazily deleted points out of the memory index
//! - **B** serialize the delta to `<prefix>_temp_mem.index.{data,tags}`
//! - **C** append the delta rows to the base data file (optionally first
//!   rewriting it without tombstoned rows) and grow its header
//! - **D** reconcile and rewrite the labels sidecar
//! - **E** rebuild the disk artifacts from the base file
//! - **F** reload the disk index, reset the memory index, reproject
//!   tombstones, clean up temp files
//!
//! A failure after the append leaves the base file grown and the disk
//! index stale; the memory delta is kept, so the index keeps serving
//! memory-only and a retried merge re-appends the delta. Duplicate rows
//! from such a retry share a label, and the query planner's label dedup
//! keeps only the nearest, so retries cost space but not correctness.

use super::{labels_path, temp_prefix, Inner};
use crate::config::BuildParams;
use crate::disk::DiskIndex;
use crate::error::{IndexError, Result};
use crate::format::{self, Element};
use crate::mem::{DeltaFiles, MemIndex};
use crate::Label;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Outcome of one merge.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeStats {
    /// Delta rows appended to the base file.
    pub appended: usize,
    /// Tombstoned rows physically removed from the base file.
    pub purged: usize,
    /// Point count of the freshly opened disk index.
    pub disk_points: usize,
}

impl<T, M, D> Inner<T, M, D>
where
    T: Element,
    M: MemIndex<T>,
    D: DiskIndex<T>,
{
    pub(crate) fn merge(&mut self) -> Result<MergeStats> {
        let dim = self.mem.dimension();

        // Phase A
        let consolidated = self.mem.consolidate(&self.config.write_params);
        if consolidated > 0 {
            debug!(consolidated, "dropped lazily deleted points from delta");
        }

        // Phase B
        let delta = self.mem.save_delta(&temp_prefix(&self.prefix))?;

        let result = self.fold_delta(&delta, dim);

        // Temp cleanup is best-effort, success or not.
        for path in [&delta.data, &delta.tags] {
            let _ = std::fs::remove_file(path);
        }

        let stats = result?;
        self.merges += 1;
        info!(
            appended = stats.appended,
            purged = stats.purged,
            disk_points = stats.disk_points,
            "merge complete"
        );
        Ok(stats)
    }

    fn fold_delta(&mut self, delta: &DeltaFiles, dim: usize) -> Result<MergeStats> {
        let purge: Vec<Label> = if self.config.purge_deleted_on_merge {
            self.registry
                .deleted_labels()
                .filter(|&label| self.label_map.contains(label))
                .collect()
        } else {
            Vec::new()
        };

        if delta.count == 0 && purge.is_empty() {
            debug!("nothing to merge");
            return Ok(MergeStats {
                appended: 0,
                purged: 0,
                disk_points: self.disk.as_ref().map_or(0, |d| d.num_points()),
            });
        }

        // Phase C: base header, treating an absent or header-less file as
        // a fresh base of the delta's dimension.
        let (mut n_file, d_file) = format::read_or_init_bin_header(&self.data_path, dim)?;
        if d_file != 0 && d_file != dim {
            return Err(IndexError::DimensionMismatch {
                base_dim: d_file,
                delta_dim: dim,
            });
        }

        // Phase D (first half): bring the sidecar back in step with the
        // base file before relying on its row alignment.
        let sidecar_path = labels_path(&self.prefix);
        let mut sidecar = format::read_labels_text(&sidecar_path)?;
        if sidecar.len() < n_file {
            warn!(
                sidecar = sidecar.len(),
                base = n_file,
                "labels sidecar shorter than base file, padding with row ids; \
                 this indicates prior data/label skew"
            );
            sidecar.extend(sidecar.len() as Label..n_file as Label);
        } else if sidecar.len() > n_file {
            warn!(
                sidecar = sidecar.len(),
                base = n_file,
                "labels sidecar longer than base file, truncating"
            );
            sidecar.truncate(n_file);
        }

        // Optional purge: rewrite the base without tombstoned rows. The
        // rewrite lands in a temp file first and renames over the base, so
        // a failure mid-rewrite leaves the original intact.
        let purged = if purge.is_empty() {
            0
        } else {
            let purge_set: HashSet<Label> = purge.iter().copied().collect();
            let (data, n, d) = format::read_bin_file::<T>(&self.data_path)?;
            let mut kept_data = Vec::with_capacity(data.len());
            let mut kept_labels = Vec::with_capacity(n);
            for (row, &label) in sidecar.iter().enumerate() {
                if purge_set.contains(&label) {
                    continue;
                }
                kept_data.extend_from_slice(&data[row * d..(row + 1) * d]);
                kept_labels.push(label);
            }
            let removed = n - kept_labels.len();

            let rewrite = self.data_path.with_extension("rewrite");
            format::write_bin_file(&rewrite, &kept_data, kept_labels.len(), d)?;
            std::fs::rename(&rewrite, &self.data_path)?;

            sidecar = kept_labels;
            n_file = sidecar.len();
            debug!(removed, remaining = n_file, "purged tombstoned base rows");
            removed
        };

        // Phase C (second half): append the delta rows. The append
        // truncates back on failure, so the header never overstates the
        // payload.
        if delta.count > 0 {
            let (delta_data, delta_n, delta_d) = format::read_bin_file::<T>(&delta.data)?;
            format::append_bin_rows(&self.data_path, &delta_data, delta_n, delta_d)?;
            sidecar.extend(format::read_tags_file(&delta.tags)?);
            n_file += delta_n;
        }

        // Phase D (second half): the sidecar is rewritten wholesale so row
        // i always names the label of base row i.
        format::write_labels_text(&sidecar_path, &sidecar)?;

        // Phase E: release the old handle, drop quantization sidecars
        // whose shape may change, rebuild.
        self.disk = None;
        D::purge_artifacts(&self.prefix)?;
        if n_file > 0 {
            D::rebuild(&self.data_path, &sidecar_path, &self.prefix, &self.build_params())?;
            // The sidecar stays authoritative even against a builder that
            // mangles embedded labels.
            D::write_tags(&self.prefix, &sidecar)?;
        }

        // Phase F: reload and reproject. Internal ids did not survive the
        // rebuild; the label set did.
        self.mem.clear();
        self.reload_disk();
        self.registry.discard_labels(purge);

        Ok(MergeStats {
            appended: delta.count,
            purged,
            disk_points: self.disk.as_ref().map_or(0, |d| d.num_points()),
        })
    }

    fn build_params(&self) -> BuildParams {
        let wp = &self.config.write_params;
        BuildParams {
            max_degree: wp.max_degree,
            search_list_size: wp.search_list_size,
            alpha: wp.alpha,
            pq_chunks: self.config.pq_chunks,
            // 70% of the overall budget may go to PQ training, with the
            // floor keeping tiny budgets workable.
            pq_train_ram_gb: (0.7 * self.config.ram_budget_gb).max(0.001),
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}
