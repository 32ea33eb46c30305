//! Configuration for the hybrid index.
//!
//! Two knobs control when the memory delta is folded into the disk index:
//! an explicit point-count threshold, or a total RAM budget from which a
//! threshold is derived. At least one must be set.

use crate::error::{IndexError, Result};

/// Graph construction parameters shared by the memory index and the
/// disk-index builder.
#[derive(Debug, Clone)]
pub struct WriteParams {
    /// Maximum out-degree per node (R).
    pub max_degree: usize,
    /// Candidate list size during construction (L).
    pub search_list_size: usize,
    /// Pruning aggressiveness for alpha-pruning (typically 1.2 - 1.4).
    pub alpha: f32,
}

impl Default for WriteParams {
    fn default() -> Self {
        Self {
            max_degree: 32,
            search_list_size: 64,
            alpha: 1.2,
        }
    }
}

/// Parameters handed to the disk-index builder on rebuild.
#[derive(Debug, Clone)]
pub struct BuildParams {
    /// Maximum out-degree per node (R).
    pub max_degree: usize,
    /// Candidate list size during construction (L).
    pub search_list_size: usize,
    /// Pruning aggressiveness.
    pub alpha: f32,
    /// Number of PQ subspaces; 0 derives one from the dimension.
    pub pq_chunks: usize,
    /// RAM cap in GiB for PQ codebook training; bounds the training sample.
    pub pq_train_ram_gb: f64,
    /// Worker threads the builder may use.
    pub threads: usize,
}

/// Configuration for a [`HybridIndex`](crate::hybrid::HybridIndex).
#[derive(Debug, Clone)]
pub struct HybridConfig {
    /// Vector dimension. Immutable for the index lifetime.
    pub dimension: usize,
    /// Graph construction parameters.
    pub write_params: WriteParams,
    /// Memory-index point count that triggers a merge. 0 derives the
    /// threshold from `ram_budget_gb`.
    pub mem_threshold: usize,
    /// Total RAM budget in GiB. 0 means unset; then `mem_threshold` must be
    /// positive.
    pub ram_budget_gb: f64,
    /// Number of PQ subspaces for the disk index; 0 derives one from the
    /// dimension.
    pub pq_chunks: usize,
    /// Rewrite the base file on merge, dropping tombstoned on-disk rows.
    /// Off by default: deleted rows stay in the base file and are masked by
    /// tombstone projection.
    pub purge_deleted_on_merge: bool,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            dimension: 0,
            write_params: WriteParams::default(),
            mem_threshold: 0,
            ram_budget_gb: 0.0,
            pq_chunks: 0,
            purge_deleted_on_merge: false,
        }
    }
}

impl HybridConfig {
    /// Validate the configuration and resolve the merge threshold for an
    /// element of `elem_size` bytes.
    pub fn resolved_threshold(&self, elem_size: usize) -> Result<usize> {
        if self.dimension == 0 {
            return Err(IndexError::Config("dimension must be positive".into()));
        }
        if self.mem_threshold > 0 {
            return Ok(self.mem_threshold);
        }
        if self.ram_budget_gb <= 0.0 {
            return Err(IndexError::Config(
                "either mem_threshold or ram_budget_gb must be set".into(),
            ));
        }
        Ok(mem_capacity_for_budget(
            self.ram_budget_gb,
            self.dimension,
            elem_size,
            self.write_params.max_degree,
        ))
    }
}

/// Fraction of the total budget reserved for the memory index; the rest is
/// left to disk-index caches and beam-search buffers.
const DYN_RATIO: f64 = 0.2;
/// Allocator and bookkeeping overhead multiplier.
const OVERHEAD: f64 = 1.1;
/// Adjacency lists run over the nominal degree during construction.
const GRAPH_SLACK: f64 = 1.3;

/// Translate a total RAM budget in GiB into a memory-index capacity.
///
/// Models the per-point footprint as the aligned vector row plus the
/// slack-adjusted adjacency list plus per-point synchronization state.
/// Returns at least 1 for any positive budget.
pub fn mem_capacity_for_budget(
    budget_gb: f64,
    dimension: usize,
    elem_size: usize,
    max_degree: usize,
) -> usize {
    let aligned_dim = (dimension + 7) & !7;
    let per_point = OVERHEAD
        * (aligned_dim as f64 * elem_size as f64
            + max_degree as f64 * 4.0 * GRAPH_SLACK
            + std::mem::size_of::<parking_lot::Mutex<()>>() as f64
            + std::mem::size_of::<isize>() as f64);
    let budget_bytes = budget_gb * (1u64 << 30) as f64 * DYN_RATIO;
    ((budget_bytes / per_point) as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_passthrough() {
        let config = HybridConfig {
            dimension: 16,
            mem_threshold: 500,
            ..Default::default()
        };
        assert_eq!(config.resolved_threshold(4).unwrap(), 500);
    }

    #[test]
    fn test_threshold_from_budget() {
        let config = HybridConfig {
            dimension: 128,
            ram_budget_gb: 1.0,
            ..Default::default()
        };
        let threshold = config.resolved_threshold(4).unwrap();
        // 0.2 GiB over ~750 bytes/point lands in the hundreds of thousands.
        assert!(threshold > 100_000, "threshold {} too small", threshold);
        assert!(threshold < 1_000_000, "threshold {} too large", threshold);
    }

    #[test]
    fn test_tiny_budget_still_positive() {
        let threshold = mem_capacity_for_budget(0.00005, 128, 4, 32);
        assert!(threshold >= 1);
        assert!(threshold < 100);
    }

    #[test]
    fn test_unset_capacity_rejected() {
        let config = HybridConfig {
            dimension: 16,
            ..Default::default()
        };
        assert!(matches!(
            config.resolved_threshold(4),
            Err(IndexError::Config(_))
        ));
    }

    #[test]
    fn test_zero_dimension_rejected() {
        let config = HybridConfig {
            mem_threshold: 100,
            ..Default::default()
        };
        assert!(matches!(
            config.resolved_threshold(4),
            Err(IndexError::Config(_))
        ));
    }

    #[test]
    fn test_budget_scales_with_degree() {
        let small = mem_capacity_for_budget(0.5, 64, 4, 16);
        let large = mem_capacity_for_budget(0.5, 64, 4, 128);
        assert!(small > large);
    }
}
