//! Product quantization for the on-disk index.
//!
//! Vectors are split into contiguous subspaces; each subspace is quantized
//! against its own k-means codebook of at most 256 codewords, so a point
//! compresses to one byte per subspace. Search precomputes a per-query
//! table of subspace distances and scores a point by summing table entries
//! for its codes (asymmetric distance computation).

use crate::error::{IndexError, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::Path;

const CODEBOOK_SIZE: usize = 256;
const KMEANS_ITERS: usize = 10;

/// Trained product quantizer: subspace boundaries plus one codebook per
/// subspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductQuantizer {
    dimension: usize,
    // Subspace i covers dims [bounds[i], bounds[i + 1]).
    bounds: Vec<usize>,
    // codebooks[chunk][code] -> centroid of that subspace.
    codebooks: Vec<Vec<Vec<f32>>>,
}

/// Per-query lookup table of subspace distances.
pub struct DistanceTable {
    // tables[chunk][code] = squared L2 between the query subvector and the
    // codeword.
    tables: Vec<Vec<f32>>,
}

impl DistanceTable {
    /// Approximate squared L2 distance to the point encoded as `codes`.
    #[inline]
    pub fn distance(&self, codes: &[u8]) -> f32 {
        codes
            .iter()
            .zip(self.tables.iter())
            .map(|(&code, table)| table[code as usize])
            .sum()
    }
}

/// Pick a subspace count for `dimension` when the caller leaves it to us:
/// roughly four dims per subspace, at least one, at most the dimension.
pub fn derive_chunks(dimension: usize) -> usize {
    (dimension / 4).clamp(1, dimension.max(1))
}

impl ProductQuantizer {
    /// Train codebooks over `n` rows of `data` (row-major, `dimension`
    /// wide). `max_train` bounds the training sample; rows are taken at a
    /// fixed stride so the sample spans the corpus.
    pub fn train(
        data: &[f32],
        n: usize,
        dimension: usize,
        num_chunks: usize,
        max_train: usize,
    ) -> Result<Self> {
        if n == 0 || dimension == 0 {
            return Err(IndexError::Build(
                "cannot train a quantizer on empty data".into(),
            ));
        }
        if num_chunks == 0 || num_chunks > dimension {
            return Err(IndexError::Build(format!(
                "pq chunks {} out of range for dimension {}",
                num_chunks, dimension
            )));
        }

        let stride = (n / max_train.max(1)).max(1);
        let sample: Vec<usize> = (0..n).step_by(stride).collect();

        let bounds = chunk_bounds(dimension, num_chunks);
        let mut rng = StdRng::seed_from_u64(n as u64 ^ (dimension as u64) << 17);
        let mut codebooks = Vec::with_capacity(num_chunks);
        for chunk in 0..num_chunks {
            let (start, end) = (bounds[chunk], bounds[chunk + 1]);
            let subvectors: Vec<Vec<f32>> = sample
                .iter()
                .map(|&row| data[row * dimension + start..row * dimension + end].to_vec())
                .collect();
            let k = CODEBOOK_SIZE.min(subvectors.len());
            codebooks.push(kmeans(&subvectors, k, &mut rng));
        }

        Ok(Self {
            dimension,
            bounds,
            codebooks,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn num_chunks(&self) -> usize {
        self.codebooks.len()
    }

    /// Encode one vector to one code byte per subspace.
    pub fn encode(&self, vector: &[f32]) -> Vec<u8> {
        debug_assert_eq!(vector.len(), self.dimension);
        let mut codes = Vec::with_capacity(self.num_chunks());
        for (chunk, codebook) in self.codebooks.iter().enumerate() {
            let sub = &vector[self.bounds[chunk]..self.bounds[chunk + 1]];
            let mut best = 0usize;
            let mut best_dist = f32::INFINITY;
            for (code, codeword) in codebook.iter().enumerate() {
                let dist = squared_l2(sub, codeword);
                if dist < best_dist {
                    best_dist = dist;
                    best = code;
                }
            }
            codes.push(best as u8);
        }
        codes
    }

    /// Encode `n` rows, fanning out over up to `threads` workers.
    pub fn encode_batch(&self, data: &[f32], n: usize, threads: usize) -> Vec<u8> {
        let chunks = self.num_chunks();
        if n == 0 {
            return Vec::new();
        }
        let mut codes = vec![0u8; n * chunks];
        let workers = threads.max(1).min(n);
        let rows_per_worker = n.div_ceil(workers);

        std::thread::scope(|scope| {
            for (worker, out) in codes.chunks_mut(rows_per_worker * chunks).enumerate() {
                let first_row = worker * rows_per_worker;
                scope.spawn(move || {
                    for (i, row_codes) in out.chunks_mut(chunks).enumerate() {
                        let row = first_row + i;
                        let vector = &data[row * self.dimension..(row + 1) * self.dimension];
                        row_codes.copy_from_slice(&self.encode(vector));
                    }
                });
            }
        });
        codes
    }

    /// Build the per-query distance table for ADC scoring.
    pub fn distance_table(&self, query: &[f32]) -> DistanceTable {
        let tables = self
            .codebooks
            .iter()
            .enumerate()
            .map(|(chunk, codebook)| {
                let sub = &query[self.bounds[chunk]..self.bounds[chunk + 1]];
                codebook.iter().map(|cw| squared_l2(sub, cw)).collect()
            })
            .collect();
        DistanceTable { tables }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), self)
            .map_err(|e| IndexError::Format(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|e| IndexError::Format(format!("{}: {}", path.display(), e)))
    }
}

fn chunk_bounds(dimension: usize, num_chunks: usize) -> Vec<usize> {
    // First `rem` subspaces take one extra dim when the split is uneven.
    let base = dimension / num_chunks;
    let rem = dimension % num_chunks;
    let mut bounds = Vec::with_capacity(num_chunks + 1);
    let mut at = 0;
    bounds.push(0);
    for chunk in 0..num_chunks {
        at += base + usize::from(chunk < rem);
        bounds.push(at);
    }
    bounds
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}

/// Lloyd's iterations over `points` with random init. Empty clusters are
/// reseeded from the point farthest from its centroid.
fn kmeans(points: &[Vec<f32>], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let picked = rand::seq::index::sample(rng, points.len(), k);
    let mut centroids: Vec<Vec<f32>> = picked.iter().map(|i| points[i].clone()).collect();
    let mut assignment = vec![0usize; points.len()];

    for _ in 0..KMEANS_ITERS {
        let mut moved = false;
        for (i, point) in points.iter().enumerate() {
            let mut best = 0usize;
            let mut best_dist = f32::INFINITY;
            for (c, centroid) in centroids.iter().enumerate() {
                let dist = squared_l2(point, centroid);
                if dist < best_dist {
                    best_dist = dist;
                    best = c;
                }
            }
            if assignment[i] != best {
                assignment[i] = best;
                moved = true;
            }
        }
        if !moved {
            break;
        }

        let dim = centroids[0].len();
        let mut sums = vec![vec![0.0f32; dim]; k];
        let mut counts = vec![0usize; k];
        for (i, point) in points.iter().enumerate() {
            counts[assignment[i]] += 1;
            for (s, &v) in sums[assignment[i]].iter_mut().zip(point.iter()) {
                *s += v;
            }
        }
        for c in 0..k {
            if counts[c] == 0 {
                // Reseed from the worst-fitted point.
                let far = (0..points.len())
                    .max_by(|&a, &b| {
                        squared_l2(&points[a], &centroids[assignment[a]])
                            .total_cmp(&squared_l2(&points[b], &centroids[assignment[b]]))
                    })
                    .unwrap_or(0);
                centroids[c] = points[far].clone();
            } else {
                for (s, out) in sums[c].iter().zip(centroids[c].iter_mut()) {
                    *out = s / counts[c] as f32;
                }
            }
        }
    }

    centroids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn training_data(n: usize, d: usize) -> Vec<f32> {
        let mut state = 0x9e3779b97f4a7c15u64;
        let mut next = move || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            ((state >> 33) as f32) / (u32::MAX as f32)
        };
        (0..n * d).map(|_| next()).collect()
    }

    #[test]
    fn test_chunk_bounds_even_and_uneven() {
        assert_eq!(chunk_bounds(8, 2), vec![0, 4, 8]);
        assert_eq!(chunk_bounds(10, 3), vec![0, 4, 7, 10]);
    }

    #[test]
    fn test_derive_chunks() {
        assert_eq!(derive_chunks(128), 32);
        assert_eq!(derive_chunks(3), 1);
        assert_eq!(derive_chunks(1), 1);
    }

    #[test]
    fn test_encode_decode_distance_tracks_truth() {
        let (n, d) = (400, 16);
        let data = training_data(n, d);
        let pq = ProductQuantizer::train(&data, n, d, 4, n).unwrap();

        let query = &data[0..d];
        let table = pq.distance_table(query);

        // The encoded self-distance should be small relative to distances
        // to unrelated rows.
        let self_codes = pq.encode(query);
        let other_codes = pq.encode(&data[200 * d..201 * d]);
        let true_other = squared_l2(query, &data[200 * d..201 * d]);

        assert!(table.distance(&self_codes) < table.distance(&other_codes));
        let approx = table.distance(&other_codes);
        assert!(
            (approx - true_other).abs() < true_other.max(0.5),
            "approx {} too far from true {}",
            approx,
            true_other
        );
    }

    #[test]
    fn test_encode_batch_matches_single() {
        let (n, d) = (50, 8);
        let data = training_data(n, d);
        let pq = ProductQuantizer::train(&data, n, d, 2, n).unwrap();

        let batch = pq.encode_batch(&data, n, 4);
        for row in 0..n {
            let single = pq.encode(&data[row * d..(row + 1) * d]);
            assert_eq!(&batch[row * 2..(row + 1) * 2], single.as_slice());
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pivots.json");

        let (n, d) = (100, 8);
        let data = training_data(n, d);
        let pq = ProductQuantizer::train(&data, n, d, 2, n).unwrap();
        pq.save(&path).unwrap();

        let loaded = ProductQuantizer::load(&path).unwrap();
        assert_eq!(loaded.num_chunks(), 2);
        assert_eq!(loaded.encode(&data[0..d]), pq.encode(&data[0..d]));
    }

    #[test]
    fn test_train_rejects_empty() {
        assert!(ProductQuantizer::train(&[], 0, 8, 2, 100).is_err());
    }
}
