//! On-disk quantized graph index.
//!
//! The disk substrate holds the merged base corpus as a Vamana graph over
//! product-quantized codes. Artifacts live under `<prefix>_disk.*`: JSON
//! metadata, the graph file, PQ codes and pivots, and embedded label tags.
//! The builder reads the base data file at full precision, trains the
//! quantizer, links the graph in two alpha passes, and writes every
//! artifact; metadata goes last, so a torn rebuild reads as no index.
//!
//! Labels: the embedded tags are a verbatim copy of the coordinator's
//! sidecar at build time. The builder never parses or rewrites the sidecar
//! itself.

pub mod io;
pub mod pq;

use crate::config::BuildParams;
use crate::error::{IndexError, Result};
use crate::format::{self, Element};
use crate::Label;
use io::{GraphFile, GraphFileWriter};
use pq::ProductQuantizer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// The coordinator's disk-substrate seam.
///
/// Implementations serve masked beam search over an immutable artifact set
/// and rebuild that artifact set from a base data file. Internal ids are
/// dense in `[0, num_points)` and valid only for the currently open index.
pub trait DiskIndex<T: Element>: Sized {
    /// Open the index under `prefix`. Absent or corrupt artifacts yield
    /// [`IndexError::Load`].
    fn open(prefix: &Path) -> Result<Self>;

    fn num_points(&self) -> usize;

    /// External label embedded for `id`, if one was recorded at build time.
    fn label_of(&self, id: u32) -> Option<Label>;

    /// Beam search for `k` nearest points. Ids in `mask` are neither
    /// expanded nor returned; the result holds at most `k` entries, all
    /// with finite distances, nearest first.
    fn beam_search(
        &self,
        query: &[T],
        k: usize,
        l_search: usize,
        mask: Option<&HashSet<u32>>,
    ) -> Vec<(u32, f32)>;

    /// Rebuild the artifact set from the base data file, embedding a copy
    /// of the labels sidecar as tags.
    fn rebuild(data_path: &Path, labels_path: &Path, prefix: &Path, params: &BuildParams)
        -> Result<()>;

    /// Delete quantization sidecars ahead of a rebuild; their shape may
    /// change with the new corpus.
    fn purge_artifacts(prefix: &Path) -> Result<()>;

    /// Overwrite the embedded tags with an authoritative label list.
    fn write_tags(prefix: &Path, labels: &[Label]) -> Result<()>;
}

fn artifact(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(prefix.as_os_str());
    name.push("_disk.");
    name.push(suffix);
    PathBuf::from(name)
}

#[derive(Debug, Serialize, Deserialize)]
struct DiskMeta {
    dimension: usize,
    num_points: usize,
    max_degree: usize,
    data_type: String,
    pq_chunks: usize,
}

/// Vamana graph over PQ codes, loaded from `<prefix>_disk.*`.
#[derive(Debug)]
pub struct PqDiskIndex<T: Element> {
    dimension: usize,
    num_points: usize,
    graph: GraphFile,
    quantizer: ProductQuantizer,
    // Row-major: point i owns codes [i * chunks, (i + 1) * chunks).
    codes: Vec<u8>,
    tags: Vec<Label>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Element> PqDiskIndex<T> {
    fn load_error(e: IndexError) -> IndexError {
        match e {
            IndexError::Load(_) => e,
            other => IndexError::Load(other.to_string()),
        }
    }
}

impl<T: Element> DiskIndex<T> for PqDiskIndex<T> {
    fn open(prefix: &Path) -> Result<Self> {
        let meta_path = artifact(prefix, "meta.json");
        let meta_file = std::fs::File::open(&meta_path)
            .map_err(|e| IndexError::Load(format!("{}: {}", meta_path.display(), e)))?;
        let meta: DiskMeta = serde_json::from_reader(std::io::BufReader::new(meta_file))
            .map_err(|e| IndexError::Load(format!("{}: {}", meta_path.display(), e)))?;

        if meta.data_type != T::DATA_TYPE {
            return Err(IndexError::Load(format!(
                "index was built for {} elements, opened as {}",
                meta.data_type,
                T::DATA_TYPE
            )));
        }

        let graph = GraphFile::open(&artifact(prefix, "graph")).map_err(Self::load_error)?;
        if graph.num_nodes != meta.num_points || graph.max_degree != meta.max_degree {
            return Err(IndexError::Load(format!(
                "graph is {} nodes of degree {}, metadata claims {} of degree {}",
                graph.num_nodes, graph.max_degree, meta.num_points, meta.max_degree
            )));
        }

        let quantizer =
            ProductQuantizer::load(&artifact(prefix, "pivots.json")).map_err(Self::load_error)?;
        let (codes, n_codes, chunks) =
            format::read_bin_file::<u8>(&artifact(prefix, "codes")).map_err(Self::load_error)?;
        if n_codes != meta.num_points || chunks != quantizer.num_chunks() {
            return Err(IndexError::Load(format!(
                "codes file is {}x{}, expected {}x{}",
                n_codes,
                chunks,
                meta.num_points,
                quantizer.num_chunks()
            )));
        }

        // Tags are best-effort: a missing file leaves every lookup a miss
        // and the planner drops those results.
        let tags = match format::read_tags_file(&artifact(prefix, "tags")) {
            Ok(tags) => tags,
            Err(e) => {
                warn!("embedded tags unreadable, label lookups will miss: {}", e);
                Vec::new()
            }
        };

        Ok(Self {
            dimension: meta.dimension,
            num_points: meta.num_points,
            graph,
            quantizer,
            codes,
            tags,
            _marker: std::marker::PhantomData,
        })
    }

    fn num_points(&self) -> usize {
        self.num_points
    }

    fn label_of(&self, id: u32) -> Option<Label> {
        self.tags.get(id as usize).copied()
    }

    fn beam_search(
        &self,
        query: &[T],
        k: usize,
        l_search: usize,
        mask: Option<&HashSet<u32>>,
    ) -> Vec<(u32, f32)> {
        if self.num_points == 0 || k == 0 || query.len() != self.dimension {
            return Vec::new();
        }
        let masked = |id: u32| mask.is_some_and(|m| m.contains(&id));

        let start = if masked(self.graph.start_node) {
            (0..self.num_points as u32).find(|&id| !masked(id))
        } else {
            Some(self.graph.start_node)
        };
        let Some(start) = start else {
            return Vec::new();
        };

        let query_f32: Vec<f32> = query.iter().map(|&v| v.to_f32()).collect();
        let table = self.quantizer.distance_table(&query_f32);
        let chunks = self.quantizer.num_chunks();
        let dist_of = |id: u32| {
            let at = id as usize * chunks;
            table.distance(&self.codes[at..at + chunks])
        };

        let l = l_search.max(k);
        let mut visited = HashSet::new();
        let mut retset: Vec<(u32, f32)> = Vec::with_capacity(l + 1);
        retset.push((start, dist_of(start)));
        visited.insert(start);

        let mut current = 0;
        while current < retset.len() {
            let (expand, _) = retset[current];
            current += 1;

            for &neighbor in self.graph.neighbors(expand) {
                if masked(neighbor) || !visited.insert(neighbor) {
                    continue;
                }
                retset.push((neighbor, dist_of(neighbor)));
            }

            retset.sort_by(|a, b| a.1.total_cmp(&b.1));
            if retset.len() > l {
                retset.truncate(l);
                current = current.min(l);
            }
        }

        retset.truncate(k);
        retset
    }

    fn rebuild(
        data_path: &Path,
        labels_path: &Path,
        prefix: &Path,
        params: &BuildParams,
    ) -> Result<()> {
        let (raw, n, dimension) = format::read_bin_file::<T>(data_path)?;
        if n == 0 {
            return Err(IndexError::Build("base data file has no points".into()));
        }
        let vectors: Vec<f32> = raw.iter().map(|&v| v.to_f32()).collect();
        debug!(n, dimension, "rebuilding disk index");

        let chunks = if params.pq_chunks > 0 {
            params.pq_chunks
        } else {
            pq::derive_chunks(dimension)
        };
        let train_budget_bytes = params.pq_train_ram_gb.max(0.001) * (1u64 << 30) as f64;
        let max_train = ((train_budget_bytes / (dimension as f64 * 4.0)) as usize).max(256);
        let quantizer = ProductQuantizer::train(&vectors, n, dimension, chunks, max_train)?;
        let codes = quantizer.encode_batch(&vectors, n, params.threads);

        let mut builder = VamanaBuilder {
            dimension,
            vectors: &vectors,
            num_points: n,
            max_degree: params.max_degree,
            search_list_size: params.search_list_size,
            adj: Vec::new(),
            start: 0,
        };
        builder.build(params.alpha);

        quantizer.save(&artifact(prefix, "pivots.json"))?;
        format::write_bin_file(&artifact(prefix, "codes"), &codes, n, chunks)?;

        let mut graph_out =
            GraphFileWriter::create(&artifact(prefix, "graph"), n, params.max_degree, builder.start)?;
        for list in &builder.adj {
            graph_out.write_adjacency(list)?;
        }
        graph_out.finish()?;

        // Embed a verbatim copy of the sidecar as tags.
        let labels = format::read_labels_text(labels_path)?;
        if labels.len() != n {
            warn!(
                sidecar = labels.len(),
                points = n,
                "labels sidecar does not cover the base file; embedded tags will be short"
            );
        }
        format::write_tags_file(&artifact(prefix, "tags"), &labels)?;

        // Metadata goes last; open() treats a missing meta as no index.
        let meta = DiskMeta {
            dimension,
            num_points: n,
            max_degree: params.max_degree,
            data_type: T::DATA_TYPE.to_string(),
            pq_chunks: chunks,
        };
        let meta_file = std::fs::File::create(artifact(prefix, "meta.json"))?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(meta_file), &meta)
            .map_err(|e| IndexError::Build(format!("metadata write failed: {}", e)))?;
        Ok(())
    }

    fn purge_artifacts(prefix: &Path) -> Result<()> {
        for suffix in ["pivots.json", "codes"] {
            let path = artifact(prefix, suffix);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn write_tags(prefix: &Path, labels: &[Label]) -> Result<()> {
        format::write_tags_file(&artifact(prefix, "tags"), labels)
    }
}

/// Batch Vamana construction over full-precision vectors: random
/// initialization, then two refinement passes (alpha = 1.0, then the
/// configured alpha) of greedy search plus alpha pruning.
struct VamanaBuilder<'a> {
    dimension: usize,
    vectors: &'a [f32],
    num_points: usize,
    max_degree: usize,
    search_list_size: usize,
    adj: Vec<SmallVec<[u32; 32]>>,
    start: u32,
}

impl VamanaBuilder<'_> {
    fn vector(&self, id: u32) -> &[f32] {
        let at = id as usize * self.dimension;
        &self.vectors[at..at + self.dimension]
    }

    fn dist(&self, a: u32, b: u32) -> f32 {
        squared_l2(self.vector(a), self.vector(b))
    }

    fn build(&mut self, alpha: f32) {
        self.init_random();
        self.start = self.medoid();
        self.pass(1.0);
        self.pass(alpha);
    }

    fn init_random(&mut self) {
        let mut rng = StdRng::seed_from_u64(self.num_points as u64);
        let degree = self.max_degree.min(self.num_points.saturating_sub(1));
        self.adj = (0..self.num_points as u32)
            .map(|id| {
                let mut neighbors: HashSet<u32> = HashSet::with_capacity(degree);
                while neighbors.len() < degree {
                    let candidate = rng.random_range(0..self.num_points as u32);
                    if candidate != id {
                        neighbors.insert(candidate);
                    }
                }
                neighbors.into_iter().collect()
            })
            .collect();
    }

    /// Point nearest to the corpus centroid.
    fn medoid(&self) -> u32 {
        let mut centroid = vec![0.0f32; self.dimension];
        for id in 0..self.num_points as u32 {
            for (c, &v) in centroid.iter_mut().zip(self.vector(id)) {
                *c += v;
            }
        }
        for c in centroid.iter_mut() {
            *c /= self.num_points as f32;
        }
        (0..self.num_points as u32)
            .min_by(|&a, &b| {
                squared_l2(self.vector(a), &centroid)
                    .total_cmp(&squared_l2(self.vector(b), &centroid))
            })
            .unwrap_or(0)
    }

    fn pass(&mut self, alpha: f32) {
        for id in 0..self.num_points as u32 {
            let visited = self.greedy_search(id);
            self.adj[id as usize] = self.robust_prune(id, &visited, alpha);
        }
    }

    fn greedy_search(&self, target: u32) -> Vec<u32> {
        let l = self.search_list_size;
        let mut visited = HashSet::new();
        let mut retset: Vec<(u32, f32)> = vec![(self.start, self.dist(self.start, target))];
        visited.insert(self.start);

        let mut current = 0;
        while current < retset.len() {
            let (expand, _) = retset[current];
            current += 1;

            for &neighbor in &self.adj[expand as usize] {
                if !visited.insert(neighbor) {
                    continue;
                }
                retset.push((neighbor, self.dist(neighbor, target)));
            }

            retset.sort_by(|a, b| a.1.total_cmp(&b.1));
            if retset.len() > l {
                retset.truncate(l);
                current = current.min(l);
            }
        }

        retset.into_iter().map(|(id, _)| id).collect()
    }

    fn robust_prune(&self, id: u32, candidates: &[u32], alpha: f32) -> SmallVec<[u32; 32]> {
        let mut pool: Vec<(u32, f32)> = candidates
            .iter()
            .chain(self.adj[id as usize].iter())
            .filter(|&&c| c != id)
            .map(|&c| (c, self.dist(id, c)))
            .collect();
        pool.sort_by(|a, b| a.1.total_cmp(&b.1));
        pool.dedup_by_key(|&mut (c, _)| c);

        let mut kept: SmallVec<[u32; 32]> = SmallVec::new();
        for (candidate, dist) in pool {
            if kept.len() >= self.max_degree {
                break;
            }
            let covered = kept
                .iter()
                .any(|&k| alpha * self.dist(k, candidate) <= dist);
            if !covered {
                kept.push(candidate);
            }
        }
        kept
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}
