//! Fixed-record graph file for the on-disk index.
//!
//! Layout:
//! - Header (64 bytes): magic (8) + num nodes (8) + max degree (8) +
//!   start node (8) + padding (32).
//! - One record per node: degree (4) + `max_degree × 4` neighbor slots,
//!   zero-padded past the actual degree.

use crate::error::{IndexError, Result};
use smallvec::SmallVec;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

// "ESTG" + format version 1
const GRAPH_MAGIC: &[u8; 8] = b"ESTG\x00\x00\x00\x01";

/// Streaming writer for the graph file.
pub struct GraphFileWriter {
    writer: BufWriter<File>,
    num_nodes: usize,
    max_degree: usize,
    written: usize,
}

impl GraphFileWriter {
    pub fn create(path: &Path, num_nodes: usize, max_degree: usize, start_node: u32) -> Result<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(GRAPH_MAGIC)?;
        writer.write_all(&(num_nodes as u64).to_le_bytes())?;
        writer.write_all(&(max_degree as u64).to_le_bytes())?;
        writer.write_all(&(start_node as u64).to_le_bytes())?;
        writer.write_all(&[0u8; 32])?;

        Ok(Self {
            writer,
            num_nodes,
            max_degree,
            written: 0,
        })
    }

    /// Append one node's adjacency list, padded to the fixed record size.
    pub fn write_adjacency(&mut self, neighbors: &[u32]) -> Result<()> {
        if neighbors.len() > self.max_degree {
            return Err(IndexError::Format(format!(
                "node degree {} exceeds max degree {}",
                neighbors.len(),
                self.max_degree
            )));
        }

        self.writer
            .write_all(&(neighbors.len() as u32).to_le_bytes())?;
        for &neighbor in neighbors {
            self.writer.write_all(&neighbor.to_le_bytes())?;
        }
        let padding = vec![0u8; (self.max_degree - neighbors.len()) * 4];
        self.writer.write_all(&padding)?;

        self.written += 1;
        Ok(())
    }

    /// Flush and verify every declared record was written.
    pub fn finish(mut self) -> Result<()> {
        if self.written != self.num_nodes {
            return Err(IndexError::Format(format!(
                "graph file declared {} nodes but {} records were written",
                self.num_nodes, self.written
            )));
        }
        self.writer.flush()?;
        Ok(())
    }
}

/// A graph file loaded into memory.
///
/// Adjacency lists are preloaded at open so traversal takes `&self`;
/// record-level positioned reads are the upgrade path for corpora whose
/// graph outgrows RAM.
#[derive(Debug)]
pub struct GraphFile {
    pub num_nodes: usize,
    pub max_degree: usize,
    pub start_node: u32,
    adj: Vec<SmallVec<[u32; 32]>>,
}

impl GraphFile {
    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 8];
        reader
            .read_exact(&mut magic)
            .map_err(|_| IndexError::Format(format!("{}: truncated header", path.display())))?;
        if &magic != GRAPH_MAGIC {
            return Err(IndexError::Format(format!(
                "{}: bad graph file magic",
                path.display()
            )));
        }

        let mut u64_buf = [0u8; 8];
        reader.read_exact(&mut u64_buf)?;
        let num_nodes = u64::from_le_bytes(u64_buf) as usize;
        reader.read_exact(&mut u64_buf)?;
        let max_degree = u64::from_le_bytes(u64_buf) as usize;
        reader.read_exact(&mut u64_buf)?;
        let start_node = u64::from_le_bytes(u64_buf) as u32;
        let mut padding = [0u8; 32];
        reader.read_exact(&mut padding)?;

        let mut adj = Vec::with_capacity(num_nodes);
        let mut record = vec![0u8; 4 + max_degree * 4];
        for node in 0..num_nodes {
            reader.read_exact(&mut record).map_err(|_| {
                IndexError::Format(format!("{}: truncated record {}", path.display(), node))
            })?;
            let degree =
                u32::from_le_bytes([record[0], record[1], record[2], record[3]]) as usize;
            if degree > max_degree {
                return Err(IndexError::Format(format!(
                    "{}: record {} has degree {} > max {}",
                    path.display(),
                    node,
                    degree,
                    max_degree
                )));
            }
            let neighbors: SmallVec<[u32; 32]> = record[4..4 + degree * 4]
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            adj.push(neighbors);
        }

        Ok(Self {
            num_nodes,
            max_degree,
            start_node,
            adj,
        })
    }

    pub fn neighbors(&self, node: u32) -> &[u32] {
        &self.adj[node as usize]
    }
}
