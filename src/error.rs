//! Error types for estuary.

use thiserror::Error;

/// Errors that can occur while building, mutating, or querying the index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Invalid construction parameters (zero dimension, no capacity source).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Disk index absent or unreadable. Recovered at construction: the
    /// index operates memory-only until a merge creates the disk artifacts.
    #[error("disk index load failed: {0}")]
    Load(String),

    /// A memory delta cannot be appended to a base file of another dimension.
    #[error("dimension mismatch: base file has {base_dim}, delta has {delta_dim}")]
    DimensionMismatch { base_dim: usize, delta_dim: usize },

    /// I/O error on the base data file, labels sidecar, or temp files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Disk index rebuild failed; the index stays memory-only.
    #[error("disk index build failed: {0}")]
    Build(String),

    /// The memory index rejected a point. Logged by the coordinator, never
    /// surfaced through the public insert.
    #[error("memory index rejected point: {0}")]
    Insertion(String),

    /// Malformed on-disk artifact (bad magic, header, or record).
    #[error("format error: {0}")]
    Format(String),
}

/// Result type alias for estuary operations.
pub type Result<T> = std::result::Result<T, IndexError>;
