//! estuary: a hybrid mutable approximate-nearest-neighbor index.
//!
//! # The Problem
//!
//! Graph ANN indices answer queries fast but hate churn: an in-memory graph
//! over millions of vectors blows the RAM budget, while a disk-resident
//! index cannot absorb inserts and deletes point by point. Workloads that
//! need both a large base corpus and low-latency visibility of updates fit
//! neither alone.
//!
//! # Architecture
//!
//! ```text
//! inserts / removes
//!        │
//!        ▼
//! ┌───────────────┐   at capacity    ┌──────────────────────┐
//! │  memory index │ ───────────────▶ │ merge: append delta, │
//! │ (fresh Vamana)│                  │ rebuild disk index   │
//! └──────┬────────┘                  └──────────┬───────────┘
//!        │          ┌───────────────────────────┘
//!        ▼          ▼
//! ┌─────────────────────────┐
//! │ disk index (PQ Vamana)  │ ◀── bulk of the corpus
//! └─────────────────────────┘
//! ```
//!
//! Queries fan out to both substrates; a tombstone registry filters deleted
//! labels from each side, and results merge by label, nearest copy winning.
//! Deletes are logical until a merge rebuilds the disk index.
//!
//! The coordinator lives in [`hybrid`]; the substrates sit behind the
//! [`mem::MemIndex`] and [`disk::DiskIndex`] seams with shipped defaults
//! ([`mem::FreshVamana`], [`disk::PqDiskIndex`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use estuary::{HybridConfig, DefaultHybridIndex};
//!
//! let config = HybridConfig { dimension: 128, mem_threshold: 10_000, ..Default::default() };
//! let index = DefaultHybridIndex::<f32>::open(config, "corpus.data".as_ref(), "idx".as_ref())?;
//!
//! index.insert(&embedding, 42)?;
//! let hits = index.search(&query, 10, 50)?;
//! index.remove(42)?;
//! ```
//!
//! # What this is not
//!
//! The memory delta is not crash-durable (points since the last merge die
//! with the process), there is no replication, writers serialize, and
//! results are approximate.

pub mod config;
pub mod disk;
pub mod error;
pub mod format;
pub mod hybrid;
pub mod mem;

pub use config::{BuildParams, HybridConfig, WriteParams};
pub use error::{IndexError, Result};
pub use hybrid::{DefaultHybridIndex, HybridIndex, HybridStats};

/// External point identifier, chosen by the caller and stable for the
/// index lifetime. The only identifier exposed publicly.
pub type Label = u32;

/// One search result: an external label and its squared-L2 distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub label: Label,
    pub distance: f32,
}
