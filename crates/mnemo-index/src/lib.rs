//! In-memory indexes over the COW store: metadata postings and graph
//! adjacency, plus the predicate language and the shared rebuild contract.
//!
//! Indexes are rebuildable projections; the COW store remains the single
//! source of truth. Their persisted shard files exist so a warm process can
//! skip the full scan, and are kept in step with every mutation.

pub mod graph;
pub mod metadata;
pub mod predicate;
pub mod rebuild;

pub use graph::{Direction, GraphIndex, NeighborHit};
pub use metadata::MetadataIndex;
pub use predicate::{FieldOp, Predicate};
pub use rebuild::{RebuildOptions, RebuildReport, ScanSource, drive_rebuild, should_preload};
