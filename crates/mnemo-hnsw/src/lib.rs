//! Hierarchical navigable small world index.
//!
//! In-memory ANN over unit vectors. Vector bytes are owned by the entity
//! blobs in the COW store; the index holds a working copy per node plus the
//! multi-level proximity graph. Persistence is split into a full binary
//! checkpoint (`hnsw/index`) and an append-only log of pending mutations
//! (`hnsw/log`) folded at the next checkpoint.

pub mod index;
pub mod persist;

pub use index::{HnswIndex, HnswParams, SearchHit};
pub use persist::{LogRecord, Topology, decode_checkpoint, decode_log, encode_log_records};
