//! Embeddable vector-plus-graph knowledge store.
//!
//! Items become unit vectors stored alongside typed metadata and typed
//! relationships; queries combine nearest-neighbor search, metadata
//! predicates, and graph traversal. Everything persists through a
//! content-addressed copy-on-write store over a pluggable byte backend.
//!
//! ```no_run
//! use std::sync::Arc;
//! use mnemo::{AddRequest, Cx, FindQuery, HashingEmbedder, MemoryBackend, NounKind, Storage,
//!     StoreConfig};
//!
//! # fn main() -> mnemo::Result<()> {
//! let config = StoreConfig { dim: 64, ..StoreConfig::default() };
//! let store = Storage::new(
//!     Arc::new(MemoryBackend::new()),
//!     Arc::new(HashingEmbedder::new(64)),
//!     config,
//! )?;
//! let cx = Cx::new();
//! store.init(&cx)?;
//!
//! let mut request = AddRequest::new(NounKind::Person);
//! request.data = Some("Alice Chen, product manager".to_owned());
//! let id = store.add(&cx, request)?;
//!
//! let people = store.find(&cx, FindQuery {
//!     where_clause: Some(serde_json::json!({"type": "Person"})),
//!     ..FindQuery::default()
//! })?;
//! assert_eq!(people[0].id, id);
//! store.close(&cx)?;
//! # Ok(())
//! # }
//! ```

pub use mnemo_backend::{
    BackendProfile, BlobBackend, BlobStat, ConnectionPool, Connector, ListPage, LocalFsBackend,
    MemoryBackend, PoolConfig, PooledConn,
};
pub use mnemo_cache::{CacheConfig, CacheUsage, Tier, UnifiedCache};
pub use mnemo_cow::{
    Change, ChangeOp, CommitId, CommitObject, CommitOutcome, CowConfig, CowStore, Digest,
    TreeEntry, TreeObject,
};
pub use mnemo_error::{MnemoError, Result, RollbackFailure};
pub use mnemo_hnsw::{HnswIndex, HnswParams, SearchHit};
pub use mnemo_index::{
    Direction, FieldOp, GraphIndex, MetadataIndex, NeighborHit, Predicate, RebuildOptions,
    RebuildReport,
};
pub use mnemo_store::{
    AddRequest, ClusterOptions, DuplicateOptions, FindQuery, HashingEmbedder, IndexStats,
    NeighborsOptions, RelateRequest, RelatedFilter, SimilarHit, SimilarQuery, Storage,
    StoreConfig, UpdateRequest,
};
pub use mnemo_txn::{BatchOperation, FnOperation, Operation, Transaction, TxnConfig, TxnState};
pub use mnemo_types::{
    Clock, Cx, Embedder, Metric, Noun, NounKind, RngSource, Shard, StdRandom, SystemClock,
    TimestampMs, Uid, Vector, Verb, VerbKind,
};
