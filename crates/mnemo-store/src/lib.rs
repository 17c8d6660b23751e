//! Storage facade over the COW store and the three indexes.
//!
//! [`Storage`] is the public surface: `init`, `add`, `relate`, `get`,
//! `find`, `similar`, `update`, `delete`, `neighbors`, plus maintenance
//! entry points (`flush`, `compact`, `index_stats`, `close`). Writers take
//! a per-entity logical lock and run their mutations through the
//! transaction manager; readers observe the committed head through the
//! unified cache.

pub mod config;
pub mod counts;
pub mod embed;
pub mod locks;
pub mod paths;
pub mod query;
pub mod store;
pub mod write;

pub use config::StoreConfig;
pub use counts::CountsLedger;
pub use embed::HashingEmbedder;
pub use query::{
    ClusterOptions, DuplicateOptions, FindQuery, IndexStats, NeighborsOptions, RelatedFilter,
    SimilarHit, SimilarQuery,
};
pub use store::Storage;
pub use write::{AddRequest, RelateRequest, UpdateRequest};
