//! Facade configuration.

use std::time::Duration;

use mnemo_cache::CacheConfig;
use mnemo_cow::CowConfig;
use mnemo_hnsw::index::HnswParams;
use mnemo_txn::TxnConfig;

/// Knobs for one [`crate::Storage`] instance.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Vector dimensionality; must match the injected embedder.
    pub dim: usize,
    /// Provenance tag written into every entity.
    pub service: String,
    /// Gate for the `regex` predicate operator.
    pub allow_regex: bool,
    /// Cadence of the counts flusher.
    pub counts_flush_interval: Duration,
    /// Page size for rebuild scans.
    pub rebuild_batch_size: usize,
    pub hnsw: HnswParams,
    pub cache: CacheConfig,
    pub cow: CowConfig,
    pub txn: TxnConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dim: 384,
            service: "mnemo".to_owned(),
            allow_regex: false,
            counts_flush_interval: Duration::from_millis(200),
            rebuild_batch_size: 1000,
            hnsw: HnswParams::default(),
            cache: CacheConfig::default(),
            cow: CowConfig::default(),
            txn: TxnConfig::default(),
        }
    }
}
