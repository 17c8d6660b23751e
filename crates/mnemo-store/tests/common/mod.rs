//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::time::Duration;

use mnemo_backend::{BackendProfile, BlobBackend, BlobStat, ListPage, MemoryBackend};
use mnemo_cache::CacheConfig;
use mnemo_error::{MnemoError, Result};
use mnemo_hnsw::index::HnswParams;
use mnemo_store::{HashingEmbedder, Storage, StoreConfig};
use mnemo_txn::TxnConfig;
use mnemo_types::{Cx, Metric, RngSource, StdRandom, SystemClock};

pub const DIM: usize = 32;

pub fn test_config() -> StoreConfig {
    StoreConfig {
        dim: DIM,
        allow_regex: true,
        // Kept long so fault-injection tests control commit ordering;
        // the periodic flusher has its own dedicated test.
        counts_flush_interval: Duration::from_secs(3600),
        hnsw: HnswParams {
            m: 8,
            m0: 16,
            ef_construction: 64,
            ef_search: 48,
            metric: Metric::Cosine,
        },
        cache: CacheConfig {
            budget_bytes: 32 * 1024 * 1024,
            ..CacheConfig::default()
        },
        txn: TxnConfig {
            rollback_backoff: Duration::from_millis(1),
            ..TxnConfig::default()
        },
        ..StoreConfig::default()
    }
}

/// Open an initialized store over the given backend.
pub fn open_store(backend: Arc<dyn BlobBackend>, seed: u64) -> Arc<Storage> {
    let store = Storage::with_collaborators(
        backend,
        Arc::new(HashingEmbedder::new(DIM)),
        Arc::new(SystemClock),
        Arc::new(StdRandom::seeded(seed)),
        test_config(),
    )
    .expect("store construction");
    store.init(&Cx::new()).expect("init");
    store
}

/// Open an initialized store over a fresh in-memory backend.
pub fn fresh_store(seed: u64) -> Arc<Storage> {
    open_store(Arc::new(MemoryBackend::new()), seed)
}

/// A deterministic point on the unit sphere.
pub fn unit_vector(seed: u64) -> Vec<f32> {
    let rng = StdRandom::seeded(seed);
    let values: Vec<f32> = (0..DIM)
        .map(|_| {
            let raw = rng.next_u64();
            (raw as f64 / u64::MAX as f64).mul_add(2.0, -1.0) as f32
        })
        .collect();
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    values.into_iter().map(|v| v / norm).collect()
}

/// Backend wrapper that fails the n-th put of `refs/head` exactly once.
///
/// Each COW commit finishes by advancing the head ref, so "fail the n-th
/// head advance" is "fail the n-th commit": an injection point for
/// atomicity tests at any depth of a multi-operation transaction.
pub struct FailingBackend {
    inner: MemoryBackend,
    ref_puts: AtomicU64,
    /// 1-based index of the head put to fail; 0 disables injection.
    fail_nth: AtomicI32,
}

impl FailingBackend {
    pub fn new() -> Self {
        Self {
            inner: MemoryBackend::new(),
            ref_puts: AtomicU64::new(0),
            fail_nth: AtomicI32::new(0),
        }
    }

    /// Arm the injection: the n-th subsequent head advance fails once.
    pub fn fail_nth_commit(&self, n: i32) {
        self.ref_puts.store(0, Ordering::SeqCst);
        self.fail_nth.store(n, Ordering::SeqCst);
    }
}

impl BlobBackend for FailingBackend {
    fn profile(&self) -> BackendProfile {
        self.inner.profile()
    }

    fn get(&self, cx: &Cx, key: &str) -> Result<Vec<u8>> {
        self.inner.get(cx, key)
    }

    fn put(&self, cx: &Cx, key: &str, bytes: &[u8]) -> Result<()> {
        if key == "refs/head" {
            let nth = self.fail_nth.load(Ordering::SeqCst);
            if nth > 0 {
                let seen = self.ref_puts.fetch_add(1, Ordering::SeqCst) + 1;
                if seen == nth as u64 {
                    self.fail_nth.store(0, Ordering::SeqCst);
                    return Err(MnemoError::backend("injected commit failure"));
                }
            }
        }
        self.inner.put(cx, key, bytes)
    }

    fn delete(&self, cx: &Cx, key: &str) -> Result<()> {
        self.inner.delete(cx, key)
    }

    fn exists(&self, cx: &Cx, key: &str) -> Result<bool> {
        self.inner.exists(cx, key)
    }

    fn stat(&self, cx: &Cx, key: &str) -> Result<BlobStat> {
        self.inner.stat(cx, key)
    }

    fn list(&self, cx: &Cx, prefix: &str, limit: usize, cursor: Option<&str>) -> Result<ListPage> {
        self.inner.list(cx, prefix, limit, cursor)
    }
}
