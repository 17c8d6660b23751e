//! Unified multi-tier cache.
//!
//! One byte budget serves the HNSW, metadata, embedding, and miscellaneous
//! tiers. Eviction is cost-aware: the score of an entry is
//! `access_count / max(rebuild_cost_ms, 1)`, and the cheapest-to-rebuild,
//! least-used entries go first. Eviction is a pure memory operation and
//! never performs I/O.
//!
//! Concurrent loads of the same key coalesce: one loader runs, every waiter
//! shares its result (or its error).

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use mnemo_error::{MnemoError, Result};
use mnemo_types::Cx;

/// Cache tier a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hnsw,
    Metadata,
    Embedding,
    Other,
}

impl Tier {
    /// All tiers, for usage reports.
    pub const ALL: &'static [Self] = &[Self::Hnsw, Self::Metadata, Self::Embedding, Self::Other];
}

/// Cache knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Total byte budget across all tiers.
    pub budget_bytes: usize,
    /// Cadence of the fairness monitor.
    pub fairness_interval: std::time::Duration,
    /// A tier holding more than this fraction of bytes…
    pub fairness_size_ratio: f64,
    /// …while receiving less than this fraction of accesses is starved out.
    pub fairness_access_ratio: f64,
    /// Fraction of the offending tier evicted, lowest score first.
    pub fairness_evict_fraction: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 2 * 1024 * 1024 * 1024,
            fairness_interval: std::time::Duration::from_secs(60),
            fairness_size_ratio: 0.9,
            fairness_access_ratio: 0.1,
            fairness_evict_fraction: 0.2,
        }
    }
}

struct Entry {
    bytes: Arc<Vec<u8>>,
    tier: Tier,
    /// Estimated cost to rebuild this entry, in milliseconds.
    rebuild_cost_ms: u64,
    access_count: u64,
    /// Logical clock of the last access (monotonic counter, not wall time).
    last_access: u64,
}

impl Entry {
    fn score(&self) -> f64 {
        self.access_count as f64 / self.rebuild_cost_ms.max(1) as f64
    }
}

#[derive(Default)]
struct TierStats {
    bytes: usize,
    accesses: u64,
}

struct CacheState {
    entries: HashMap<String, Entry>,
    total_bytes: usize,
    access_clock: u64,
    /// Warm-start hints: seed access counts for keys seen in a prior run.
    warm_hints: HashMap<String, u64>,
    evictions: u64,
}

enum LoadSlot {
    Pending,
    Done(Result<Arc<Vec<u8>>>),
}

struct InFlight {
    slot: Mutex<LoadSlot>,
    ready: Condvar,
}

/// Per-tier usage snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierUsage {
    pub bytes: usize,
    pub entries: usize,
    pub accesses: u64,
}

/// Whole-cache usage snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheUsage {
    pub total_bytes: usize,
    pub budget_bytes: usize,
    pub evictions: u64,
    pub hnsw: TierUsage,
    pub metadata: TierUsage,
    pub embedding: TierUsage,
    pub other: TierUsage,
}

/// Serialized access-pattern snapshot for warm starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PatternSnapshot {
    version: u32,
    keys: Vec<(String, u64)>,
}

/// The unified cache.
pub struct UnifiedCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
    loading: Mutex<HashMap<String, Arc<InFlight>>>,
}

impl UnifiedCache {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                total_bytes: 0,
                access_clock: 0,
                warm_hints: HashMap::new(),
                evictions: 0,
            }),
            loading: Mutex::new(HashMap::new()),
        }
    }

    /// Configured fairness cadence, for the owner's monitor loop.
    #[must_use]
    pub const fn fairness_interval(&self) -> std::time::Duration {
        self.config.fairness_interval
    }

    /// Cached bytes for `key`, bumping access stats on hit.
    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let mut state = self.state.lock();
        state.access_clock += 1;
        let clock = state.access_clock;
        let entry = state.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_access = clock;
        Some(Arc::clone(&entry.bytes))
    }

    /// Insert (or replace) an entry, evicting low-score entries as needed.
    pub fn insert(&self, key: &str, tier: Tier, rebuild_cost_ms: u64, bytes: Vec<u8>) {
        self.insert_shared(key, tier, rebuild_cost_ms, Arc::new(bytes));
    }

    fn insert_shared(&self, key: &str, tier: Tier, rebuild_cost_ms: u64, bytes: Arc<Vec<u8>>) {
        let size = bytes.len();
        let mut state = self.state.lock();
        if let Some(old) = state.entries.remove(key) {
            state.total_bytes -= old.bytes.len();
        }
        if size > self.config.budget_bytes {
            // Larger than the whole budget: never cacheable.
            return;
        }
        Self::make_room(
            &mut state,
            self.config.budget_bytes.saturating_sub(size),
        );
        state.access_clock += 1;
        let seeded = state.warm_hints.remove(key).unwrap_or(0);
        let clock = state.access_clock;
        state.total_bytes += size;
        state.entries.insert(
            key.to_owned(),
            Entry {
                bytes,
                tier,
                rebuild_cost_ms,
                access_count: 1 + seeded,
                last_access: clock,
            },
        );
    }

    /// Drop an entry (mutation invalidation).
    pub fn invalidate(&self, key: &str) {
        let mut state = self.state.lock();
        if let Some(old) = state.entries.remove(key) {
            state.total_bytes -= old.bytes.len();
        }
    }

    /// Drop every entry whose key starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) {
        let mut state = self.state.lock();
        let doomed: Vec<String> = state
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in doomed {
            if let Some(old) = state.entries.remove(&key) {
                state.total_bytes -= old.bytes.len();
            }
        }
    }

    /// Get or load with request coalescing: while a load for `key` is in
    /// flight, concurrent callers wait for it instead of invoking `loader`.
    pub fn get_or_load(
        &self,
        cx: &Cx,
        key: &str,
        tier: Tier,
        rebuild_cost_ms: u64,
        loader: impl FnOnce(&Cx) -> Result<Vec<u8>>,
    ) -> Result<Arc<Vec<u8>>> {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }

        // Register or join the in-flight load.
        let (flight, leader) = {
            let mut loading = self.loading.lock();
            match loading.get(key) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let flight = Arc::new(InFlight {
                        slot: Mutex::new(LoadSlot::Pending),
                        ready: Condvar::new(),
                    });
                    loading.insert(key.to_owned(), Arc::clone(&flight));
                    (flight, true)
                }
            }
        };

        if !leader {
            let mut slot = flight.slot.lock();
            loop {
                match &*slot {
                    LoadSlot::Done(result) => return result.clone(),
                    LoadSlot::Pending => {
                        cx.checkpoint_with("cache load wait")?;
                        flight
                            .ready
                            .wait_for(&mut slot, std::time::Duration::from_millis(50));
                    }
                }
            }
        }

        let result = loader(cx).map(|bytes| {
            let shared = Arc::new(bytes);
            // Callers get the loaded bytes even if the entry is evicted
            // again immediately.
            self.insert_shared(key, tier, rebuild_cost_ms, Arc::clone(&shared));
            shared
        });

        {
            let mut slot = flight.slot.lock();
            *slot = LoadSlot::Done(result.clone());
        }
        flight.ready.notify_all();
        self.loading.lock().remove(key);
        result
    }

    /// One pass of the fairness monitor: a tier holding more than the size
    /// ratio of cached bytes while earning less than the access ratio of
    /// accesses loses its bottom slice by score.
    pub fn fairness_tick(&self) {
        let mut state = self.state.lock();
        if state.entries.is_empty() || state.total_bytes == 0 {
            return;
        }
        let mut stats: HashMap<Tier, TierStats> = HashMap::new();
        let mut total_accesses = 0_u64;
        for entry in state.entries.values() {
            let s = stats.entry(entry.tier).or_default();
            s.bytes += entry.bytes.len();
            s.accesses += entry.access_count;
            total_accesses += entry.access_count;
        }
        if total_accesses == 0 {
            return;
        }
        let total_bytes = state.total_bytes;
        for (&tier, tier_stats) in &stats {
            let size_ratio = tier_stats.bytes as f64 / total_bytes as f64;
            let access_ratio = tier_stats.accesses as f64 / total_accesses as f64;
            if size_ratio > self.config.fairness_size_ratio
                && access_ratio < self.config.fairness_access_ratio
            {
                let mut members: Vec<(String, f64)> = state
                    .entries
                    .iter()
                    .filter(|(_, e)| e.tier == tier)
                    .map(|(k, e)| (k.clone(), e.score()))
                    .collect();
                members.sort_by(|a, b| a.1.total_cmp(&b.1));
                let to_evict =
                    ((members.len() as f64) * self.config.fairness_evict_fraction).ceil() as usize;
                info!(
                    tier = ?tier,
                    size_ratio,
                    access_ratio,
                    evicting = to_evict,
                    "cache fairness intervention"
                );
                for (key, _) in members.into_iter().take(to_evict) {
                    if let Some(old) = state.entries.remove(&key) {
                        state.total_bytes -= old.bytes.len();
                        state.evictions += 1;
                    }
                }
                // One intervention per tick is enough.
                return;
            }
        }
    }

    /// Usage snapshot for stats surfaces.
    #[must_use]
    pub fn usage(&self) -> CacheUsage {
        let state = self.state.lock();
        let mut per: HashMap<Tier, TierUsage> = HashMap::new();
        for entry in state.entries.values() {
            let u = per.entry(entry.tier).or_insert(TierUsage {
                bytes: 0,
                entries: 0,
                accesses: 0,
            });
            u.bytes += entry.bytes.len();
            u.entries += 1;
            u.accesses += entry.access_count;
        }
        let tier = |t: Tier| {
            per.get(&t).copied().unwrap_or(TierUsage {
                bytes: 0,
                entries: 0,
                accesses: 0,
            })
        };
        CacheUsage {
            total_bytes: state.total_bytes,
            budget_bytes: self.config.budget_bytes,
            evictions: state.evictions,
            hnsw: tier(Tier::Hnsw),
            metadata: tier(Tier::Metadata),
            embedding: tier(Tier::Embedding),
            other: tier(Tier::Other),
        }
    }

    /// Serialize access patterns for warm-starting a future process.
    #[must_use]
    pub fn snapshot_patterns(&self) -> Vec<u8> {
        let state = self.state.lock();
        let snapshot = PatternSnapshot {
            version: 1,
            keys: state
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.access_count))
                .collect(),
        };
        serde_json::to_vec(&snapshot).unwrap_or_default()
    }

    /// Seed access counts from a prior run's snapshot; future inserts of
    /// those keys start with the recorded heat.
    pub fn restore_patterns(&self, bytes: &[u8]) -> Result<()> {
        let snapshot: PatternSnapshot =
            serde_json::from_slice(bytes).map_err(|err| MnemoError::Integrity {
                what: "cache pattern snapshot",
                detail: err.to_string(),
            })?;
        let mut state = self.state.lock();
        for (key, count) in snapshot.keys {
            state.warm_hints.insert(key, count);
        }
        Ok(())
    }

    fn make_room(state: &mut CacheState, target_bytes: usize) {
        if state.total_bytes <= target_bytes {
            return;
        }
        let mut scored: Vec<(String, f64)> = state
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.score()))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        for (key, score) in scored {
            if state.total_bytes <= target_bytes {
                break;
            }
            if let Some(old) = state.entries.remove(&key) {
                state.total_bytes -= old.bytes.len();
                state.evictions += 1;
                debug!(key, score, "cache eviction");
            }
        }
    }
}
