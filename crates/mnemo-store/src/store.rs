//! The storage facade: construction, `init`, background loops, shutdown.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{info, warn};

use mnemo_backend::BlobBackend;
use mnemo_cache::{Tier, UnifiedCache};
use mnemo_cow::{Change, CowStore};
use mnemo_error::{MnemoError, Result};
use mnemo_hnsw::index::HnswIndex;
use mnemo_hnsw::persist::{LogRecord, decode_checkpoint, decode_log, encode_checkpoint};
use mnemo_index::graph::GraphIndex;
use mnemo_index::metadata::MetadataIndex;
use mnemo_index::rebuild::{RebuildOptions, ScanSource, drive_rebuild, should_preload};
use mnemo_txn::{FnOperation, Transaction};
use mnemo_types::value::flatten_metadata;
use mnemo_types::{
    Clock, Cx, Embedder, IndexValue, Noun, NounKind, RngSource, StdRandom, SystemClock, Uid, Vector,
    Verb, VerbKind,
};

use crate::config::StoreConfig;
use crate::counts::CountsLedger;
use crate::locks::EntityLocks;
use crate::paths;

pub(crate) struct LoopSignal {
    pub(crate) stop: Mutex<bool>,
    pub(crate) wake: Condvar,
}

/// The storage facade.
pub struct Storage {
    pub(crate) config: StoreConfig,
    pub(crate) cow: Arc<CowStore>,
    pub(crate) cache: Arc<UnifiedCache>,
    pub(crate) embedder: Arc<dyn Embedder>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) rng: Arc<dyn RngSource>,
    pub(crate) hnsw: Arc<RwLock<HnswIndex>>,
    pub(crate) meta: Arc<RwLock<MetadataIndex>>,
    pub(crate) graph: Arc<RwLock<GraphIndex>>,
    pub(crate) counts: Arc<Mutex<CountsLedger>>,
    pub(crate) locks: EntityLocks,
    ready: AtomicBool,
    init_lock: Mutex<()>,
    loop_signal: Arc<LoopSignal>,
    loop_handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Storage {
    /// Build a facade with system clock and entropy-seeded randomness.
    pub fn new(
        backend: Arc<dyn BlobBackend>,
        embedder: Arc<dyn Embedder>,
        config: StoreConfig,
    ) -> Result<Arc<Self>> {
        Self::with_collaborators(
            backend,
            embedder,
            Arc::new(SystemClock),
            Arc::new(StdRandom::from_entropy()),
            config,
        )
    }

    /// Build a facade with injected clock and randomness (tests).
    pub fn with_collaborators(
        backend: Arc<dyn BlobBackend>,
        embedder: Arc<dyn Embedder>,
        clock: Arc<dyn Clock>,
        rng: Arc<dyn RngSource>,
        config: StoreConfig,
    ) -> Result<Arc<Self>> {
        if embedder.dim() != config.dim {
            return Err(MnemoError::invalid(
                "embedder dimension",
                format!("embedder={} config={}", embedder.dim(), config.dim),
            ));
        }
        let cow = CowStore::open(backend, Arc::clone(&clock), config.cow.clone());
        let cache = Arc::new(UnifiedCache::new(config.cache.clone()));
        let hnsw = HnswIndex::new(config.hnsw, config.dim);
        Ok(Arc::new(Self {
            cow,
            cache,
            embedder,
            clock,
            rng,
            hnsw: Arc::new(RwLock::new(hnsw)),
            meta: Arc::new(RwLock::new(MetadataIndex::new())),
            graph: Arc::new(RwLock::new(GraphIndex::new())),
            counts: Arc::new(Mutex::new(CountsLedger::new())),
            locks: EntityLocks::new(),
            ready: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            loop_signal: Arc::new(LoopSignal {
                stop: Mutex::new(false),
                wake: Condvar::new(),
            }),
            loop_handles: Mutex::new(Vec::new()),
            config,
        }))
    }

    /// Whether `init` has completed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(MnemoError::internal("storage not initialized; call init()"))
        }
    }

    // -----------------------------------------------------------------------
    // init
    // -----------------------------------------------------------------------

    /// Open the backend, rebuild every index, validate counts against a
    /// scan (self-repairing on mismatch), and start the background loops.
    /// Idempotent.
    pub fn init(self: &Arc<Self>, cx: &Cx) -> Result<()> {
        let _guard = self.init_lock.lock();
        if self.is_ready() {
            return Ok(());
        }

        // Counts: a corrupt blob loads with defaults and fails validation
        // below; an unreadable one starts fresh and is likewise rebuilt.
        let ledger = match self.cow.lookup(cx, paths::COUNTS) {
            Ok(bytes) => match CountsLedger::from_bytes(&bytes) {
                Ok(ledger) => ledger,
                Err(err) => {
                    warn!(error = %err, "counts blob unreadable, will rebuild");
                    let mut fresh = CountsLedger::new();
                    fresh.mark_suspect();
                    fresh
                }
            },
            Err(MnemoError::NotFound { .. }) => CountsLedger::new(),
            Err(err) => return Err(err),
        };
        *self.counts.lock() = ledger;

        // Warm-start hints for the cache, best effort.
        if let Ok(bytes) = self.cow.lookup(cx, paths::CACHE_PATTERNS) {
            if let Err(err) = self.cache.restore_patterns(&bytes) {
                warn!(error = %err, "ignoring stale cache pattern snapshot");
            }
        }

        // The three indexes rebuild in parallel; each honors the shared
        // rebuild contract internally.
        let (meta_result, graph_result, hnsw_result) = std::thread::scope(|scope| {
            let meta = scope.spawn(|| self.rebuild_metadata(cx, false));
            let graph = scope.spawn(|| self.rebuild_graph(cx, false));
            let hnsw = scope.spawn(|| self.rebuild_hnsw(cx, false));
            (
                meta.join()
                    .unwrap_or_else(|_| Err(MnemoError::internal("metadata rebuild panicked"))),
                graph
                    .join()
                    .unwrap_or_else(|_| Err(MnemoError::internal("graph rebuild panicked"))),
                hnsw.join()
                    .unwrap_or_else(|_| Err(MnemoError::internal("hnsw rebuild panicked"))),
            )
        });
        meta_result?;
        graph_result?;
        hnsw_result?;

        // Counts validation: index-derived tallies are cheap and faithful
        // to storage; on any disagreement the ledger is rebuilt from the
        // authoritative full scan.
        let scanned_nouns = self.nouns_by_kind_from_index();
        let scanned_verbs = self.verbs_by_kind_from_index();
        let trustworthy = {
            let counts = self.counts.lock();
            !counts.needs_rebuild() && counts.matches(&scanned_nouns, &scanned_verbs)
        };
        if !trustworthy {
            warn!("counts ledger disagrees with storage, rebuilding");
            self.rebuild_counts(cx)?;
            self.persist_counts(cx)?;
        }

        self.spawn_loops();
        self.ready.store(true, Ordering::SeqCst);
        info!(
            entities = self.counts.lock().total_nouns(),
            relationships = self.counts.lock().total_verbs(),
            "storage ready"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Rebuilds
    // -----------------------------------------------------------------------

    fn rebuild_options(&self) -> RebuildOptions {
        RebuildOptions {
            batch_size: self.config.rebuild_batch_size,
            force: false,
            on_progress: None,
        }
    }

    /// Metadata index: warm projection when present and complete, entity
    /// scan otherwise (or when forced).
    pub(crate) fn rebuild_metadata(&self, cx: &Cx, force: bool) -> Result<()> {
        let noun_count = self.noun_path_list(cx)?.len();
        let mut index = MetadataIndex::new();
        let warm = if force {
            0
        } else {
            index.load_projection(cx, &self.cow)?
        };
        if warm == 0 || index.len() != noun_count {
            if warm != 0 {
                warn!(
                    projected = index.len(),
                    stored = noun_count,
                    "metadata projection incomplete, falling back to scan"
                );
            }
            index.clear();
            let source = self.noun_source(cx)?;
            drive_rebuild(cx, &source, &self.rebuild_options(), |batch| {
                for noun in batch {
                    index.insert(noun.id, &noun_index_entries(&noun));
                }
                Ok(())
            })?;
        }
        // Loading is not a mutation; nothing needs re-persisting.
        let _ = index.take_dirty_changes()?;
        *self.meta.write() = index;
        Ok(())
    }

    /// Graph index: warm projection when present and complete, verb scan
    /// otherwise.
    pub(crate) fn rebuild_graph(&self, cx: &Cx, force: bool) -> Result<()> {
        let verb_count = self.verb_path_list(cx)?.len();
        let mut index = GraphIndex::new();
        let warm = if force {
            0
        } else {
            index.load_projection(cx, &self.cow)?
        };
        if warm == 0 || index.verb_count() != verb_count {
            if warm != 0 {
                warn!(
                    projected = index.verb_count(),
                    stored = verb_count,
                    "graph projection incomplete, falling back to scan"
                );
            }
            index.clear();
            let source = self.verb_source(cx)?;
            drive_rebuild(cx, &source, &self.rebuild_options(), |batch| {
                for verb in batch {
                    index.insert(&verb);
                }
                Ok(())
            })?;
        }
        let _ = index.take_dirty_changes()?;
        *self.graph.write() = index;
        Ok(())
    }

    /// HNSW: checkpoint + log replay when present, full scan otherwise.
    pub(crate) fn rebuild_hnsw(&self, cx: &Cx, force: bool) -> Result<()> {
        let noun_paths = self.noun_path_list(cx)?;
        let estimated = noun_paths.len() * self.config.dim * 4;
        let preload = should_preload(estimated, self.config.cache.budget_bytes);

        let checkpoint = if force {
            None
        } else {
            match self.cow.lookup(cx, paths::HNSW_INDEX) {
                Ok(bytes) => Some(bytes),
                Err(MnemoError::NotFound { .. }) => None,
                Err(err) => return Err(err),
            }
        };

        let index = match checkpoint {
            Some(bytes) => {
                let topology = decode_checkpoint(&bytes)?;
                let mut index = HnswIndex::from_topology(self.config.hnsw, topology, |id| {
                    match self.read_vector(cx, id, preload) {
                        Ok(vector) => Ok(Some(vector)),
                        // Deleted after the checkpoint; the log replay
                        // confirms the tombstone.
                        Err(MnemoError::NotFound { .. }) => Ok(None),
                        Err(err) => Err(err),
                    }
                })?;
                self.replay_hnsw_log(cx, &mut index, preload)?;
                index
            }
            None => {
                let mut index = HnswIndex::new(self.config.hnsw, self.config.dim);
                let source = self.noun_source(cx)?;
                drive_rebuild(cx, &source, &self.rebuild_options(), |batch| {
                    for noun in batch {
                        if noun.vector_ref.is_some() {
                            let vector = self.read_vector(cx, noun.id, preload)?;
                            index.insert(cx, noun.id, vector, self.rng.as_ref())?;
                        }
                    }
                    Ok(())
                })?;
                index
            }
        };
        // A rebuild restores state the store already has; the log restarts
        // empty.
        let mut index = index;
        let _ = index.take_log();
        *self.hnsw.write() = index;
        Ok(())
    }

    fn replay_hnsw_log(&self, cx: &Cx, index: &mut HnswIndex, preload: bool) -> Result<()> {
        let bytes = match self.cow.lookup(cx, paths::HNSW_LOG) {
            Ok(bytes) => bytes,
            Err(MnemoError::NotFound { .. }) => return Ok(()),
            Err(err) => return Err(err),
        };
        for record in decode_log(&bytes)? {
            match record {
                LogRecord::Insert { id, level } => {
                    if !index.contains(id) {
                        let vector = self.read_vector(cx, id, preload)?;
                        index.insert_at_level(cx, id, vector, level)?;
                    }
                }
                LogRecord::Delete { id } => {
                    let _ = index.remove(id);
                }
            }
        }
        Ok(())
    }

    /// Full-scan counts rebuild (the authoritative repair path).
    pub(crate) fn rebuild_counts(&self, cx: &Cx) -> Result<()> {
        let mut nouns: BTreeMap<NounKind, u64> = BTreeMap::new();
        let noun_source = self.noun_source(cx)?;
        drive_rebuild(cx, &noun_source, &self.rebuild_options(), |batch| {
            for noun in batch {
                *nouns.entry(noun.kind).or_insert(0) += 1;
            }
            Ok(())
        })?;
        let mut verbs: BTreeMap<VerbKind, u64> = BTreeMap::new();
        let verb_source = self.verb_source(cx)?;
        drive_rebuild(cx, &verb_source, &self.rebuild_options(), |batch| {
            for verb in batch {
                *verbs.entry(verb.kind).or_insert(0) += 1;
            }
            Ok(())
        })?;
        self.counts.lock().replace(nouns, verbs);
        Ok(())
    }

    fn nouns_by_kind_from_index(&self) -> BTreeMap<NounKind, u64> {
        let meta = self.meta.read();
        let mut out = BTreeMap::new();
        for kind in NounKind::ALL {
            let set = meta
                .eval(&mnemo_index::predicate::Predicate::Field {
                    path: "type".to_owned(),
                    op: mnemo_index::predicate::FieldOp::Equals(IndexValue::Str(
                        kind.as_str().to_owned(),
                    )),
                })
                .unwrap_or_default();
            if !set.is_empty() {
                out.insert(*kind, set.len() as u64);
            }
        }
        out
    }

    fn verbs_by_kind_from_index(&self) -> BTreeMap<VerbKind, u64> {
        let graph = self.graph.read();
        let mut out: BTreeMap<VerbKind, u64> = BTreeMap::new();
        for kind in graph.verb_kinds() {
            *out.entry(kind).or_insert(0) += 1;
        }
        out
    }

    // -----------------------------------------------------------------------
    // Scan sources
    // -----------------------------------------------------------------------

    pub(crate) fn noun_path_list(&self, cx: &Cx) -> Result<Vec<String>> {
        let mut all = self
            .cow
            .scan_paths(cx, "entities/nouns/", 0, usize::MAX)?;
        all.retain(|p| paths::is_noun_record(p));
        Ok(all)
    }

    pub(crate) fn verb_path_list(&self, cx: &Cx) -> Result<Vec<String>> {
        self.cow.scan_paths(cx, "entities/verbs/", 0, usize::MAX)
    }

    pub(crate) fn noun_source(&self, cx: &Cx) -> Result<RecordSource<'_, Noun>> {
        Ok(RecordSource {
            store: self,
            paths: self.noun_path_list(cx)?,
            what: "entity",
            _marker: std::marker::PhantomData,
        })
    }

    pub(crate) fn verb_source(&self, cx: &Cx) -> Result<RecordSource<'_, Verb>> {
        Ok(RecordSource {
            store: self,
            paths: self.verb_path_list(cx)?,
            what: "relationship",
            _marker: std::marker::PhantomData,
        })
    }

    // -----------------------------------------------------------------------
    // Record reads
    // -----------------------------------------------------------------------

    /// Read an entity through the unified cache.
    pub(crate) fn read_noun(&self, cx: &Cx, id: Uid) -> Result<Option<Noun>> {
        let path = paths::noun(id);
        match self
            .cache
            .get_or_load(cx, &path, Tier::Metadata, 5, |cx| self.cow.lookup(cx, &path))
        {
            Ok(bytes) => {
                let noun: Noun =
                    serde_json::from_slice(&bytes).map_err(|err| MnemoError::Integrity {
                        what: "entity",
                        detail: format!("{path}: {err}"),
                    })?;
                Ok(Some(noun))
            }
            Err(MnemoError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn read_noun_required(&self, cx: &Cx, id: Uid) -> Result<Noun> {
        self.read_noun(cx, id)?
            .ok_or_else(|| MnemoError::not_found("entity", id.to_hex()))
    }

    /// Read a vector blob, optionally through the cache's hnsw tier.
    pub(crate) fn read_vector(&self, cx: &Cx, id: Uid, use_cache: bool) -> Result<Vector> {
        let path = paths::noun_vector(id);
        let bytes = if use_cache {
            self.cache
                .get_or_load(cx, &path, Tier::Hnsw, 20, |cx| self.cow.lookup(cx, &path))?
                .as_ref()
                .clone()
        } else {
            self.cow.lookup(cx, &path)?
        };
        Vector::from_le_bytes(&bytes, self.config.dim)
    }

    /// Embed text through the cache's embedding tier, so repeated adds of
    /// identical text (retries, dedup flows) skip the model call.
    pub(crate) fn embed_cached(&self, cx: &Cx, text: &str) -> Result<Vector> {
        let key = format!(
            "embed/{}/{:016x}",
            self.embedder.model_version(),
            xxhash_rust::xxh3::xxh3_64(text.as_bytes())
        );
        let bytes = self.cache.get_or_load(cx, &key, Tier::Embedding, 50, |cx| {
            Ok(self.embedder.embed(cx, text)?.to_le_bytes())
        })?;
        Vector::from_le_bytes(&bytes, self.config.dim)
    }

    pub(crate) fn read_verb(&self, cx: &Cx, id: Uid) -> Result<Option<Verb>> {
        let path = paths::verb(id);
        match self.cow.lookup(cx, &path) {
            Ok(bytes) => {
                let verb: Verb =
                    serde_json::from_slice(&bytes).map_err(|err| MnemoError::Integrity {
                        what: "relationship",
                        detail: format!("{path}: {err}"),
                    })?;
                Ok(Some(verb))
            }
            Err(MnemoError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Run a transaction; a partial rollback marks the counts ledger
    /// suspect so the next `init` rebuilds it.
    pub(crate) fn run_txn(&self, cx: &Cx, ops: Vec<FnOperation>) -> Result<()> {
        let mut txn = Transaction::new(self.config.txn.clone());
        for op in ops {
            txn.push(op)?;
        }
        match txn.run(cx) {
            Err(err @ MnemoError::TransactionRollback { .. }) => {
                self.counts.lock().mark_suspect();
                Err(err)
            }
            other => other,
        }
    }

    /// Collect dirty index projections and pending HNSW log records into
    /// one change list.
    pub(crate) fn index_changes(&self, cx: &Cx) -> Result<Vec<Change>> {
        crate::write::collect_index_changes(cx, &self.cow, &self.meta, &self.graph, &self.hnsw)
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Persist the counts ledger when dirty. Idempotent.
    pub(crate) fn persist_counts(&self, cx: &Cx) -> Result<()> {
        let bytes = {
            let mut counts = self.counts.lock();
            if !counts.is_dirty() {
                return Ok(());
            }
            let bytes = counts.to_bytes()?;
            counts.persisted();
            bytes
        };
        if let Err(err) = self.cow.commit(cx, vec![Change::put(paths::COUNTS, bytes)]) {
            self.counts.lock().touch();
            return Err(err);
        }
        Ok(())
    }

    /// Force every pending projection, log record, counter, and buffered
    /// write to storage.
    pub fn flush(&self, cx: &Cx) -> Result<()> {
        let changes = self.index_changes(cx)?;
        self.cow.commit(cx, changes)?;
        self.persist_counts(cx)?;
        self.cow.flush(cx)?;
        Ok(())
    }

    /// Rebuild HNSW neighborhoods, drop tombstones, rewrite the checkpoint
    /// and truncate the log.
    pub fn compact(&self, cx: &Cx) -> Result<usize> {
        self.ensure_ready()?;
        let dropped = {
            let mut hnsw = self.hnsw.write();
            let dropped = hnsw.compact(cx)?;
            drop(hnsw);
            dropped
        };
        self.write_checkpoint(cx)?;
        info!(dropped, "compaction complete");
        Ok(dropped)
    }

    /// Serialize the HNSW topology and truncate the log in one commit.
    pub(crate) fn write_checkpoint(&self, cx: &Cx) -> Result<()> {
        let encoded = {
            let mut hnsw = self.hnsw.write();
            let _ = hnsw.take_log();
            encode_checkpoint(&hnsw)
        };
        self.cow.commit(
            cx,
            vec![
                Change::put(paths::HNSW_INDEX, encoded),
                Change::delete(paths::HNSW_LOG),
            ],
        )?;
        Ok(())
    }

    /// Stop loops, flush all pending state, checkpoint, and release the
    /// backend. The facade refuses further work afterwards.
    pub fn close(&self, cx: &Cx) -> Result<()> {
        if !self.is_ready() {
            return Ok(());
        }
        self.ready.store(false, Ordering::SeqCst);

        // Loops first so nothing races the final flush.
        {
            let mut stop = self.loop_signal.stop.lock();
            *stop = true;
        }
        self.loop_signal.wake.notify_all();
        for handle in self.loop_handles.lock().drain(..) {
            let _ = handle.join();
        }

        self.flush(cx)?;
        self.write_checkpoint(cx)?;
        let patterns = self.cache.snapshot_patterns();
        self.cow
            .commit(cx, vec![Change::put(paths::CACHE_PATTERNS, patterns)])?;
        self.cow.shutdown(cx);
        info!("storage closed");
        Ok(())
    }

    fn spawn_loops(self: &Arc<Self>) {
        let mut handles = self.loop_handles.lock();

        let store = Arc::clone(self);
        let signal = Arc::clone(&self.loop_signal);
        let interval = self.config.counts_flush_interval;
        if let Ok(handle) = std::thread::Builder::new()
            .name("mnemo-counts-flush".to_owned())
            .spawn(move || {
                run_loop(&signal, interval, || {
                    let cx = Cx::new();
                    if let Err(err) = store.persist_counts(&cx) {
                        warn!(error = %err, "counts flush failed, will retry");
                    }
                })
            })
        {
            handles.push(handle);
        }

        let cache = Arc::clone(&self.cache);
        let signal = Arc::clone(&self.loop_signal);
        let interval = self.cache.fairness_interval();
        if let Ok(handle) = std::thread::Builder::new()
            .name("mnemo-cache-fairness".to_owned())
            .spawn(move || run_loop(&signal, interval, || cache.fairness_tick()))
        {
            handles.push(handle);
        }
    }
}

fn run_loop(signal: &LoopSignal, interval: Duration, mut tick: impl FnMut()) {
    loop {
        {
            let mut stop = signal.stop.lock();
            if *stop {
                return;
            }
            // Spurious wakeups just re-check the stop flag.
            let _ = signal.wake.wait_for(&mut stop, interval);
            if *stop {
                return;
            }
        }
        tick();
    }
}

/// Offset-paginated source over stored records; the path list is pinned at
/// construction so offsets stay stable for the whole rebuild.
pub(crate) struct RecordSource<'a, T> {
    store: &'a Storage,
    paths: Vec<String>,
    what: &'static str,
    _marker: std::marker::PhantomData<T>,
}

impl<T: serde::de::DeserializeOwned> ScanSource<T> for RecordSource<'_, T> {
    fn total(&self, _cx: &Cx) -> Result<usize> {
        Ok(self.paths.len())
    }

    fn page(&self, cx: &Cx, offset: usize, limit: usize) -> Result<Vec<T>> {
        let mut out = Vec::with_capacity(limit.min(self.paths.len().saturating_sub(offset)));
        for path in self.paths.iter().skip(offset).take(limit) {
            let bytes = self.store.cow.lookup(cx, path)?;
            let record: T =
                serde_json::from_slice(&bytes).map_err(|err| MnemoError::Integrity {
                    what: self.what,
                    detail: format!("{path}: {err}"),
                })?;
            out.push(record);
        }
        Ok(out)
    }
}

/// Flattened index entries for an entity: the `type` field plus every
/// metadata scalar under its dotted path.
#[must_use]
pub(crate) fn noun_index_entries(noun: &Noun) -> Vec<(String, IndexValue)> {
    let mut entries = vec![(
        "type".to_owned(),
        IndexValue::Str(noun.kind.as_str().to_owned()),
    )];
    entries.extend(flatten_metadata(&noun.metadata));
    entries
}
