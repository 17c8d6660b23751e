//! The copy-on-write store proper.
//!
//! Single-writer discipline: in-process commits serialize on a commit lock,
//! and `refs/head` advances by compare-and-swap so an unexpected external
//! writer surfaces as `PreconditionFailed` instead of silent divergence.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use mnemo_backend::BlobBackend;
use mnemo_error::{MnemoError, Result};
use mnemo_types::value::canonical_json_bytes;
use mnemo_types::{Clock, Cx};

use crate::buffer::{BufferConfig, FlushSignal, spawn_flush_loop};
use crate::codec;
use crate::digest::Digest;
use crate::object::{CommitObject, RefObject, TreeEntry, TreeObject};

/// Name of the head ref.
pub const HEAD_REF: &str = "refs/head";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct CowConfig {
    /// Writer identity recorded in commit objects.
    pub writer: String,
    pub buffer: BufferConfig,
    /// CAS retry bound for `refs/head` advancement.
    pub cas_retries: u32,
    /// Base backoff between CAS retries (doubles per attempt).
    pub cas_backoff: std::time::Duration,
}

impl Default for CowConfig {
    fn default() -> Self {
        Self {
            writer: format!("mnemo/{}", env!("CARGO_PKG_VERSION")),
            buffer: BufferConfig::default(),
            cas_retries: 3,
            cas_backoff: std::time::Duration::from_millis(100),
        }
    }
}

/// Identity of a durable commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitId {
    pub seq: u64,
    pub digest: Digest,
}

/// A mutation of one logical path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOp {
    Put(Vec<u8>),
    /// Tombstone: the path disappears from the new tree. Prior commits
    /// retain the payload until garbage collection.
    Delete,
}

/// A logical-path mutation inside a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub path: String,
    pub op: ChangeOp,
}

impl Change {
    /// Convenience constructor for a put.
    #[must_use]
    pub fn put(path: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            op: ChangeOp::Put(bytes),
        }
    }

    /// Convenience constructor for a tombstone.
    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            op: ChangeOp::Delete,
        }
    }
}

/// Result of [`CowStore::commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Changes are durable in the named commit.
    Committed(CommitId),
    /// Changes are staged in the write buffer (remote backends only).
    Buffered,
    /// The change list was empty.
    Noop,
}

struct StoreState {
    /// Staged logical-path mutations, last write wins per path.
    pending: BTreeMap<String, ChangeOp>,
    /// When the oldest staged entry arrived.
    pending_since: Option<Instant>,
    /// Cached head commit digest (single-writer, safe to trust).
    head_cache: Option<Digest>,
}

/// Content-addressed COW store over a blob backend.
pub struct CowStore {
    backend: Arc<dyn BlobBackend>,
    clock: Arc<dyn Clock>,
    config: CowConfig,
    buffered: bool,
    state: Mutex<StoreState>,
    /// Serializes commit construction and head advancement in-process.
    commit_lock: Mutex<()>,
    flush_signal: Arc<FlushSignal>,
    flush_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl CowStore {
    /// Open a store over a backend. Remote backends get the write buffer
    /// and its background flush thread.
    pub fn open(
        backend: Arc<dyn BlobBackend>,
        clock: Arc<dyn Clock>,
        config: CowConfig,
    ) -> Arc<Self> {
        let buffered = backend.profile().remote;
        let signal = FlushSignal::new();
        let store = Arc::new(Self {
            backend,
            clock,
            buffered,
            flush_signal: Arc::clone(&signal),
            state: Mutex::new(StoreState {
                pending: BTreeMap::new(),
                pending_since: None,
                head_cache: None,
            }),
            commit_lock: Mutex::new(()),
            flush_thread: Mutex::new(None),
            config,
        });
        if buffered {
            let handle =
                spawn_flush_loop(Arc::clone(&store), signal, store.config.buffer.window);
            *store.flush_thread.lock() = handle;
        }
        store
    }

    /// Whether this store buffers writes.
    #[must_use]
    pub const fn is_buffered(&self) -> bool {
        self.buffered
    }

    /// Stop the flush thread, flushing staged writes first (best effort).
    pub fn shutdown(&self, cx: &Cx) {
        if let Err(err) = self.flush(cx) {
            warn!(error = %err, "final flush on shutdown failed");
        }
        self.flush_signal.shutdown();
        if let Some(handle) = self.flush_thread.lock().take() {
            let _ = handle.join();
        }
    }

    // -----------------------------------------------------------------------
    // Object plane
    // -----------------------------------------------------------------------

    /// Write a blob object, deduplicating by digest.
    pub fn write_object(&self, cx: &Cx, bytes: &[u8]) -> Result<Digest> {
        let digest = Digest::of(bytes);
        let key = format!("blob/{digest}");
        if !self.backend.exists(cx, &key)? {
            self.backend.put(cx, &key, bytes)?;
        }
        Ok(digest)
    }

    /// Read a blob object, verifying its digest.
    pub fn read_object(&self, cx: &Cx, digest: &Digest) -> Result<Vec<u8>> {
        let key = format!("blob/{digest}");
        let raw = self.backend.get(cx, &key)?;
        let bytes = codec::unwrap_binary(&raw)?.into_owned();
        let actual = Digest::of(&bytes);
        if actual != *digest {
            return Err(MnemoError::Integrity {
                what: "blob",
                detail: format!("digest mismatch: expected {digest}, read {actual}"),
            });
        }
        Ok(bytes)
    }

    fn write_tree(&self, cx: &Cx, tree: &TreeObject) -> Result<Digest> {
        let bytes = tree.to_canonical_bytes()?;
        let digest = Digest::of(&bytes);
        let key = format!("tree/{digest}");
        if !self.backend.exists(cx, &key)? {
            self.backend.put(cx, &key, &bytes)?;
        }
        Ok(digest)
    }

    fn read_tree(&self, cx: &Cx, digest: &Digest) -> Result<TreeObject> {
        let key = format!("tree/{digest}");
        let bytes = self.backend.get(cx, &key)?;
        if Digest::of(&bytes) != *digest {
            return Err(MnemoError::Integrity {
                what: "tree",
                detail: format!("digest mismatch at {key}"),
            });
        }
        TreeObject::from_bytes(&bytes)
    }

    fn write_commit_object(&self, cx: &Cx, commit: &CommitObject) -> Result<Digest> {
        let bytes = commit.to_canonical_bytes()?;
        let digest = Digest::of(&bytes);
        let key = format!("commit/{digest}");
        if !self.backend.exists(cx, &key)? {
            self.backend.put(cx, &key, &bytes)?;
        }
        Ok(digest)
    }

    /// Read a commit object by digest.
    pub fn read_commit(&self, cx: &Cx, digest: &Digest) -> Result<CommitObject> {
        let key = format!("commit/{digest}");
        let bytes = self.backend.get(cx, &key)?;
        if Digest::of(&bytes) != *digest {
            return Err(MnemoError::Integrity {
                what: "commit",
                detail: format!("digest mismatch at {key}"),
            });
        }
        CommitObject::from_bytes(&bytes)
    }

    // -----------------------------------------------------------------------
    // Ref plane
    // -----------------------------------------------------------------------

    /// Read a ref; `None` when it does not exist.
    pub fn read_ref(&self, cx: &Cx, name: &str) -> Result<Option<Digest>> {
        debug_assert_eq!(codec::classify(name), codec::PayloadClass::Json);
        match self.backend.get(cx, name) {
            Ok(bytes) => {
                let obj: RefObject =
                    serde_json::from_slice(&bytes).map_err(|err| MnemoError::Integrity {
                        what: "ref",
                        detail: err.to_string(),
                    })?;
                Ok(Some(obj.digest))
            }
            Err(MnemoError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Compare-and-swap a ref. `expected = None` requires the ref to be
    /// absent. Returns `PreconditionFailed` on mismatch.
    pub fn update_ref(
        &self,
        cx: &Cx,
        name: &str,
        expected: Option<&Digest>,
        new: &Digest,
    ) -> Result<()> {
        let _guard = self.commit_lock.lock();
        self.update_ref_locked(cx, name, expected, new)
    }

    /// CAS body; caller must hold the commit lock. In-process writers are
    /// serialized by that lock, so read-compare-put is atomic here and an
    /// external writer shows up as a mismatch.
    fn update_ref_locked(
        &self,
        cx: &Cx,
        name: &str,
        expected: Option<&Digest>,
        new: &Digest,
    ) -> Result<()> {
        let current = self.read_ref(cx, name)?;
        match (expected, current) {
            (None, None) => {}
            (Some(e), Some(c)) if *e == c => {}
            (expected, current) => {
                return Err(MnemoError::PreconditionFailed {
                    what: "ref",
                    expected: expected.map_or_else(|| "<absent>".to_owned(), Digest::to_hex),
                    actual: current.map_or_else(|| "<absent>".to_owned(), |d| d.to_hex()),
                });
            }
        }
        let obj = RefObject { digest: *new };
        let value = serde_json::to_value(&obj).map_err(MnemoError::internal)?;
        self.backend.put(cx, name, &canonical_json_bytes(&value))
    }

    /// The head commit, or `None` on a fresh backend.
    pub fn head_commit(&self, cx: &Cx) -> Result<Option<(Digest, CommitObject)>> {
        let cached = self.state.lock().head_cache;
        let digest = match cached {
            Some(d) => Some(d),
            None => {
                let read = self.read_ref(cx, HEAD_REF)?;
                if let Some(d) = read {
                    self.state.lock().head_cache = Some(d);
                }
                read
            }
        };
        match digest {
            Some(d) => Ok(Some((d, self.read_commit(cx, &d)?))),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Commit plane
    // -----------------------------------------------------------------------

    /// Apply a batch of logical-path changes.
    ///
    /// Local backends commit synchronously. Remote backends stage the
    /// changes, collapsing same-path writes, and flush when the window or
    /// entry cap is reached.
    pub fn commit(&self, cx: &Cx, changes: Vec<Change>) -> Result<CommitOutcome> {
        if changes.is_empty() {
            return Ok(CommitOutcome::Noop);
        }
        if !self.buffered {
            let mut map = BTreeMap::new();
            for change in changes {
                map.insert(change.path, change.op);
            }
            return Ok(CommitOutcome::Committed(self.apply_commit(cx, &map)?));
        }

        let force_flush = {
            let mut state = self.state.lock();
            for change in changes {
                state.pending.insert(change.path, change.op);
            }
            if state.pending_since.is_none() {
                state.pending_since = Some(Instant::now());
            }
            state.pending.len() >= self.config.buffer.max_entries
        };
        if force_flush {
            debug!("write buffer reached entry cap, flushing early");
            return Ok(match self.flush(cx)? {
                Some(id) => CommitOutcome::Committed(id),
                None => CommitOutcome::Buffered,
            });
        }
        Ok(CommitOutcome::Buffered)
    }

    /// Flush all staged changes now. `None` when nothing is staged.
    pub fn flush(&self, cx: &Cx) -> Result<Option<CommitId>> {
        let drained = {
            let mut state = self.state.lock();
            if state.pending.is_empty() {
                return Ok(None);
            }
            state.pending_since = None;
            std::mem::take(&mut state.pending)
        };
        match self.apply_commit(cx, &drained) {
            Ok(id) => Ok(Some(id)),
            Err(err) => {
                // Restage so the background loop retries; newer staged
                // entries written during the flush win over the restaged.
                let mut state = self.state.lock();
                for (path, op) in drained {
                    state.pending.entry(path).or_insert(op);
                }
                if state.pending_since.is_none() {
                    state.pending_since = Some(Instant::now());
                }
                Err(err)
            }
        }
    }

    /// Flush only when the oldest staged entry has aged past the window.
    pub fn flush_expired(&self, cx: &Cx) -> Result<Option<CommitId>> {
        let due = {
            let state = self.state.lock();
            state
                .pending_since
                .is_some_and(|since| since.elapsed() >= self.config.buffer.window)
        };
        if due { self.flush(cx) } else { Ok(None) }
    }

    fn apply_commit(&self, cx: &Cx, changes: &BTreeMap<String, ChangeOp>) -> Result<CommitId> {
        let _guard = self.commit_lock.lock();
        cx.checkpoint_with("commit")?;

        // Blobs first: content-addressed, so retries and dedup are free.
        let mut blob_digests: BTreeMap<&str, Digest> = BTreeMap::new();
        let puts: Vec<(&str, &Vec<u8>)> = changes
            .iter()
            .filter_map(|(path, op)| match op {
                ChangeOp::Put(bytes) => Some((path.as_str(), bytes)),
                ChangeOp::Delete => None,
            })
            .collect();
        for digested in self.write_blobs(cx, &puts)? {
            blob_digests.insert(digested.0, digested.1);
        }

        let mut attempt = 0_u32;
        loop {
            cx.checkpoint_with("commit")?;
            let head = self.read_ref(cx, HEAD_REF)?;
            let (parent_digest, parent_seq, base_tree) = match head {
                Some(digest) => {
                    let commit = self.read_commit(cx, &digest)?;
                    (Some(digest), commit.seq, Some(commit.tree))
                }
                None => (None, 0, None),
            };

            let entries: BTreeMap<String, Option<Digest>> = changes
                .iter()
                .map(|(path, op)| {
                    let digest = match op {
                        ChangeOp::Put(_) => Some(blob_digests[path.as_str()]),
                        ChangeOp::Delete => None,
                    };
                    (path.clone(), digest)
                })
                .collect();
            let tree_digest = self
                .apply_tree(cx, base_tree.as_ref(), &entries)?
                .map_or_else(|| self.write_tree(cx, &TreeObject::default()), Ok)?;

            let commit = CommitObject {
                seq: parent_seq + 1,
                parent: parent_digest,
                tree: tree_digest,
                timestamp_ms: self.clock.now_ms(),
                writer: self.config.writer.clone(),
            };
            let commit_digest = self.write_commit_object(cx, &commit)?;

            match self.update_ref_locked(cx, HEAD_REF, parent_digest.as_ref(), &commit_digest) {
                Ok(()) => {
                    self.state.lock().head_cache = Some(commit_digest);
                    info!(
                        seq = commit.seq,
                        changes = changes.len(),
                        commit = %commit_digest,
                        "commit"
                    );
                    return Ok(CommitId {
                        seq: commit.seq,
                        digest: commit_digest,
                    });
                }
                Err(err @ MnemoError::PreconditionFailed { .. }) => {
                    // External writer advanced the head. Dead objects from
                    // this attempt stay unreferenced until GC.
                    self.state.lock().head_cache = None;
                    if attempt >= self.config.cas_retries {
                        return Err(err);
                    }
                    let backoff = self.config.cas_backoff * 2_u32.pow(attempt);
                    warn!(attempt, backoff_ms = backoff.as_millis() as u64, "head CAS conflict, retrying");
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Write put-blobs with bounded concurrency (the flush concurrency cap
    /// only matters for remote backends; local writes are microseconds).
    fn write_blobs<'a>(
        &self,
        cx: &Cx,
        puts: &[(&'a str, &Vec<u8>)],
    ) -> Result<Vec<(&'a str, Digest)>> {
        let cap = self.config.buffer.flush_concurrency.max(1);
        if !self.buffered || puts.len() <= 1 {
            return puts
                .iter()
                .map(|(path, bytes)| Ok((*path, self.write_object(cx, bytes)?)))
                .collect();
        }
        let mut out = Vec::with_capacity(puts.len());
        for chunk in puts.chunks(cap) {
            let results = std::thread::scope(|scope| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|(path, bytes)| {
                        scope.spawn(move || Ok((*path, self.write_object(cx, bytes)?)))
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| {
                        h.join()
                            .unwrap_or_else(|_| Err(MnemoError::internal("blob writer panicked")))
                    })
                    .collect::<Vec<Result<(&str, Digest)>>>()
            });
            for result in results {
                out.push(result?);
            }
        }
        Ok(out)
    }

    /// Rebuild the tree along mutated paths, sharing unchanged subtrees.
    fn apply_tree(
        &self,
        cx: &Cx,
        base: Option<&Digest>,
        entries: &BTreeMap<String, Option<Digest>>,
    ) -> Result<Option<Digest>> {
        let mut tree = match base {
            Some(digest) => self.read_tree(cx, digest)?,
            None => TreeObject::default(),
        };

        // Partition changes into leaves at this level and grouped subtrees.
        let mut children: BTreeMap<&str, BTreeMap<String, Option<Digest>>> = BTreeMap::new();
        for (path, digest) in entries {
            match path.split_once('/') {
                None => match digest {
                    Some(d) => {
                        tree.entries.insert(path.clone(), TreeEntry::Blob(*d));
                    }
                    None => {
                        tree.entries.remove(path);
                    }
                },
                Some((seg, rest)) => {
                    children
                        .entry(seg)
                        .or_default()
                        .insert(rest.to_owned(), *digest);
                }
            }
        }

        for (seg, child_entries) in children {
            let base_child = match tree.entries.get(seg) {
                Some(TreeEntry::Tree(d)) => Some(*d),
                // A blob shadowed by a directory write is replaced.
                Some(TreeEntry::Blob(_)) | None => None,
            };
            match self.apply_tree(cx, base_child.as_ref(), &child_entries)? {
                Some(d) => {
                    tree.entries.insert(seg.to_owned(), TreeEntry::Tree(d));
                }
                None => {
                    tree.entries.remove(seg);
                }
            }
        }

        if tree.entries.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.write_tree(cx, &tree)?))
    }

    // -----------------------------------------------------------------------
    // Read plane
    // -----------------------------------------------------------------------

    /// Read a logical path at head, observing staged writes first.
    pub fn lookup(&self, cx: &Cx, path: &str) -> Result<Vec<u8>> {
        if self.buffered {
            let state = self.state.lock();
            match state.pending.get(path) {
                Some(ChangeOp::Put(bytes)) => return Ok(bytes.clone()),
                Some(ChangeOp::Delete) => {
                    return Err(MnemoError::not_found("path", path));
                }
                None => {}
            }
        }
        let Some((_, commit)) = self.head_commit(cx)? else {
            return Err(MnemoError::not_found("path", path));
        };
        self.lookup_in_tree(cx, &commit.tree, path)
    }

    /// Read a logical path as of a specific commit.
    pub fn lookup_at(&self, cx: &Cx, commit: &Digest, path: &str) -> Result<Vec<u8>> {
        let commit = self.read_commit(cx, commit)?;
        self.lookup_in_tree(cx, &commit.tree, path)
    }

    fn lookup_in_tree(&self, cx: &Cx, root: &Digest, path: &str) -> Result<Vec<u8>> {
        let mut current = *root;
        let mut segments = path.split('/').peekable();
        while let Some(segment) = segments.next() {
            let tree = self.read_tree(cx, &current)?;
            match tree.entries.get(segment) {
                Some(TreeEntry::Tree(d)) if segments.peek().is_some() => current = *d,
                Some(TreeEntry::Blob(d)) if segments.peek().is_none() => {
                    return self.read_object(cx, d);
                }
                _ => return Err(MnemoError::not_found("path", path)),
            }
        }
        Err(MnemoError::not_found("path", path))
    }

    /// Enumerate logical paths under a prefix in lexicographic order with
    /// offset pagination. Staged writes overlay the committed tree.
    pub fn scan_paths(
        &self,
        cx: &Cx,
        prefix: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>> {
        let all = self.collect_prefix(cx, prefix)?;
        Ok(all.into_iter().skip(offset).take(limit).collect())
    }

    /// Count logical paths under a prefix.
    pub fn count_paths(&self, cx: &Cx, prefix: &str) -> Result<usize> {
        Ok(self.collect_prefix(cx, prefix)?.len())
    }

    fn collect_prefix(&self, cx: &Cx, prefix: &str) -> Result<Vec<String>> {
        let mut found: Vec<String> = Vec::new();
        if let Some((_, commit)) = self.head_commit(cx)? {
            self.collect_tree(cx, &commit.tree, "", prefix, &mut found)?;
        }
        if self.buffered {
            let state = self.state.lock();
            for (path, op) in &state.pending {
                if !path.starts_with(prefix) {
                    continue;
                }
                match op {
                    ChangeOp::Put(_) => found.push(path.clone()),
                    ChangeOp::Delete => found.retain(|p| p != path),
                }
            }
        }
        found.sort_unstable();
        found.dedup();
        Ok(found)
    }

    fn collect_tree(
        &self,
        cx: &Cx,
        digest: &Digest,
        base: &str,
        prefix: &str,
        out: &mut Vec<String>,
    ) -> Result<()> {
        cx.checkpoint_with("scan")?;
        let tree = self.read_tree(cx, digest)?;
        for (name, entry) in &tree.entries {
            let path = if base.is_empty() {
                name.clone()
            } else {
                format!("{base}/{name}")
            };
            match entry {
                TreeEntry::Blob(_) => {
                    if path.starts_with(prefix) {
                        out.push(path);
                    }
                }
                TreeEntry::Tree(d) => {
                    // Descend only when the subtree can intersect the prefix.
                    let dir = format!("{path}/");
                    if prefix.starts_with(&dir) || dir.starts_with(prefix) {
                        self.collect_tree(cx, d, &path, prefix, out)?;
                    }
                }
            }
        }
        Ok(())
    }
}
