//! Mutating API: add, relate, update, delete.
//!
//! Every mutation takes the per-entity lock, then runs an ordered
//! transaction: persist through the COW store, update the in-memory
//! indexes, bump counts, and persist the dirty index projections. Any step
//! failing unwinds the earlier steps through their compensations, so
//! observable state never diverges from storage.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use mnemo_cow::{Change, CowStore};
use mnemo_error::{MnemoError, Result};
use mnemo_txn::{BatchOperation, FnOperation, Operation, RollbackFn, no_rollback};
use mnemo_types::{Cx, Noun, NounKind, RngSource, Uid, Vector, Verb, VerbKind};

use crate::paths;
use crate::store::{Storage, noun_index_entries};

/// Input to [`Storage::add`].
#[derive(Debug, Clone)]
pub struct AddRequest {
    pub kind: NounKind,
    /// Source text; embedded when no explicit vector is given.
    pub data: Option<String>,
    /// Pre-computed unit vector (skips the embedder).
    pub vector: Option<Vec<f32>>,
    pub metadata: Map<String, Value>,
    pub confidence: Option<f64>,
}

impl AddRequest {
    #[must_use]
    pub fn new(kind: NounKind) -> Self {
        Self {
            kind,
            data: None,
            vector: None,
            metadata: Map::new(),
            confidence: None,
        }
    }
}

/// Input to [`Storage::relate`].
#[derive(Debug, Clone)]
pub struct RelateRequest {
    pub from: Uid,
    pub to: Uid,
    pub kind: VerbKind,
    pub weight: Option<f64>,
    pub confidence: Option<f64>,
    pub metadata: Option<Map<String, Value>>,
}

/// Input to [`Storage::update`].
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub id: Uid,
    /// Replacement source text. Changing it re-embeds automatically.
    pub data: Option<String>,
    pub metadata: Option<Map<String, Value>>,
    /// Merge metadata keys into the existing mapping instead of replacing
    /// it wholesale.
    pub merge: bool,
    /// Force (or suppress) re-embedding regardless of data changes.
    pub reembed: Option<bool>,
    pub confidence: Option<f64>,
}

impl UpdateRequest {
    #[must_use]
    pub fn new(id: Uid) -> Self {
        Self {
            id,
            data: None,
            metadata: None,
            merge: true,
            reembed: None,
            confidence: None,
        }
    }
}

impl Storage {
    // -----------------------------------------------------------------------
    // add
    // -----------------------------------------------------------------------

    /// Create an entity. Embeds `data` when no vector is supplied; an
    /// entity with neither stays findable by metadata but unsearchable by
    /// similarity.
    pub fn add(&self, cx: &Cx, request: AddRequest) -> Result<Uid> {
        self.ensure_ready()?;
        validate_metadata(&request.metadata)?;
        let vector = self.resolve_vector(cx, request.vector, request.data.as_deref())?;

        let id = Uid::random(self.rng.as_ref());
        let now = self.clock.now_ms();
        let noun = Noun {
            id,
            kind: request.kind,
            data: request.data,
            metadata: request.metadata,
            vector_ref: vector.as_ref().map(|_| paths::noun_vector(id)),
            created_at: now,
            updated_at: now,
            service: self.config.service.clone(),
            confidence: request.confidence.unwrap_or(1.0),
            merge_count: 0,
        };

        let _guard = self.locks.acquire(cx, id)?;
        let mut ops = vec![self.persist_noun_op(&noun, vector.clone(), None, None)?];
        if let Some(v) = vector {
            ops.push(self.hnsw_insert_op(id, v));
        }
        ops.push(self.metadata_insert_op(id, noun_index_entries(&noun)));
        ops.push(self.counts_noun_op(noun.kind, 1));
        ops.push(self.persist_indexes_op());
        self.run_txn(cx, ops)?;

        self.cache.invalidate(&paths::noun(id));
        debug!(id = %id, kind = %noun.kind, "entity added");
        Ok(id)
    }

    /// Batched add: one transaction, stage-batched operations.
    pub fn add_many(&self, cx: &Cx, requests: Vec<AddRequest>) -> Result<Vec<Uid>> {
        self.ensure_ready()?;
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let mut prepared = Vec::with_capacity(requests.len());
        for request in requests {
            validate_metadata(&request.metadata)?;
            let vector =
                self.resolve_vector(cx, request.vector.clone(), request.data.as_deref())?;
            let id = Uid::random(self.rng.as_ref());
            let now = self.clock.now_ms();
            prepared.push((
                Noun {
                    id,
                    kind: request.kind,
                    data: request.data,
                    metadata: request.metadata,
                    vector_ref: vector.as_ref().map(|_| paths::noun_vector(id)),
                    created_at: now,
                    updated_at: now,
                    service: self.config.service.clone(),
                    confidence: request.confidence.unwrap_or(1.0),
                    merge_count: 0,
                },
                vector,
            ));
        }

        let mut guards = Vec::with_capacity(prepared.len());
        let mut ids: Vec<Uid> = prepared.iter().map(|(n, _)| n.id).collect();
        ids.sort_unstable();
        for id in &ids {
            guards.push(self.locks.acquire(cx, *id)?);
        }

        let mut persist: Vec<Box<dyn Operation>> = Vec::new();
        let mut hnsw: Vec<Box<dyn Operation>> = Vec::new();
        let mut meta: Vec<Box<dyn Operation>> = Vec::new();
        let mut counts: Vec<Box<dyn Operation>> = Vec::new();
        for (noun, vector) in &prepared {
            persist.push(Box::new(self.persist_noun_op(
                noun,
                vector.clone(),
                None,
                None,
            )?));
            if let Some(v) = vector {
                hnsw.push(Box::new(self.hnsw_insert_op(noun.id, v.clone())));
            }
            meta.push(Box::new(
                self.metadata_insert_op(noun.id, noun_index_entries(noun)),
            ));
            counts.push(Box::new(self.counts_noun_op(noun.kind, 1)));
        }

        let mut txn_ops: Vec<FnOperation> = Vec::new();
        txn_ops.push(wrap_batch("persist_entities", persist));
        if !hnsw.is_empty() {
            txn_ops.push(wrap_batch("hnsw_insert_batch", hnsw));
        }
        txn_ops.push(wrap_batch("metadata_insert_batch", meta));
        txn_ops.push(wrap_batch("counts_increment_batch", counts));
        txn_ops.push(self.persist_indexes_op());
        self.run_txn(cx, txn_ops)?;

        for (noun, _) in &prepared {
            self.cache.invalidate(&paths::noun(noun.id));
        }
        Ok(prepared.into_iter().map(|(n, _)| n.id).collect())
    }

    // -----------------------------------------------------------------------
    // relate
    // -----------------------------------------------------------------------

    /// Create (or merge into) a relationship. `(from, kind, to)` is
    /// unique: re-asserting updates weight/confidence/metadata on the
    /// existing verb and returns its id without touching counts.
    pub fn relate(&self, cx: &Cx, request: RelateRequest) -> Result<Uid> {
        self.ensure_ready()?;
        if let Some(metadata) = &request.metadata {
            validate_metadata(metadata)?;
        }
        let _ = self.read_noun_required(cx, request.from)?;
        let _ = self.read_noun_required(cx, request.to)?;

        let _guard = self.locks.acquire_pair(cx, request.from, request.to)?;

        let existing = self
            .graph
            .read()
            .find_edge(request.from, request.kind, request.to);
        if let Some(verb_id) = existing {
            let mut verb = self
                .read_verb(cx, verb_id)?
                .ok_or_else(|| MnemoError::Integrity {
                    what: "relationship",
                    detail: format!("indexed verb {verb_id} missing from storage"),
                })?;
            verb.weight = request.weight.or(verb.weight);
            verb.confidence = request.confidence.or(verb.confidence);
            if let Some(metadata) = request.metadata {
                verb.metadata = Some(metadata);
            }
            verb.updated_at = self.clock.now_ms();
            let bytes = serde_json::to_vec(&verb).map_err(MnemoError::internal)?;
            self.cow
                .commit(cx, vec![Change::put(paths::verb(verb_id), bytes)])?;
            debug!(id = %verb_id, "relationship merged");
            return Ok(verb_id);
        }

        let id = Uid::random(self.rng.as_ref());
        let now = self.clock.now_ms();
        let verb = Verb {
            id,
            from_id: request.from,
            to_id: request.to,
            kind: request.kind,
            weight: request.weight,
            confidence: request.confidence,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
        };

        let ops = vec![
            self.persist_verb_op(&verb)?,
            self.graph_insert_op(verb.clone()),
            self.counts_verb_op(verb.kind, 1),
            self.persist_indexes_op(),
        ];
        self.run_txn(cx, ops)?;
        debug!(id = %id, kind = %verb.kind, "relationship added");
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // update
    // -----------------------------------------------------------------------

    /// Update an entity's data and/or metadata. A data change re-embeds
    /// automatically; `reembed` overrides in either direction.
    pub fn update(&self, cx: &Cx, request: UpdateRequest) -> Result<()> {
        self.ensure_ready()?;
        let id = request.id;
        let _guard = self.locks.acquire(cx, id)?;
        let current = self.read_noun_required(cx, id)?;

        let data_changed =
            request.data.is_some() && request.data != current.data;
        let new_data = request.data.or_else(|| current.data.clone());
        let metadata_merged = request.merge && request.metadata.is_some();
        let new_metadata = match request.metadata {
            None => current.metadata.clone(),
            Some(patch) if request.merge => {
                let mut merged = current.metadata.clone();
                for (key, value) in patch {
                    merged.insert(key, value);
                }
                merged
            }
            Some(replacement) => replacement,
        };
        validate_metadata(&new_metadata)?;

        let should_embed = request.reembed.unwrap_or(data_changed);
        let new_vector = if should_embed {
            let text = new_data.as_deref().ok_or_else(|| {
                MnemoError::invalid("update", "re-embedding requires data")
            })?;
            Some(self.resolve_vector(cx, None, Some(text))?.ok_or_else(|| {
                MnemoError::internal("embedder produced no vector")
            })?)
        } else {
            None
        };

        // Pre-image vector for the compensation path.
        let old_vector = if new_vector.is_some() && current.vector_ref.is_some() {
            Some(self.read_vector(cx, id, false)?)
        } else {
            None
        };

        let updated = Noun {
            id,
            kind: current.kind,
            data: new_data,
            metadata: new_metadata,
            vector_ref: if new_vector.is_some() {
                Some(paths::noun_vector(id))
            } else {
                current.vector_ref.clone()
            },
            created_at: current.created_at,
            updated_at: self.clock.now_ms(),
            service: current.service.clone(),
            confidence: request.confidence.unwrap_or(current.confidence),
            merge_count: current.merge_count + u32::from(metadata_merged),
        };

        let mut ops = vec![self.persist_noun_op(
            &updated,
            new_vector.clone(),
            Some(&current),
            old_vector.clone(),
        )?];
        ops.push(self.metadata_update_op(
            id,
            noun_index_entries(&current),
            noun_index_entries(&updated),
        ));
        if let Some(v) = new_vector {
            ops.push(self.hnsw_replace_op(id, v, old_vector));
        }
        ops.push(self.persist_indexes_op());
        self.run_txn(cx, ops)?;

        self.cache.invalidate(&paths::noun(id));
        self.cache.invalidate(&paths::noun_vector(id));
        debug!(id = %id, reembedded = should_embed, "entity updated");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // delete
    // -----------------------------------------------------------------------

    /// Delete an entity: cascade to its relationships, remove it from all
    /// indexes, tombstone the payload paths, decrement counts. Prior
    /// commits retain the payload until garbage collection.
    pub fn delete(&self, cx: &Cx, id: Uid) -> Result<()> {
        self.ensure_ready()?;
        let _guard = self.locks.acquire(cx, id)?;
        let current = self.read_noun_required(cx, id)?;

        let incident = self.graph.read().incident_verbs(id);
        let mut verbs = Vec::with_capacity(incident.len());
        for verb_id in incident {
            let verb = self
                .read_verb(cx, verb_id)?
                .ok_or_else(|| MnemoError::Integrity {
                    what: "relationship",
                    detail: format!("indexed verb {verb_id} missing from storage"),
                })?;
            verbs.push(verb);
        }
        let had_vector = current.vector_ref.is_some();
        let old_vector = if had_vector {
            Some(self.read_vector(cx, id, false)?)
        } else {
            None
        };

        let mut ops = vec![self.tombstone_op(&current, old_vector.clone(), &verbs)?];
        if had_vector {
            ops.push(self.hnsw_remove_op(id, old_vector));
        }
        ops.push(self.metadata_remove_op(id, noun_index_entries(&current)));
        if !verbs.is_empty() {
            ops.push(self.graph_remove_op(verbs.clone()));
        }
        ops.push(self.counts_delete_op(current.kind, &verbs));
        ops.push(self.persist_indexes_op());
        self.run_txn(cx, ops)?;

        self.cache.invalidate(&paths::noun(id));
        self.cache.invalidate(&paths::noun_vector(id));
        debug!(id = %id, cascaded = verbs.len(), "entity deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Operation builders
    // -----------------------------------------------------------------------

    fn resolve_vector(
        &self,
        cx: &Cx,
        explicit: Option<Vec<f32>>,
        data: Option<&str>,
    ) -> Result<Option<Vector>> {
        if let Some(raw) = explicit {
            if raw.len() != self.config.dim {
                return Err(MnemoError::invalid(
                    "vector",
                    format!("dimension {} != configured {}", raw.len(), self.config.dim),
                ));
            }
            let vector = Vector::from_unit(raw)
                .map_err(|err| MnemoError::invalid("vector", err.to_string()))?;
            return Ok(Some(vector));
        }
        let Some(text) = data else {
            return Ok(None);
        };
        let vector = self.embed_cached(cx, text)?;
        if vector.dim() != self.config.dim {
            return Err(MnemoError::Integrity {
                what: "embedder output",
                detail: format!("dimension {} != configured {}", vector.dim(), self.config.dim),
            });
        }
        Ok(Some(vector))
    }

    /// Persist an entity (and vector). With a pre-image, the compensation
    /// restores it; otherwise it tombstones the fresh paths.
    fn persist_noun_op(
        &self,
        noun: &Noun,
        vector: Option<Vector>,
        pre_image: Option<&Noun>,
        pre_vector: Option<Vector>,
    ) -> Result<FnOperation> {
        let cow = Arc::clone(&self.cow);
        let id = noun.id;
        let noun_bytes = serde_json::to_vec(noun).map_err(MnemoError::internal)?;
        let vector_bytes = vector.map(|v| v.to_le_bytes());
        let undo_noun_bytes = pre_image
            .map(|n| serde_json::to_vec(n).map_err(MnemoError::internal))
            .transpose()?;
        let undo_vector_bytes = pre_vector.map(|v| v.to_le_bytes());

        Ok(FnOperation::new("persist_entity", move |cx| {
            let mut changes = vec![Change::put(paths::noun(id), noun_bytes.clone())];
            if let Some(vb) = &vector_bytes {
                changes.push(Change::put(paths::noun_vector(id), vb.clone()));
            }
            let wrote_vector = vector_bytes.is_some();
            cow.commit(cx, changes)?;

            let cow = Arc::clone(&cow);
            let undo_noun = undo_noun_bytes.clone();
            let undo_vector = undo_vector_bytes.clone();
            Ok(Box::new(move |cx: &Cx| {
                let mut changes = Vec::new();
                match &undo_noun {
                    Some(bytes) => changes.push(Change::put(paths::noun(id), bytes.clone())),
                    None => changes.push(Change::delete(paths::noun(id))),
                }
                if wrote_vector {
                    match &undo_vector {
                        Some(bytes) => {
                            changes.push(Change::put(paths::noun_vector(id), bytes.clone()));
                        }
                        None => changes.push(Change::delete(paths::noun_vector(id))),
                    }
                }
                cow.commit(cx, changes).map(|_| ())
            }) as RollbackFn)
        }))
    }

    fn persist_verb_op(&self, verb: &Verb) -> Result<FnOperation> {
        let cow = Arc::clone(&self.cow);
        let id = verb.id;
        let bytes = serde_json::to_vec(verb).map_err(MnemoError::internal)?;
        Ok(FnOperation::new("persist_relationship", move |cx| {
            cow.commit(cx, vec![Change::put(paths::verb(id), bytes.clone())])?;
            let cow = Arc::clone(&cow);
            Ok(Box::new(move |cx: &Cx| {
                cow.commit(cx, vec![Change::delete(paths::verb(id))]).map(|_| ())
            }) as RollbackFn)
        }))
    }

    /// Tombstone an entity, its vector, and its incident verbs.
    fn tombstone_op(
        &self,
        noun: &Noun,
        vector: Option<Vector>,
        verbs: &[Verb],
    ) -> Result<FnOperation> {
        let cow = Arc::clone(&self.cow);
        let id = noun.id;
        let noun_bytes = serde_json::to_vec(noun).map_err(MnemoError::internal)?;
        let vector_bytes = vector.map(|v| v.to_le_bytes());
        let verb_images: Vec<(Uid, Vec<u8>)> = verbs
            .iter()
            .map(|v| Ok((v.id, serde_json::to_vec(v).map_err(MnemoError::internal)?)))
            .collect::<Result<_>>()?;

        Ok(FnOperation::new("persist_tombstones", move |cx| {
            let mut changes = vec![Change::delete(paths::noun(id))];
            if vector_bytes.is_some() {
                changes.push(Change::delete(paths::noun_vector(id)));
            }
            for (verb_id, _) in &verb_images {
                changes.push(Change::delete(paths::verb(*verb_id)));
            }
            cow.commit(cx, changes)?;

            let cow = Arc::clone(&cow);
            let noun_bytes = noun_bytes.clone();
            let vector_bytes = vector_bytes.clone();
            let verb_images = verb_images.clone();
            Ok(Box::new(move |cx: &Cx| {
                let mut changes = vec![Change::put(paths::noun(id), noun_bytes.clone())];
                if let Some(vb) = &vector_bytes {
                    changes.push(Change::put(paths::noun_vector(id), vb.clone()));
                }
                for (verb_id, bytes) in &verb_images {
                    changes.push(Change::put(paths::verb(*verb_id), bytes.clone()));
                }
                cow.commit(cx, changes).map(|_| ())
            }) as RollbackFn)
        }))
    }

    fn hnsw_insert_op(&self, id: Uid, vector: Vector) -> FnOperation {
        let hnsw = Arc::clone(&self.hnsw);
        let rng: Arc<dyn RngSource> = Arc::clone(&self.rng);
        FnOperation::new("hnsw_insert", move |cx| {
            hnsw.write().insert(cx, id, vector.clone(), rng.as_ref())?;
            let hnsw = Arc::clone(&hnsw);
            Ok(Box::new(move |_cx: &Cx| {
                let _ = hnsw.write().remove(id);
                Ok(())
            }) as RollbackFn)
        })
    }

    fn hnsw_remove_op(&self, id: Uid, pre_vector: Option<Vector>) -> FnOperation {
        let hnsw = Arc::clone(&self.hnsw);
        let rng: Arc<dyn RngSource> = Arc::clone(&self.rng);
        FnOperation::new("hnsw_remove", move |_cx| {
            let removed = hnsw.write().remove(id);
            let hnsw = Arc::clone(&hnsw);
            let rng = Arc::clone(&rng);
            let pre_vector = pre_vector.clone();
            Ok(Box::new(move |cx: &Cx| {
                if removed {
                    if let Some(v) = &pre_vector {
                        if !hnsw.read().contains(id) {
                            hnsw.write().insert(cx, id, v.clone(), rng.as_ref())?;
                        }
                    }
                }
                Ok(())
            }) as RollbackFn)
        })
    }

    fn hnsw_replace_op(&self, id: Uid, vector: Vector, pre_vector: Option<Vector>) -> FnOperation {
        let hnsw = Arc::clone(&self.hnsw);
        let rng: Arc<dyn RngSource> = Arc::clone(&self.rng);
        FnOperation::new("hnsw_replace", move |cx| {
            {
                let mut index = hnsw.write();
                let _ = index.remove(id);
                index.insert(cx, id, vector.clone(), rng.as_ref())?;
            }
            let hnsw = Arc::clone(&hnsw);
            let rng = Arc::clone(&rng);
            let pre_vector = pre_vector.clone();
            Ok(Box::new(move |cx: &Cx| {
                let mut index = hnsw.write();
                let _ = index.remove(id);
                if let Some(v) = &pre_vector {
                    index.insert(cx, id, v.clone(), rng.as_ref())?;
                }
                Ok(())
            }) as RollbackFn)
        })
    }

    fn metadata_insert_op(
        &self,
        id: Uid,
        entries: Vec<(String, mnemo_types::IndexValue)>,
    ) -> FnOperation {
        let meta = Arc::clone(&self.meta);
        FnOperation::new("metadata_insert", move |_cx| {
            meta.write().insert(id, &entries);
            let meta = Arc::clone(&meta);
            let entries = entries.clone();
            Ok(Box::new(move |_cx: &Cx| {
                meta.write().remove(id, &entries);
                Ok(())
            }) as RollbackFn)
        })
    }

    fn metadata_remove_op(
        &self,
        id: Uid,
        entries: Vec<(String, mnemo_types::IndexValue)>,
    ) -> FnOperation {
        let meta = Arc::clone(&self.meta);
        FnOperation::new("metadata_remove", move |_cx| {
            meta.write().remove(id, &entries);
            let meta = Arc::clone(&meta);
            let entries = entries.clone();
            Ok(Box::new(move |_cx: &Cx| {
                meta.write().insert(id, &entries);
                Ok(())
            }) as RollbackFn)
        })
    }

    fn metadata_update_op(
        &self,
        id: Uid,
        old_entries: Vec<(String, mnemo_types::IndexValue)>,
        new_entries: Vec<(String, mnemo_types::IndexValue)>,
    ) -> FnOperation {
        let meta = Arc::clone(&self.meta);
        FnOperation::new("metadata_update", move |_cx| {
            {
                let mut index = meta.write();
                index.remove(id, &old_entries);
                index.insert(id, &new_entries);
            }
            let meta = Arc::clone(&meta);
            let old_entries = old_entries.clone();
            let new_entries = new_entries.clone();
            Ok(Box::new(move |_cx: &Cx| {
                let mut index = meta.write();
                index.remove(id, &new_entries);
                index.insert(id, &old_entries);
                Ok(())
            }) as RollbackFn)
        })
    }

    fn graph_insert_op(&self, verb: Verb) -> FnOperation {
        let graph = Arc::clone(&self.graph);
        FnOperation::new("graph_insert", move |_cx| {
            graph.write().insert(&verb);
            let graph = Arc::clone(&graph);
            let verb_id = verb.id;
            Ok(Box::new(move |_cx: &Cx| {
                let _ = graph.write().remove(verb_id);
                Ok(())
            }) as RollbackFn)
        })
    }

    fn graph_remove_op(&self, verbs: Vec<Verb>) -> FnOperation {
        let graph = Arc::clone(&self.graph);
        FnOperation::new("graph_remove", move |_cx| {
            {
                let mut index = graph.write();
                for verb in &verbs {
                    let _ = index.remove(verb.id);
                }
            }
            let graph = Arc::clone(&graph);
            let verbs = verbs.clone();
            Ok(Box::new(move |_cx: &Cx| {
                let mut index = graph.write();
                for verb in &verbs {
                    if index.find_edge(verb.from_id, verb.kind, verb.to_id).is_none() {
                        index.insert(verb);
                    }
                }
                Ok(())
            }) as RollbackFn)
        })
    }

    fn counts_noun_op(&self, kind: NounKind, delta: i64) -> FnOperation {
        let counts = Arc::clone(&self.counts);
        FnOperation::new("counts_nouns", move |_cx| {
            counts.lock().bump_noun(kind, delta);
            let counts = Arc::clone(&counts);
            Ok(Box::new(move |_cx: &Cx| {
                counts.lock().bump_noun(kind, -delta);
                Ok(())
            }) as RollbackFn)
        })
    }

    fn counts_verb_op(&self, kind: VerbKind, delta: i64) -> FnOperation {
        let counts = Arc::clone(&self.counts);
        FnOperation::new("counts_verbs", move |_cx| {
            counts.lock().bump_verb(kind, delta);
            let counts = Arc::clone(&counts);
            Ok(Box::new(move |_cx: &Cx| {
                counts.lock().bump_verb(kind, -delta);
                Ok(())
            }) as RollbackFn)
        })
    }

    /// Decrement the deleted noun plus every cascaded verb in one step.
    fn counts_delete_op(&self, kind: NounKind, verbs: &[Verb]) -> FnOperation {
        let counts = Arc::clone(&self.counts);
        let verb_kinds: Vec<VerbKind> = verbs.iter().map(|v| v.kind).collect();
        FnOperation::new("counts_decrement", move |_cx| {
            {
                let mut ledger = counts.lock();
                ledger.bump_noun(kind, -1);
                for vk in &verb_kinds {
                    ledger.bump_verb(*vk, -1);
                }
            }
            let counts = Arc::clone(&counts);
            let verb_kinds = verb_kinds.clone();
            Ok(Box::new(move |_cx: &Cx| {
                let mut ledger = counts.lock();
                ledger.bump_noun(kind, 1);
                for vk in &verb_kinds {
                    ledger.bump_verb(*vk, 1);
                }
                Ok(())
            }) as RollbackFn)
        })
    }

    /// Persist dirty index projections and pending HNSW log records. Last
    /// step of every write transaction; nothing to compensate: the
    /// projections are rebuildable by definition.
    pub(crate) fn persist_indexes_op(&self) -> FnOperation {
        let cow = Arc::clone(&self.cow);
        let meta = Arc::clone(&self.meta);
        let graph = Arc::clone(&self.graph);
        let hnsw = Arc::clone(&self.hnsw);
        FnOperation::new("persist_indexes", move |cx| {
            let changes = collect_index_changes(cx, &cow, &meta, &graph, &hnsw)?;
            cow.commit(cx, changes)?;
            Ok(no_rollback())
        })
    }
}

/// Shared body for [`Storage::persist_indexes_op`] and the flush path.
pub(crate) fn collect_index_changes(
    cx: &Cx,
    cow: &CowStore,
    meta: &parking_lot::RwLock<mnemo_index::metadata::MetadataIndex>,
    graph: &parking_lot::RwLock<mnemo_index::graph::GraphIndex>,
    hnsw: &parking_lot::RwLock<mnemo_hnsw::index::HnswIndex>,
) -> Result<Vec<Change>> {
    let mut changes = meta.write().take_dirty_changes()?;
    changes.extend(graph.write().take_dirty_changes()?);
    let records = hnsw.write().take_log();
    if !records.is_empty() {
        let existing = match cow.lookup(cx, paths::HNSW_LOG) {
            Ok(bytes) => bytes,
            Err(MnemoError::NotFound { .. }) => Vec::new(),
            Err(err) => return Err(err),
        };
        changes.push(Change::put(
            paths::HNSW_LOG,
            mnemo_hnsw::persist::encode_log_records(&existing, &records),
        ));
    }
    Ok(changes)
}

fn wrap_batch(label: &'static str, ops: Vec<Box<dyn Operation>>) -> FnOperation {
    let mut batch = BatchOperation::new(label, ops);
    FnOperation::new(label, move |cx| batch.execute(cx))
}

/// Metadata keys become index fields and storage path segments, so the
/// accepted alphabet is restricted; dots are reserved for query-side
/// nested addressing.
pub(crate) fn validate_metadata(metadata: &Map<String, Value>) -> Result<()> {
    for (key, value) in metadata {
        validate_field_name(key)?;
        validate_nested(value)?;
    }
    Ok(())
}

fn validate_nested(value: &Value) -> Result<()> {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                validate_field_name(key)?;
                validate_nested(nested)?;
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(validate_nested),
        _ => Ok(()),
    }
}

fn validate_field_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(MnemoError::invalid("metadata field name", name))
    }
}
