//! Read API: get, find, similar, neighbors, duplicate detection,
//! clustering, stats.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use mnemo_cache::CacheUsage;
use mnemo_error::{MnemoError, Result};
use mnemo_index::graph::{Direction, NeighborHit};
use mnemo_index::predicate::Predicate;
use mnemo_types::{Cx, Metric, Noun, NounKind, Uid, Vector, VerbKind};

use crate::store::Storage;

/// Graph constraint for [`FindQuery`]: keep only entities reachable from
/// `id` within `depth` hops.
#[derive(Debug, Clone, Copy)]
pub struct RelatedFilter {
    pub id: Uid,
    pub direction: Direction,
    pub kind: Option<VerbKind>,
    pub depth: u32,
}

/// Input to [`Storage::find`].
#[derive(Debug, Clone)]
pub struct FindQuery {
    /// Free-text query; when present, results rank by vector similarity.
    pub query: Option<String>,
    /// BFO predicate tree.
    pub where_clause: Option<Value>,
    /// Optional intersection with a graph neighborhood.
    pub related_to: Option<RelatedFilter>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for FindQuery {
    fn default() -> Self {
        Self {
            query: None,
            where_clause: None,
            related_to: None,
            limit: 20,
            offset: 0,
        }
    }
}

/// Input to [`Storage::similar`].
#[derive(Debug, Clone)]
pub struct SimilarQuery {
    /// Explicit query vector (unit length).
    pub vector: Option<Vec<f32>>,
    /// Use a stored entity's vector as the query.
    pub id: Option<Uid>,
    pub k: usize,
    /// Per-query `efSearch` override.
    pub ef: Option<usize>,
    pub where_clause: Option<Value>,
}

impl Default for SimilarQuery {
    fn default() -> Self {
        Self {
            vector: None,
            id: None,
            k: 10,
            ef: None,
            where_clause: None,
        }
    }
}

/// One [`Storage::similar`] result.
#[derive(Debug, Clone)]
pub struct SimilarHit {
    pub noun: Noun,
    /// `1 − distance` under cosine; negated distance otherwise.
    pub score: f32,
}

/// Options for [`Storage::neighbors`].
#[derive(Debug, Clone, Copy)]
pub struct NeighborsOptions {
    pub direction: Direction,
    pub kind: Option<VerbKind>,
    pub depth: u32,
    pub limit: usize,
}

impl Default for NeighborsOptions {
    fn default() -> Self {
        Self {
            direction: Direction::Outgoing,
            kind: None,
            depth: 1,
            limit: 50,
        }
    }
}

/// Options for [`Storage::find_duplicates`].
#[derive(Debug, Clone, Copy)]
pub struct DuplicateOptions {
    /// Minimum similarity score for a pair to count as duplicates.
    pub threshold: f32,
    pub limit: usize,
}

impl Default for DuplicateOptions {
    fn default() -> Self {
        Self {
            threshold: 0.92,
            limit: 100,
        }
    }
}

/// Options for [`Storage::cluster`].
#[derive(Debug, Clone, Copy)]
pub struct ClusterOptions {
    pub threshold: f32,
    pub min_size: usize,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            threshold: 0.85,
            min_size: 2,
        }
    }
}

/// Snapshot of index and cache state.
#[derive(Debug, Clone)]
pub struct IndexStats {
    pub entities: u64,
    pub relationships: u64,
    pub nouns_by_kind: BTreeMap<NounKind, u64>,
    pub verbs_by_kind: BTreeMap<VerbKind, u64>,
    pub hnsw_live: usize,
    pub hnsw_tombstones: usize,
    pub commit_seq: Option<u64>,
    pub cache: CacheUsage,
}

impl Storage {
    /// Read an entity by id.
    pub fn get(&self, cx: &Cx, id: Uid) -> Result<Option<Noun>> {
        self.ensure_ready()?;
        self.read_noun(cx, id)
    }

    /// Metadata-filtered (and optionally similarity-ranked) retrieval.
    pub fn find(&self, cx: &Cx, query: FindQuery) -> Result<Vec<Noun>> {
        self.ensure_ready()?;
        let mut candidates = self.candidate_set(query.where_clause.as_ref())?;
        if let Some(related) = &query.related_to {
            let hits = self.graph.read().neighbors(
                cx,
                related.id,
                related.direction,
                related.kind,
                related.depth.max(1),
                usize::MAX,
            )?;
            let neighborhood: BTreeSet<Uid> = hits.into_iter().map(|h| h.id).collect();
            candidates = Some(match candidates {
                Some(set) => set.intersection(&neighborhood).copied().collect(),
                None => neighborhood,
            });
        }
        if query.limit == 0 {
            return Ok(Vec::new());
        }

        if let Some(text) = &query.query {
            if candidates.as_ref().is_some_and(BTreeSet::is_empty) {
                return Ok(Vec::new());
            }
            let vector = self.embed_cached(cx, text)?;
            let filter = candidates
                .as_ref()
                .map(|set| move |id: Uid| set.contains(&id));
            let hits = self.hnsw.read().search(
                cx,
                &vector,
                query.offset + query.limit,
                None,
                filter
                    .as_ref()
                    .map(|f| f as &dyn Fn(Uid) -> bool),
            )?;
            let mut out = Vec::with_capacity(query.limit);
            for hit in hits.into_iter().skip(query.offset) {
                if let Some(noun) = self.read_noun(cx, hit.id)? {
                    out.push(noun);
                }
            }
            return Ok(out);
        }

        let ids = match candidates {
            Some(set) => set,
            None => self.meta.read().eval(&Predicate::All(Vec::new()))?,
        };
        let mut out = Vec::with_capacity(query.limit);
        for id in ids.into_iter().skip(query.offset).take(query.limit) {
            if let Some(noun) = self.read_noun(cx, id)? {
                out.push(noun);
            }
        }
        Ok(out)
    }

    /// Nearest neighbors by vector, intersected with a metadata candidate
    /// set when a `where` clause is given.
    pub fn similar(&self, cx: &Cx, query: SimilarQuery) -> Result<Vec<SimilarHit>> {
        self.ensure_ready()?;
        let vector = self.resolve_similar_vector(cx, &query)?;
        let candidates = self.candidate_set(query.where_clause.as_ref())?;
        if candidates.as_ref().is_some_and(BTreeSet::is_empty) {
            return Ok(Vec::new());
        }

        let filter = candidates
            .as_ref()
            .map(|set| move |id: Uid| set.contains(&id));
        let hits = self.hnsw.read().search(
            cx,
            &vector,
            query.k,
            query.ef,
            filter
                .as_ref()
                .map(|f| f as &dyn Fn(Uid) -> bool),
        )?;

        let metric = self.config.hnsw.metric;
        let mut out = Vec::with_capacity(hits.len());
        for hit in hits {
            if let Some(noun) = self.read_noun(cx, hit.id)? {
                out.push(SimilarHit {
                    noun,
                    score: score_of(metric, hit.distance),
                });
            }
        }
        Ok(out)
    }

    /// Graph traversal starting at `id`.
    pub fn neighbors(
        &self,
        cx: &Cx,
        id: Uid,
        options: NeighborsOptions,
    ) -> Result<Vec<NeighborHit>> {
        self.ensure_ready()?;
        self.graph.read().neighbors(
            cx,
            id,
            options.direction,
            options.kind,
            options.depth,
            options.limit,
        )
    }

    /// Pairs of entities whose vectors score above the duplicate
    /// threshold. Pairs are normalized `(low id, high id)` and deduplicated.
    pub fn find_duplicates(
        &self,
        cx: &Cx,
        options: DuplicateOptions,
    ) -> Result<Vec<(Uid, Uid, f32)>> {
        self.ensure_ready()?;
        let pairs = self.similar_pairs(cx, options.threshold, 6)?;
        Ok(pairs.into_iter().take(options.limit).collect())
    }

    /// Greedy similarity clustering: connected components of the
    /// above-threshold pair graph, smallest clusters dropped.
    pub fn cluster(&self, cx: &Cx, options: ClusterOptions) -> Result<Vec<Vec<Uid>>> {
        self.ensure_ready()?;
        let pairs = self.similar_pairs(cx, options.threshold, 8)?;

        let mut parent: BTreeMap<Uid, Uid> = BTreeMap::new();
        fn root(parent: &mut BTreeMap<Uid, Uid>, mut id: Uid) -> Uid {
            loop {
                let p = *parent.entry(id).or_insert(id);
                if p == id {
                    return id;
                }
                let gp = *parent.entry(p).or_insert(p);
                parent.insert(id, gp);
                id = gp;
            }
        }
        for (a, b, _) in &pairs {
            let ra = root(&mut parent, *a);
            let rb = root(&mut parent, *b);
            if ra != rb {
                parent.insert(ra.max(rb), ra.min(rb));
            }
        }

        let members: Vec<Uid> = parent.keys().copied().collect();
        let mut clusters: BTreeMap<Uid, Vec<Uid>> = BTreeMap::new();
        for id in members {
            let r = root(&mut parent, id);
            clusters.entry(r).or_default().push(id);
        }
        let mut out: Vec<Vec<Uid>> = clusters
            .into_values()
            .filter(|c| c.len() >= options.min_size)
            .collect();
        for cluster in &mut out {
            cluster.sort_unstable();
        }
        out.sort();
        Ok(out)
    }

    /// Counters, index sizes, commit position, cache usage.
    pub fn index_stats(&self, cx: &Cx) -> Result<IndexStats> {
        self.ensure_ready()?;
        let snapshot = self.counts.lock().snapshot();
        let (live, tombstones) = {
            let hnsw = self.hnsw.read();
            (hnsw.len(), hnsw.tombstone_count())
        };
        let commit_seq = self.cow.head_commit(cx)?.map(|(_, c)| c.seq);
        Ok(IndexStats {
            entities: snapshot.total_nouns,
            relationships: snapshot.total_verbs,
            nouns_by_kind: snapshot.nouns_by_kind,
            verbs_by_kind: snapshot.verbs_by_kind,
            hnsw_live: live,
            hnsw_tombstones: tombstones,
            commit_seq,
            cache: self.cache.usage(),
        })
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn candidate_set(&self, where_clause: Option<&Value>) -> Result<Option<BTreeSet<Uid>>> {
        let Some(clause) = where_clause else {
            return Ok(None);
        };
        let predicate = Predicate::parse(clause, self.config.allow_regex)?;
        Ok(Some(self.meta.read().eval(&predicate)?))
    }

    fn resolve_similar_vector(&self, cx: &Cx, query: &SimilarQuery) -> Result<Vector> {
        if let Some(raw) = &query.vector {
            return Vector::from_unit(raw.clone())
                .map_err(|err| MnemoError::invalid("query vector", err.to_string()));
        }
        if let Some(id) = query.id {
            if let Some(v) = self.hnsw.read().vector_of(id) {
                return Ok(v.clone());
            }
            return self.read_vector(cx, id, true);
        }
        Err(MnemoError::invalid(
            "similar query",
            "either `vector` or `id` is required",
        ))
    }

    /// All normalized above-threshold pairs, sorted by descending score.
    fn similar_pairs(
        &self,
        cx: &Cx,
        threshold: f32,
        per_node_k: usize,
    ) -> Result<Vec<(Uid, Uid, f32)>> {
        let metric = self.config.hnsw.metric;
        let hnsw = self.hnsw.read();
        let mut seen: BTreeMap<(Uid, Uid), f32> = BTreeMap::new();
        for (id, _level) in hnsw.live_nodes() {
            cx.checkpoint_with("duplicate scan")?;
            let Some(vector) = hnsw.vector_of(id).cloned() else {
                continue;
            };
            for hit in hnsw.search(cx, &vector, per_node_k, None, None)? {
                if hit.id == id {
                    continue;
                }
                let score = score_of(metric, hit.distance);
                if score < threshold {
                    continue;
                }
                let key = (id.min(hit.id), id.max(hit.id));
                let slot = seen.entry(key).or_insert(score);
                if score > *slot {
                    *slot = score;
                }
            }
        }
        let mut pairs: Vec<(Uid, Uid, f32)> = seen
            .into_iter()
            .map(|((a, b), score)| (a, b, score))
            .collect();
        pairs.sort_by(|x, y| y.2.total_cmp(&x.2));
        Ok(pairs)
    }
}

fn score_of(metric: Metric, distance: f32) -> f32 {
    match metric {
        Metric::Cosine => 1.0 - distance,
        Metric::Euclidean | Metric::Manhattan => -distance,
    }
}
