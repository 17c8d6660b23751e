//! The HNSW graph: insertion, search, soft deletion, compaction.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use hashbrown::{HashMap, HashSet};
use smallvec::SmallVec;
use tracing::debug;

use mnemo_error::{MnemoError, Result};
use mnemo_types::{Cx, Metric, RngSource, Uid, Vector};

use crate::persist::LogRecord;

/// Highest permitted level; geometric sampling effectively never reaches it.
pub(crate) const MAX_LEVEL: u8 = 31;

/// Tuning parameters.
#[derive(Debug, Clone, Copy)]
pub struct HnswParams {
    /// Max neighbors per node per level (above level 0).
    pub m: usize,
    /// Max neighbors at level 0 (conventionally `2 · m`).
    pub m0: usize,
    /// Candidate list size during insertion.
    pub ef_construction: usize,
    /// Default candidate list size during search.
    pub ef_search: usize,
    pub metric: Metric,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            m0: 32,
            ef_construction: 200,
            ef_search: 64,
            metric: Metric::Cosine,
        }
    }
}

impl HnswParams {
    fn max_neighbors(&self, level: u8) -> usize {
        if level == 0 { self.m0 } else { self.m }
    }
}

pub(crate) struct Node {
    pub(crate) id: Uid,
    /// `None` only for tombstoned nodes whose payload is already gone.
    pub(crate) vector: Option<Vector>,
    pub(crate) level: u8,
    /// `neighbors[l]` holds the adjacency at level `l`, `0 ..= level`.
    pub(crate) neighbors: Vec<SmallVec<[u32; 32]>>,
    pub(crate) deleted: bool,
}

/// One search result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub id: Uid,
    pub distance: f32,
}

/// Distance-ordered heap element; ties break on ascending node index so
/// identical inputs always produce identical orderings.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Scored {
    dist: f32,
    idx: u32,
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.idx.cmp(&other.idx))
    }
}

/// The index.
pub struct HnswIndex {
    params: HnswParams,
    dim: usize,
    pub(crate) nodes: Vec<Node>,
    by_id: HashMap<Uid, u32>,
    pub(crate) entry: Option<u32>,
    /// Mutations since the last checkpoint, to append to `hnsw/log`.
    log: Vec<LogRecord>,
}

impl HnswIndex {
    #[must_use]
    pub fn new(params: HnswParams, dim: usize) -> Self {
        Self {
            params,
            dim,
            nodes: Vec::new(),
            by_id: HashMap::new(),
            entry: None,
            log: Vec::new(),
        }
    }

    /// Configured parameters.
    #[must_use]
    pub const fn params(&self) -> &HnswParams {
        &self.params
    }

    /// Vector dimensionality this index accepts.
    #[must_use]
    pub const fn dim(&self) -> usize {
        self.dim
    }

    /// Live (non-tombstoned) node count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| !n.deleted).count()
    }

    /// Whether no live node exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tombstoned node count (kept until [`HnswIndex::compact`]).
    #[must_use]
    pub fn tombstone_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.deleted).count()
    }

    /// Whether `id` is indexed and live.
    #[must_use]
    pub fn contains(&self, id: Uid) -> bool {
        self.by_id
            .get(&id)
            .is_some_and(|&idx| !self.nodes[idx as usize].deleted)
    }

    /// The stored vector for a live node.
    #[must_use]
    pub fn vector_of(&self, id: Uid) -> Option<&Vector> {
        let &idx = self.by_id.get(&id)?;
        let node = &self.nodes[idx as usize];
        if node.deleted { None } else { node.vector.as_ref() }
    }

    /// Drain mutations pending since the last checkpoint.
    pub fn take_log(&mut self) -> Vec<LogRecord> {
        std::mem::take(&mut self.log)
    }

    /// Drop all state (rebuild preamble).
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.by_id.clear();
        self.entry = None;
        self.log.clear();
    }

    /// Draw an insertion level from the geometric distribution with
    /// parameter `1 / ln(M)`.
    #[must_use]
    pub fn sample_level(&self, rng: &dyn RngSource) -> u8 {
        let u = rng.next_unit_open();
        let level = (-u.ln() / (self.params.m as f64).ln()).floor();
        if level.is_finite() {
            (level as u64).min(u64::from(MAX_LEVEL)) as u8
        } else {
            MAX_LEVEL
        }
    }

    /// Insert a vector at a sampled level.
    pub fn insert(&mut self, cx: &Cx, id: Uid, vector: Vector, rng: &dyn RngSource) -> Result<()> {
        let level = self.sample_level(rng);
        self.insert_at_level(cx, id, vector, level)?;
        self.log.push(LogRecord::Insert { id, level });
        Ok(())
    }

    /// Insert with an explicit level (log replay and compaction).
    pub fn insert_at_level(&mut self, cx: &Cx, id: Uid, vector: Vector, level: u8) -> Result<()> {
        if vector.dim() != self.dim {
            return Err(MnemoError::Integrity {
                what: "vector",
                detail: format!("dimension {} != index dimension {}", vector.dim(), self.dim),
            });
        }
        if self.contains(id) {
            return Err(MnemoError::AlreadyExists {
                what: "hnsw node",
                key: id.to_hex(),
            });
        }

        let idx = self.nodes.len() as u32;
        self.nodes.push(Node {
            id,
            vector: Some(vector),
            level,
            neighbors: vec![SmallVec::new(); usize::from(level) + 1],
            deleted: false,
        });
        self.by_id.insert(id, idx);

        let Some(entry) = self.entry else {
            self.entry = Some(idx);
            return Ok(());
        };
        let entry_level = self.nodes[entry as usize].level;
        let query = self.nodes[idx as usize]
            .vector
            .clone()
            .unwrap_or_else(|| unreachable!("freshly inserted node has a vector"));

        // Greedy descent through levels above the insertion level.
        let mut ep = vec![entry];
        let mut current = entry_level;
        while current > level {
            ep = self
                .search_layer(cx, &query, &ep, 1, current, None)?
                .into_iter()
                .map(|s| s.idx)
                .collect();
            if ep.is_empty() {
                ep = vec![entry];
            }
            current -= 1;
        }

        // Link from min(level, entry_level) down to 0.
        let mut link_level = level.min(entry_level);
        loop {
            cx.checkpoint_with("hnsw insert")?;
            let candidates = self.search_layer(
                cx,
                &query,
                &ep,
                self.params.ef_construction,
                link_level,
                None,
            )?;
            let max = self.params.max_neighbors(link_level);
            let selected = self.select_neighbors(&candidates, max);
            for &neighbor in &selected {
                self.link(idx, neighbor, link_level);
                self.link(neighbor, idx, link_level);
                self.shrink_if_needed(neighbor, link_level);
            }
            ep = if selected.is_empty() {
                ep
            } else {
                candidates.iter().map(|s| s.idx).collect()
            };
            if link_level == 0 {
                break;
            }
            link_level -= 1;
        }

        if level > entry_level {
            self.entry = Some(idx);
            debug!(id = %id, level, "hnsw entry point raised");
        }
        Ok(())
    }

    /// Soft-delete: mark the node, strip its edges. The slot survives until
    /// compaction so checkpoint indexes stay stable.
    pub fn remove(&mut self, id: Uid) -> bool {
        let Some(&idx) = self.by_id.get(&id) else {
            return false;
        };
        if self.nodes[idx as usize].deleted {
            return false;
        }
        let levels: Vec<(u8, Vec<u32>)> = self.nodes[idx as usize]
            .neighbors
            .iter()
            .enumerate()
            .map(|(l, ns)| (l as u8, ns.to_vec()))
            .collect();
        for (level, neighbors) in levels {
            for n in neighbors {
                let list = &mut self.nodes[n as usize].neighbors[usize::from(level)];
                list.retain(|&mut x| x != idx);
            }
        }
        let node = &mut self.nodes[idx as usize];
        node.deleted = true;
        node.vector = None;
        node.neighbors.iter_mut().for_each(SmallVec::clear);
        self.log.push(LogRecord::Delete { id });

        if self.entry == Some(idx) {
            self.entry = self.pick_live_entry();
        }
        true
    }

    /// Nearest live nodes to `query`, optionally filtered.
    pub fn search(
        &self,
        cx: &Cx,
        query: &Vector,
        k: usize,
        ef_override: Option<usize>,
        filter: Option<&dyn Fn(Uid) -> bool>,
    ) -> Result<Vec<SearchHit>> {
        if query.dim() != self.dim {
            return Err(MnemoError::Integrity {
                what: "query vector",
                detail: format!("dimension {} != index dimension {}", query.dim(), self.dim),
            });
        }
        let Some(entry) = self.entry else {
            return Ok(Vec::new());
        };
        let ef = ef_override.unwrap_or(self.params.ef_search).max(k);

        // Greedy single-neighbor descent to level 1.
        let mut ep = vec![entry];
        let mut level = self.nodes[entry as usize].level;
        while level > 0 {
            ep = self
                .search_layer(cx, query, &ep, 1, level, None)?
                .into_iter()
                .map(|s| s.idx)
                .collect();
            if ep.is_empty() {
                ep = vec![entry];
            }
            level -= 1;
        }

        let hits = self.search_layer(cx, query, &ep, ef, 0, filter)?;
        Ok(hits
            .into_iter()
            .take(k)
            .map(|s| SearchHit {
                id: self.nodes[s.idx as usize].id,
                distance: s.dist,
            })
            .collect())
    }

    /// Rebuild the graph from live nodes, dropping tombstones and
    /// repairing neighborhoods. Levels are preserved and nodes re-inserted
    /// in ascending id order, so the result is deterministic.
    pub fn compact(&mut self, cx: &Cx) -> Result<usize> {
        let dropped = self.tombstone_count();
        if dropped == 0 {
            return Ok(0);
        }
        let mut live: Vec<(Uid, u8, Vector)> = self
            .nodes
            .iter()
            .filter(|n| !n.deleted)
            .filter_map(|n| n.vector.clone().map(|v| (n.id, n.level, v)))
            .collect();
        live.sort_by_key(|(id, _, _)| *id);

        self.nodes.clear();
        self.by_id.clear();
        self.entry = None;
        for (id, level, vector) in live {
            self.insert_at_level(cx, id, vector, level)?;
        }
        // Compaction is always followed by a checkpoint; pending log
        // records are superseded by it.
        self.log.clear();
        debug!(dropped, live = self.nodes.len(), "hnsw compacted");
        Ok(dropped)
    }

    /// Every live `(id, level)`, ascending id (checkpoint order).
    #[must_use]
    pub fn live_nodes(&self) -> Vec<(Uid, u8)> {
        let mut out: Vec<(Uid, u8)> = self
            .nodes
            .iter()
            .filter(|n| !n.deleted)
            .map(|n| (n.id, n.level))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Register an id→slot mapping (checkpoint restore path).
    pub(crate) fn register(&mut self, id: Uid, idx: u32) {
        self.by_id.insert(id, idx);
    }

    pub(crate) fn pick_live_entry(&self) -> Option<u32> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.deleted)
            .max_by(|(ai, a), (bi, b)| {
                a.level
                    .cmp(&b.level)
                    .then_with(|| bi.cmp(ai)) // prefer the lower index on ties
            })
            .map(|(i, _)| i as u32)
    }

    fn distance(&self, query: &Vector, idx: u32) -> f32 {
        self.nodes[idx as usize]
            .vector
            .as_ref()
            .map_or(f32::INFINITY, |v| query.distance(v, self.params.metric))
    }

    /// Bounded best-first search over one layer. Results exclude deleted
    /// nodes and those rejected by `filter`; returned ascending by
    /// `(distance, index)`.
    fn search_layer(
        &self,
        cx: &Cx,
        query: &Vector,
        entry_points: &[u32],
        ef: usize,
        level: u8,
        filter: Option<&dyn Fn(Uid) -> bool>,
    ) -> Result<Vec<Scored>> {
        cx.checkpoint_with("hnsw search")?;
        let passes = |idx: u32| {
            let node = &self.nodes[idx as usize];
            !node.deleted && filter.is_none_or(|f| f(node.id))
        };

        let mut visited: HashSet<u32> = entry_points.iter().copied().collect();
        let mut candidates: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();
        let mut results: BinaryHeap<Scored> = BinaryHeap::new();
        for &ep in entry_points {
            let scored = Scored {
                dist: self.distance(query, ep),
                idx: ep,
            };
            candidates.push(Reverse(scored));
            if passes(ep) {
                results.push(scored);
            }
        }

        while let Some(Reverse(current)) = candidates.pop() {
            let bound = if results.len() >= ef {
                results.peek().map_or(f32::INFINITY, |w| w.dist)
            } else {
                f32::INFINITY
            };
            if current.dist > bound {
                break;
            }
            let neighbors = match self.nodes[current.idx as usize]
                .neighbors
                .get(usize::from(level))
            {
                Some(ns) => ns.clone(),
                None => continue,
            };
            for n in neighbors {
                if !visited.insert(n) {
                    continue;
                }
                let d = self.distance(query, n);
                let bound = if results.len() >= ef {
                    results.peek().map_or(f32::INFINITY, |w| w.dist)
                } else {
                    f32::INFINITY
                };
                if d < bound || results.len() < ef {
                    candidates.push(Reverse(Scored { dist: d, idx: n }));
                    if passes(n) {
                        results.push(Scored { dist: d, idx: n });
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        let mut out = results.into_vec();
        out.sort();
        Ok(out)
    }

    /// Diversity-preserving neighbor selection: a candidate is kept when it
    /// sits closer to the query than to every already-selected neighbor;
    /// remaining slots fill from the skipped list in distance order. Ties
    /// break on ascending node id.
    fn select_neighbors(&self, candidates: &[Scored], max: usize) -> Vec<u32> {
        let mut ordered: Vec<Scored> = candidates.to_vec();
        ordered.sort_by(|a, b| {
            a.dist.total_cmp(&b.dist).then_with(|| {
                self.nodes[a.idx as usize]
                    .id
                    .cmp(&self.nodes[b.idx as usize].id)
            })
        });

        let mut selected: Vec<Scored> = Vec::with_capacity(max);
        let mut skipped: Vec<Scored> = Vec::new();
        for &candidate in &ordered {
            if selected.len() >= max {
                break;
            }
            let Some(cand_vec) = self.nodes[candidate.idx as usize].vector.as_ref() else {
                continue;
            };
            let diverse = selected.iter().all(|s| {
                self.nodes[s.idx as usize]
                    .vector
                    .as_ref()
                    .is_none_or(|sv| candidate.dist < cand_vec.distance(sv, self.params.metric))
            });
            if diverse {
                selected.push(candidate);
            } else {
                skipped.push(candidate);
            }
        }
        for candidate in skipped {
            if selected.len() >= max {
                break;
            }
            selected.push(candidate);
        }
        selected.into_iter().map(|s| s.idx).collect()
    }

    fn link(&mut self, from: u32, to: u32, level: u8) {
        if from == to {
            return;
        }
        let list = &mut self.nodes[from as usize].neighbors[usize::from(level)];
        if !list.contains(&to) {
            list.push(to);
        }
    }

    /// Re-select a node's neighbor list when it exceeds the level cap.
    fn shrink_if_needed(&mut self, idx: u32, level: u8) {
        let max = self.params.max_neighbors(level);
        let list = self.nodes[idx as usize].neighbors[usize::from(level)].clone();
        if list.len() <= max {
            return;
        }
        let Some(own) = self.nodes[idx as usize].vector.clone() else {
            return;
        };
        let mut scored: Vec<Scored> = list
            .iter()
            .map(|&n| Scored {
                dist: self.distance(&own, n),
                idx: n,
            })
            .collect();
        scored.sort();
        let kept = self.select_neighbors(&scored, max);
        self.nodes[idx as usize].neighbors[usize::from(level)] = kept.into_iter().collect();
    }
}
