//! Typed, directed adjacency index over relationships.
//!
//! A rebuildable projection: the authoritative record of a relationship is
//! its verb blob in the COW store. Persisted per entity at
//! `graph/<shard>/<id>` so warm processes can skip the verb scan.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use mnemo_cow::{Change, CowStore};
use mnemo_error::{MnemoError, Result};
use mnemo_types::{Cx, Uid, Verb, VerbKind};

/// Traversal direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

/// One traversal hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborHit {
    pub id: Uid,
    pub verb_id: Uid,
    pub kind: VerbKind,
    /// BFS depth at which the neighbor was reached (1 = direct).
    pub depth: u32,
}

#[derive(Default, Clone)]
struct Adjacency {
    /// kind → neighbor id → verb id.
    out: BTreeMap<VerbKind, BTreeMap<Uid, Uid>>,
    inc: BTreeMap<VerbKind, BTreeMap<Uid, Uid>>,
}

impl Adjacency {
    fn is_empty(&self) -> bool {
        self.out.is_empty() && self.inc.is_empty()
    }
}

/// Serialized adjacency for one entity.
#[derive(Debug, Serialize, Deserialize)]
struct AdjacencyFile {
    id: Uid,
    out: BTreeMap<VerbKind, Vec<(Uid, Uid)>>,
    #[serde(rename = "in")]
    inc: BTreeMap<VerbKind, Vec<(Uid, Uid)>>,
}

/// Endpoint summary kept per verb for O(1) removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerbEdge {
    pub from: Uid,
    pub to: Uid,
    pub kind: VerbKind,
}

/// The adjacency index.
#[derive(Default)]
pub struct GraphIndex {
    adj: HashMap<Uid, Adjacency>,
    verbs: HashMap<Uid, VerbEdge>,
    dirty: BTreeSet<Uid>,
}

impl GraphIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed relationships.
    #[must_use]
    pub fn verb_count(&self) -> usize {
        self.verbs.len()
    }

    /// Drop all state (rebuild preamble).
    pub fn clear(&mut self) {
        self.adj.clear();
        self.verbs.clear();
        self.dirty.clear();
    }

    /// Index a relationship (one outgoing and one incoming entry).
    pub fn insert(&mut self, verb: &Verb) {
        self.verbs.insert(
            verb.id,
            VerbEdge {
                from: verb.from_id,
                to: verb.to_id,
                kind: verb.kind,
            },
        );
        self.adj
            .entry(verb.from_id)
            .or_default()
            .out
            .entry(verb.kind)
            .or_default()
            .insert(verb.to_id, verb.id);
        self.adj
            .entry(verb.to_id)
            .or_default()
            .inc
            .entry(verb.kind)
            .or_default()
            .insert(verb.from_id, verb.id);
        self.dirty.insert(verb.from_id);
        self.dirty.insert(verb.to_id);
    }

    /// Unindex a relationship by id, returning its endpoints.
    pub fn remove(&mut self, verb_id: Uid) -> Option<VerbEdge> {
        let edge = self.verbs.remove(&verb_id)?;
        if let Some(adj) = self.adj.get_mut(&edge.from) {
            if let Some(kinds) = adj.out.get_mut(&edge.kind) {
                kinds.remove(&edge.to);
                if kinds.is_empty() {
                    adj.out.remove(&edge.kind);
                }
            }
            if adj.is_empty() {
                self.adj.remove(&edge.from);
            }
        }
        if let Some(adj) = self.adj.get_mut(&edge.to) {
            if let Some(kinds) = adj.inc.get_mut(&edge.kind) {
                kinds.remove(&edge.from);
                if kinds.is_empty() {
                    adj.inc.remove(&edge.kind);
                }
            }
            if adj.is_empty() {
                self.adj.remove(&edge.to);
            }
        }
        self.dirty.insert(edge.from);
        self.dirty.insert(edge.to);
        Some(edge)
    }

    /// Kind of every indexed verb (with multiplicity), for counts tallies.
    #[must_use]
    pub fn verb_kinds(&self) -> Vec<VerbKind> {
        self.verbs.values().map(|e| e.kind).collect()
    }

    /// The existing verb id for `(from, kind, to)`, for uniqueness merges.
    #[must_use]
    pub fn find_edge(&self, from: Uid, kind: VerbKind, to: Uid) -> Option<Uid> {
        self.adj
            .get(&from)?
            .out
            .get(&kind)?
            .get(&to)
            .copied()
    }

    /// Every verb id incident to an entity (for delete cascades).
    #[must_use]
    pub fn incident_verbs(&self, id: Uid) -> Vec<Uid> {
        let Some(adj) = self.adj.get(&id) else {
            return Vec::new();
        };
        let mut out: Vec<Uid> = adj
            .out
            .values()
            .chain(adj.inc.values())
            .flat_map(|m| m.values().copied())
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Neighbors of `id`, optionally filtered by kind, with bounded BFS for
    /// `depth > 1`. Visited entities are deduplicated; results carry the
    /// depth at which each neighbor was first reached.
    pub fn neighbors(
        &self,
        cx: &Cx,
        id: Uid,
        direction: Direction,
        kind: Option<VerbKind>,
        depth: u32,
        limit: usize,
    ) -> Result<Vec<NeighborHit>> {
        let depth = depth.max(1);
        let mut visited: BTreeSet<Uid> = BTreeSet::from([id]);
        let mut frontier: VecDeque<(Uid, u32)> = VecDeque::from([(id, 0)]);
        let mut hits = Vec::new();

        while let Some((current, level)) = frontier.pop_front() {
            cx.checkpoint_with("graph traversal")?;
            if level >= depth {
                continue;
            }
            let Some(adj) = self.adj.get(&current) else {
                continue;
            };
            let mut step = |maps: &BTreeMap<VerbKind, BTreeMap<Uid, Uid>>| {
                for (&verb_kind, edges) in maps {
                    if kind.is_some_and(|k| k != verb_kind) {
                        continue;
                    }
                    for (&neighbor, &verb_id) in edges {
                        if !visited.insert(neighbor) {
                            continue;
                        }
                        hits.push(NeighborHit {
                            id: neighbor,
                            verb_id,
                            kind: verb_kind,
                            depth: level + 1,
                        });
                        frontier.push_back((neighbor, level + 1));
                    }
                }
            };
            match direction {
                Direction::Outgoing => step(&adj.out),
                Direction::Incoming => step(&adj.inc),
                Direction::Both => {
                    step(&adj.out);
                    step(&adj.inc);
                }
            }
            if hits.len() >= limit {
                hits.truncate(limit);
                break;
            }
        }
        Ok(hits)
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Logical path of an entity's adjacency file.
    #[must_use]
    pub fn adjacency_path(id: Uid) -> String {
        format!("graph/{}/{}", id.shard(), id)
    }

    /// Drain dirty entities into COW changes.
    pub fn take_dirty_changes(&mut self) -> Result<Vec<Change>> {
        let dirty = std::mem::take(&mut self.dirty);
        let mut changes = Vec::with_capacity(dirty.len());
        for id in dirty {
            let path = Self::adjacency_path(id);
            match self.adj.get(&id) {
                None => changes.push(Change::delete(path)),
                Some(adj) => {
                    let file = AdjacencyFile {
                        id,
                        out: adj
                            .out
                            .iter()
                            .map(|(k, m)| (*k, m.iter().map(|(n, v)| (*n, *v)).collect()))
                            .collect(),
                        inc: adj
                            .inc
                            .iter()
                            .map(|(k, m)| (*k, m.iter().map(|(n, v)| (*n, *v)).collect()))
                            .collect(),
                    };
                    let bytes = serde_json::to_vec(&file).map_err(MnemoError::internal)?;
                    changes.push(Change::put(path, bytes));
                }
            }
        }
        Ok(changes)
    }

    /// Load the persisted projection; returns adjacency files read.
    pub fn load_projection(&mut self, cx: &Cx, store: &CowStore) -> Result<usize> {
        self.clear();
        let mut offset = 0_usize;
        let mut files = 0_usize;
        loop {
            let paths = store.scan_paths(cx, "graph/", offset, 512)?;
            if paths.is_empty() {
                break;
            }
            offset += paths.len();
            for path in &paths {
                let bytes = store.lookup(cx, path)?;
                let file: AdjacencyFile =
                    serde_json::from_slice(&bytes).map_err(|err| MnemoError::Integrity {
                        what: "adjacency file",
                        detail: format!("{path}: {err}"),
                    })?;
                let adj = self.adj.entry(file.id).or_default();
                for (kind, edges) in file.out {
                    for (neighbor, verb_id) in edges {
                        adj.out.entry(kind).or_default().insert(neighbor, verb_id);
                        self.verbs.insert(
                            verb_id,
                            VerbEdge {
                                from: file.id,
                                to: neighbor,
                                kind,
                            },
                        );
                    }
                }
                for (kind, edges) in file.inc {
                    for (neighbor, verb_id) in edges {
                        adj.inc.entry(kind).or_default().insert(neighbor, verb_id);
                    }
                }
                files += 1;
            }
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(n: u8) -> Uid {
        Uid::from_bytes([n; 16])
    }

    fn verb(id: u8, from: u8, to: u8, kind: VerbKind) -> Verb {
        Verb {
            id: uid(id),
            from_id: uid(from),
            to_id: uid(to),
            kind,
            weight: None,
            confidence: None,
            metadata: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_insert_creates_both_directions() {
        let mut g = GraphIndex::new();
        g.insert(&verb(10, 1, 2, VerbKind::Knows));
        let cx = Cx::new();
        let out = g
            .neighbors(&cx, uid(1), Direction::Outgoing, None, 1, 10)
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, uid(2));
        assert_eq!(out[0].verb_id, uid(10));
        let inc = g
            .neighbors(&cx, uid(2), Direction::Incoming, None, 1, 10)
            .unwrap();
        assert_eq!(inc.len(), 1);
        assert_eq!(inc[0].id, uid(1), "case=incoming_mirror");
    }

    #[test]
    fn test_kind_filter() {
        let mut g = GraphIndex::new();
        g.insert(&verb(10, 1, 2, VerbKind::Knows));
        g.insert(&verb(11, 1, 3, VerbKind::Manages));
        let cx = Cx::new();
        let hits = g
            .neighbors(&cx, uid(1), Direction::Outgoing, Some(VerbKind::Manages), 1, 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, uid(3));
    }

    #[test]
    fn test_bfs_depth_two_dedups_visited() {
        let mut g = GraphIndex::new();
        g.insert(&verb(10, 1, 2, VerbKind::Knows));
        g.insert(&verb(11, 2, 3, VerbKind::Knows));
        // Back edge to an already-visited entity.
        g.insert(&verb(12, 2, 1, VerbKind::Knows));
        let cx = Cx::new();
        let hits = g
            .neighbors(&cx, uid(1), Direction::Outgoing, None, 2, 10)
            .unwrap();
        let ids: Vec<Uid> = hits.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![uid(2), uid(3)], "case=no_revisit");
        assert_eq!(hits[1].depth, 2);
    }

    #[test]
    fn test_limit_bounds_result() {
        let mut g = GraphIndex::new();
        for i in 2..12 {
            g.insert(&verb(100 + i, 1, i, VerbKind::Mentions));
        }
        let cx = Cx::new();
        let hits = g
            .neighbors(&cx, uid(1), Direction::Outgoing, None, 1, 4)
            .unwrap();
        assert_eq!(hits.len(), 4);
    }

    #[test]
    fn test_find_edge_for_uniqueness() {
        let mut g = GraphIndex::new();
        g.insert(&verb(10, 1, 2, VerbKind::Knows));
        assert_eq!(g.find_edge(uid(1), VerbKind::Knows, uid(2)), Some(uid(10)));
        assert_eq!(g.find_edge(uid(1), VerbKind::Manages, uid(2)), None);
        assert_eq!(g.find_edge(uid(2), VerbKind::Knows, uid(1)), None, "case=directed");
    }

    #[test]
    fn test_remove_cleans_both_sides() {
        let mut g = GraphIndex::new();
        g.insert(&verb(10, 1, 2, VerbKind::Knows));
        let edge = g.remove(uid(10)).unwrap();
        assert_eq!(edge.from, uid(1));
        assert_eq!(edge.to, uid(2));
        let cx = Cx::new();
        assert!(
            g.neighbors(&cx, uid(1), Direction::Both, None, 1, 10)
                .unwrap()
                .is_empty()
        );
        assert_eq!(g.verb_count(), 0);
        assert!(g.remove(uid(10)).is_none(), "case=idempotent");
    }

    #[test]
    fn test_incident_verbs_for_cascade() {
        let mut g = GraphIndex::new();
        g.insert(&verb(10, 1, 2, VerbKind::Knows));
        g.insert(&verb(11, 3, 1, VerbKind::Manages));
        let incident = g.incident_verbs(uid(1));
        assert_eq!(incident, vec![uid(10), uid(11)]);
    }

    #[test]
    fn test_projection_round_trip() {
        use mnemo_backend::MemoryBackend;
        use mnemo_cow::{CowConfig, CowStore};
        use std::sync::Arc;

        let mut g = GraphIndex::new();
        g.insert(&verb(10, 1, 2, VerbKind::Knows));
        g.insert(&verb(11, 2, 3, VerbKind::Manages));

        let store = CowStore::open(
            Arc::new(MemoryBackend::new()),
            Arc::new(mnemo_types::SystemClock),
            CowConfig::default(),
        );
        let cx = Cx::new();
        store.commit(&cx, g.take_dirty_changes().unwrap()).unwrap();

        let mut restored = GraphIndex::new();
        let files = restored.load_projection(&cx, &store).unwrap();
        assert_eq!(files, 3, "case=three_entities_touched");
        assert_eq!(restored.verb_count(), 2);
        assert_eq!(
            restored.find_edge(uid(1), VerbKind::Knows, uid(2)),
            Some(uid(10))
        );
        let hits = restored
            .neighbors(&cx, uid(1), Direction::Outgoing, None, 2, 10)
            .unwrap();
        assert_eq!(hits.len(), 2, "case=two_hop_after_restore");
    }
}
