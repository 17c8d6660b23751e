//! End-to-end scenarios over the full facade stack.

mod common;

use std::sync::Arc;

use serde_json::json;

use mnemo_backend::MemoryBackend;
use mnemo_cow::{Change, CowConfig, CowStore};
use mnemo_store::{
    AddRequest, DuplicateOptions, FindQuery, NeighborsOptions, RelateRequest, SimilarQuery,
    UpdateRequest,
};
use mnemo_types::{Cx, NounKind, SystemClock, VerbKind};

use common::{DIM, FailingBackend, fresh_store, open_store, unit_vector};

fn person(data: &str) -> AddRequest {
    let mut request = AddRequest::new(NounKind::Person);
    request.data = Some(data.to_owned());
    request
}

#[test]
fn test_add_then_find_by_type() {
    // S1: a single Person is findable by its type filter.
    let store = fresh_store(1);
    let cx = Cx::new();
    let id = store.add(&cx, person("Alice Chen, product manager")).unwrap();

    let results = store
        .find(
            &cx,
            FindQuery {
                where_clause: Some(json!({"type": "Person"})),
                limit: 10,
                ..FindQuery::default()
            },
        )
        .unwrap();
    assert_eq!(results.len(), 1, "case=s1_exactly_one");
    assert_eq!(results[0].id, id, "case=s1_id_matches");
    store.close(&cx).unwrap();
}

#[test]
fn test_numeric_range_over_timestamps() {
    // S2: half-open range over millisecond timestamps.
    let store = fresh_store(2);
    let cx = Cx::new();
    let dates: [(i64, &str); 3] = [
        (1_707_955_200_000, "2024-02-15"),
        (1_710_892_800_000, "2024-03-20"),
        (1_714_521_600_000, "2024-05-01"),
    ];
    let mut march_id = None;
    for (ms, label) in dates {
        let mut request = AddRequest::new(NounKind::Event);
        request.data = Some(label.to_owned());
        request.metadata = match json!({"date": ms}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        let id = store.add(&cx, request).unwrap();
        if label == "2024-03-20" {
            march_id = Some(id);
        }
    }

    let march_start = 1_709_251_200_000_i64;
    let april_start = 1_711_929_600_000_i64;
    let hits = store
        .find(
            &cx,
            FindQuery {
                where_clause: Some(json!({
                    "date": {"greaterEqual": march_start, "less": april_start}
                })),
                limit: 10,
                ..FindQuery::default()
            },
        )
        .unwrap();
    assert_eq!(hits.len(), 1, "case=s2_exactly_march");
    assert_eq!(hits[0].id, march_id.unwrap());
    store.close(&cx).unwrap();
}

#[test]
fn test_similar_returns_query_vector_first() {
    // S3: among 1000 sphere points the query vector ranks itself first.
    let store = fresh_store(3);
    let cx = Cx::new();

    let mut vectors = Vec::with_capacity(1000);
    let mut ids = Vec::with_capacity(1000);
    for i in 0..1000_u64 {
        let v = unit_vector(10_000 + i);
        let mut request = AddRequest::new(NounKind::Concept);
        request.vector = Some(v.clone());
        ids.push(store.add(&cx, request).unwrap());
        vectors.push(v);
    }
    let probe = 123_usize;
    let q = vectors[probe].clone();

    let hits = store
        .similar(
            &cx,
            SimilarQuery {
                vector: Some(q.clone()),
                k: 5,
                ..SimilarQuery::default()
            },
        )
        .unwrap();
    assert_eq!(hits.len(), 5);
    assert_eq!(hits[0].noun.id, ids[probe], "case=s3_self_first");
    assert!(hits[0].score >= 0.999, "case=s3_self_score {}", hits[0].score);

    // Exact cosine ranking for comparison: every ANN hit must sit inside
    // the true top-20.
    let dot = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
    let mut exact: Vec<(f32, usize)> = vectors
        .iter()
        .enumerate()
        .map(|(i, v)| (1.0 - dot(&q, v), i))
        .collect();
    exact.sort_by(|a, b| a.0.total_cmp(&b.0));
    let top20: std::collections::HashSet<_> =
        exact.iter().take(20).map(|(_, i)| ids[*i]).collect();
    for hit in &hits[1..] {
        assert!(
            top20.contains(&hit.noun.id),
            "case=s3_ann_hit_within_exact_top20"
        );
    }
    store.close(&cx).unwrap();
}

#[test]
fn test_mid_transaction_failure_leaves_state_unchanged() {
    // S4: a failure after the entity write rolls everything back.
    let backend = Arc::new(FailingBackend::new());
    let store = open_store(Arc::clone(&backend) as Arc<dyn mnemo_backend::BlobBackend>, 4);
    let cx = Cx::new();

    let anchor = store.add(&cx, person("pre-existing")).unwrap();
    store.flush(&cx).unwrap();
    let stats_before = store.index_stats(&cx).unwrap();

    // An add issues two commits (entity, then index projections); failing
    // the second one fails the transaction after HNSW, metadata, and
    // counts all succeeded.
    backend.fail_nth_commit(2);
    let err = store.add(&cx, person("doomed")).unwrap_err();
    assert!(
        matches!(
            err.kind_name(),
            "TransactionExecutionError" | "TransactionRollbackError"
        ),
        "case=s4_error_kind got {}",
        err.kind_name()
    );

    let stats_after = store.index_stats(&cx).unwrap();
    assert_eq!(
        stats_after.entities, stats_before.entities,
        "case=s4_counts_unchanged"
    );
    assert_eq!(
        stats_after.hnsw_live, stats_before.hnsw_live,
        "case=s4_hnsw_unchanged"
    );
    let all = store
        .find(
            &cx,
            FindQuery {
                where_clause: Some(json!({"type": "Person"})),
                limit: 100,
                ..FindQuery::default()
            },
        )
        .unwrap();
    assert_eq!(all.len(), 1, "case=s4_only_anchor_findable");
    assert_eq!(all[0].id, anchor);
    store.close(&cx).unwrap();
}

#[test]
fn test_failure_at_first_commit_is_clean() {
    // S4 variant: failing the entity write itself leaves nothing behind.
    let backend = Arc::new(FailingBackend::new());
    let store = open_store(Arc::clone(&backend) as Arc<dyn mnemo_backend::BlobBackend>, 40);
    let cx = Cx::new();

    backend.fail_nth_commit(1);
    let err = store.add(&cx, person("doomed")).unwrap_err();
    assert_eq!(err.kind_name(), "TransactionExecutionError");
    let stats = store.index_stats(&cx).unwrap();
    assert_eq!(stats.entities, 0);
    assert_eq!(stats.hnsw_live, 0);
    store.close(&cx).unwrap();
}

#[test]
fn test_close_reopen_preserves_everything() {
    // S5: rebuild from storage matches the writer's view.
    let backend: Arc<dyn mnemo_backend::BlobBackend> = Arc::new(MemoryBackend::new());
    let cx = Cx::new();

    let store = open_store(Arc::clone(&backend), 5);
    let mut ids = Vec::new();
    for i in 0..100 {
        let mut request = person(&format!("person number {i}"));
        request.metadata = match json!({"ordinal": i}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        ids.push(store.add(&cx, request).unwrap());
    }
    for pair in ids.windows(2).take(50) {
        store
            .relate(
                &cx,
                RelateRequest {
                    from: pair[0],
                    to: pair[1],
                    kind: VerbKind::Knows,
                    weight: Some(0.5),
                    confidence: None,
                    metadata: None,
                },
            )
            .unwrap();
    }
    let probe = SimilarQuery {
        vector: Some(unit_vector(777)),
        k: 10,
        ..SimilarQuery::default()
    };
    let before_similar: Vec<_> = store
        .similar(&cx, probe.clone())
        .unwrap()
        .into_iter()
        .map(|h| h.noun.id)
        .collect();
    let before_stats = store.index_stats(&cx).unwrap();
    store.close(&cx).unwrap();

    let reopened = open_store(backend, 55);
    let after_stats = reopened.index_stats(&cx).unwrap();
    assert_eq!(after_stats.entities, 100, "case=s5_entities");
    assert_eq!(after_stats.relationships, 50, "case=s5_relationships");
    assert_eq!(after_stats.nouns_by_kind, before_stats.nouns_by_kind);

    for id in &ids {
        assert!(
            reopened.get(&cx, *id).unwrap().is_some(),
            "case=s5_get_{id}"
        );
    }
    let neighbors = reopened
        .neighbors(&cx, ids[0], NeighborsOptions::default())
        .unwrap();
    assert_eq!(neighbors.len(), 1);
    assert_eq!(neighbors[0].id, ids[1], "case=s5_graph_survives");

    let after_similar: Vec<_> = reopened
        .similar(&cx, probe)
        .unwrap()
        .into_iter()
        .map(|h| h.noun.id)
        .collect();
    assert_eq!(before_similar, after_similar, "case=s5_similar_identical");
    reopened.close(&cx).unwrap();
}

#[test]
fn test_corrupt_counts_blob_self_repairs_on_init() {
    // S6: a counts blob reduced to `{"totalNouns":0}` is rebuilt from scan.
    let backend: Arc<dyn mnemo_backend::BlobBackend> = Arc::new(MemoryBackend::new());
    let cx = Cx::new();

    let store = open_store(Arc::clone(&backend), 6);
    for i in 0..7 {
        store.add(&cx, person(&format!("p{i}"))).unwrap();
    }
    store.close(&cx).unwrap();

    // Corrupt the ledger out-of-band.
    let cow = CowStore::open(
        Arc::clone(&backend),
        Arc::new(SystemClock),
        CowConfig::default(),
    );
    cow.commit(
        &cx,
        vec![Change::put("counts", b"{\"totalNouns\": 0}".to_vec())],
    )
    .unwrap();
    cow.shutdown(&cx);

    let reopened = open_store(backend, 66);
    let stats = reopened.index_stats(&cx).unwrap();
    assert_eq!(stats.entities, 7, "case=s6_counts_repaired");
    assert_eq!(
        stats.nouns_by_kind.get(&NounKind::Person).copied(),
        Some(7),
        "case=s6_by_kind_repaired"
    );
    reopened.close(&cx).unwrap();
}

#[test]
fn test_relate_is_idempotent_and_merges() {
    let store = fresh_store(7);
    let cx = Cx::new();
    let a = store.add(&cx, person("a")).unwrap();
    let b = store.add(&cx, person("b")).unwrap();

    let first = store
        .relate(
            &cx,
            RelateRequest {
                from: a,
                to: b,
                kind: VerbKind::WorksWith,
                weight: Some(0.4),
                confidence: Some(0.8),
                metadata: None,
            },
        )
        .unwrap();
    let counts_after_first = store.index_stats(&cx).unwrap().relationships;

    let second = store
        .relate(
            &cx,
            RelateRequest {
                from: a,
                to: b,
                kind: VerbKind::WorksWith,
                weight: Some(0.9),
                confidence: None,
                metadata: None,
            },
        )
        .unwrap();
    assert_eq!(first, second, "case=same_verb_id");
    assert_eq!(
        store.index_stats(&cx).unwrap().relationships,
        counts_after_first,
        "case=counts_unchanged_on_reassert"
    );

    // Opposite direction is a distinct relationship.
    let reverse = store
        .relate(
            &cx,
            RelateRequest {
                from: b,
                to: a,
                kind: VerbKind::WorksWith,
                weight: None,
                confidence: None,
                metadata: None,
            },
        )
        .unwrap();
    assert_ne!(reverse, first, "case=directed_uniqueness");
    store.close(&cx).unwrap();
}

#[test]
fn test_relate_rejects_missing_endpoints() {
    let store = fresh_store(8);
    let cx = Cx::new();
    let a = store.add(&cx, person("a")).unwrap();
    let ghost = mnemo_types::Uid::parse("00000000000000000000000000000001").unwrap();
    let err = store
        .relate(
            &cx,
            RelateRequest {
                from: a,
                to: ghost,
                kind: VerbKind::Knows,
                weight: None,
                confidence: None,
                metadata: None,
            },
        )
        .unwrap_err();
    assert_eq!(err.kind_name(), "NotFound");
    store.close(&cx).unwrap();
}

#[test]
fn test_update_reembeds_on_data_change() {
    let store = fresh_store(9);
    let cx = Cx::new();
    let id = store.add(&cx, person("the original text")).unwrap();
    let before = store
        .similar(
            &cx,
            SimilarQuery {
                id: Some(id),
                k: 1,
                ..SimilarQuery::default()
            },
        )
        .unwrap();
    assert_eq!(before[0].noun.id, id);

    let mut update = UpdateRequest::new(id);
    update.data = Some("completely different words".to_owned());
    store.update(&cx, update).unwrap();

    let noun = store.get(&cx, id).unwrap().unwrap();
    assert_eq!(noun.data.as_deref(), Some("completely different words"));
    assert!(noun.updated_at >= noun.created_at);

    // The stored vector now matches the new text's embedding.
    let embedder = mnemo_store::HashingEmbedder::new(DIM);
    let expected = mnemo_types::Embedder::embed(&embedder, &cx, "completely different words")
        .unwrap();
    let hits = store
        .similar(
            &cx,
            SimilarQuery {
                vector: Some(expected.as_slice().to_vec()),
                k: 1,
                ..SimilarQuery::default()
            },
        )
        .unwrap();
    assert_eq!(hits[0].noun.id, id, "case=reembedded_vector_queryable");
    assert!(hits[0].score > 0.999, "case=exact_match_score");
    store.close(&cx).unwrap();
}

#[test]
fn test_metadata_only_update_keeps_vector() {
    let store = fresh_store(10);
    let cx = Cx::new();
    let id = store.add(&cx, person("stable text")).unwrap();

    let mut update = UpdateRequest::new(id);
    update.metadata = match json!({"title": "PM"}) {
        serde_json::Value::Object(map) => Some(map),
        _ => unreachable!(),
    };
    store.update(&cx, update).unwrap();

    let noun = store.get(&cx, id).unwrap().unwrap();
    assert_eq!(noun.metadata.get("title"), Some(&json!("PM")));
    assert_eq!(noun.merge_count, 1, "case=merge_count_incremented");

    let hits = store
        .find(
            &cx,
            FindQuery {
                where_clause: Some(json!({"title": "PM"})),
                ..FindQuery::default()
            },
        )
        .unwrap();
    assert_eq!(hits.len(), 1, "case=new_field_indexed");
    store.close(&cx).unwrap();
}

#[test]
fn test_delete_cascades_and_tombstones() {
    let store = fresh_store(11);
    let cx = Cx::new();
    let a = store.add(&cx, person("a")).unwrap();
    let b = store.add(&cx, person("b")).unwrap();
    store
        .relate(
            &cx,
            RelateRequest {
                from: a,
                to: b,
                kind: VerbKind::Knows,
                weight: None,
                confidence: None,
                metadata: None,
            },
        )
        .unwrap();

    store.delete(&cx, a).unwrap();
    assert!(store.get(&cx, a).unwrap().is_none(), "case=entity_gone");
    assert!(store.get(&cx, b).unwrap().is_some(), "case=peer_survives");
    let stats = store.index_stats(&cx).unwrap();
    assert_eq!(stats.entities, 1);
    assert_eq!(stats.relationships, 0, "case=cascade_removed_verb");
    assert_eq!(stats.hnsw_tombstones, 1, "case=tombstone_retained");
    assert!(
        store
            .neighbors(&cx, b, NeighborsOptions {
                direction: mnemo_index::graph::Direction::Incoming,
                ..NeighborsOptions::default()
            })
            .unwrap()
            .is_empty(),
        "case=adjacency_cleaned"
    );

    let dropped = store.compact(&cx).unwrap();
    assert_eq!(dropped, 1, "case=compact_drops_tombstone");
    assert_eq!(store.index_stats(&cx).unwrap().hnsw_tombstones, 0);
    store.close(&cx).unwrap();
}

#[test]
fn test_find_duplicates_spots_identical_vectors() {
    let store = fresh_store(12);
    let cx = Cx::new();
    let shared = unit_vector(42);
    let mut twin_ids = Vec::new();
    for _ in 0..2 {
        let mut request = AddRequest::new(NounKind::Document);
        request.vector = Some(shared.clone());
        twin_ids.push(store.add(&cx, request).unwrap());
    }
    for i in 0..30_u64 {
        let mut request = AddRequest::new(NounKind::Document);
        request.vector = Some(unit_vector(9000 + i));
        store.add(&cx, request).unwrap();
    }

    let pairs = store
        .find_duplicates(&cx, DuplicateOptions::default())
        .unwrap();
    let expected = (twin_ids[0].min(twin_ids[1]), twin_ids[0].max(twin_ids[1]));
    assert!(
        pairs
            .iter()
            .any(|(a, b, score)| (*a, *b) == expected && *score > 0.999),
        "case=twins_detected pairs={pairs:?}"
    );
    store.close(&cx).unwrap();
}

#[test]
fn test_neighbors_depth_two() {
    let store = fresh_store(13);
    let cx = Cx::new();
    let a = store.add(&cx, person("a")).unwrap();
    let b = store.add(&cx, person("b")).unwrap();
    let c = store.add(&cx, person("c")).unwrap();
    for (from, to) in [(a, b), (b, c)] {
        store
            .relate(
                &cx,
                RelateRequest {
                    from,
                    to,
                    kind: VerbKind::Manages,
                    weight: None,
                    confidence: None,
                    metadata: None,
                },
            )
            .unwrap();
    }
    let hits = store
        .neighbors(
            &cx,
            a,
            NeighborsOptions {
                depth: 2,
                ..NeighborsOptions::default()
            },
        )
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[1].id, c);
    assert_eq!(hits[1].depth, 2, "case=two_hops");
    store.close(&cx).unwrap();
}

#[test]
fn test_find_intersects_graph_neighborhood() {
    let store = fresh_store(16);
    let cx = Cx::new();
    let hub = store.add(&cx, person("hub")).unwrap();
    let friend = store.add(&cx, person("friend")).unwrap();
    let stranger = store.add(&cx, person("stranger")).unwrap();
    let _ = stranger;
    store
        .relate(
            &cx,
            RelateRequest {
                from: hub,
                to: friend,
                kind: VerbKind::Knows,
                weight: None,
                confidence: None,
                metadata: None,
            },
        )
        .unwrap();

    let hits = store
        .find(
            &cx,
            FindQuery {
                where_clause: Some(json!({"type": "Person"})),
                related_to: Some(mnemo_store::RelatedFilter {
                    id: hub,
                    direction: mnemo_index::graph::Direction::Outgoing,
                    kind: None,
                    depth: 1,
                }),
                limit: 10,
                ..FindQuery::default()
            },
        )
        .unwrap();
    assert_eq!(hits.len(), 1, "case=only_neighborhood");
    assert_eq!(hits[0].id, friend);
    store.close(&cx).unwrap();
}

#[test]
fn test_unknown_kind_suggestion_via_parse() {
    let err = NounKind::parse("Persn").unwrap_err();
    assert!(
        err.to_string().contains("did you mean `Person`?"),
        "case=suggestion_in_message"
    );
}

#[test]
fn test_periodic_counts_flusher_persists_without_explicit_flush() {
    use mnemo_store::{HashingEmbedder, Storage};
    use mnemo_types::StdRandom;

    let backend: Arc<dyn mnemo_backend::BlobBackend> = Arc::new(MemoryBackend::new());
    let mut config = common::test_config();
    config.counts_flush_interval = std::time::Duration::from_millis(20);
    let store = Storage::with_collaborators(
        Arc::clone(&backend),
        Arc::new(HashingEmbedder::new(DIM)),
        Arc::new(SystemClock),
        Arc::new(StdRandom::seeded(77)),
        config,
    )
    .unwrap();
    let cx = Cx::new();
    store.init(&cx).unwrap();
    store.add(&cx, person("flushed eventually")).unwrap();

    // Wait out a few flusher ticks, then read the blob through an
    // independent reader.
    std::thread::sleep(std::time::Duration::from_millis(300));
    let cow = CowStore::open(
        Arc::clone(&backend),
        Arc::new(SystemClock),
        CowConfig::default(),
    );
    let bytes = cow.lookup(&cx, "counts").unwrap();
    let ledger = mnemo_store::CountsLedger::from_bytes(&bytes).unwrap();
    assert_eq!(ledger.total_nouns(), 1, "case=flusher_persisted");
    cow.shutdown(&cx);
    store.close(&cx).unwrap();
}

#[test]
fn test_local_fs_backend_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let backend: Arc<dyn mnemo_backend::BlobBackend> =
        Arc::new(mnemo_backend::LocalFsBackend::open(dir.path()).unwrap());
    let cx = Cx::new();

    let store = open_store(Arc::clone(&backend), 14);
    let id = store.add(&cx, person("filesystem resident")).unwrap();
    store.close(&cx).unwrap();

    let reopened = open_store(backend, 15);
    let noun = reopened.get(&cx, id).unwrap().unwrap();
    assert_eq!(noun.data.as_deref(), Some("filesystem resident"));
    reopened.close(&cx).unwrap();
}
