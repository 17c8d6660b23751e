//! Logical path layout inside the commit tree.

use mnemo_types::Uid;

/// Counts ledger blob.
pub const COUNTS: &str = "counts";
/// HNSW checkpoint blob.
pub const HNSW_INDEX: &str = "hnsw/index";
/// HNSW append-only log blob.
pub const HNSW_LOG: &str = "hnsw/log";
/// Cache access-pattern snapshot for warm starts.
pub const CACHE_PATTERNS: &str = "cache/patterns";

/// Entity JSON.
#[must_use]
pub fn noun(id: Uid) -> String {
    format!("entities/nouns/{}/{}", id.shard(), id)
}

/// Entity vector blob (little-endian f32).
#[must_use]
pub fn noun_vector(id: Uid) -> String {
    format!("entities/nouns/vectors/{}/{}", id.shard(), id)
}

/// Relationship JSON.
#[must_use]
pub fn verb(id: Uid) -> String {
    format!("entities/verbs/{}/{}", id.shard(), id)
}

/// Whether a path under `entities/nouns/` is an entity record (and not a
/// vector blob, which nests one level deeper).
#[must_use]
pub fn is_noun_record(path: &str) -> bool {
    path.split('/').count() == 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_shapes() {
        let id = Uid::parse("ab123456789abcdef0123456789abcde").unwrap();
        assert_eq!(noun(id), format!("entities/nouns/ab/{id}"));
        assert_eq!(noun_vector(id), format!("entities/nouns/vectors/ab/{id}"));
        assert_eq!(verb(id), format!("entities/verbs/ab/{id}"));
        assert!(is_noun_record(&noun(id)));
        assert!(!is_noun_record(&noun_vector(id)), "case=vector_excluded");
    }
}
