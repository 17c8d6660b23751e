//! In-memory backend for tests and ephemeral stores.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use mnemo_error::{MnemoError, Result};
use mnemo_types::{Clock, Cx, SystemClock};

use crate::{BackendProfile, BlobBackend, BlobStat, ListPage};

/// A `BTreeMap`-backed backend. Listing order falls out of the map's key
/// order, which matches the lexicographic contract.
pub struct MemoryBackend {
    blobs: RwLock<BTreeMap<String, (Vec<u8>, i64)>>,
    clock: SystemClock,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(BTreeMap::new()),
            clock: SystemClock,
        }
    }

    /// Number of stored blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Whether the backend holds no blobs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobBackend for MemoryBackend {
    fn profile(&self) -> BackendProfile {
        BackendProfile {
            name: "memory",
            remote: false,
        }
    }

    fn get(&self, cx: &Cx, key: &str) -> Result<Vec<u8>> {
        cx.checkpoint_with("memory get")?;
        self.blobs
            .read()
            .get(key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| MnemoError::not_found("blob", key))
    }

    fn put(&self, cx: &Cx, key: &str, bytes: &[u8]) -> Result<()> {
        cx.checkpoint_with("memory put")?;
        self.blobs
            .write()
            .insert(key.to_owned(), (bytes.to_vec(), self.clock.now_ms()));
        Ok(())
    }

    fn delete(&self, cx: &Cx, key: &str) -> Result<()> {
        cx.checkpoint_with("memory delete")?;
        let _ = self.blobs.write().remove(key);
        Ok(())
    }

    fn exists(&self, cx: &Cx, key: &str) -> Result<bool> {
        cx.checkpoint_with("memory exists")?;
        Ok(self.blobs.read().contains_key(key))
    }

    fn stat(&self, cx: &Cx, key: &str) -> Result<BlobStat> {
        cx.checkpoint_with("memory stat")?;
        self.blobs
            .read()
            .get(key)
            .map(|(bytes, mtime)| BlobStat {
                size: bytes.len() as u64,
                mtime_ms: *mtime,
            })
            .ok_or_else(|| MnemoError::not_found("blob", key))
    }

    fn list(
        &self,
        cx: &Cx,
        prefix: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<ListPage> {
        cx.checkpoint_with("memory list")?;
        let blobs = self.blobs.read();
        let mut keys: Vec<String> = blobs
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(k, _)| cursor.is_none_or(|c| k.as_str() > c))
            .take(limit + 1)
            .map(|(k, _)| k.clone())
            .collect();
        let next = if keys.len() > limit {
            keys.truncate(limit);
            keys.last().cloned()
        } else {
            None
        };
        Ok(ListPage { keys, next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_round_trip() {
        let backend = MemoryBackend::new();
        let cx = Cx::new();
        backend.put(&cx, "a/b", b"payload").unwrap();
        assert_eq!(backend.get(&cx, "a/b").unwrap(), b"payload");
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let backend = MemoryBackend::new();
        let cx = Cx::new();
        let err = backend.get(&cx, "nope").unwrap_err();
        assert_eq!(err.kind_name(), "NotFound");
    }

    #[test]
    fn test_delete_is_idempotent() {
        let backend = MemoryBackend::new();
        let cx = Cx::new();
        backend.put(&cx, "k", b"v").unwrap();
        backend.delete(&cx, "k").unwrap();
        backend.delete(&cx, "k").unwrap();
        assert!(!backend.exists(&cx, "k").unwrap());
    }

    #[test]
    fn test_list_is_lexicographic_with_cursor() {
        let backend = MemoryBackend::new();
        let cx = Cx::new();
        for key in ["p/03", "p/01", "q/09", "p/02"] {
            backend.put(&cx, key, b"x").unwrap();
        }
        let page1 = backend.list(&cx, "p/", 2, None).unwrap();
        assert_eq!(page1.keys, vec!["p/01", "p/02"]);
        let cursor = page1.next.expect("more pages");
        let page2 = backend.list(&cx, "p/", 2, Some(&cursor)).unwrap();
        assert_eq!(page2.keys, vec!["p/03"]);
        assert_eq!(page2.next, None, "case=exhausted");
    }

    #[test]
    fn test_stat_reports_size() {
        let backend = MemoryBackend::new();
        let cx = Cx::new();
        backend.put(&cx, "k", &[0_u8; 17]).unwrap();
        let stat = backend.stat(&cx, "k").unwrap();
        assert_eq!(stat.size, 17);
        assert!(stat.mtime_ms > 0);
    }

    #[test]
    fn test_cancelled_context_rejects_io() {
        let backend = MemoryBackend::new();
        let cx = Cx::new();
        cx.cancel_handle().cancel();
        assert!(matches!(
            backend.get(&cx, "k"),
            Err(MnemoError::Cancelled)
        ));
    }
}
