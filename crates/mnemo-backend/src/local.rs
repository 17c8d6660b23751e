//! Local file-tree backend.
//!
//! Keys map to paths under a root directory. Writes go through a sibling
//! temp file and an atomic rename, then fsync, so a successful `put` is
//! durable. Key characters are restricted to a safe set; anything with `..`
//! or a leading `/` is rejected before touching the filesystem.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use tracing::debug;

use mnemo_error::{MnemoError, Result};
use mnemo_types::Cx;

use crate::{BackendProfile, BlobBackend, BlobStat, ListPage};

/// Filesystem-backed blob store rooted at one directory.
pub struct LocalFsBackend {
    root: PathBuf,
}

impl LocalFsBackend {
    /// Open (creating the root directory when absent).
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(MnemoError::backend)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn collect_keys(&self, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(MnemoError::backend(err)),
        };
        for entry in entries {
            let entry = entry.map_err(MnemoError::backend)?;
            let path = entry.path();
            if path.is_dir() {
                self.collect_keys(&path, out)?;
            } else if let Ok(rel) = path.strip_prefix(&self.root) {
                // Keys always use forward slashes regardless of platform.
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                // Orphaned temp files from interrupted writes are not keys.
                if !key.contains(".tmp-") {
                    out.push(key);
                }
            }
        }
        Ok(())
    }
}

/// Reject keys that would escape the root or collide with temp files.
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('/') || key.ends_with('/') {
        return Err(MnemoError::invalid("blob key", key));
    }
    let ok = key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.' | ':'));
    if !ok || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return Err(MnemoError::invalid("blob key", key));
    }
    Ok(())
}

impl BlobBackend for LocalFsBackend {
    fn profile(&self) -> BackendProfile {
        BackendProfile {
            name: "local-fs",
            remote: false,
        }
    }

    fn get(&self, cx: &Cx, key: &str) -> Result<Vec<u8>> {
        cx.checkpoint_with("fs get")?;
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(MnemoError::not_found("blob", key))
            }
            Err(err) => Err(MnemoError::backend(err)),
        }
    }

    fn put(&self, cx: &Cx, key: &str, bytes: &[u8]) -> Result<()> {
        cx.checkpoint_with("fs put")?;
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(MnemoError::backend)?;
        }
        static TMP_SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let seq = TMP_SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let tmp = PathBuf::from(format!(
            "{}.tmp-{}-{seq}",
            path.display(),
            std::process::id()
        ));
        {
            let mut file = fs::File::create(&tmp).map_err(MnemoError::backend)?;
            file.write_all(bytes).map_err(MnemoError::backend)?;
            file.sync_all().map_err(MnemoError::backend)?;
        }
        fs::rename(&tmp, &path).map_err(MnemoError::backend)?;
        debug!(key, size = bytes.len(), "fs put");
        Ok(())
    }

    fn delete(&self, cx: &Cx, key: &str) -> Result<()> {
        cx.checkpoint_with("fs delete")?;
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(MnemoError::backend(err)),
        }
    }

    fn exists(&self, cx: &Cx, key: &str) -> Result<bool> {
        cx.checkpoint_with("fs exists")?;
        Ok(self.path_for(key)?.is_file())
    }

    fn stat(&self, cx: &Cx, key: &str) -> Result<BlobStat> {
        cx.checkpoint_with("fs stat")?;
        let path = self.path_for(key)?;
        let meta = fs::metadata(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                MnemoError::not_found("blob", key)
            } else {
                MnemoError::backend(err)
            }
        })?;
        let mtime_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_millis() as i64);
        Ok(BlobStat {
            size: meta.len(),
            mtime_ms,
        })
    }

    fn list(
        &self,
        cx: &Cx,
        prefix: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<ListPage> {
        cx.checkpoint_with("fs list")?;
        // Walk the deepest directory implied by the prefix, then filter.
        // Simple and correct; listing is a rebuild-path operation, not a
        // hot-path one.
        let dir = prefix.rfind('/').map_or_else(
            || self.root.clone(),
            |idx| self.root.join(&prefix[..idx]),
        );
        let mut keys = Vec::new();
        self.collect_keys(&dir, &mut keys)?;
        keys.retain(|k| k.starts_with(prefix) && cursor.is_none_or(|c| k.as_str() > c));
        keys.sort_unstable();
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

    fn backend() -> (LocalFsBackend, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = LocalFsBackend::open(dir.path()).unwrap();
        (backend, dir)
    }

    #[test]
    fn test_put_get_round_trip_nested_key() {
        let (backend, _dir) = backend();
        let cx = Cx::new();
        backend
            .put(&cx, "entities/nouns/ab/abcd", b"payload")
            .unwrap();
        assert_eq!(
            backend.get(&cx, "entities/nouns/ab/abcd").unwrap(),
            b"payload"
        );
    }

    #[test]
    fn test_overwrite_replaces_contents() {
        let (backend, _dir) = backend();
        let cx = Cx::new();
        backend.put(&cx, "k", b"one").unwrap();
        backend.put(&cx, "k", b"two").unwrap();
        assert_eq!(backend.get(&cx, "k").unwrap(), b"two");
    }

    #[test]
    fn test_traversal_keys_rejected() {
        let (backend, _dir) = backend();
        let cx = Cx::new();
        for key in ["../escape", "a/../b", "/abs", "a//b", ""] {
            let err = backend.put(&cx, key, b"x").unwrap_err();
            assert_eq!(err.kind_name(), "InvalidArgument", "case=key `{key}`");
        }
    }

    #[test]
    fn test_list_paginates_lexicographically() {
        let (backend, _dir) = backend();
        let cx = Cx::new();
        for key in ["m/02/b", "m/01/a", "m/03/c", "n/zz"] {
            backend.put(&cx, key, b"x").unwrap();
        }
        let page = backend.list(&cx, "m/", 2, None).unwrap();
        assert_eq!(page.keys, vec!["m/01/a", "m/02/b"]);
        let rest = backend
            .list(&cx, "m/", 10, page.next.as_deref())
            .unwrap();
        assert_eq!(rest.keys, vec!["m/03/c"]);
    }

    #[test]
    fn test_delete_idempotent_and_stat_not_found() {
        let (backend, _dir) = backend();
        let cx = Cx::new();
        backend.put(&cx, "k", b"v").unwrap();
        backend.delete(&cx, "k").unwrap();
        backend.delete(&cx, "k").unwrap();
        assert_eq!(backend.stat(&cx, "k").unwrap_err().kind_name(), "NotFound");
    }
}
