//! Byte-addressable blob backends.
//!
//! [`BlobBackend`] is the only storage interface the engine sees; no layer
//! above it touches a filesystem path. Shipped implementations: an in-memory
//! map for tests and ephemeral stores, and a local file tree. Networked
//! object stores are injected by the embedding application and typically
//! wrap a [`pool::ConnectionPool`].

pub mod local;
pub mod memory;
pub mod pool;

pub use local::LocalFsBackend;
pub use memory::MemoryBackend;
pub use pool::{ConnectionPool, Connector, PoolConfig, PooledConn};

use mnemo_error::Result;
use mnemo_types::Cx;

/// Size and modification time of a stored blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobStat {
    pub size: u64,
    pub mtime_ms: i64,
}

/// One page of a lexicographic listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPage {
    /// Keys in ascending lexicographic order.
    pub keys: Vec<String>,
    /// Cursor for the next page, `None` when exhausted.
    pub next: Option<String>,
}

/// Static traits of a backend the COW layer keys decisions on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendProfile {
    /// Human-readable backend name for logs.
    pub name: &'static str,
    /// True for networked backends whose per-write cost justifies the
    /// COW write buffer; local backends write through synchronously.
    pub remote: bool,
}

/// Pluggable byte storage.
///
/// Contract: `put` is durable on successful return; `list` is
/// lexicographic and consistent with preceding writes on the same logical
/// backend; `delete` is idempotent. Keys are opaque strings, values opaque
/// bytes.
pub trait BlobBackend: Send + Sync {
    /// Backend traits.
    fn profile(&self) -> BackendProfile;

    /// Read a blob. `NotFound` when absent.
    fn get(&self, cx: &Cx, key: &str) -> Result<Vec<u8>>;

    /// Write a blob, replacing any prior value.
    fn put(&self, cx: &Cx, key: &str, bytes: &[u8]) -> Result<()>;

    /// Remove a blob. Succeeds when already absent.
    fn delete(&self, cx: &Cx, key: &str) -> Result<()>;

    /// Whether a blob exists.
    fn exists(&self, cx: &Cx, key: &str) -> Result<bool>;

    /// Size and mtime. `NotFound` when absent.
    fn stat(&self, cx: &Cx, key: &str) -> Result<BlobStat>;

    /// List keys with the given prefix, lexicographically, starting after
    /// `cursor` when supplied.
    fn list(&self, cx: &Cx, prefix: &str, limit: usize, cursor: Option<&str>)
    -> Result<ListPage>;
}
