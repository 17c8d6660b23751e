//! The uniform rebuild contract shared by every index.
//!
//! Rebuilds paginate with plain offsets; cursor pagination over a store
//! that is being folded back into memory has bitten before (resumed cursors
//! can loop forever), so offsets are mandatory here. Restore order is
//! deterministic: ascending shard, ascending id within shard, which is
//! exactly the lexicographic path order of the COW tree.

use std::sync::Arc;

use tracing::debug;

use mnemo_error::Result;
use mnemo_types::Cx;

/// Progress callback: `(loaded, total)`.
pub type ProgressFn = dyn Fn(usize, usize) + Send + Sync;

/// Options accepted by every index rebuild.
#[derive(Clone)]
pub struct RebuildOptions {
    /// Page size for the offset scan.
    pub batch_size: usize,
    /// Rebuild even when a warm projection could be loaded instead.
    pub force: bool,
    /// Invoked after each batch.
    pub on_progress: Option<Arc<ProgressFn>>,
}

impl Default for RebuildOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            force: false,
            on_progress: None,
        }
    }
}

impl std::fmt::Debug for RebuildOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebuildOptions")
            .field("batch_size", &self.batch_size)
            .field("force", &self.force)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// What a completed rebuild covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildReport {
    pub loaded: usize,
    pub total: usize,
    pub batches: usize,
}

/// A paginated view over stored items, in deterministic order.
pub trait ScanSource<T> {
    /// Total number of items.
    fn total(&self, cx: &Cx) -> Result<usize>;

    /// Items `[offset, offset + limit)`.
    fn page(&self, cx: &Cx, offset: usize, limit: usize) -> Result<Vec<T>>;
}

/// Drive an offset-paginated rebuild, feeding each batch to `apply`.
pub fn drive_rebuild<T>(
    cx: &Cx,
    source: &dyn ScanSource<T>,
    options: &RebuildOptions,
    mut apply: impl FnMut(Vec<T>) -> Result<()>,
) -> Result<RebuildReport> {
    let total = source.total(cx)?;
    let batch_size = options.batch_size.max(1);
    let mut offset = 0_usize;
    let mut batches = 0_usize;
    loop {
        cx.checkpoint_with("rebuild")?;
        let page = source.page(cx, offset, batch_size)?;
        let len = page.len();
        if len == 0 {
            break;
        }
        apply(page)?;
        offset += len;
        batches += 1;
        debug!(loaded = offset, total, "rebuild progress");
        if let Some(progress) = &options.on_progress {
            progress(offset, total);
        }
        if len < batch_size {
            break;
        }
    }
    Ok(RebuildReport {
        loaded: offset,
        total,
        batches,
    })
}

/// Whether a rebuild should preload the whole dataset rather than fault it
/// in on demand: preload when the estimated footprint stays under 80% of
/// the cache budget.
#[must_use]
pub fn should_preload(estimated_bytes: usize, cache_budget_bytes: usize) -> bool {
    (estimated_bytes as f64) < (cache_budget_bytes as f64) * 0.8
}
