//! Write-buffer configuration and the background flush loop.
//!
//! Buffering applies to remote backends only: repeated writes to the same
//! logical path inside the window collapse to the last value, which is the
//! dominant pattern when index files are rewritten on every mutation.
//! Local backends write through synchronously.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use mnemo_types::Cx;

/// Buffering knobs.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Coalescing window; staged writes older than this are flushed.
    pub window: Duration,
    /// Staged-entry cap; reaching it forces an early flush.
    pub max_entries: usize,
    /// Upper bound on in-flight backend puts during a flush.
    pub flush_concurrency: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(200),
            max_entries: 200,
            flush_concurrency: 10,
        }
    }
}

pub(crate) struct FlushSignal {
    pub(crate) stop: Mutex<bool>,
    pub(crate) wake: Condvar,
}

impl FlushSignal {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            stop: Mutex::new(false),
            wake: Condvar::new(),
        })
    }

    pub(crate) fn shutdown(&self) {
        *self.stop.lock() = true;
        self.wake.notify_all();
    }
}

/// Spawn the periodic flush thread for a buffered store.
pub(crate) fn spawn_flush_loop(
    store: Arc<crate::store::CowStore>,
    signal: Arc<FlushSignal>,
    window: Duration,
) -> Option<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("mnemo-cow-flush".to_owned())
        .spawn(move || {
            let tick = window.max(Duration::from_millis(10)) / 2;
            loop {
                {
                    let mut stop = signal.stop.lock();
                    if *stop {
                        return;
                    }
                    let _ = signal.wake.wait_for(&mut stop, tick);
                    if *stop {
                        return;
                    }
                }
                let cx = Cx::new();
                if let Err(err) = store.flush_expired(&cx) {
                    // Buffered writes stay staged; the next tick retries.
                    warn!(error = %err, "background flush failed, will retry");
                }
            }
        })
        .ok()
}
