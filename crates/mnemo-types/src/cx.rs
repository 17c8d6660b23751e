//! Cancellation and deadline context threaded through every fallible call.
//!
//! A `Cx` is cheap to clone and is passed by reference into backend I/O,
//! embedder calls, cache loads, and transaction execution. Long-running
//! loops call [`Cx::checkpoint`] at their suspension points.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mnemo_error::{MnemoError, Result};

/// Cancellation flag plus optional deadline.
#[derive(Debug, Clone)]
pub struct Cx {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

/// Handle that trips the cancellation flag of the `Cx` it came from.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Cancel every operation holding the originating context.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl Cx {
    /// A context with no deadline and a fresh cancellation flag.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    /// A fresh context that times out after `timeout`.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Derive a child sharing this context's cancellation flag with a
    /// deadline no later than both the parent's and `timeout` from now.
    #[must_use]
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let child_deadline = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) => Some(parent.min(child_deadline)),
            None => Some(child_deadline),
        };
        Self {
            cancelled: Arc::clone(&self.cancelled),
            deadline,
        }
    }

    /// Handle for cancelling this context from another thread.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            cancelled: Arc::clone(&self.cancelled),
        }
    }

    /// Whether the flag has been tripped.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Time left before the deadline, `None` when no deadline is set.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail fast when cancelled or past the deadline.
    pub fn checkpoint(&self) -> Result<()> {
        self.checkpoint_with("operation")
    }

    /// Like [`Cx::checkpoint`] with an operation name for the timeout error.
    pub fn checkpoint_with(&self, operation: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(MnemoError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(MnemoError::Timeout(operation.to_owned()));
            }
        }
        Ok(())
    }
}

impl Default for Cx {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_context_passes_checkpoint() {
        let cx = Cx::new();
        assert!(cx.checkpoint().is_ok());
        assert_eq!(cx.remaining(), None);
    }

    #[test]
    fn test_cancel_handle_trips_checkpoint() {
        let cx = Cx::new();
        let handle = cx.cancel_handle();
        handle.cancel();
        assert!(matches!(cx.checkpoint(), Err(MnemoError::Cancelled)));
    }

    #[test]
    fn test_expired_deadline_times_out() {
        let cx = Cx::with_timeout(Duration::ZERO);
        let err = cx.checkpoint_with("flush").unwrap_err();
        assert!(matches!(err, MnemoError::Timeout(op) if op == "flush"));
    }

    #[test]
    fn test_child_deadline_never_exceeds_parent() {
        let parent = Cx::with_timeout(Duration::from_millis(5));
        let child = parent.child_with_timeout(Duration::from_secs(60));
        let remaining = child.remaining().expect("child must carry a deadline");
        assert!(remaining <= Duration::from_millis(5), "case=child_clamped");
    }

    #[test]
    fn test_child_shares_cancellation() {
        let parent = Cx::new();
        let child = parent.child_with_timeout(Duration::from_secs(60));
        parent.cancel_handle().cancel();
        assert!(child.is_cancelled(), "case=cancel_propagates_to_child");
    }
}
