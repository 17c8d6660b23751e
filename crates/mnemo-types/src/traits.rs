//! Injectable collaborator seams: embedder, clock, randomness.
//!
//! Production wiring injects real implementations at `init`; tests inject
//! deterministic doubles. Nothing in the engine reaches for ambient time or
//! entropy directly.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng as _};

use mnemo_error::Result;

use crate::TimestampMs;
use crate::cx::Cx;
use crate::vector::Vector;

/// Turns text into unit vectors of a fixed dimension.
///
/// Must be deterministic for a fixed model version; the version string is
/// stored with entities so vectors from different models are never compared.
pub trait Embedder: Send + Sync {
    /// Output dimensionality.
    fn dim(&self) -> usize;

    /// Identifier of the embedding model and revision.
    fn model_version(&self) -> &str;

    /// Embed one text into a unit vector of length [`Embedder::dim`].
    fn embed(&self, cx: &Cx, text: &str) -> Result<Vector>;

    /// Embed several texts, preserving input order.
    fn embed_batch(&self, cx: &Cx, texts: &[&str]) -> Result<Vec<Vector>> {
        texts.iter().map(|t| self.embed(cx, t)).collect()
    }
}

/// Millisecond wall clock.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> TimestampMs;
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> TimestampMs {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as TimestampMs)
            .unwrap_or(0)
    }
}

/// Source of randomness for id generation and HNSW level sampling.
pub trait RngSource: Send + Sync {
    /// Next raw 64-bit draw.
    fn next_u64(&self) -> u64;

    /// Uniform draw from the half-open interval `(0, 1]`.
    fn next_unit_open(&self) -> f64 {
        // Map to (0, 1]: zero maps to 1.0, everything else stays in range.
        let raw = self.next_u64() >> 11; // 53 significant bits
        if raw == 0 {
            1.0
        } else {
            raw as f64 / (1_u64 << 53) as f64
        }
    }
}

/// `rand`-backed source; seedable for deterministic tests.
#[derive(Debug)]
pub struct StdRandom {
    inner: Mutex<StdRng>,
}

impl StdRandom {
    /// Seed from OS entropy.
    #[must_use]
    pub fn from_entropy() -> Self {
        Self {
            inner: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Fixed seed for reproducible runs.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            inner: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RngSource for StdRandom {
    fn next_u64(&self) -> u64 {
        self.inner.lock().r#gen()
    }
}
