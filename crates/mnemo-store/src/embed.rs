//! Built-in deterministic embedder.
//!
//! A hash-projection embedder: component `i` of the output is a signed
//! value derived from `xxh3(text, seed = i)`, normalized to unit length.
//! No semantic power, but fully deterministic across processes and
//! platforms, which makes it the right default for tests, offline stores,
//! and smoke environments where a model-backed [`Embedder`] is not wired
//! in.

use xxhash_rust::xxh3::xxh3_64_with_seed;

use mnemo_error::{MnemoError, Result};
use mnemo_types::{Cx, Embedder, Vector};

/// Deterministic hash-projection embedder.
pub struct HashingEmbedder {
    dim: usize,
    version: String,
}

impl HashingEmbedder {
    #[must_use]
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            version: format!("hashing-v1/{dim}"),
        }
    }
}

impl Embedder for HashingEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn model_version(&self) -> &str {
        &self.version
    }

    fn embed(&self, cx: &Cx, text: &str) -> Result<Vector> {
        cx.checkpoint_with("embed")?;
        let components: Vec<f32> = (0..self.dim)
            .map(|i| {
                let h = xxh3_64_with_seed(text.as_bytes(), i as u64);
                // Map the hash to a symmetric value in [-1, 1).
                (h as f64 / u64::MAX as f64).mul_add(2.0, -1.0) as f32
            })
            .collect();
        Vector::normalized(components)
            .map_err(|_| MnemoError::invalid("embed input", format!("{} chars", text.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_and_unit_norm() {
        let embedder = HashingEmbedder::new(64);
        let cx = Cx::new();
        let a = embedder.embed(&cx, "Alice Chen, product manager").unwrap();
        let b = embedder.embed(&cx, "Alice Chen, product manager").unwrap();
        assert_eq!(a, b, "case=deterministic");
        assert!((a.norm() - 1.0).abs() < 1e-4, "case=unit_norm");
        assert_eq!(a.dim(), 64);
    }

    #[test]
    fn test_distinct_texts_embed_differently() {
        let embedder = HashingEmbedder::new(32);
        let cx = Cx::new();
        let a = embedder.embed(&cx, "alpha").unwrap();
        let b = embedder.embed(&cx, "beta").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_batch_preserves_order() {
        let embedder = HashingEmbedder::new(16);
        let cx = Cx::new();
        let batch = embedder.embed_batch(&cx, &["one", "two"]).unwrap();
        assert_eq!(batch[0], embedder.embed(&cx, "one").unwrap());
        assert_eq!(batch[1], embedder.embed(&cx, "two").unwrap());
    }
}
