//! Unit vectors and distance metrics.
//!
//! Vectors are validated to unit length on construction and serialized as
//! little-endian f32 arrays, never as JSON.

use mnemo_error::{MnemoError, Result};
use serde::{Deserialize, Serialize};

/// Tolerance on `|‖v‖₂ − 1|` for stored vectors.
pub const UNIT_NORM_EPSILON: f32 = 1e-4;

/// Distance metric for nearest-neighbor search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// `1 − a·b` over unit vectors.
    #[default]
    Cosine,
    /// `‖a − b‖₂`.
    Euclidean,
    /// `Σ |aᵢ − bᵢ|`.
    Manhattan,
}

impl Metric {
    /// Stable numeric tag used in the HNSW checkpoint header.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::Cosine => 0,
            Self::Euclidean => 1,
            Self::Manhattan => 2,
        }
    }

    /// Inverse of [`Metric::tag`].
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::Cosine),
            1 => Ok(Self::Euclidean),
            2 => Ok(Self::Manhattan),
            other => Err(MnemoError::invalid("metric tag", other.to_string())),
        }
    }
}

/// A unit-length embedding vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Vector(Vec<f32>);

impl Vector {
    /// Accept a vector that is already unit length (within
    /// [`UNIT_NORM_EPSILON`]).
    pub fn from_unit(values: Vec<f32>) -> Result<Self> {
        let norm = l2_norm(&values);
        if !norm.is_finite() || (norm - 1.0).abs() > UNIT_NORM_EPSILON {
            return Err(MnemoError::Integrity {
                what: "vector",
                detail: format!("expected unit norm, got {norm}"),
            });
        }
        Ok(Self(values))
    }

    /// Normalize arbitrary values to unit length.
    ///
    /// # Errors
    /// `InvalidArgument` for zero or non-finite input.
    pub fn normalized(mut values: Vec<f32>) -> Result<Self> {
        let norm = l2_norm(&values);
        if norm == 0.0 || !norm.is_finite() {
            return Err(MnemoError::invalid("vector", format!("norm {norm}")));
        }
        for v in &mut values {
            *v /= norm;
        }
        Ok(Self(values))
    }

    /// Dimensionality.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.0.len()
    }

    /// Component slice.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// L2 norm of the stored components.
    #[must_use]
    pub fn norm(&self) -> f32 {
        l2_norm(&self.0)
    }

    /// Dot product; both operands must share a dimension.
    #[must_use]
    pub fn dot(&self, other: &Self) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| a * b)
            .sum()
    }

    /// Distance under the given metric. Cosine distance assumes unit
    /// operands, which construction guarantees.
    #[must_use]
    pub fn distance(&self, other: &Self, metric: Metric) -> f32 {
        match metric {
            Metric::Cosine => 1.0 - self.dot(other),
            Metric::Euclidean => self
                .0
                .iter()
                .zip(other.0.iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f32>()
                .sqrt(),
            Metric::Manhattan => self
                .0
                .iter()
                .zip(other.0.iter())
                .map(|(a, b)| (a - b).abs())
                .sum(),
        }
    }

    /// Wire encoding: `dim · 4` bytes of little-endian f32.
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * 4);
        for v in &self.0 {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Decode the wire encoding, enforcing the expected dimension and unit
    /// norm.
    pub fn from_le_bytes(bytes: &[u8], expected_dim: usize) -> Result<Self> {
        if bytes.len() != expected_dim * 4 {
            return Err(MnemoError::Integrity {
                what: "vector",
                detail: format!(
                    "expected {} bytes for dim {expected_dim}, got {}",
                    expected_dim * 4,
                    bytes.len()
                ),
            });
        }
        let values: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::from_unit(values)
    }
}

fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize, axis: usize) -> Vector {
        let mut v = vec![0.0_f32; dim];
        v[axis] = 1.0;
        Vector::from_unit(v).unwrap()
    }

    #[test]
    fn test_from_unit_rejects_non_unit() {
        assert!(Vector::from_unit(vec![1.0, 1.0]).is_err(), "case=norm_sqrt2");
        assert!(Vector::from_unit(vec![0.0, 0.0]).is_err(), "case=zero");
        assert!(
            Vector::from_unit(vec![f32::NAN, 0.0]).is_err(),
            "case=nan"
        );
    }

    #[test]
    fn test_normalized_produces_unit_norm() {
        let v = Vector::normalized(vec![3.0, 4.0]).unwrap();
        assert!((v.norm() - 1.0).abs() <= UNIT_NORM_EPSILON);
        assert!((v.as_slice()[0] - 0.6).abs() < 1e-6);
        assert!((v.as_slice()[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_normalized_rejects_zero() {
        assert!(Vector::normalized(vec![0.0; 8]).is_err());
    }

    #[test]
    fn test_cosine_distance_on_axes() {
        let x = unit(4, 0);
        let y = unit(4, 1);
        assert!((x.distance(&x, Metric::Cosine)).abs() < 1e-6, "case=self");
        assert!(
            (x.distance(&y, Metric::Cosine) - 1.0).abs() < 1e-6,
            "case=orthogonal"
        );
    }

    #[test]
    fn test_euclidean_and_manhattan() {
        let x = unit(2, 0);
        let y = unit(2, 1);
        let e = x.distance(&y, Metric::Euclidean);
        assert!((e - std::f32::consts::SQRT_2).abs() < 1e-6);
        let m = x.distance(&y, Metric::Manhattan);
        assert!((m - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_le_bytes_round_trip() {
        let v = Vector::normalized(vec![0.25, -0.5, 0.75, 0.1]).unwrap();
        let bytes = v.to_le_bytes();
        assert_eq!(bytes.len(), 16);
        let back = Vector::from_le_bytes(&bytes, 4).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_le_bytes_dimension_mismatch() {
        let v = unit(4, 0);
        let err = Vector::from_le_bytes(&v.to_le_bytes(), 8).unwrap_err();
        assert_eq!(err.kind_name(), "IntegrityError", "case=dim_mismatch");
    }

    #[test]
    fn test_metric_tag_round_trip() {
        for metric in [Metric::Cosine, Metric::Euclidean, Metric::Manhattan] {
            assert_eq!(Metric::from_tag(metric.tag()).unwrap(), metric);
        }
        assert!(Metric::from_tag(9).is_err());
    }
}
