//! Core types shared by every mnemo crate.
//!
//! Identifiers, the 256-way shard scheme, the closed noun/verb vocabularies,
//! unit vectors, metadata value flattening, the cancellation/deadline context
//! [`Cx`], and the injectable collaborator seams ([`Embedder`], [`Clock`],
//! [`RngSource`]).

pub mod cx;
pub mod entity;
pub mod id;
pub mod kind;
pub mod traits;
pub mod value;
pub mod vector;

pub use cx::Cx;
pub use entity::{Noun, Verb};
pub use id::{Shard, Uid};
pub use kind::{NounKind, VerbKind};
pub use traits::{Clock, Embedder, RngSource, StdRandom, SystemClock};
pub use value::{IndexValue, OrdF64};
pub use vector::{Metric, UNIT_NORM_EPSILON, Vector};

/// Milliseconds since the Unix epoch.
pub type TimestampMs = i64;
