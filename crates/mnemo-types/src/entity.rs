//! Persistent records: nouns (entities) and verbs (relationships).
//!
//! These are the only payloads the COW store serializes as JSON. Vectors
//! live in sibling binary blobs referenced by logical path.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::TimestampMs;
use crate::id::Uid;
use crate::kind::{NounKind, VerbKind};

/// A persistent entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Noun {
    pub id: Uid,
    pub kind: NounKind,
    /// Source text the vector was embedded from, kept for re-embedding on
    /// update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Logical path of the vector blob, when the entity has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_ref: Option<String>,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
    /// Originating service identifier.
    pub service: String,
    pub confidence: f64,
    pub merge_count: u32,
}

/// A typed directed relationship between two nouns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verb {
    pub id: Uid,
    pub from_id: Uid,
    pub to_id: Uid,
    pub kind: VerbKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}
