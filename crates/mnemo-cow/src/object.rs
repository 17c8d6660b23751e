//! Commit and tree objects.
//!
//! Both serialize as canonical JSON (sorted keys) so identical logical
//! content always hashes to the same digest regardless of insertion order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use mnemo_error::{MnemoError, Result};
use mnemo_types::TimestampMs;
use mnemo_types::value::canonical_json_bytes;

use crate::digest::Digest;

/// COW root object: one per durable write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitObject {
    /// Strictly increasing sequence number.
    pub seq: u64,
    /// Parent commit digest; `None` only for the first commit.
    pub parent: Option<Digest>,
    /// Root tree digest.
    pub tree: Digest,
    /// Wall-clock millis at commit time.
    pub timestamp_ms: TimestampMs,
    /// Writer identity, for forensic logs.
    pub writer: String,
}

/// One entry in a tree manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeEntry {
    /// Leaf blob digest.
    Blob(Digest),
    /// Child tree digest.
    Tree(Digest),
}

/// Immutable manifest mapping path segments to blob or subtree digests.
///
/// `BTreeMap` keeps entries sorted, which makes the canonical serialization
/// deterministic by construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeObject {
    pub entries: BTreeMap<String, TreeEntry>,
}

impl TreeObject {
    /// Canonical bytes (the form that is hashed and stored).
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>> {
        let value = serde_json::to_value(self).map_err(MnemoError::internal)?;
        Ok(canonical_json_bytes(&value))
    }

    /// Decode stored bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|err| MnemoError::Integrity {
            what: "tree object",
            detail: err.to_string(),
        })
    }
}

impl CommitObject {
    /// Canonical bytes (the form that is hashed and stored).
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>> {
        let value = serde_json::to_value(self).map_err(MnemoError::internal)?;
        Ok(canonical_json_bytes(&value))
    }

    /// Decode stored bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|err| MnemoError::Integrity {
            what: "commit object",
            detail: err.to_string(),
        })
    }
}

/// Content of `refs/head`: a JSON pointer at the latest commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefObject {
    pub digest: Digest,
}
