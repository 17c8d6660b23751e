//! Authoritative entity/relationship counters.
//!
//! Incremented inside write transactions, persisted to the single `counts`
//! path by a periodic, idempotent flusher, and rebuildable from a full
//! offset-paginated scan whenever a discrepancy (or a prior partial
//! rollback) is detected.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use mnemo_error::{MnemoError, Result};
use mnemo_types::{NounKind, VerbKind};

/// Persisted form of the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CountsSnapshot {
    pub total_nouns: u64,
    pub total_verbs: u64,
    pub nouns_by_kind: BTreeMap<NounKind, u64>,
    pub verbs_by_kind: BTreeMap<VerbKind, u64>,
    /// Set when a partial rollback may have left the ledger divergent;
    /// forces a rebuild on the next `init`.
    pub needs_rebuild: bool,
}

/// In-memory ledger with a pending-persist flag.
#[derive(Debug, Default)]
pub struct CountsLedger {
    snapshot: CountsSnapshot,
    dirty: bool,
}

impl CountsLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the persisted blob. Unknown or missing fields default, so a
    /// corrupt-but-parseable blob loads and then fails validation against
    /// the scan instead of failing `init`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let snapshot: CountsSnapshot =
            serde_json::from_slice(bytes).map_err(|err| MnemoError::Integrity {
                what: "counts ledger",
                detail: err.to_string(),
            })?;
        Ok(Self {
            snapshot,
            dirty: false,
        })
    }

    /// Canonical persisted bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.snapshot).map_err(MnemoError::internal)
    }

    #[must_use]
    pub const fn total_nouns(&self) -> u64 {
        self.snapshot.total_nouns
    }

    #[must_use]
    pub const fn total_verbs(&self) -> u64 {
        self.snapshot.total_verbs
    }

    #[must_use]
    pub fn nouns_of_kind(&self, kind: NounKind) -> u64 {
        self.snapshot.nouns_by_kind.get(&kind).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn verbs_of_kind(&self, kind: VerbKind) -> u64 {
        self.snapshot.verbs_by_kind.get(&kind).copied().unwrap_or(0)
    }

    /// Whether unpersisted deltas are pending.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether a rebuild is required before the ledger can be trusted.
    #[must_use]
    pub const fn needs_rebuild(&self) -> bool {
        self.snapshot.needs_rebuild
    }

    /// Flag the ledger as untrustworthy after a partial rollback.
    pub fn mark_suspect(&mut self) {
        self.snapshot.needs_rebuild = true;
        self.dirty = true;
    }

    /// Apply a noun delta.
    pub fn bump_noun(&mut self, kind: NounKind, delta: i64) {
        Self::apply(&mut self.snapshot.total_nouns, delta);
        let slot = self.snapshot.nouns_by_kind.entry(kind).or_insert(0);
        Self::apply(slot, delta);
        if *slot == 0 {
            self.snapshot.nouns_by_kind.remove(&kind);
        }
        self.dirty = true;
    }

    /// Apply a verb delta.
    pub fn bump_verb(&mut self, kind: VerbKind, delta: i64) {
        Self::apply(&mut self.snapshot.total_verbs, delta);
        let slot = self.snapshot.verbs_by_kind.entry(kind).or_insert(0);
        Self::apply(slot, delta);
        if *slot == 0 {
            self.snapshot.verbs_by_kind.remove(&kind);
        }
        self.dirty = true;
    }

    fn apply(slot: &mut u64, delta: i64) {
        if delta >= 0 {
            *slot = slot.saturating_add(delta as u64);
        } else {
            *slot = slot.saturating_sub(delta.unsigned_abs());
        }
    }

    /// Replace all counters with freshly scanned truth.
    pub fn replace(
        &mut self,
        nouns_by_kind: BTreeMap<NounKind, u64>,
        verbs_by_kind: BTreeMap<VerbKind, u64>,
    ) {
        self.snapshot.total_nouns = nouns_by_kind.values().sum();
        self.snapshot.total_verbs = verbs_by_kind.values().sum();
        self.snapshot.nouns_by_kind = nouns_by_kind;
        self.snapshot.verbs_by_kind = verbs_by_kind;
        self.snapshot.needs_rebuild = false;
        self.dirty = true;
    }

    /// Whether the ledger agrees with scanned truth.
    #[must_use]
    pub fn matches(
        &self,
        nouns_by_kind: &BTreeMap<NounKind, u64>,
        verbs_by_kind: &BTreeMap<VerbKind, u64>,
    ) -> bool {
        self.snapshot.total_nouns == nouns_by_kind.values().sum::<u64>()
            && self.snapshot.total_verbs == verbs_by_kind.values().sum::<u64>()
            && self.snapshot.nouns_by_kind == *nouns_by_kind
            && self.snapshot.verbs_by_kind == *verbs_by_kind
    }

    /// Clear the dirty flag after a successful persist.
    pub fn persisted(&mut self) {
        self.dirty = false;
    }

    /// Re-flag pending deltas (a persist attempt failed after clearing).
    pub fn touch(&mut self) {
        self.dirty = true;
    }

    /// Copy of the current snapshot for stats surfaces.
    #[must_use]
    pub fn snapshot(&self) -> CountsSnapshot {
        self.snapshot.clone()
    }
}
