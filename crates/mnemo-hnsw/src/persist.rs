//! Binary persistence: full checkpoint plus append-only mutation log.
//!
//! The checkpoint (`hnsw/index`) carries topology only (ids, levels,
//! tombstone flags, neighbor lists), never vectors; those live with their
//! entities. The log (`hnsw/log`) is a flat record sequence appended on
//! every mutation batch and folded into the next checkpoint. Both carry
//! xxh3 checksums so a torn write surfaces as `IntegrityError` instead of
//! a scrambled graph.

use smallvec::SmallVec;
use tracing::warn;
use xxhash_rust::xxh3::xxh3_64;

use mnemo_error::{MnemoError, Result};
use mnemo_types::{Metric, Uid, Vector};

use crate::index::{HnswIndex, HnswParams, Node};

const CHECKPOINT_MAGIC: &[u8; 4] = b"MNHW";
const LOG_MAGIC: &[u8; 4] = b"MNHL";
const VERSION: u16 = 1;
const NO_ENTRY: u32 = u32::MAX;

/// One logged mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRecord {
    Insert { id: Uid, level: u8 },
    Delete { id: Uid },
}

/// Decoded checkpoint topology, pending vector attachment.
#[derive(Debug, Clone)]
pub struct Topology {
    pub metric: Metric,
    pub dim: usize,
    pub entry: Option<u32>,
    /// `(id, level, deleted, neighbors per level)`.
    pub nodes: Vec<(Uid, u8, bool, Vec<Vec<u32>>)>,
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Serialize the full index topology.
#[must_use]
pub fn encode_checkpoint(index: &HnswIndex) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + index.nodes.len() * 64);
    out.extend_from_slice(CHECKPOINT_MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.push(index.params().metric.tag());
    out.extend_from_slice(&(index.dim() as u32).to_le_bytes());
    out.extend_from_slice(&(index.params().m as u32).to_le_bytes());
    out.extend_from_slice(&(index.params().m0 as u32).to_le_bytes());
    out.extend_from_slice(&index.entry.unwrap_or(NO_ENTRY).to_le_bytes());
    out.extend_from_slice(&(index.nodes.len() as u32).to_le_bytes());
    for node in &index.nodes {
        out.extend_from_slice(node.id.as_bytes());
        out.push(node.level);
        out.push(u8::from(node.deleted));
        for list in &node.neighbors {
            out.extend_from_slice(&(list.len() as u16).to_le_bytes());
            for &n in list {
                out.extend_from_slice(&n.to_le_bytes());
            }
        }
    }
    let checksum = xxh3_64(&out);
    out.extend_from_slice(&checksum.to_le_bytes());
    out
}

/// Decode a checkpoint into topology.
pub fn decode_checkpoint(bytes: &[u8]) -> Result<Topology> {
    let mut r = Reader::new(bytes, "hnsw checkpoint");
    if bytes.len() < 8 + 8 {
        return Err(r.corrupt("truncated header"));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - 8);
    let stored = u64::from_le_bytes(trailer.try_into().map_err(|_| r.corrupt("trailer"))?);
    if xxh3_64(body) != stored {
        return Err(r.corrupt("checksum mismatch"));
    }
    r = Reader::new(body, "hnsw checkpoint");

    if r.take(4)? != CHECKPOINT_MAGIC {
        return Err(r.corrupt("bad magic"));
    }
    let version = r.u16()?;
    if version != VERSION {
        return Err(r.corrupt(&format!("unsupported version {version}")));
    }
    let metric = Metric::from_tag(r.u8()?)?;
    let dim = r.u32()? as usize;
    let _m = r.u32()?;
    let _m0 = r.u32()?;
    let entry_raw = r.u32()?;
    let count = r.u32()? as usize;

    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
        let id = Uid::from_bytes(
            r.take(16)?
                .try_into()
                .map_err(|_| r.corrupt("node id"))?,
        );
        let level = r.u8()?;
        let deleted = r.u8()? != 0;
        let mut levels = Vec::with_capacity(usize::from(level) + 1);
        for _ in 0..=level {
            let len = r.u16()? as usize;
            let mut list = Vec::with_capacity(len);
            for _ in 0..len {
                let n = r.u32()?;
                if n as usize >= count {
                    return Err(r.corrupt("neighbor index out of range"));
                }
                list.push(n);
            }
            levels.push(list);
        }
        nodes.push((id, level, deleted, levels));
    }

    let entry = if entry_raw == NO_ENTRY {
        None
    } else if (entry_raw as usize) < count {
        Some(entry_raw)
    } else {
        return Err(r.corrupt("entry point out of range"));
    };

    Ok(Topology {
        metric,
        dim,
        entry,
        nodes,
    })
}

impl HnswIndex {
    /// Reassemble an index from checkpoint topology, fetching live-node
    /// vectors from storage through `fetch`.
    ///
    /// `fetch` returning `None` means the payload is already gone (the
    /// deletion sits in the un-folded log); the node loads tombstoned and
    /// edges into it are stripped, exactly as a live `remove` would have.
    pub fn from_topology(
        params: HnswParams,
        topology: Topology,
        mut fetch: impl FnMut(Uid) -> Result<Option<Vector>>,
    ) -> Result<Self> {
        if topology.metric != params.metric {
            return Err(MnemoError::Integrity {
                what: "hnsw checkpoint",
                detail: format!(
                    "checkpoint metric {:?} != configured {:?}",
                    topology.metric, params.metric
                ),
            });
        }
        let mut index = Self::new(params, topology.dim);
        for (id, level, deleted, levels) in topology.nodes {
            let vector = if deleted { None } else { fetch(id)? };
            if let Some(v) = &vector {
                if v.dim() != index.dim() {
                    return Err(MnemoError::Integrity {
                        what: "vector",
                        detail: format!(
                            "stored dimension {} != checkpoint dimension {}",
                            v.dim(),
                            index.dim()
                        ),
                    });
                }
            }
            let deleted = deleted || vector.is_none();
            let idx = index.nodes.len() as u32;
            index.nodes.push(Node {
                id,
                vector,
                level,
                neighbors: if deleted {
                    vec![SmallVec::new(); usize::from(level) + 1]
                } else {
                    levels
                        .into_iter()
                        .map(|l| l.into_iter().collect::<SmallVec<[u32; 32]>>())
                        .collect()
                },
                deleted,
            });
            if !deleted {
                index.register(id, idx);
            }
        }

        // Strip dangling edges into tombstoned nodes.
        let dead: Vec<u32> = index
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.deleted)
            .map(|(i, _)| i as u32)
            .collect();
        if !dead.is_empty() {
            for node in &mut index.nodes {
                for list in &mut node.neighbors {
                    list.retain(|n| !dead.contains(n));
                }
            }
        }

        index.entry = topology
            .entry
            .filter(|&e| !index.nodes[e as usize].deleted)
            .or_else(|| index.pick_live_entry());
        Ok(index)
    }
}

// ---------------------------------------------------------------------------
// Log
// ---------------------------------------------------------------------------

const RECORD_INSERT: u8 = 1;
const RECORD_DELETE: u8 = 2;
/// tag + id + level + checksum.
const RECORD_LEN: usize = 1 + 16 + 1 + 8;

/// Encode records for appending to the log blob. An empty existing log gets
/// the magic header first.
#[must_use]
pub fn encode_log_records(existing: &[u8], records: &[LogRecord]) -> Vec<u8> {
    let mut out = existing.to_vec();
    if out.is_empty() {
        out.extend_from_slice(LOG_MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
    }
    for record in records {
        let (tag, id, level) = match record {
            LogRecord::Insert { id, level } => (RECORD_INSERT, id, *level),
            LogRecord::Delete { id } => (RECORD_DELETE, id, 0),
        };
        let mut body = Vec::with_capacity(RECORD_LEN);
        body.push(tag);
        body.extend_from_slice(id.as_bytes());
        body.push(level);
        let checksum = xxh3_64(&body);
        out.extend_from_slice(&body);
        out.extend_from_slice(&checksum.to_le_bytes());
    }
    out
}

/// Decode a log blob. A torn trailing record (crash mid-append) is dropped
/// with a warning; a checksum mismatch mid-stream is corruption.
pub fn decode_log(bytes: &[u8]) -> Result<Vec<LogRecord>> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let mut r = Reader::new(bytes, "hnsw log");
    if r.take(4)? != LOG_MAGIC {
        return Err(r.corrupt("bad magic"));
    }
    let version = r.u16()?;
    if version != VERSION {
        return Err(r.corrupt(&format!("unsupported version {version}")));
    }
    let mut records = Vec::new();
    loop {
        let remaining = r.remaining();
        if remaining == 0 {
            break;
        }
        if remaining < RECORD_LEN {
            warn!(remaining, "dropping torn hnsw log tail");
            break;
        }
        let body = r.take(RECORD_LEN - 8)?.to_vec();
        let stored = u64::from_le_bytes(
            r.take(8)?
                .try_into()
                .map_err(|_| MnemoError::internal("log checksum slice"))?,
        );
        if xxh3_64(&body) != stored {
            return Err(MnemoError::Integrity {
                what: "hnsw log",
                detail: format!("record {} checksum mismatch", records.len()),
            });
        }
        let id = Uid::from_bytes(
            body[1..17]
                .try_into()
                .map_err(|_| MnemoError::internal("log id slice"))?,
        );
        match body[0] {
            RECORD_INSERT => records.push(LogRecord::Insert {
                id,
                level: body[17],
            }),
            RECORD_DELETE => records.push(LogRecord::Delete { id }),
            other => {
                return Err(MnemoError::Integrity {
                    what: "hnsw log",
                    detail: format!("unknown record tag {other}"),
                });
            }
        }
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// Byte reader
// ---------------------------------------------------------------------------

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8], what: &'static str) -> Self {
        Self {
            bytes,
            pos: 0,
            what,
        }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn corrupt(&self, detail: &str) -> MnemoError {
        MnemoError::Integrity {
            what: self.what,
            detail: detail.to_owned(),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(self.corrupt("unexpected end of input"));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::HnswParams;
    use mnemo_types::{Cx, RngSource, StdRandom};

    fn uid(n: u16) -> Uid {
        let mut bytes = [0_u8; 16];
        bytes[0] = (n >> 8) as u8;
        bytes[1] = (n & 0xff) as u8;
        bytes[15] = 2;
        Uid::from_bytes(bytes)
    }

    fn random_unit(rng: &StdRandom, dim: usize) -> Vector {
        let values: Vec<f32> = (0..dim)
            .map(|_| (rng.next_unit_open() as f32) * 2.0 - 1.0)
            .collect();
        Vector::normalized(values).expect("non-zero")
    }

    fn populated_index() -> (HnswIndex, Vec<(Uid, Vector)>) {
        let mut index = HnswIndex::new(
            HnswParams {
                m: 8,
                m0: 16,
                ef_construction: 48,
                ef_search: 32,
                metric: Metric::Cosine,
            },
            8,
        );
        let rng = StdRandom::seeded(17);
        let cx = Cx::new();
        let mut stored = Vec::new();
        for i in 0..80_u16 {
            let v = random_unit(&rng, 8);
            index.insert(&cx, uid(i), v.clone(), &rng).unwrap();
            stored.push((uid(i), v));
        }
        index.remove(uid(5));
        index.remove(uid(6));
        (index, stored)
    }

    #[test]
    fn test_checkpoint_round_trip_preserves_search() {
        let (index, stored) = populated_index();
        let bytes = encode_checkpoint(&index);
        let topology = decode_checkpoint(&bytes).unwrap();
        assert_eq!(topology.dim, 8);
        assert_eq!(topology.nodes.len(), 80);

        let vectors: std::collections::HashMap<Uid, Vector> =
            stored.iter().cloned().collect();
        let restored =
            HnswIndex::from_topology(*index.params(), topology, |id| Ok(vectors.get(&id).cloned()))
                .unwrap();

        assert_eq!(restored.len(), index.len());
        assert_eq!(restored.tombstone_count(), 2);
        let cx = Cx::new();
        let query = &stored[30].1;
        let before = index.search(&cx, query, 10, None, None).unwrap();
        let after = restored.search(&cx, query, 10, None, None).unwrap();
        assert_eq!(
            before.iter().map(|h| h.id).collect::<Vec<_>>(),
            after.iter().map(|h| h.id).collect::<Vec<_>>(),
            "case=identical_results_after_restore"
        );
    }

    #[test]
    fn test_checkpoint_detects_flipped_bit() {
        let (index, _) = populated_index();
        let mut bytes = encode_checkpoint(&index);
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x40;
        let err = decode_checkpoint(&bytes).unwrap_err();
        assert_eq!(err.kind_name(), "IntegrityError");
    }

    #[test]
    fn test_checkpoint_rejects_truncation() {
        let (index, _) = populated_index();
        let bytes = encode_checkpoint(&index);
        let err = decode_checkpoint(&bytes[..bytes.len() / 3]).unwrap_err();
        assert_eq!(err.kind_name(), "IntegrityError");
    }

    #[test]
    fn test_log_append_and_decode() {
        let records = vec![
            LogRecord::Insert {
                id: uid(1),
                level: 2,
            },
            LogRecord::Delete { id: uid(2) },
        ];
        let log = encode_log_records(&[], &records);
        let more = vec![LogRecord::Insert {
            id: uid(3),
            level: 0,
        }];
        let log = encode_log_records(&log, &more);
        let decoded = decode_log(&log).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0], records[0]);
        assert_eq!(decoded[1], records[1]);
        assert_eq!(decoded[2], more[0]);
    }

    #[test]
    fn test_log_tolerates_torn_tail() {
        let records = vec![LogRecord::Insert {
            id: uid(1),
            level: 1,
        }];
        let mut log = encode_log_records(&[], &records);
        // Simulate a crash mid-append of a second record.
        log.extend_from_slice(&[RECORD_INSERT, 0xAB, 0xCD]);
        let decoded = decode_log(&log).unwrap();
        assert_eq!(decoded.len(), 1, "case=torn_tail_dropped");
    }

    #[test]
    fn test_log_checksum_mismatch_is_corruption() {
        let records = vec![
            LogRecord::Insert {
                id: uid(1),
                level: 1,
            },
            LogRecord::Delete { id: uid(2) },
        ];
        let mut log = encode_log_records(&[], &records);
        // Corrupt the first record's body.
        log[7] ^= 0xFF;
        let err = decode_log(&log).unwrap_err();
        assert_eq!(err.kind_name(), "IntegrityError");
    }

    #[test]
    fn test_empty_log_decodes_empty() {
        assert!(decode_log(&[]).unwrap().is_empty());
    }
}
