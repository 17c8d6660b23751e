//! Entity/relationship identifiers and the 2-hex-char shard scheme.
//!
//! A [`Uid`] is 16 raw bytes, accepted as 32 hex chars with or without
//! hyphens and rendered lowercase without hyphens on the wire. The shard of
//! a uid is its first byte, which is exactly the first two hex chars, so
//! every key space partitions into 256 scan-friendly buckets with no
//! configuration.

use std::fmt;

use mnemo_error::{MnemoError, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::traits::RngSource;

/// A 128-bit identifier, rendered as 32 lowercase hex chars.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid([u8; 16]);

impl Uid {
    /// Parse a uid from hex, tolerating hyphens and uppercase.
    ///
    /// # Errors
    /// `InvalidArgument` when the input does not normalize to exactly 32
    /// hex characters.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut bytes = [0_u8; 16];
        let mut nibbles = 0_usize;
        for ch in raw.chars() {
            if ch == '-' {
                continue;
            }
            let Some(v) = ch.to_digit(16) else {
                return Err(MnemoError::invalid("uuid", raw));
            };
            if nibbles >= 32 {
                return Err(MnemoError::invalid("uuid", raw));
            }
            let byte = &mut bytes[nibbles / 2];
            *byte = (*byte << 4) | v as u8;
            nibbles += 1;
        }
        if nibbles != 32 {
            return Err(MnemoError::invalid("uuid", raw));
        }
        Ok(Self(bytes))
    }

    /// A random version-4-shaped uid drawn from the injected rng.
    #[must_use]
    pub fn random(rng: &dyn RngSource) -> Self {
        let hi = rng.next_u64().to_be_bytes();
        let lo = rng.next_u64().to_be_bytes();
        let mut bytes = [0_u8; 16];
        bytes[..8].copy_from_slice(&hi);
        bytes[8..].copy_from_slice(&lo);
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;
        Self(bytes)
    }

    /// Raw big-endian bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Rebuild from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// The uid's shard bucket.
    #[must_use]
    pub const fn shard(&self) -> Shard {
        Shard(self.0[0])
    }

    /// 32-char lowercase hex rendering (the wire form).
    #[must_use]
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(32);
        for byte in self.0 {
            out.push(char::from_digit(u32::from(byte >> 4), 16).unwrap_or('0'));
            out.push(char::from_digit(u32::from(byte & 0x0f), 16).unwrap_or('0'));
        }
        out
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({self})")
    }
}

impl Serialize for Uid {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Uid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(D::Error::custom)
    }
}

/// One of 256 hex-prefix buckets partitioning every key space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Shard(u8);

impl Shard {
    /// Build from the raw bucket number.
    #[must_use]
    pub const fn new(bucket: u8) -> Self {
        Self(bucket)
    }

    /// Raw bucket number.
    #[must_use]
    pub const fn bucket(&self) -> u8 {
        self.0
    }

    /// All 256 shards in ascending order, for deterministic full scans.
    pub fn all() -> impl Iterator<Item = Self> {
        (0_u16..256).map(|b| Self(b as u8))
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shard({self})")
    }
}
