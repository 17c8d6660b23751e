//! Key-prefix-directed payload classification and legacy unwrapping.
//!
//! The key alone decides whether a payload is JSON or raw bytes. Content
//! probing is forbidden: compressed binary can parse as valid JSON and a
//! sniffing decoder will corrupt it. The only sanctioned byte inspection is
//! the legacy `{"_binary":true,...}` envelope check, which matches an exact
//! marker prefix rather than attempting a parse.

use std::borrow::Cow;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;

use mnemo_error::{MnemoError, Result};

/// How a payload travels through the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadClass {
    /// Canonical UTF-8 JSON.
    Json,
    /// Opaque bytes, stored verbatim.
    Binary,
}

/// Classify a backend key by its prefix.
///
/// `refs/` and legacy `ref:`/`-meta:` keys carry JSON; `blob/`, `commit/`,
/// and `tree/` (and their legacy colon spellings) carry raw bytes. Unknown
/// keys default to binary, the corruption-safe direction.
#[must_use]
pub fn classify(key: &str) -> PayloadClass {
    if key.starts_with("refs/") || key.starts_with("ref:") || key.contains("-meta:") {
        return PayloadClass::Json;
    }
    PayloadClass::Binary
}

/// Marker the legacy envelope always starts with (canonical key order).
const ENVELOPE_MARKER: &[u8] = b"{\"_binary\":true,";

#[derive(Deserialize)]
struct BinaryEnvelope {
    #[serde(rename = "_binary")]
    _binary: bool,
    data: String,
}

/// Unwrap a binary-class payload.
///
/// Accepts either raw bytes (returned borrowed) or the legacy base64
/// envelope some earlier on-disk stores wrote.
pub fn unwrap_binary(bytes: &[u8]) -> Result<Cow<'_, [u8]>> {
    if !bytes.starts_with(ENVELOPE_MARKER) {
        return Ok(Cow::Borrowed(bytes));
    }
    let envelope: BinaryEnvelope = serde_json::from_slice(bytes).map_err(|err| {
        MnemoError::Integrity {
            what: "binary envelope",
            detail: err.to_string(),
        }
    })?;
    let decoded = BASE64
        .decode(envelope.data.as_bytes())
        .map_err(|err| MnemoError::Integrity {
            what: "binary envelope",
            detail: format!("base64: {err}"),
        })?;
    Ok(Cow::Owned(decoded))
}

/// Wrap bytes in the legacy envelope. Only used by migration tooling and
/// tests; new writes always store raw bytes.
#[must_use]
pub fn wrap_binary_legacy(bytes: &[u8]) -> Vec<u8> {
    format!(
        "{{\"_binary\":true,\"data\":\"{}\"}}",
        BASE64.encode(bytes)
    )
    .into_bytes()
}
