//! Reference values: where the bytes of a virtual file come from.
//!
//! A reference is inline data, a whole-URL read, a byte range inside a URL,
//! or the `Absent` tombstone marking an explicitly deleted key (distinct
//! from a key that never existed, which surfaces as `NotFound`).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;

use crate::error::{RefError, Result};

/// Prefix marking base64-wrapped inline payloads, in JSON specs and in the
/// `raw` column of record files.
pub const BASE64_PREFIX: &[u8] = b"base64:";

// ── Reference ──────────────────────────────────────────────────────

/// A single reference: the definition of one virtual file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// Literal bytes, already decoded.
    Inline(Bytes),
    /// A URL to be read whole (or with caller-supplied start/end).
    /// `None` defers to the configured default target URL.
    Whole(Option<String>),
    /// The half-open byte range `[offset, offset + size)` of a URL.
    Slice {
        url: Option<String>,
        offset: u64,
        size: u64,
    },
    /// Tombstone: explicitly deleted.
    Absent,
}

impl Reference {
    /// Build an inline reference from a spec string, decoding the
    /// `"base64:"` form.
    pub fn inline_from_str(s: &str) -> Result<Self> {
        Ok(Reference::Inline(decode_inline(s.as_bytes())?))
    }

    /// The size this reference declares, if it declares one.
    ///
    /// `Whole` references don't know their size; `info` fills it in by
    /// asking the backing store.
    pub fn size_hint(&self) -> Option<u64> {
        match self {
            Reference::Inline(b) => Some(b.len() as u64),
            Reference::Slice { size, .. } => Some(*size),
            Reference::Whole(_) | Reference::Absent => None,
        }
    }

    /// The target URL, if this reference names one.
    pub fn url(&self) -> Option<&str> {
        match self {
            Reference::Whole(u) => u.as_deref(),
            Reference::Slice { url, .. } => url.as_deref(),
            _ => None,
        }
    }
}

// ── Path predicates ────────────────────────────────────────────────

/// True for metadata paths: the path, or its last segment, begins with `.z`.
pub fn is_metadata_key(path: &str) -> bool {
    path.starts_with(".z") || path.contains("/.z")
}

// ── Inline payload encoding ────────────────────────────────────────

/// Decode an inline payload: raw bytes pass through, `"base64:" + b64(...)`
/// is unwrapped.
pub fn decode_inline(raw: &[u8]) -> Result<Bytes> {
    if let Some(b64) = raw.strip_prefix(BASE64_PREFIX) {
        let decoded = BASE64
            .decode(b64)
            .map_err(|e| RefError::BadSpec(format!("invalid base64 inline data: {e}")))?;
        Ok(Bytes::from(decoded))
    } else {
        Ok(Bytes::copy_from_slice(raw))
    }
}

/// Encode inline bytes for the `raw` column of a record file: ASCII bytes
/// pass through, anything else is base64-wrapped.
pub fn encode_raw(data: &[u8]) -> Vec<u8> {
    if data.is_ascii() {
        data.to_vec()
    } else {
        let mut out = BASE64_PREFIX.to_vec();
        out.extend_from_slice(BASE64.encode(data).as_bytes());
        out
    }
}

/// Encode inline bytes for JSON serialization: an ASCII string, else the
/// `"base64:"` form.
pub fn encode_inline_json(data: &[u8]) -> String {
    if data.is_ascii() {
        // ASCII is valid UTF-8 by construction.
        String::from_utf8_lossy(data).into_owned()
    } else {
        format!("base64:{}", BASE64.encode(data))
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_key_detection() {
        assert!(is_metadata_key(".zmetadata"));
        assert!(is_metadata_key(".zgroup"));
        assert!(is_metadata_key("temp/.zarray"));
        assert!(is_metadata_key("a/b/.zattrs"));
        assert!(!is_metadata_key("temp/0.0"));
        assert!(!is_metadata_key("data"));
        assert!(!is_metadata_key("z/0"));
    }

    #[test]
    fn decode_plain_and_base64() {
        assert_eq!(decode_inline(b"hello").unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(
            decode_inline(b"base64:aGVsbG8=").unwrap(),
            Bytes::from_static(b"hello")
        );
        assert!(decode_inline(b"base64:!!notb64!!").is_err());
    }

    #[test]
    fn raw_encoding_wraps_non_ascii() {
        assert_eq!(encode_raw(b"plain ascii"), b"plain ascii".to_vec());
        let wrapped = encode_raw(&[0xff, 0x00, 0x80]);
        assert!(wrapped.starts_with(BASE64_PREFIX));
        assert_eq!(decode_inline(&wrapped).unwrap(), Bytes::from_static(&[0xff, 0x00, 0x80]));
    }

    #[test]
    fn json_encoding_round_trips() {
        assert_eq!(encode_inline_json(b"hello"), "hello");
        let enc = encode_inline_json(&[0xde, 0xad]);
        assert!(enc.starts_with("base64:"));
        assert_eq!(
            decode_inline(enc.as_bytes()).unwrap(),
            Bytes::from_static(&[0xde, 0xad])
        );
    }

    #[test]
    fn size_hints() {
        assert_eq!(Reference::Inline(Bytes::from_static(b"abc")).size_hint(), Some(3));
        assert_eq!(
            Reference::Slice { url: Some("u".into()), offset: 10, size: 5 }.size_hint(),
            Some(5)
        );
        assert_eq!(Reference::Whole(Some("u".into())).size_hint(), None);
    }
}
