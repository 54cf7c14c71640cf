//! Backing byte stores.
//!
//! The reference filesystem never owns the bytes it serves; every resolved
//! reference is fetched from a backend keyed by URL protocol. The contract
//! is small: a single-range read, a parallel multi-range read, an object
//! size probe, and (for catalog authoring) a whole-object write.

pub mod http;
pub mod local;
pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;

use crate::coalesce::ByteRange;
use crate::error::{RefError, Result};

pub use http::HttpBackend;
pub use local::LocalBackend;
pub use memory::MemoryBackend;

// ── URL helpers ────────────────────────────────────────────────────

/// Split `proto://rest` into `(Some(proto), rest)`; URLs without a scheme
/// map to `(None, url)`.
pub fn split_protocol(url: &str) -> (Option<&str>, &str) {
    match url.split_once("://") {
        Some((proto, rest))
            if !proto.is_empty()
                && proto
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) =>
        {
            (Some(proto), rest)
        }
        _ => (None, url),
    }
}

/// Resolve `start`/`end` against an object of `len` bytes, with Python
/// slice semantics: negative offsets count from the end, out-of-range
/// offsets clamp, and an inverted range is empty.
pub fn byte_window(len: u64, start: Option<i64>, end: Option<i64>) -> (u64, u64) {
    let resolve = |v: Option<i64>, default: u64| -> u64 {
        match v {
            None => default,
            Some(v) if v >= 0 => (v as u64).min(len),
            Some(v) => len.saturating_sub(v.unsigned_abs()),
        }
    };
    let s = resolve(start, 0);
    let e = resolve(end, len);
    (s, e.max(s))
}

/// Slice `data` with Python semantics.
pub fn window_bytes(data: &Bytes, start: Option<i64>, end: Option<i64>) -> Bytes {
    let (s, e) = byte_window(data.len() as u64, start, end);
    data.slice(s as usize..e as usize)
}

// ── Backend contract ───────────────────────────────────────────────

#[async_trait]
pub trait ByteBackend: Send + Sync {
    /// Primary protocol this backend serves.
    fn protocol(&self) -> &'static str;

    /// Read `[start, end)` of one object. `None` endpoints extend to the
    /// object's own bounds; negative offsets count from the end.
    async fn cat_file(&self, url: &str, start: Option<i64>, end: Option<i64>) -> Result<Bytes>;

    /// Read many ranges in parallel. One result per input range; a failed
    /// range does not abort its siblings.
    async fn cat_ranges(&self, ranges: &[ByteRange]) -> Vec<Result<Bytes>> {
        join_all(ranges.iter().map(|r| {
            self.cat_file(
                &r.url,
                r.start.map(|v| v as i64),
                r.end.map(|v| v as i64),
            )
        }))
        .await
    }

    /// Size of one object in bytes.
    async fn size(&self, url: &str) -> Result<u64>;

    /// Write one whole object. Read-only backends refuse.
    async fn pipe(&self, url: &str, _data: Bytes) -> Result<()> {
        Err(RefError::ReadOnly(format!(
            "backend '{}' cannot write {url}",
            self.protocol()
        )))
    }

    /// True if `url` names a directory. Only meaningful for backends with
    /// a real directory structure.
    async fn is_dir(&self, _url: &str) -> bool {
        false
    }
}

// ── Registry ───────────────────────────────────────────────────────

/// Backends keyed by protocol, with a fallback for scheme-less URLs.
#[derive(Clone)]
pub struct BackendSet {
    by_protocol: HashMap<String, Arc<dyn ByteBackend>>,
    fallback: Arc<dyn ByteBackend>,
}

impl Default for BackendSet {
    fn default() -> Self {
        BackendSet {
            by_protocol: HashMap::new(),
            fallback: Arc::new(LocalBackend),
        }
    }
}

impl BackendSet {
    pub fn insert(&mut self, protocol: impl Into<String>, backend: Arc<dyn ByteBackend>) {
        self.by_protocol.insert(protocol.into(), backend);
    }

    pub fn set_fallback(&mut self, backend: Arc<dyn ByteBackend>) {
        self.fallback = backend;
    }

    pub fn contains(&self, protocol: &str) -> bool {
        self.by_protocol.contains_key(protocol)
    }

    /// Backend for a protocol; `None` selects the fallback.
    pub fn get(&self, protocol: Option<&str>) -> Result<&Arc<dyn ByteBackend>> {
        match protocol {
            None => Ok(&self.fallback),
            Some(p) => self
                .by_protocol
                .get(p)
                .ok_or_else(|| RefError::UnknownProtocol(p.to_string())),
        }
    }

    /// Backend responsible for a URL.
    pub fn for_url(&self, url: &str) -> Result<&Arc<dyn ByteBackend>> {
        self.get(split_protocol(url).0)
    }

    /// Register the built-in default backend for a protocol if none is
    /// registered yet. Protocols without a built-in default must be
    /// provided explicitly.
    pub fn ensure_default(&mut self, protocol: &str) -> Result<()> {
        if self.contains(protocol) {
            return Ok(());
        }
        let backend: Arc<dyn ByteBackend> = match protocol {
            "file" => Arc::new(LocalBackend),
            "http" | "https" => Arc::new(HttpBackend::new()),
            "memory" => Arc::new(MemoryBackend::new()),
            other => return Err(RefError::UnknownProtocol(other.to_string())),
        };
        self.insert(protocol, backend);
        Ok(())
    }
}

// -- Tests --------------------------------------------------------------------
