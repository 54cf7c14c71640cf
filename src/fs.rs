//! The virtual reference filesystem.
//!
//! `ReferenceFs` resolves paths through a reference store, routes byte
//! reads to the backend owning each target URL, and batches bulk reads
//! through the range coalescer. The namespace is read-only; the reference
//! store itself stays mutable for catalog authoring.

use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backend::{split_protocol, window_bytes, BackendSet, ByteBackend};
use crate::coalesce::{merge_ranges, ByteRange};
use crate::dircache::{DirCache, DirEntry};
use crate::error::{RefError, Result};
use crate::reference::Reference;
use crate::spec::{parse_spec, refs_to_json};
use crate::store::{LazyRefMap, RefStore};

/// Default inter-range gap budget for merging, in bytes (64 kB).
pub const DEFAULT_MAX_GAP: i64 = 64_000;
/// Default merged-block size budget, in bytes (256 MB).
pub const DEFAULT_MAX_BLOCK: u64 = 256_000_000;
/// Default lazy-map page cache capacity, in records.
pub const DEFAULT_CACHE_SIZE: usize = 128;

/// Where the references come from.
#[derive(Debug, Clone)]
pub enum RefSource {
    /// An already-parsed JSON reference spec.
    Spec(Value),
    /// A URL naming either a JSON spec file or a record-paged store root.
    Url(String),
    /// A record-paged store root.
    Dir(String),
}

/// Per-path failure policy for bulk reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnError {
    /// Abort the whole batch on the first failure.
    #[default]
    Raise,
    /// Drop failed paths from the result.
    Omit,
    /// Keep failed paths, with the error as their value.
    Return,
}

fn normalize(path: &str) -> &str {
    path.trim_matches('/')
}

// ── Builder ────────────────────────────────────────────────────────

pub struct ReferenceFsBuilder {
    source: RefSource,
    target: Option<String>,
    backends: Vec<(String, Arc<dyn ByteBackend>)>,
    default_backend: Option<Arc<dyn ByteBackend>>,
    remote_protocol: Option<String>,
    template_overrides: Option<IndexMap<String, String>>,
    simple_templates: bool,
    max_gap: i64,
    max_block: u64,
    cache_size: usize,
}

impl ReferenceFsBuilder {
    fn new(source: RefSource) -> Self {
        ReferenceFsBuilder {
            source,
            target: None,
            backends: Vec::new(),
            default_backend: None,
            remote_protocol: None,
            template_overrides: None,
            simple_templates: true,
            max_gap: DEFAULT_MAX_GAP,
            max_block: DEFAULT_MAX_BLOCK,
            cache_size: DEFAULT_CACHE_SIZE,
        }
    }

    /// Default target URL for references whose own URL is null.
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Register a backend for one protocol.
    pub fn backend(mut self, protocol: impl Into<String>, backend: Arc<dyn ByteBackend>) -> Self {
        self.backends.push((protocol.into(), backend));
        self
    }

    /// Backend for scheme-less URLs (defaults to the local filesystem).
    pub fn default_backend(mut self, backend: Arc<dyn ByteBackend>) -> Self {
        self.default_backend = Some(backend);
        self
    }

    /// Protocol the references resolve against when none can be derived
    /// from the spec itself.
    pub fn remote_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.remote_protocol = Some(protocol.into());
        self
    }

    /// Shadow entries of the spec's template set.
    pub fn template_overrides(mut self, overrides: IndexMap<String, String>) -> Self {
        self.template_overrides = Some(overrides);
        self
    }

    /// Choose simple (name-substitution) vs. full template expansion.
    pub fn simple_templates(mut self, simple: bool) -> Self {
        self.simple_templates = simple;
        self
    }

    /// Largest inter-range gap the coalescer bridges. Negative disables
    /// merging.
    pub fn max_gap(mut self, max_gap: i64) -> Self {
        self.max_gap = max_gap;
        self
    }

    /// Largest merged block the coalescer emits.
    pub fn max_block(mut self, max_block: u64) -> Self {
        self.max_block = max_block;
        self
    }

    /// Lazy-map page cache capacity, in records.
    pub fn cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub async fn build(self) -> Result<ReferenceFs> {
        let mut backends = BackendSet::default();
        for (protocol, backend) in self.backends {
            backends.insert(protocol, backend);
        }
        if let Some(fallback) = self.default_backend {
            backends.set_fallback(fallback);
        }

        let overrides = self.template_overrides.as_ref();
        let (store, templates) = match self.source {
            RefSource::Spec(value) => {
                let (map, templates) = parse_spec(&value, overrides, self.simple_templates)?;
                (RefStore::Eager(map), Some(templates))
            }
            RefSource::Dir(root) => {
                if let (Some(proto), _) = split_protocol(&root) {
                    backends.ensure_default(proto)?;
                }
                let fs = backends.for_url(&root)?.clone();
                let map = LazyRefMap::open(root, fs, self.cache_size).await?;
                (RefStore::Lazy(map), None)
            }
            RefSource::Url(url) => {
                if let (Some(proto), _) = split_protocol(&url) {
                    backends.ensure_default(proto)?;
                }
                let fs = backends.for_url(&url)?.clone();
                if fs.is_dir(&url).await {
                    let map = LazyRefMap::open(url, fs, self.cache_size).await?;
                    (RefStore::Lazy(map), None)
                } else {
                    let raw = fs.cat_file(&url, None, None).await?;
                    info!(url = %url, "read reference spec");
                    let value: Value = serde_json::from_slice(&raw)?;
                    let (map, templates) = parse_spec(&value, overrides, self.simple_templates)?;
                    (RefStore::Eager(map), Some(templates))
                }
            }
        };

        // Derive backends the spec needs but the caller didn't provide:
        // an explicit remote protocol wins, then template URLs, then the
        // first referenced URL carrying a protocol.
        if let Some(proto) = &self.remote_protocol {
            backends.ensure_default(proto)?;
        } else {
            let mut derived = false;
            if let Some(templates) = &templates {
                for value in templates.rendered_values() {
                    if let (Some(proto), _) = split_protocol(&value) {
                        backends.ensure_default(proto)?;
                        derived = true;
                    }
                }
            }
            if !derived {
                if let RefStore::Eager(map) = &store {
                    for (_, reference) in map.iter() {
                        if let Some((Some(proto), _)) = reference.url().map(split_protocol) {
                            backends.ensure_default(proto)?;
                            break;
                        }
                    }
                }
            }
        }

        Ok(ReferenceFs {
            store,
            backends,
            target: self.target,
            max_gap: self.max_gap,
            max_block: self.max_block,
            dircache: Mutex::new(None),
        })
    }
}

// ── ReferenceFs ────────────────────────────────────────────────────

pub struct ReferenceFs {
    store: RefStore,
    backends: BackendSet,
    target: Option<String>,
    max_gap: i64,
    max_block: u64,
    dircache: Mutex<Option<Arc<DirCache>>>,
}

/// A path resolved for reading.
enum Resolved {
    Inline(Bytes),
    Remote {
        url: String,
        start: Option<i64>,
        end: Option<i64>,
    },
}

impl ReferenceFs {
    pub fn builder(source: RefSource) -> ReferenceFsBuilder {
        ReferenceFsBuilder::new(source)
    }

    /// Build from an already-parsed spec with defaults.
    pub async fn from_spec(spec: Value) -> Result<Self> {
        Self::builder(RefSource::Spec(spec)).build().await
    }

    /// Build from a JSON spec URL or a record-paged store root.
    pub async fn from_url(url: impl Into<String>) -> Result<Self> {
        Self::builder(RefSource::Url(url.into())).build().await
    }

    pub fn store(&self) -> &RefStore {
        &self.store
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    // -- Resolution -----------------------------------------------------------

    fn target_url(&self, url: Option<String>, path: &str) -> Result<String> {
        url.or_else(|| self.target.clone()).ok_or_else(|| {
            RefError::BadSpec(format!(
                "reference '{path}' has no target URL and no default target is configured"
            ))
        })
    }

    /// Resolve a path and compose the caller's window with the reference.
    /// For a slice `[o, o + sz)`, non-negative offsets are relative to
    /// `o`, negative offsets to `o + sz`.
    async fn cat_common(
        &self,
        path: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Resolved> {
        match self.store.get(path).await? {
            Reference::Inline(data) => Ok(Resolved::Inline(data)),
            Reference::Whole(url) => Ok(Resolved::Remote {
                url: self.target_url(url, path)?,
                start,
                end,
            }),
            Reference::Slice { url, offset, size } => {
                let end0 = offset + size;
                let resolve = |v: Option<i64>, default: u64| -> u64 {
                    match v {
                        None => default,
                        Some(v) if v >= 0 => offset + v as u64,
                        Some(v) => end0.saturating_sub(v.unsigned_abs()),
                    }
                };
                Ok(Resolved::Remote {
                    url: self.target_url(url, path)?,
                    start: Some(resolve(start, offset) as i64),
                    end: Some(resolve(end, end0) as i64),
                })
            }
            Reference::Absent => Err(RefError::NotFound(path.to_string())),
        }
    }

    // -- Reads ----------------------------------------------------------------

    /// Read one virtual file, optionally a window of it.
    pub async fn cat_file(
        &self,
        path: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Bytes> {
        let path = normalize(path);
        debug!(path, "cat_file");
        match self.cat_common(path, start, end).await? {
            Resolved::Inline(data) => Ok(window_bytes(&data, start, end)),
            Resolved::Remote { url, start, end } => {
                let backend = self.backends.for_url(&url)?;
                backend
                    .cat_file(&url, start, end)
                    .await
                    .map_err(|e| RefError::not_reachable(path, &url, e))
            }
        }
    }

    /// Read many virtual files in one pass: resolve, group by protocol,
    /// coalesce ranges, fetch, unbundle.
    pub async fn cat(
        &self,
        paths: &[&str],
        on_error: OnError,
    ) -> Result<BTreeMap<String, Result<Bytes>>> {
        if paths.iter().any(|p| p.contains('*')) {
            return Err(RefError::Unsupported(
                "glob patterns are not supported in bulk cat".into(),
            ));
        }

        struct Pending {
            path: String,
            url: String,
            start: Option<u64>,
            end: Option<u64>,
        }

        let mut out: BTreeMap<String, Result<Bytes>> = BTreeMap::new();
        let mut groups: IndexMap<Option<String>, Vec<Pending>> = IndexMap::new();

        for &raw_path in paths {
            let path = normalize(raw_path);
            match self.cat_common(path, None, None).await {
                Ok(Resolved::Inline(data)) => {
                    out.insert(path.to_string(), Ok(data));
                }
                Ok(Resolved::Remote { url, start, end }) => {
                    let protocol = split_protocol(&url).0.map(str::to_string);
                    groups.entry(protocol).or_default().push(Pending {
                        path: path.to_string(),
                        url,
                        start: start.map(|v| v.max(0) as u64),
                        end: end.map(|v| v.max(0) as u64),
                    });
                }
                Err(e) => match on_error {
                    OnError::Raise => return Err(e),
                    OnError::Omit => {}
                    OnError::Return => {
                        out.insert(path.to_string(), Err(e));
                    }
                },
            }
        }

        for (protocol, pending) in groups {
            let backend = self.backends.get(protocol.as_deref())?;

            // A whole-file fetch subsumes any slice of the same url
            // within this batch.
            let whole_files: HashSet<&str> = pending
                .iter()
                .filter(|p| p.start.is_none())
                .map(|p| p.url.as_str())
                .collect();
            let mut requests: Vec<ByteRange> = Vec::new();
            for p in &pending {
                if p.start.is_none() {
                    requests.push(ByteRange::whole(p.url.clone()));
                }
            }
            for p in &pending {
                if let (Some(s), Some(e)) = (p.start, p.end) {
                    if !whole_files.contains(p.url.as_str()) {
                        requests.push(ByteRange::new(p.url.clone(), s, e));
                    }
                }
            }

            let merged = merge_ranges(&requests, self.max_gap, self.max_block);
            let results = backend.cat_ranges(&merged).await;

            for p in &pending {
                let index = merged.iter().position(|m| {
                    m.url == p.url
                        && match (p.start, p.end) {
                            (Some(s), Some(e)) => m.is_whole() || m.covers(&p.url, s, e),
                            _ => m.is_whole(),
                        }
                });
                let outcome: Result<Bytes> = match index {
                    None => Err(RefError::Backend(format!(
                        "no merged range covers '{}'",
                        p.path
                    ))),
                    Some(i) => match &results[i] {
                        Err(e) => Err(RefError::Backend(e.to_string())),
                        Ok(bytes) => Ok(unbundle(bytes, &merged[i], p.start, p.end)),
                    },
                };
                match outcome {
                    Ok(data) => {
                        out.insert(p.path.clone(), Ok(data));
                    }
                    Err(cause) => {
                        warn!(path = %p.path, url = %p.url, error = %cause, "bulk fetch failed");
                        let wrapped = RefError::not_reachable(&p.path, &p.url, cause);
                        match on_error {
                            OnError::Raise => return Err(wrapped),
                            OnError::Omit => {}
                            OnError::Return => {
                                out.insert(p.path.clone(), Err(wrapped));
                            }
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Read a whole virtual file into a seekable in-memory reader. No
    /// streaming: references are chunk-sized by construction.
    pub async fn open(&self, path: &str) -> Result<Cursor<Bytes>> {
        Ok(Cursor::new(self.cat_file(path, None, None).await?))
    }

    /// Materialize one virtual file (or directory) at a local path.
    pub async fn get_file(&self, path: &str, local: &Path) -> Result<()> {
        if self.isdir(path).await {
            tokio::fs::create_dir_all(local).await?;
            return Ok(());
        }
        let data = self.cat_file(path, None, None).await?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local, &data).await?;
        Ok(())
    }

    // -- Listings -------------------------------------------------------------

    pub async fn ls(&self, path: &str) -> Result<Vec<DirEntry>> {
        let path = normalize(path);
        match &self.store {
            RefStore::Lazy(map) => map.ls(path).await,
            RefStore::Eager(_) => self
                .dircache()
                .ls(path)
                .map(<[DirEntry]>::to_vec)
                .ok_or_else(|| RefError::NotFound(path.to_string())),
        }
    }

    /// Entry details for one path. The size of a whole-URL reference is
    /// filled in by asking the backing store.
    pub async fn info(&self, path: &str) -> Result<DirEntry> {
        let path = normalize(path);
        match self.store.get(path).await {
            Ok(reference) => {
                let size = match &reference {
                    Reference::Whole(url) => {
                        let url = self.target_url(url.clone(), path)?;
                        let backend = self.backends.for_url(&url)?;
                        let size = backend
                            .size(&url)
                            .await
                            .map_err(|e| RefError::not_reachable(path, &url, e))?;
                        Some(size)
                    }
                    other => other.size_hint(),
                };
                Ok(DirEntry::file(path, size))
            }
            Err(e) if e.is_not_found() => {
                if self.isdir(path).await {
                    Ok(DirEntry::directory(path))
                } else {
                    Err(RefError::NotFound(path.to_string()))
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn isdir(&self, path: &str) -> bool {
        let path = normalize(path);
        if path.is_empty() {
            return true;
        }
        match &self.store {
            RefStore::Lazy(map) => map.is_dir(path),
            RefStore::Eager(_) => self.dircache().is_dir(path),
        }
    }

    pub async fn isfile(&self, path: &str) -> bool {
        self.store.contains(normalize(path)).await
    }

    pub async fn exists(&self, path: &str) -> bool {
        self.isfile(path).await || self.isdir(path).await
    }

    /// All keys under a prefix, sorted. For lazy stores this lists
    /// *expected* chunks.
    pub fn find(&self, path: &str) -> Vec<String> {
        let path = normalize(path);
        let mut keys: Vec<String> = self
            .store
            .keys()
            .into_iter()
            .filter(|k| path.is_empty() || k.starts_with(path))
            .collect();
        keys.sort();
        keys
    }

    // -- Catalog authoring ----------------------------------------------------

    /// Add or replace one reference. Directory paths are synthesized, not
    /// stored, and cannot be written.
    pub async fn pipe_file(&mut self, path: &str, value: Reference) -> Result<()> {
        let path = normalize(path);
        if !self.store.contains(path).await && self.isdir(path).await {
            return Err(RefError::ReadOnly(format!("'{path}' is a directory")));
        }
        self.store.put(path, value).await?;
        self.invalidate_dircache();
        Ok(())
    }

    /// Remove one reference.
    pub async fn rm_file(&mut self, path: &str) -> Result<()> {
        self.store.delete(normalize(path)).await?;
        self.invalidate_dircache();
        Ok(())
    }

    /// Persist staged state of the reference store.
    pub async fn flush(&mut self) -> Result<()> {
        self.store.flush().await
    }

    /// Write the current references as a version-1 JSON spec.
    pub async fn save_json(&self, url: &str) -> Result<()> {
        let mut entries = Vec::new();
        for key in self.store.keys() {
            match self.store.get(&key).await {
                Ok(reference) => entries.push((key, reference)),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        let value = refs_to_json(entries);
        let backend = self.backends.for_url(url)?;
        backend.pipe(url, Bytes::from(serde_json::to_vec(&value)?)).await
    }

    // -- Internals ------------------------------------------------------------

    fn dircache(&self) -> Arc<DirCache> {
        let mut guard = self.dircache.lock().expect("dircache poisoned");
        if let Some(cache) = &*guard {
            return cache.clone();
        }
        let entries: Vec<(String, Option<u64>)> = match &self.store {
            RefStore::Eager(map) => map
                .iter()
                .filter(|(_, v)| !matches!(v, Reference::Absent))
                .map(|(k, v)| (k.clone(), v.size_hint()))
                .collect(),
            RefStore::Lazy(_) => Vec::new(),
        };
        let built = Arc::new(DirCache::build(entries));
        *guard = Some(built.clone());
        built
    }

    fn invalidate_dircache(&self) {
        *self.dircache.lock().expect("dircache poisoned") = None;
    }
}

/// Cut one path's window out of a merged fetch result.
fn unbundle(bytes: &Bytes, merged: &ByteRange, start: Option<u64>, end: Option<u64>) -> Bytes {
    match (merged.start, start, end) {
        // Whole-object fetch serving a slice of it.
        (None, Some(s), Some(e)) => window_bytes(bytes, Some(s as i64), Some(e as i64)),
        // Whole-object fetch serving a whole-file path.
        (None, _, _) => bytes.clone(),
        // Concrete merged range: trim the lead and tail.
        (Some(ns), Some(s), Some(e)) => {
            let ne = merged.end.unwrap_or(ns);
            let lead = (s.saturating_sub(ns)) as usize;
            let tail = (ne.saturating_sub(e)) as usize;
            let hi = bytes.len().saturating_sub(tail).max(lead).min(bytes.len());
            bytes.slice(lead.min(bytes.len())..hi)
        }
        _ => bytes.clone(),
    }
}
