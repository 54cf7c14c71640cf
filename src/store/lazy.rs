//! Lazily loaded, on-disk, record-paged reference map.
//!
//! A catalog of tens of millions of references cannot live in memory. The
//! lazy map keeps only `.zmetadata` resident and pages references in and
//! out in fixed-size records: for each field, `refs.<record>.parq` files
//! of up to `record_size` rows, loaded through the backing store into a
//! bounded LRU cache on first touch.
//!
//! Writes are staged: `put`/`delete` land in an in-memory partition keyed
//! `(field, record)` — the analog of a memtable ahead of immutable
//! segments. A partition is written out eagerly once every expected row of
//! its record has been assigned, or explicitly on `flush`, which also
//! rewrites `.zmetadata` and drops the page cache.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backend::ByteBackend;
use crate::dircache::DirEntry;
use crate::error::{RefError, Result};
use crate::reference::{decode_inline, encode_raw, is_metadata_key, Reference};
use crate::store::block::{BlockCodec, RecordBlock, RowView, ZstdBlockCodec};
use crate::store::cache::PageCache;

/// Name of the store's root metadata document.
pub const ZMETADATA: &str = ".zmetadata";

// ── Chunk grid arithmetic ──────────────────────────────────────────

/// Number of chunks along each axis: `ceil(shape[i] / chunks[i])`. Empty
/// for scalar fields.
pub(crate) fn grid_from_zarray(zarray: &Value, key: &str) -> Result<Vec<u64>> {
    let shape = int_array(zarray, "shape", key)?;
    let chunks = int_array(zarray, "chunks", key)?;
    if shape.len() != chunks.len() {
        return Err(RefError::BadSpec(format!(
            "{key}: shape has {} axes but chunks has {}",
            shape.len(),
            chunks.len()
        )));
    }
    shape
        .iter()
        .zip(&chunks)
        .map(|(&s, &c)| {
            if c == 0 {
                Err(RefError::BadSpec(format!("{key}: chunk extent must not be 0")))
            } else {
                Ok((s + c - 1) / c)
            }
        })
        .collect()
}

fn int_array(zarray: &Value, name: &str, key: &str) -> Result<Vec<u64>> {
    zarray
        .get(name)
        .and_then(Value::as_array)
        .ok_or_else(|| RefError::BadSpec(format!("{key}: missing integer array '{name}'")))?
        .iter()
        .map(|v| {
            v.as_u64()
                .ok_or_else(|| RefError::BadSpec(format!("{key}: '{name}' holds non-integer {v}")))
        })
        .collect()
}

/// Total chunks in a grid; the scalar grid has exactly one.
pub(crate) fn chunk_count(grid: &[u64]) -> u64 {
    grid.iter().product()
}

/// Row-major (C-order) ravel of a dotted chunk id. The scalar grid admits
/// only id `"0"`.
pub(crate) fn ravel_chunk(chunk: &str, grid: &[u64]) -> Result<u64> {
    if grid.is_empty() {
        return if chunk == "0" {
            Ok(0)
        } else {
            Err(RefError::BadSpec(format!(
                "scalar field admits only chunk id '0', got '{chunk}'"
            )))
        };
    }
    let parts: Vec<&str> = chunk.split('.').collect();
    if parts.len() != grid.len() {
        return Err(RefError::BadSpec(format!(
            "chunk id '{chunk}' has {} components, grid has {} axes",
            parts.len(),
            grid.len()
        )));
    }
    let mut flat = 0u64;
    for (part, &extent) in parts.iter().zip(grid) {
        let idx: u64 = part
            .parse()
            .map_err(|_| RefError::BadSpec(format!("non-integer chunk id '{chunk}'")))?;
        if idx >= extent {
            return Err(RefError::BadSpec(format!(
                "chunk id '{chunk}' lies outside the {grid:?} grid"
            )));
        }
        flat = flat * extent + idx;
    }
    Ok(flat)
}

/// Inverse of [`ravel_chunk`].
pub(crate) fn unravel_chunk(mut flat: u64, grid: &[u64]) -> String {
    if grid.is_empty() {
        return "0".to_string();
    }
    let mut indices = vec![0u64; grid.len()];
    for (i, &extent) in grid.iter().enumerate().rev() {
        indices[i] = flat % extent;
        flat /= extent;
    }
    indices
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

// ── Store metadata ─────────────────────────────────────────────────

/// The `.zmetadata` document: page size plus every metadata entry,
/// already decoded.
#[derive(Debug, Serialize, Deserialize)]
struct StoreMeta {
    record_size: usize,
    metadata: IndexMap<String, Value>,
}

// ── LazyRefMap ─────────────────────────────────────────────────────

pub struct LazyRefMap {
    root: String,
    fs: Arc<dyn ByteBackend>,
    codec: Box<dyn BlockCodec>,
    record_size: usize,
    /// Decoded metadata entries (`.z*` paths).
    zmetadata: IndexMap<String, Value>,
    /// Directly staged top-level / metadata bytes, checked before
    /// `zmetadata` on reads.
    staged_top: HashMap<String, Bytes>,
    /// Dirty partitions: per `(field, record)`, the staged chunk values.
    /// `None` is a tombstone. Values stay uninterpreted until `write`.
    staged: BTreeMap<(String, u64), HashMap<String, Option<Reference>>>,
    grids: Mutex<HashMap<String, Arc<Vec<u64>>>>,
    cache: PageCache,
}

impl LazyRefMap {
    /// Open an existing store: reads only `{root}/.zmetadata`.
    pub async fn open(root: impl Into<String>, fs: Arc<dyn ByteBackend>, cache_size: usize) -> Result<Self> {
        let root = root.into();
        let raw = fs.cat_file(&format!("{root}/{ZMETADATA}"), None, None).await?;
        let meta: StoreMeta = serde_json::from_slice(&raw)?;
        if meta.record_size == 0 {
            return Err(RefError::InvalidFormat(format!(
                "{root}/{ZMETADATA}: record_size must be positive"
            )));
        }
        info!(root = %root, record_size = meta.record_size, "opened reference store");
        Ok(LazyRefMap {
            root,
            fs,
            codec: Box::new(ZstdBlockCodec::default()),
            record_size: meta.record_size,
            zmetadata: meta.metadata,
            staged_top: HashMap::new(),
            staged: BTreeMap::new(),
            grids: Mutex::new(HashMap::new()),
            cache: PageCache::new(cache_size),
        })
    }

    /// Create a fresh store: writes an empty `.zmetadata` and opens it.
    pub async fn create(
        root: impl Into<String>,
        fs: Arc<dyn ByteBackend>,
        record_size: usize,
        cache_size: usize,
    ) -> Result<Self> {
        let root = root.into();
        if record_size == 0 {
            return Err(RefError::BadSpec("record_size must be positive".into()));
        }
        let meta = StoreMeta {
            record_size,
            metadata: IndexMap::new(),
        };
        fs.pipe(
            &format!("{root}/{ZMETADATA}"),
            Bytes::from(serde_json::to_vec(&meta)?),
        )
        .await?;
        Self::open(root, fs, cache_size).await
    }

    /// Swap the record-block codec. The default reads and writes the
    /// built-in zstd block format.
    pub fn with_codec(mut self, codec: Box<dyn BlockCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Number of dirty `(field, record)` partitions not yet written.
    pub fn dirty_partitions(&self) -> usize {
        self.staged.len()
    }

    fn record_url(&self, field: &str, record: u64) -> String {
        format!("{}/{field}/refs.{record}.parq", self.root)
    }

    // -- Grid handling --------------------------------------------------------

    fn grid(&self, field: &str) -> Result<Arc<Vec<u64>>> {
        if let Some(hit) = self.grids.lock().expect("grid cache poisoned").get(field) {
            return Ok(hit.clone());
        }
        let key = format!("{field}/.zarray");
        let zarray = self
            .zmetadata
            .get(&key)
            .ok_or_else(|| RefError::NotFound(key.clone()))?;
        let grid = Arc::new(grid_from_zarray(zarray, &key)?);
        self.grids
            .lock()
            .expect("grid cache poisoned")
            .insert(field.to_string(), grid.clone());
        Ok(grid)
    }

    /// Fields, identified by their `.zarray` metadata entries.
    pub fn fields(&self) -> Vec<String> {
        self.zmetadata
            .keys()
            .filter_map(|k| k.strip_suffix("/.zarray"))
            .map(str::to_string)
            .collect()
    }

    /// Top-level directory names.
    pub fn listdir(&self) -> BTreeSet<String> {
        self.zmetadata
            .keys()
            .filter(|k| !k.starts_with('.'))
            .filter_map(|k| k.split('/').next())
            .map(str::to_string)
            .collect()
    }

    pub fn is_dir(&self, path: &str) -> bool {
        if path.is_empty() {
            return true;
        }
        self.listdir().contains(path)
            || self
                .fields()
                .iter()
                .any(|f| f == path || f.starts_with(&format!("{path}/")))
    }

    /// Rows expected in one record of a field: full records hold
    /// `record_size`, the final record holds the remainder.
    fn expected_rows(&self, grid: &[u64], record: u64) -> usize {
        let n = chunk_count(grid);
        if n == 0 {
            return 0;
        }
        let rs = self.record_size as u64;
        let nrec = (n + rs - 1) / rs;
        if record == nrec - 1 {
            (n - rs * (nrec - 1)) as usize
        } else {
            self.record_size
        }
    }

    // -- Reads ----------------------------------------------------------------

    /// Resolve one key.
    ///
    /// A staged or on-disk tombstone fails with `NotFound`, exactly like a
    /// key that never existed; the tombstone only matters to writers.
    pub async fn get(&self, key: &str) -> Result<Reference> {
        if is_metadata_key(key) || !key.contains('/') {
            if let Some(bytes) = self.staged_top.get(key) {
                return Ok(Reference::Inline(bytes.clone()));
            }
            if let Some(value) = self.zmetadata.get(key) {
                return Ok(Reference::Inline(Bytes::from(serde_json::to_vec(value)?)));
            }
            if key == ZMETADATA {
                return Ok(Reference::Inline(Bytes::from(serde_json::to_vec(
                    &StoreMeta {
                        record_size: self.record_size,
                        metadata: self.zmetadata.clone(),
                    },
                )?)));
            }
            return Err(RefError::NotFound(key.to_string()));
        }

        let (field, chunk) = key.rsplit_once('/').expect("checked above");
        let grid = self
            .grid(field)
            .map_err(|_| RefError::NotFound(key.to_string()))?;
        let flat = ravel_chunk(chunk, &grid).map_err(|_| RefError::NotFound(key.to_string()))?;
        let record = flat / self.record_size as u64;
        let row = (flat % self.record_size as u64) as usize;

        if let Some(partition) = self.staged.get(&(field.to_string(), record)) {
            if let Some(staged) = partition.get(chunk) {
                return match staged {
                    None | Some(Reference::Absent) => Err(RefError::NotFound(key.to_string())),
                    Some(reference) => Ok(reference.clone()),
                };
            }
        }

        let block = self.load_block(field, record).await.map_err(|e| {
            if e.is_not_found() {
                RefError::NotFound(key.to_string())
            } else {
                e
            }
        })?;
        match block.row(row) {
            None => Err(RefError::NotFound(key.to_string())),
            Some(view) => decode_row(key, view),
        }
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.get(key).await.is_ok()
    }

    async fn load_block(&self, field: &str, record: u64) -> Result<Arc<RecordBlock>> {
        if let Some(hit) = self.cache.get(field, record) {
            return Ok(hit);
        }
        let url = self.record_url(field, record);
        debug!(url = %url, "loading record block");
        let raw = self.fs.cat_file(&url, None, None).await?;
        let block = Arc::new(self.codec.decode(&raw)?);
        self.cache.put(field.to_string(), record, block.clone());
        Ok(block)
    }

    // -- Writes ---------------------------------------------------------------

    /// Stage one reference. Metadata and top-level keys must be inline;
    /// chunk keys land in their record's dirty partition, which is written
    /// out as soon as every expected row of the record is assigned.
    pub async fn put(&mut self, key: &str, value: Reference) -> Result<()> {
        if matches!(value, Reference::Absent) {
            return self.delete(key).await;
        }
        if is_metadata_key(key) || !key.contains('/') {
            let Reference::Inline(bytes) = value else {
                return Err(RefError::BadSpec(format!(
                    "'{key}': metadata and top-level entries must be inline bytes"
                )));
            };
            if is_metadata_key(key) {
                let decoded: Value = serde_json::from_slice(&bytes)?;
                self.zmetadata.insert(key.to_string(), decoded);
                if let Some(field) = key.strip_suffix("/.zarray") {
                    self.grids.lock().expect("grid cache poisoned").remove(field);
                }
            }
            self.staged_top.insert(key.to_string(), bytes);
            return Ok(());
        }

        let (field, chunk) = key.rsplit_once('/').expect("checked above");
        let grid = self.grid(field)?;
        let flat = ravel_chunk(chunk, &grid)?;
        let record = flat / self.record_size as u64;
        self.staged
            .entry((field.to_string(), record))
            .or_default()
            .insert(chunk.to_string(), Some(value));
        self.maybe_write(field, record).await
    }

    /// Delete a key. Chunk keys stage a tombstone (and may trigger the
    /// record write like `put`); metadata and top-level keys are removed
    /// from the in-memory maps.
    pub async fn delete(&mut self, key: &str) -> Result<()> {
        if is_metadata_key(key) || !key.contains('/') {
            let staged = self.staged_top.remove(key).is_some();
            let meta = self.zmetadata.shift_remove(key).is_some();
            if !(staged || meta) {
                return Err(RefError::NotFound(key.to_string()));
            }
            if let Some(field) = key.strip_suffix("/.zarray") {
                self.grids.lock().expect("grid cache poisoned").remove(field);
            }
            return Ok(());
        }

        let (field, chunk) = key.rsplit_once('/').expect("checked above");
        let grid = self.grid(field)?;
        let flat = ravel_chunk(chunk, &grid)?;
        let record = flat / self.record_size as u64;
        self.staged
            .entry((field.to_string(), record))
            .or_default()
            .insert(chunk.to_string(), None);
        self.maybe_write(field, record).await
    }

    async fn maybe_write(&mut self, field: &str, record: u64) -> Result<()> {
        let grid = self.grid(field)?;
        let expected = self.expected_rows(&grid, record);
        let filled = self
            .staged
            .get(&(field.to_string(), record))
            .map(HashMap::len)
            .unwrap_or(0);
        if expected > 0 && filled == expected {
            self.write(field, record).await?;
        }
        Ok(())
    }

    /// Serialize one dirty partition into its record file and drop it.
    ///
    /// Unassigned rows keep their all-null defaults, which read back as
    /// absent.
    // TODO: when the partition is incomplete, load the existing record and
    // merge it in instead of nulling the unassigned rows.
    pub async fn write(&mut self, field: &str, record: u64) -> Result<()> {
        let key = (field.to_string(), record);
        let Some(partition) = self.staged.get(&key) else {
            return Ok(());
        };
        let grid = self.grid(field)?;
        let effective = self.expected_rows(&grid, record);

        let mut block = RecordBlock::with_rows(self.record_size);
        for (chunk, staged) in partition {
            let flat = ravel_chunk(chunk, &grid)?;
            let row = (flat % self.record_size as u64) as usize;
            match staged {
                None | Some(Reference::Absent) => {}
                Some(Reference::Inline(data)) => {
                    block.raws[row] = Some(encode_raw(data));
                }
                Some(Reference::Whole(url)) => {
                    block.paths[row] = url.clone();
                }
                Some(Reference::Slice { url, offset, size }) => {
                    block.paths[row] = url.clone();
                    block.offsets[row] = *offset as i64;
                    block.sizes[row] = *size as i64;
                }
            }
        }
        block.truncate(effective);

        let data = self.codec.encode(&block)?;
        self.fs
            .pipe(&self.record_url(field, record), Bytes::from(data))
            .await?;
        debug!(field, record, rows = effective, "wrote record block");
        self.staged.remove(&key);
        // A cached copy of this record is now stale.
        self.cache.invalidate(field, record);
        Ok(())
    }

    /// Write every dirty partition, rewrite `.zmetadata`, and drop the
    /// page cache. Idempotent: a second flush only rewrites `.zmetadata`.
    pub async fn flush(&mut self) -> Result<()> {
        let pending: Vec<(String, u64)> = self.staged.keys().cloned().collect();
        for (field, record) in pending {
            self.write(&field, record).await?;
        }

        let meta = StoreMeta {
            record_size: self.record_size,
            metadata: self.zmetadata.clone(),
        };
        self.fs
            .pipe(
                &format!("{}/{ZMETADATA}", self.root),
                Bytes::from(serde_json::to_vec(&meta)?),
            )
            .await?;
        self.cache.clear();
        info!(root = %self.root, "flushed reference store");
        Ok(())
    }

    // -- Iteration ------------------------------------------------------------

    /// All *expected* keys: metadata entries plus every chunk the grids
    /// declare. A chunk is listed whether or not its row is actually
    /// present; `get` on an absent chunk still fails with `NotFound`.
    pub fn keys(&self) -> Vec<String> {
        let mut metas: BTreeSet<String> = self.zmetadata.keys().cloned().collect();
        metas.extend(self.staged_top.keys().cloned());
        let mut out: Vec<String> = metas.into_iter().collect();
        for field in self.fields() {
            match self.grid(&field) {
                Ok(grid) => {
                    for flat in 0..chunk_count(&grid) {
                        out.push(format!("{field}/{}", unravel_chunk(flat, &grid)));
                    }
                }
                Err(e) => warn!(field = %field, error = %e, "skipping field with bad .zarray"),
            }
        }
        out
    }

    /// Expected entry count; the same caveat as [`LazyRefMap::keys`].
    pub fn len(&self) -> usize {
        let mut metas: BTreeSet<&String> = self.zmetadata.keys().collect();
        metas.extend(self.staged_top.keys());
        let chunks: u64 = self
            .fields()
            .iter()
            .filter_map(|f| self.grid(f).ok())
            .map(|g| chunk_count(&g))
            .sum();
        metas.len() + chunks as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -- Listings -------------------------------------------------------------

    /// List the store root (fields + top-level metadata files) or one
    /// field (its metadata entries + present chunks, with sizes). Records
    /// that have never been written list no chunks.
    pub async fn ls(&self, path: &str) -> Result<Vec<DirEntry>> {
        if path.is_empty() {
            let mut entries: Vec<DirEntry> =
                self.listdir().into_iter().map(DirEntry::directory).collect();
            let mut names: BTreeSet<&str> = [ZMETADATA].into_iter().collect();
            names.extend(
                self.zmetadata
                    .keys()
                    .filter(|k| !k.contains('/'))
                    .map(String::as_str),
            );
            names.extend(
                self.staged_top
                    .keys()
                    .filter(|k| !k.contains('/'))
                    .map(String::as_str),
            );
            for name in names {
                let size = self.meta_size(name).await;
                entries.push(DirEntry::file(name, size));
            }
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            return Ok(entries);
        }

        let prefix = format!("{path}/");
        let mut subdirs = BTreeSet::new();
        let mut entries = Vec::new();
        let mut meta_names: BTreeSet<&String> = self.zmetadata.keys().collect();
        meta_names.extend(self.staged_top.keys());
        for name in meta_names {
            if let Some(rest) = name.strip_prefix(&prefix) {
                match rest.split_once('/') {
                    None => {
                        let size = self.meta_size(name).await;
                        entries.push(DirEntry::file(name.clone(), size));
                    }
                    Some((child, _)) => {
                        subdirs.insert(format!("{path}/{child}"));
                    }
                }
            }
        }
        entries.extend(subdirs.into_iter().map(DirEntry::directory));

        match self.grid(path) {
            Ok(grid) => {
                let n = chunk_count(&grid);
                let rs = self.record_size as u64;
                let nrec = (n + rs - 1) / rs;
                for record in 0..nrec {
                    let block = match self.load_block(path, record).await {
                        Ok(block) => block,
                        Err(e) if e.is_not_found() => continue,
                        Err(e) => return Err(e),
                    };
                    for row in 0..block.rows() {
                        let flat = record * rs + row as u64;
                        if flat >= n {
                            break;
                        }
                        let name = format!("{path}/{}", unravel_chunk(flat, &grid));
                        if let Ok(reference) =
                            block.row(row).map_or(Err(RefError::NotFound(name.clone())), |v| {
                                decode_row(&name, v)
                            })
                        {
                            entries.push(DirEntry::file(name, reference.size_hint()));
                        }
                    }
                }
            }
            Err(e) if e.is_not_found() => {
                if entries.is_empty() && !self.is_dir(path) {
                    return Err(RefError::NotFound(path.to_string()));
                }
            }
            Err(e) => return Err(e),
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn meta_size(&self, name: &str) -> Option<u64> {
        match self.get(name).await {
            Ok(Reference::Inline(b)) => Some(b.len() as u64),
            _ => None,
        }
    }
}

/// Decode one block row per the column semantics: `raw` wins, a null
/// `path` is a tombstone, zero offset+size marks a whole-URL read.
fn decode_row(key: &str, view: RowView<'_>) -> Result<Reference> {
    if let Some(raw) = view.raw {
        return Ok(Reference::Inline(decode_inline(raw)?));
    }
    match view.path {
        None => Err(RefError::NotFound(key.to_string())),
        Some(path) if view.offset == 0 && view.size == 0 => {
            Ok(Reference::Whole(Some(path.to_string())))
        }
        Some(path) => Ok(Reference::Slice {
            url: Some(path.to_string()),
            offset: view.offset as u64,
            size: view.size as u64,
        }),
    }
}

// -- Tests --------------------------------------------------------------------
