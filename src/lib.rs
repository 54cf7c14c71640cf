//! refvfs — a virtual reference filesystem.
//!
//! A read-mostly namespace in which each logical file is defined by a
//! *reference*: inline bytes, a whole URL, or a `(url, offset, size)` byte
//! range inside some other storage. Chunk catalogs built this way
//! virtualize large chunked datasets (millions of tiny array chunks
//! scattered across objects) without rewriting the underlying data.
//!
//! The moving parts:
//!
//! - [`Reference`]: the tagged reference value.
//! - [`EagerRefMap`] / [`LazyRefMap`]: the reference store, either fully
//!   resident (parsed from a JSON spec, with template and generator
//!   expansion) or paged on demand from columnar record files through an
//!   LRU cache.
//! - [`merge_ranges`]: the byte-range coalescer for bulk fetches.
//! - [`ReferenceFs`]: the dispatcher tying it together (`cat_file`, bulk
//!   `cat`, listings, catalog authoring) over pluggable [`ByteBackend`]
//!   implementations keyed by URL protocol.
//!
//! ```no_run
//! # async fn demo() -> refvfs::Result<()> {
//! use refvfs::{OnError, ReferenceFs};
//!
//! let fs = ReferenceFs::from_spec(serde_json::json!({
//!     "version": 1,
//!     "refs": {
//!         "greeting": "base64:aGVsbG8=",
//!         "chunk": ["http://example.com/data", 1024, 512],
//!     },
//! }))
//! .await?;
//!
//! assert_eq!(&fs.cat_file("greeting", None, None).await?[..], b"hello");
//! let bulk = fs.cat(&["greeting", "chunk"], OnError::Raise).await?;
//! # let _ = bulk;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod coalesce;
pub mod dircache;
pub mod error;
pub mod fs;
pub mod reference;
pub mod spec;
pub mod store;
pub mod template;

pub use backend::{BackendSet, ByteBackend, HttpBackend, LocalBackend, MemoryBackend};
pub use coalesce::{merge_ranges, ByteRange};
pub use dircache::{DirCache, DirEntry, EntryKind};
pub use error::{RefError, Result};
pub use fs::{OnError, RefSource, ReferenceFs, ReferenceFsBuilder};
pub use reference::Reference;
pub use store::{BlockCodec, EagerRefMap, LazyRefMap, RecordBlock, RefStore, ZstdBlockCodec};
pub use template::Templates;
