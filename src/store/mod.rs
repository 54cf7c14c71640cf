//! Reference stores: one contract, two representations.
//!
//! The eager map holds every reference in memory, built from a JSON spec.
//! The lazy map pages references in from columnar record files so that
//! catalogs of hundreds of millions of entries stay out of memory.

pub mod block;
pub mod cache;
pub mod eager;
pub mod lazy;

pub use block::{BlockCodec, RecordBlock, ZstdBlockCodec};
pub use cache::PageCache;
pub use eager::EagerRefMap;
pub use lazy::LazyRefMap;

use crate::error::{RefError, Result};
use crate::reference::Reference;

/// Either representation, behind the shared mapping contract.
pub enum RefStore {
    Eager(EagerRefMap),
    Lazy(LazyRefMap),
}

impl RefStore {
    /// Resolve one key. Tombstoned keys fail `NotFound` just like keys
    /// that never existed.
    pub async fn get(&self, key: &str) -> Result<Reference> {
        match self {
            RefStore::Eager(map) => match map.get(key) {
                None | Some(Reference::Absent) => Err(RefError::NotFound(key.to_string())),
                Some(reference) => Ok(reference.clone()),
            },
            RefStore::Lazy(map) => map.get(key).await,
        }
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.get(key).await.is_ok()
    }

    pub async fn put(&mut self, key: &str, value: Reference) -> Result<()> {
        match self {
            RefStore::Eager(map) => {
                map.put(key.to_string(), value);
                Ok(())
            }
            RefStore::Lazy(map) => map.put(key, value).await,
        }
    }

    pub async fn delete(&mut self, key: &str) -> Result<()> {
        match self {
            RefStore::Eager(map) => map
                .delete(key)
                .map(|_| ())
                .ok_or_else(|| RefError::NotFound(key.to_string())),
            RefStore::Lazy(map) => map.delete(key).await,
        }
    }

    /// Every key. For the lazy map this enumerates *expected* chunks from
    /// the chunk grids, not proven-present ones.
    pub fn keys(&self) -> Vec<String> {
        match self {
            RefStore::Eager(map) => map.keys().cloned().collect(),
            RefStore::Lazy(map) => map.keys(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RefStore::Eager(map) => map.len(),
            RefStore::Lazy(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist staged state. A no-op for the eager map.
    pub async fn flush(&mut self) -> Result<()> {
        match self {
            RefStore::Eager(_) => Ok(()),
            RefStore::Lazy(map) => map.flush().await,
        }
    }

    pub fn as_lazy(&self) -> Option<&LazyRefMap> {
        match self {
            RefStore::Lazy(map) => Some(map),
            RefStore::Eager(_) => None,
        }
    }

    pub fn as_eager(&self) -> Option<&EagerRefMap> {
        match self {
            RefStore::Eager(map) => Some(map),
            RefStore::Lazy(_) => None,
        }
    }
}
