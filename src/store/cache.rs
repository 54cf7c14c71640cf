//! LRU page cache for decoded record blocks.
//!
//! Capacity is measured in records, not bytes: effective memory is about
//! `capacity * record_size * row_size`. Eviction is exact LRU on insert.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::store::block::RecordBlock;

type PageKey = (String, u64);

pub struct PageCache {
    pages: Mutex<LruCache<PageKey, Arc<RecordBlock>>>,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        PageCache {
            pages: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    /// Fetch a page, marking it most recently used.
    pub fn get(&self, field: &str, record: u64) -> Option<Arc<RecordBlock>> {
        self.pages
            .lock()
            .expect("page cache poisoned")
            .get(&(field.to_string(), record))
            .cloned()
    }

    pub fn put(&self, field: String, record: u64, block: Arc<RecordBlock>) {
        self.pages
            .lock()
            .expect("page cache poisoned")
            .put((field, record), block);
    }

    /// Drop one page, if cached.
    pub fn invalidate(&self, field: &str, record: u64) {
        self.pages
            .lock()
            .expect("page cache poisoned")
            .pop(&(field.to_string(), record));
    }

    pub fn clear(&self) {
        self.pages.lock().expect("page cache poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.pages.lock().expect("page cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// -- Tests --------------------------------------------------------------------
