//! In-memory backend, for tests and for authoring small catalogs.

use std::collections::HashMap;
use std::io;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;

use crate::backend::{window_bytes, ByteBackend};
use crate::error::{RefError, Result};

/// Objects keyed by their exact URL string.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: RwLock<HashMap<String, Bytes>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, data: impl Into<Bytes>) {
        self.objects
            .write()
            .expect("memory backend poisoned")
            .insert(url.into(), data.into());
    }

    fn object(&self, url: &str) -> Result<Bytes> {
        self.objects
            .read()
            .expect("memory backend poisoned")
            .get(url)
            .cloned()
            .ok_or_else(|| {
                RefError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no such object: {url}"),
                ))
            })
    }
}

#[async_trait]
impl ByteBackend for MemoryBackend {
    fn protocol(&self) -> &'static str {
        "memory"
    }

    async fn cat_file(&self, url: &str, start: Option<i64>, end: Option<i64>) -> Result<Bytes> {
        Ok(window_bytes(&self.object(url)?, start, end))
    }

    async fn size(&self, url: &str) -> Result<u64> {
        Ok(self.object(url)?.len() as u64)
    }

    async fn pipe(&self, url: &str, data: Bytes) -> Result<()> {
        self.insert(url, data);
        Ok(())
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn whole_and_ranged_reads() {
        let be = MemoryBackend::new();
        be.insert("memory://x", Bytes::from_static(b"abcdef"));
        assert_eq!(
            be.cat_file("memory://x", None, None).await.unwrap(),
            Bytes::from_static(b"abcdef")
        );
        assert_eq!(
            be.cat_file("memory://x", Some(1), Some(3)).await.unwrap(),
            Bytes::from_static(b"bc")
        );
        assert_eq!(be.size("memory://x").await.unwrap(), 6);
        assert!(be.cat_file("memory://y", None, None).await.unwrap_err().is_not_found());
    }
}
