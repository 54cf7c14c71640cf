//! Local-filesystem backend.

use std::io::SeekFrom;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::backend::{byte_window, ByteBackend};
use crate::error::Result;

/// Reads and writes plain files. Serves the `file` protocol and acts as
/// the fallback for scheme-less URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBackend;

fn strip_scheme(url: &str) -> &Path {
    Path::new(url.strip_prefix("file://").unwrap_or(url))
}

#[async_trait]
impl ByteBackend for LocalBackend {
    fn protocol(&self) -> &'static str {
        "file"
    }

    async fn cat_file(&self, url: &str, start: Option<i64>, end: Option<i64>) -> Result<Bytes> {
        let path = strip_scheme(url);
        let mut file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        let (s, e) = byte_window(len, start, end);
        if s > 0 {
            file.seek(SeekFrom::Start(s)).await?;
        }
        let mut buf = vec![0u8; (e - s) as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn size(&self, url: &str) -> Result<u64> {
        Ok(tokio::fs::metadata(strip_scheme(url)).await?.len())
    }

    async fn pipe(&self, url: &str, data: Bytes) -> Result<()> {
        let path = strip_scheme(url);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &data).await?;
        Ok(())
    }

    async fn is_dir(&self, url: &str) -> bool {
        tokio::fs::metadata(strip_scheme(url))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }
}

// -- Tests --------------------------------------------------------------------
