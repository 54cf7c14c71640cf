//! HTTP(S) backend using ranged GET requests.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::RANGE;
use reqwest::StatusCode;

use crate::backend::{window_bytes, ByteBackend};
use crate::error::{RefError, Result};

#[derive(Debug, Clone, Default)]
pub struct HttpBackend {
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        HttpBackend { client }
    }
}

/// `Range` header for the requested window, when one maps onto HTTP range
/// units. Windows that mix negative offsets fall back to a full fetch.
fn range_header(start: Option<i64>, end: Option<i64>) -> Option<String> {
    match (start, end) {
        (None, None) => None,
        (Some(s), Some(e)) if s >= 0 && e > s => Some(format!("bytes={}-{}", s, e - 1)),
        (Some(s), None) if s >= 0 => Some(format!("bytes={s}-")),
        (Some(s), None) if s < 0 => Some(format!("bytes=-{}", -s)),
        _ => None,
    }
}

#[async_trait]
impl ByteBackend for HttpBackend {
    fn protocol(&self) -> &'static str {
        "http"
    }

    async fn cat_file(&self, url: &str, start: Option<i64>, end: Option<i64>) -> Result<Bytes> {
        if matches!((start, end), (Some(s), Some(e)) if s >= 0 && e >= 0 && e <= s) {
            return Ok(Bytes::new());
        }
        let header = range_header(start, end);
        let mut request = self.client.get(url);
        if let Some(range) = &header {
            request = request.header(RANGE, range.as_str());
        }
        let response = request.send().await?.error_for_status()?;
        let status = response.status();
        let body = response.bytes().await?;
        if status != StatusCode::PARTIAL_CONTENT {
            // Whole object: either the server ignored the Range header or
            // the window had no Range form. Cut the window locally.
            return Ok(window_bytes(&body, start, end));
        }
        Ok(body)
    }

    async fn size(&self, url: &str) -> Result<u64> {
        let response = self.client.head(url).send().await?.error_for_status()?;
        response
            .content_length()
            .ok_or_else(|| RefError::Backend(format!("no content-length for {url}")))
    }
}

// -- Tests --------------------------------------------------------------------
