//! Built-in HTTP implementation of [`RangeFetcher`], plus the probe that
//! discovers a remote file's length and version tag before planning.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, LAST_MODIFIED, RANGE};
use reqwest::{Client, StatusCode};

use crate::download::{ByteStream, RangeFetcher};
use crate::error::{BoxError, TransferError};
use crate::models::FileDescriptor;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(50);

/// Remote file metadata discovered by [`HttpRangeFetcher::probe`].
#[derive(Debug, Clone)]
pub struct RemoteFileInfo {
    pub total_len: u64,
    /// Sanitized `Last-Modified` value, usable as a path component.
    pub version_tag: String,
}

/// Fetches byte ranges of one URL with HTTP `Range` requests.
pub struct HttpRangeFetcher {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpRangeFetcher {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), url)
    }

    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Issues a one-byte range request to learn the file's total length (from
    /// `Content-Range`) and its version tag (from `Last-Modified`).
    ///
    /// A server answering 200 instead of 206 does not honor ranges and cannot
    /// be segmented or resumed against.
    pub async fn probe(&self) -> Result<RemoteFileInfo, TransferError> {
        let resp = self
            .client
            .get(&self.url)
            .header(RANGE, "bytes=0-0")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(TransferError::session)?;
        if resp.status() != StatusCode::PARTIAL_CONTENT {
            return Err(TransferError::Protocol(format!(
                "server does not support range requests (status {})",
                resp.status()
            )));
        }
        let total_len = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(content_range_total)
            .ok_or_else(|| {
                TransferError::Protocol("missing or unparsable Content-Range header".into())
            })?;
        let version_tag = resp
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(sanitize_tag)
            .unwrap_or_else(|| "unversioned".into());
        Ok(RemoteFileInfo {
            total_len,
            version_tag,
        })
    }

    /// Builds the transfer descriptor for this URL from a probe result.
    pub fn descriptor(
        &self,
        info: &RemoteFileInfo,
        temp_root: impl Into<std::path::PathBuf>,
    ) -> FileDescriptor {
        FileDescriptor {
            file_id: file_id_from_url(&self.url),
            total_len: info.total_len,
            version_tag: info.version_tag.clone(),
            temp_root: temp_root.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RangeFetcher for HttpRangeFetcher {
    async fn fetch(&self, from: u64, to: Option<u64>) -> Result<ByteStream, BoxError> {
        let range = match to {
            Some(to) => format!("bytes={}-{}", from, to.saturating_sub(1)),
            None => format!("bytes={from}-"),
        };
        let resp = self
            .client
            .get(&self.url)
            .header(RANGE, range)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?;
        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Box::new(e) as BoxError));
        Ok(Box::pin(stream))
    }
}

/// Total length from a `Content-Range` value like `bytes 0-0/12345`.
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

/// Derives a file id from the URL: last path segment, query stripped.
pub fn file_id_from_url(url: &str) -> String {
    let without_query = url.split('?').next().unwrap_or(url);
    let segment = without_query.rsplit('/').next().unwrap_or("");
    if segment.is_empty() || segment.contains(':') {
        "download".into()
    } else {
        segment.to_string()
    }
}

/// Keeps a header value path-safe for use as a temp directory name.
fn sanitize_tag(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect()
}
