//! Image acquisition
//!
//! Query photos arrive either as a local file (the transport downloads them)
//! or as a catalog picture URL. URL fetches carry a hard timeout and a single
//! retry with backoff; everything else is surfaced as `SourceUnreadable`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use image::DynamicImage;

use super::{EmbedError, Result};

/// Default timeout for fetching a picture over HTTP
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Backoff before the single retry on a transient fetch failure
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

// ============================================================================
// IMAGE SOURCE
// ============================================================================

/// Where a query or catalog image comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// A file on the local filesystem
    Path(PathBuf),
    /// An http(s) URL, typically a catalog picture link
    Url(String),
}

impl ImageSource {
    /// Classify a raw string: http(s) prefixes become URLs, everything else
    /// is treated as a local path
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            ImageSource::Url(raw.to_string())
        } else {
            ImageSource::Path(PathBuf::from(raw))
        }
    }

    /// Human-readable description for logs and errors
    pub fn describe(&self) -> String {
        match self {
            ImageSource::Path(p) => p.display().to_string(),
            ImageSource::Url(u) => u.clone(),
        }
    }
}

impl From<&Path> for ImageSource {
    fn from(p: &Path) -> Self {
        ImageSource::Path(p.to_path_buf())
    }
}

// ============================================================================
// FETCHER
// ============================================================================

/// Fetches and decodes images from paths and URLs
#[derive(Debug, Clone)]
pub struct ImageFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl ImageFetcher {
    /// Create a fetcher with the given per-request timeout
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client, timeout }
    }

    /// The configured per-request timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Load and decode an image from its source
    pub async fn load(&self, source: &ImageSource) -> Result<DynamicImage> {
        match source {
            ImageSource::Path(path) => {
                let bytes = tokio::fs::read(path)
                    .await
                    .map_err(|e| EmbedError::SourceUnreadable(format!("{}: {e}", path.display())))?;
                decode(&bytes, &source.describe())
            }
            ImageSource::Url(url) => {
                let bytes = match self.fetch_url(url).await {
                    Ok(bytes) => bytes,
                    Err(first) => {
                        // One retry with backoff covers transient network
                        // errors; a second failure is surfaced.
                        tracing::debug!(url = %url, error = %first, "image fetch failed, retrying");
                        tokio::time::sleep(RETRY_BACKOFF).await;
                        self.fetch_url(url).await.map_err(|e| {
                            EmbedError::SourceUnreadable(format!("{url}: {e}"))
                        })?
                    }
                };
                decode(&bytes, url)
            }
        }
    }

    async fn fetch_url(&self, url: &str) -> std::result::Result<Vec<u8>, reqwest::Error> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

impl Default for ImageFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_FETCH_TIMEOUT)
    }
}

fn decode(bytes: &[u8], source: &str) -> Result<DynamicImage> {
    image::load_from_memory(bytes).map_err(|e| EmbedError::DecodeFailed(format!("{source}: {e}")))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url_and_path() {
        assert_eq!(
            ImageSource::parse("https://cdn.example.com/item.jpg"),
            ImageSource::Url("https://cdn.example.com/item.jpg".into())
        );
        assert_eq!(
            ImageSource::parse("/tmp/photo.jpg"),
            ImageSource::Path(PathBuf::from("/tmp/photo.jpg"))
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_source_unreadable() {
        let fetcher = ImageFetcher::default();
        let err = fetcher
            .load(&ImageSource::Path(PathBuf::from("/nonexistent/nope.jpg")))
            .await
            .unwrap_err();
        assert!(matches!(err, EmbedError::SourceUnreadable(_)));
    }

    #[tokio::test]
    async fn test_garbage_bytes_are_decode_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_an_image.jpg");
        std::fs::write(&path, b"definitely not a jpeg").unwrap();

        let fetcher = ImageFetcher::default();
        let err = fetcher.load(&ImageSource::Path(path)).await.unwrap_err();
        assert!(matches!(err, EmbedError::DecodeFailed(_)));
    }
}
