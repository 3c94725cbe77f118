//! The REST boundary the realtime core consumes but does not implement:
//! fetching file metadata and downloading the seed notebook JSON that
//! catch-up replays on top of.
//!
//! Expressed as one narrow trait (`SeedSource`) rather than a concrete REST
//! client, so the core stays transport-agnostic at this seam — the
//! one-way-dependency fix for the REST/realtime cycle the original system
//! has (`origami`'s REST layer and RTU layer import each other). A default
//! `reqwest`-based implementation lives behind the `rest-client` feature;
//! without it, callers supply their own (a test double, or an alternate
//! REST stack).

use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub id: String,
    pub current_version_id: Option<String>,
    pub presigned_download_url: String,
}

#[async_trait]
pub trait SeedSource: Send + Sync {
    async fn fetch_metadata(&self, file_id: &str) -> Result<FileMetadata, SeedError>;
    async fn download_notebook(&self, presigned_url: &str) -> Result<Vec<u8>, SeedError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected response status: {0}")]
    Status(u16),
    #[error("malformed response body: {0}")]
    Malformed(String),
}

#[cfg(feature = "rest-client")]
mod rest_client {
    use super::{FileMetadata, SeedError, SeedSource};
    use async_trait::async_trait;
    use serde::Deserialize;

    /// The default `reqwest`-based [`SeedSource`].
    pub struct ReqwestSeedSource {
        client: reqwest::Client,
        api_base_url: String,
        authorization_token: String,
    }

    impl ReqwestSeedSource {
        pub fn new(api_base_url: impl Into<String>, authorization_token: impl Into<String>) -> Self {
            Self {
                client: reqwest::Client::new(),
                api_base_url: api_base_url.into(),
                authorization_token: authorization_token.into(),
            }
        }
    }

    #[derive(Deserialize)]
    struct FileMetadataResponse {
        id: String,
        #[serde(default)]
        current_version_id: Option<String>,
        presigned_download_url: String,
    }

    #[async_trait]
    impl SeedSource for ReqwestSeedSource {
        async fn fetch_metadata(&self, file_id: &str) -> Result<FileMetadata, SeedError> {
            let url = format!("{}/v1/files/{}", self.api_base_url.trim_end_matches('/'), file_id);
            let response = self
                .client
                .get(&url)
                .bearer_auth(&self.authorization_token)
                .send()
                .await
                .map_err(|e| SeedError::Request(e.to_string()))?;

            if !response.status().is_success() {
                return Err(SeedError::Status(response.status().as_u16()));
            }
            let body: FileMetadataResponse = response
                .json()
                .await
                .map_err(|e| SeedError::Malformed(e.to_string()))?;
            Ok(FileMetadata {
                id: body.id,
                current_version_id: body.current_version_id,
                presigned_download_url: body.presigned_download_url,
            })
        }

        async fn download_notebook(&self, presigned_url: &str) -> Result<Vec<u8>, SeedError> {
            let response = self
                .client
                .get(presigned_url)
                .send()
                .await
                .map_err(|e| SeedError::Request(e.to_string()))?;
            if !response.status().is_success() {
                return Err(SeedError::Status(response.status().as_u16()));
            }
            let bytes = response
                .bytes()
                .await
                .map_err(|e| SeedError::Request(e.to_string()))?;
            Ok(bytes.to_vec())
        }
    }
}

#[cfg(feature = "rest-client")]
pub use rest_client::ReqwestSeedSource;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubSeedSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SeedSource for StubSeedSource {
        async fn fetch_metadata(&self, file_id: &str) -> Result<FileMetadata, SeedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FileMetadata {
                id: file_id.to_owned(),
                current_version_id: Some("v1".to_owned()),
                presigned_download_url: "https://example.test/seed.json".to_owned(),
            })
        }

        async fn download_notebook(&self, _presigned_url: &str) -> Result<Vec<u8>, SeedError> {
            Ok(br#"{"nbformat":4,"nbformat_minor":5,"metadata":{},"cells":[]}"#.to_vec())
        }
    }

    #[tokio::test]
    async fn stub_seed_source_round_trips_metadata_and_bytes() {
        let source = StubSeedSource {
            calls: AtomicUsize::new(0),
        };
        let metadata = source.fetch_metadata("file-1").await.unwrap();
        assert_eq!(metadata.id, "file-1");
        assert_eq!(metadata.current_version_id.as_deref(), Some("v1"));

        let bytes = source.download_notebook(&metadata.presigned_download_url).await.unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }
}
