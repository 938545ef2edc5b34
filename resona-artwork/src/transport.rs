//! Remote tier: the contract with the streaming server.

use std::fmt;
use std::time::Duration;

use resona_model::{ArtworkId, ArtworkKind, Resolution};

use crate::error::ArtworkError;

/// Fetches raw encoded artwork bytes from the remote server.
///
/// The cache treats any non-success response or transport failure
/// identically: a terminal error for the in-flight load. Timeout policy
/// belongs to the implementation, not to the cache.
#[async_trait::async_trait]
pub trait ArtworkTransport: Send + Sync + fmt::Debug {
    async fn fetch_artwork(
        &self,
        kind: ArtworkKind,
        id: &ArtworkId,
        resolution: Resolution,
    ) -> Result<Vec<u8>, ArtworkError>;
}

/// HTTP transport against the Resona server's artwork endpoints.
#[derive(Debug, Clone)]
pub struct HttpArtworkTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpArtworkTransport {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

    pub fn try_new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(Self::REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url.into()),
        })
    }

    fn url_for(
        &self,
        kind: ArtworkKind,
        id: &ArtworkId,
        resolution: Resolution,
    ) -> String {
        format!(
            "{}/artwork/{}/{}?size={}",
            self.base_url,
            kind,
            id,
            resolution.px()
        )
    }
}

#[async_trait::async_trait]
impl ArtworkTransport for HttpArtworkTransport {
    async fn fetch_artwork(
        &self,
        kind: ArtworkKind,
        id: &ArtworkId,
        resolution: Resolution,
    ) -> Result<Vec<u8>, ArtworkError> {
        let url = self.url_for(kind, id, resolution);
        log::debug!("fetching artwork from {url}");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ArtworkError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ArtworkError::Transport(format!(
                "HTTP {} for {kind}/{id}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ArtworkError::Transport(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

fn normalize_base_url(url: String) -> String {
    url.trim().trim_end_matches('/').to_owned()
}
