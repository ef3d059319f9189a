use std::time::Duration;
use url::{ParseError, Url};

use crate::error::{RelayError, Result};
use crate::io_struct::{ImageFetchResult, ImageMetadata};

const METADATA_PATH: &str = "/cat?json=true";

/// Client for the random image provider.
///
/// A lookup is two chained calls: the metadata endpoint names an image, then
/// the image itself is downloaded. Each call gets its own deadline and a
/// single attempt.
#[derive(Debug, Clone)]
pub struct ImageProvider {
    client: reqwest::Client,
    origin: Url,
    timeout: Duration,
}

impl ImageProvider {
    pub fn new(client: reqwest::Client, base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let origin = Url::parse(base_url)?;
        if origin.cannot_be_a_base() {
            anyhow::bail!("image provider url {} cannot be used as a base", base_url);
        }
        Ok(Self {
            client,
            origin,
            timeout,
        })
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn metadata_url(&self) -> String {
        format!(
            "{}{}",
            self.origin.as_str().trim_end_matches('/'),
            METADATA_PATH
        )
    }

    pub async fn fetch_random_image(&self) -> Result<ImageFetchResult> {
        let metadata_url = self.metadata_url();
        let metadata: ImageMetadata = {
            let resp = self.get(&metadata_url).await?;
            resp.json()
                .await
                .map_err(|e| self.classify(&metadata_url, e))?
        };

        let raw = metadata
            .url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| RelayError::unavailable(&metadata_url, "metadata has no image url"))?;
        let source_url = self.resolve(&raw).map_err(|e| {
            RelayError::unavailable(&metadata_url, format!("bad image url {}: {}", raw, e))
        })?;
        log::info!("resolved image url: {}", source_url);

        let resp = self.get(source_url.as_str()).await?;
        let raw_bytes = resp
            .bytes()
            .await
            .map_err(|e| self.classify(source_url.as_str(), e))?;

        Ok(ImageFetchResult {
            raw_bytes,
            source_url: source_url.into(),
        })
    }

    /// Resolves an image reference from the metadata body. Absolute urls pass
    /// through; anything without a scheme is a path on the provider origin,
    /// including `//host/...` forms.
    pub fn resolve(&self, reference: &str) -> std::result::Result<Url, ParseError> {
        match Url::parse(reference) {
            Ok(url) => Ok(url),
            Err(ParseError::RelativeUrlWithoutBase) => self
                .origin
                .join(&format!("/{}", reference.trim_start_matches('/'))),
            Err(e) => Err(e),
        }
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let resp = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.classify(url, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RelayError::unavailable(url, format!("status {}", status)));
        }
        Ok(resp)
    }

    fn classify(&self, url: &str, err: reqwest::Error) -> RelayError {
        if err.is_decode() {
            return RelayError::unavailable(url, format!("malformed body: {}", err));
        }
        RelayError::from_reqwest(url, self.timeout, err)
    }
}
