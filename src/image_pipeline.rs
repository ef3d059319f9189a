use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};

use crate::error::Result;
use crate::io_struct::CatResponse;
use crate::offload::OffloadPool;
use crate::transcode::{self, OUTPUT_MEDIA_TYPE};
use crate::upstream::ImageProvider;

pub const SUCCESS_NOTE: &str = "A fresh cat fetched and compressed by the relay backend";

/// Fetch, offload the transcode, assemble. Owns the mapping from failures to
/// the always-successful JSON body.
#[derive(Debug, Clone)]
pub struct ImagePipeline {
    provider: ImageProvider,
    pool: OffloadPool,
    max_dimension: u32,
    quality: u8,
}

impl ImagePipeline {
    pub fn new(provider: ImageProvider, pool: OffloadPool, max_dimension: u32, quality: u8) -> Self {
        Self {
            provider,
            pool,
            max_dimension,
            quality,
        }
    }

    /// Never fails: any error becomes an empty `image` with the cause in `note`.
    pub async fn handle(&self) -> CatResponse {
        match self.run().await {
            Ok(image) => CatResponse {
                image,
                note: SUCCESS_NOTE.to_string(),
            },
            Err(e) => {
                log::warn!("cat request failed: {}", e);
                CatResponse {
                    image: String::new(),
                    note: format!("Failed to fetch a cat: {}", e),
                }
            }
        }
    }

    async fn run(&self) -> Result<String> {
        let fetched = self.provider.fetch_random_image().await?;
        log::debug!(
            "fetched {} bytes from {}",
            fetched.raw_bytes.len(),
            fetched.source_url
        );

        let (max_dimension, quality) = (self.max_dimension, self.quality);
        let encoded = self
            .pool
            .run(move || transcode::transcode(&fetched.raw_bytes, max_dimension, quality))
            .await?;

        Ok(data_uri(OUTPUT_MEDIA_TYPE, &encoded))
    }
}

pub fn data_uri(media_type: &str, payload: &[u8]) -> String {
    format!("data:{};base64,{}", media_type, BASE64_STANDARD.encode(payload))
}
