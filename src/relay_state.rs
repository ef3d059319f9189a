use std::sync::Arc;

use crate::chat_relay::ChatProvider;
use crate::config::RelayConfig;
use crate::history::{MemoryHistoryStore, SharedHistoryStore, SqliteHistoryStore};
use crate::image_pipeline::ImagePipeline;
use crate::offload::OffloadPool;
use crate::upstream::ImageProvider;

/// Everything a handler needs, resolved once at startup and cloned into
/// each worker. Nothing here is mutated per request.
#[derive(Clone)]
pub struct RelayState {
    pub images: ImagePipeline,
    pub chat: ChatProvider,
    pub history: SharedHistoryStore,
    pub history_limit: usize,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> anyhow::Result<Self> {
        let history: SharedHistoryStore = match &config.history_db {
            Some(path) => {
                log::info!("chat history stored in {}", path);
                Arc::new(SqliteHistoryStore::open(path)?)
            }
            None => {
                log::info!("chat history kept in memory");
                Arc::new(MemoryHistoryStore::new())
            }
        };
        Self::with_history(config, history)
    }

    pub fn with_history(config: RelayConfig, history: SharedHistoryStore) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.image_timeout().min(config.chat_timeout()))
            .build()?;

        let provider = ImageProvider::new(
            client.clone(),
            &config.image_base_url,
            config.image_timeout(),
        )?;
        let pool = OffloadPool::new(config.transcode_workers);
        log::info!("image transcoding limited to {} concurrent jobs", pool.width());
        let images = ImagePipeline::new(provider, pool, config.max_dimension, config.jpeg_quality);

        let chat = ChatProvider::new(client, &config);
        if !chat.is_configured() {
            log::warn!("no chat API key configured; /chat will answer with a diagnostic");
        }

        Ok(Self {
            images,
            chat,
            history,
            history_limit: config.history_limit,
        })
    }
}
