use clap::Parser;
use std::time::Duration;

fn default_transcode_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, Parser)]
#[command(name = "catchat-relay", version, about = "Cat picture and chat relay backend")]
pub struct RelayConfig {
    #[arg(long, env = "RELAY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "RELAY_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Origin of the random image provider; relative image paths resolve against it
    #[arg(long, env = "IMAGE_BASE_URL", default_value = "https://cataas.com")]
    pub image_base_url: String,

    /// Deadline applied to each of the two image provider calls
    #[arg(long, default_value_t = 10)]
    pub image_timeout_secs: u64,

    #[arg(long, default_value_t = 600)]
    pub max_dimension: u32,

    #[arg(long, default_value_t = 60)]
    pub jpeg_quality: u8,

    /// Width of the CPU pool used for transcoding
    #[arg(long, default_value_t = default_transcode_workers())]
    pub transcode_workers: usize,

    #[arg(long, env = "CHAT_BASE_URL", default_value = "https://api.siliconflow.cn/v1")]
    pub chat_base_url: String,

    #[arg(long, env = "CHAT_MODEL", default_value = "deepseek-ai/DeepSeek-V3")]
    pub chat_model: String,

    #[arg(long, default_value_t = 0.7)]
    pub chat_temperature: f32,

    /// Deadline for the chat provider to start answering
    #[arg(long, default_value_t = 60)]
    pub chat_timeout_secs: u64,

    #[arg(long, env = "SILICON_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// SQLite file for chat history; in-memory history when unset
    #[arg(long, env = "HISTORY_DB")]
    pub history_db: Option<String>,

    #[arg(long, default_value_t = 50)]
    pub history_limit: usize,

    #[arg(long, default_value = "info")]
    pub log_level: log::LevelFilter,
}

impl RelayConfig {
    pub fn image_timeout(&self) -> Duration {
        Duration::from_secs(self.image_timeout_secs)
    }

    pub fn chat_timeout(&self) -> Duration {
        Duration::from_secs(self.chat_timeout_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            host: "0.0.0.0".to_string(),
            port: 8000,
            image_base_url: "https://cataas.com".to_string(),
            image_timeout_secs: 10,
            max_dimension: 600,
            jpeg_quality: 60,
            transcode_workers: default_transcode_workers(),
            chat_base_url: "https://api.siliconflow.cn/v1".to_string(),
            chat_model: "deepseek-ai/DeepSeek-V3".to_string(),
            chat_temperature: 0.7,
            chat_timeout_secs: 60,
            api_key: None,
            history_db: None,
            history_limit: 50,
            log_level: log::LevelFilter::Info,
        }
    }
}
