pub mod chat_relay;
pub mod config;
pub mod error;
pub mod history;
pub mod image_pipeline;
pub mod io_struct;
pub mod offload;
pub mod relay_state;
pub mod server;
pub mod transcode;
pub mod upstream;
