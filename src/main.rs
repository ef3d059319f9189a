use catchat_relay::config::RelayConfig;
use catchat_relay::relay_state::RelayState;
use catchat_relay::server::{init_logging, startup};
use clap::Parser;
use tokio::signal;

fn main() -> anyhow::Result<()> {
    let config = RelayConfig::parse();
    init_logging(config.log_level);

    let relay_state = RelayState::new(config.clone())?;

    actix_web::rt::System::new().block_on(async move {
        tokio::select! {
            res = startup(config, relay_state) => {
                res?;
            }
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down");
            }
        }
        Ok::<(), anyhow::Error>(())
    })
}
