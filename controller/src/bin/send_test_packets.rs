use anyhow::Context;
use env_logger::Env;
use log::info;
use motion_power_controller::{config::Config, notifier::Notifier};

/// Checks that the listener gets our packets without needing any motion
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("debug")).init();
    let config = Config::load().context("Error loading config")?;
    let notifier = Notifier::bind(&config.remote).await?;
    for count in [70, 71, 72] {
        info!("Sending {count} to {}", notifier.remote());
        notifier.notify(count).await;
    }
    Ok(())
}
