use anyhow::Context;
use env_logger::Env;
use log::warn;
use motion_power_common::MotionDetectPacket;
use motion_power_controller::config::Config;
use tokio::net::UdpSocket;

/// Prints every motion packet sent to the configured remote address as a line of JSON
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let config = Config::load().context("Error loading config")?;
    let socket = UdpSocket::bind(config.remote.as_str())
        .await
        .with_context(|| format!("Error binding {}", config.remote))?;
    let mut buf = [0; 64];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        match MotionDetectPacket::from_bytes(&buf[..len]) {
            Some(packet) => println!("{}", serde_json::to_string(&packet)?),
            None => warn!("Ignoring {len} byte packet from {from}"),
        }
    }
}
