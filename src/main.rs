mod bridge;
mod config;
mod error;
mod framing;
mod heartbeat;
mod manifest;
mod mavcmd;
mod mission;
mod mqtt;
mod packet;
mod registry;
mod router;
mod transport;

use anyhow::Result;
use tracing_subscriber::filter::LevelFilter;

use crate::bridge::Bridge;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load("config.toml")?;
    config.validate()?;

    init_logging(&config.logging.level);

    let bridge = Bridge::new(config).await?;
    bridge.run().await
}

fn init_logging(level: &str) {
    let filter = match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(false)
        .init();
}
