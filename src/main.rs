// TickForge entry point: config, logging, supervisor, run until ctrl-c.

use std::path::PathBuf;

use tickforge::core::config::EngineConfig;
use tickforge::core::logger::setup_logging;
use tickforge::layer3::supervisor::Supervisor;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("tickforge.json"));

    let cfg = match EngineConfig::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load config {}: {}", config_path.display(), e);
            std::process::exit(1);
        }
    };

    setup_logging(std::env::var("LOG_LEVEL").ok().as_deref(), false);

    let supervisor = Supervisor::new(cfg);
    supervisor.start();
    info!("TickForge running, press ctrl-c to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Signal handler failed");
    }

    info!("Shutting down");
    supervisor.stop();
}
