use std::path::PathBuf;
use std::process;

use clap::Parser;
use log::{error, info, warn};
use server::config::DEFAULT_CONFIG_PATH;
use server::{logging, RelayConfig, Server};

/// Relays game-server console logs from UDP to TCP subscribers.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the JSON configuration file
    #[clap(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let (config, warnings) = match RelayConfig::load(&args.config) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Console relay failed to start: {}", e);
            process::exit(1);
        }
    };

    if let Some(warning) = logging::init(config.debug_level, config.log_file.as_deref()) {
        eprintln!("{}", warning);
    }
    for warning in &warnings {
        warn!("{}", warning);
    }

    info!("Console Relay {} starting", env!("CARGO_PKG_VERSION"));
    config.log_effective();

    let server = match Server::new(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    let state = server.state();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down gracefully...");
                state.shutdown.trigger();
            }
            Err(e) => warn!("Could not listen for Ctrl+C: {}", e),
        }
    });

    server.run().await?;
    info!("Console relay stopped");
    Ok(())
}
