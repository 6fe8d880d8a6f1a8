//! vidcap: capture device listing and streaming harness.
//!
//! ```text
//! vidcap devices                         index, name, symbolic link
//! vidcap formats --device N              advertised formats (filtered)
//! vidcap capture --device N [--width W --height H --fps F --format PF]
//!                [--backend engine|reader] [--seconds S]
//! ```
//!
//! `--simulate` swaps the platform capture stack for in-process simulated
//! webcams, which also makes every command usable off Windows.

mod args;
mod commands;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vidcap_capture_windows::MediaFoundationPlatform;
use vidcap_core::sim::SimulatedPlatform;
use vidcap_core::{CapturePlatform, DeviceManager, VidcapConfig};

use args::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => VidcapConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => VidcapConfig::default(),
    };

    let platform: Arc<dyn CapturePlatform> = if cli.simulate {
        Arc::new(SimulatedPlatform::demo())
    } else {
        Arc::new(MediaFoundationPlatform::new())
    };
    info!(platform = platform.name(), "vidcap v{}", env!("CARGO_PKG_VERSION"));

    let mut manager = DeviceManager::new(platform, config.filter.clone());

    match cli.command {
        Command::Devices => commands::devices(&mut manager, cli.json),
        Command::Formats { device, filter } => {
            if let Some(filter) = filter.selected() {
                manager.set_filter(filter);
            }
            commands::formats(&mut manager, device, cli.json)
        }
        Command::Capture(args) => commands::capture(manager, config, args).await,
    }
}
