//! Command-line arguments.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use vidcap_core::{BackendKind, FormatFilter, PixelFormat};

/// List capture devices and their formats, or stream frames from one.
#[derive(Parser, Debug)]
#[command(name = "vidcap")]
#[command(version, about = "Video capture device enumeration and streaming", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// JSON config file (filter + session settings)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Use simulated devices instead of the platform capture stack
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Print listings as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List capture devices
    Devices,
    /// List the formats advertised by a device
    Formats {
        /// Device index (from `devices`)
        #[arg(long, default_value = "0")]
        device: u32,

        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Stream frames and print statistics
    Capture(CaptureArgs),
}

#[derive(Args, Debug, Default)]
#[group(multiple = false)]
pub struct FilterArgs {
    /// Show every advertised format
    #[arg(long)]
    pub no_filter: bool,

    /// Apply the legacy allow-list (320x240..1280x720, 10-30 fps, NV12/MJPEG)
    #[arg(long)]
    pub legacy_filter: bool,
}

impl FilterArgs {
    /// Filter selected on the command line, if any.
    pub fn selected(&self) -> Option<FormatFilter> {
        if self.no_filter {
            Some(FormatFilter::permissive())
        } else if self.legacy_filter {
            Some(FormatFilter::legacy())
        } else {
            None
        }
    }
}

#[derive(Args, Debug)]
pub struct CaptureArgs {
    /// Device index (from `devices`)
    #[arg(long, default_value = "0")]
    pub device: u32,

    #[arg(long)]
    pub width: Option<u32>,

    #[arg(long)]
    pub height: Option<u32>,

    #[arg(long)]
    pub fps: Option<u32>,

    /// Pixel format, e.g. NV12, MJPG, YUY2
    #[arg(long)]
    pub format: Option<PixelFormat>,

    /// Delivery back end (defaults to the configured one)
    #[arg(long)]
    pub backend: Option<BackendKind>,

    /// Stop after this many seconds (runs until Ctrl-C when omitted)
    #[arg(long)]
    pub seconds: Option<u64>,
}
