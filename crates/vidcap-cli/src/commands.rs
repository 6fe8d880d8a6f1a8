//! Subcommand handlers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};
use vidcap_core::{
    find_format, CaptureSession, Device, DeviceManager, FormatDescription,
    VidcapConfig,
};

use crate::args::CaptureArgs;

const STATS_INTERVAL: Duration = Duration::from_secs(1);

fn device_at(manager: &mut DeviceManager, index: u32) -> Result<Device> {
    let devices = manager.list_devices().context("enumerating capture devices")?;
    if devices.is_empty() {
        bail!("no capture devices found");
    }
    manager
        .device_by_index(index)
        .cloned()
        .with_context(|| format!("no device at index {index} ({} found)", devices.len()))
}

pub fn devices(manager: &mut DeviceManager, json: bool) -> Result<()> {
    let devices = manager.list_devices().context("enumerating capture devices")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }
    if devices.is_empty() {
        println!("No capture devices found.");
    }
    for device in &devices {
        println!("{device}\n    {}", device.id);
    }
    Ok(())
}

pub fn formats(manager: &mut DeviceManager, index: u32, json: bool) -> Result<()> {
    let device = device_at(manager, index)?;
    let formats = manager
        .list_formats(&device)
        .with_context(|| format!("listing formats of {device}"))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&formats)?);
        return Ok(());
    }
    println!("{device}: {} format(s)", formats.len());
    for (i, format) in formats.iter().enumerate() {
        println!("  {i:>3}  {format}");
    }
    Ok(())
}

fn wildcard<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "*".to_owned(), |v| v.to_string())
}

/// Pick the format to stream: the first advertised one matching every
/// dimension given on the command line.
fn choose_format(args: &CaptureArgs, available: &[FormatDescription]) -> Option<FormatDescription> {
    let wanted = available.iter().find(|f| {
        args.width.map_or(true, |w| f.width == w)
            && args.height.map_or(true, |h| f.height == h)
            && args.fps.map_or(true, |fps| f.fps == fps)
            && args.format.map_or(true, |p| f.pixel_format == p)
    })?;
    find_format(wanted, available)
}

pub async fn capture(
    mut manager: DeviceManager,
    config: VidcapConfig,
    args: CaptureArgs,
) -> Result<()> {
    let device = device_at(&mut manager, args.device)?;
    let available = manager
        .list_formats(&device)
        .with_context(|| format!("listing formats of {device}"))?;
    let Some(format) = choose_format(&args, &available) else {
        bail!(
            "{device} advertises no format matching {}x{}@{} {} ({} format(s) available)",
            wildcard(args.width),
            wildcard(args.height),
            wildcard(args.fps),
            wildcard(args.format),
            available.len()
        );
    };

    let mut session_config = config.session;
    if let Some(backend) = args.backend {
        session_config.backend = backend;
    }
    let mut session = CaptureSession::new(manager.platform(), session_config);

    let bytes = Arc::new(AtomicU64::new(0));
    let counter = bytes.clone();
    session.register_frame_callback(move |frame| {
        counter.fetch_add(frame.byte_len() as u64, Ordering::Relaxed);
    });
    let (error_tx, mut error_rx) = mpsc::unbounded_channel();
    session.register_error_callback(move |err| {
        let _ = error_tx.send(err.clone());
    });

    session
        .start(&manager, &device, &format)
        .await
        .with_context(|| format!("starting capture on {device} at {format}"))?;
    info!(device = %device, %format, "Streaming; press Ctrl-C to stop");

    let deadline = async {
        match args.seconds {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;
    let started = Instant::now();
    let mut last_frames = 0;

    let outcome = loop {
        tokio::select! {
            _ = ticker.tick() => {
                let frames = session.frames_delivered();
                let elapsed = started.elapsed().as_secs_f64();
                println!(
                    "{:>6.1}s  frames {:>6}  (+{:>3})  {:>6.1} fps  {:>8.1} MiB",
                    elapsed,
                    frames,
                    frames - last_frames,
                    frames as f64 / elapsed.max(f64::EPSILON),
                    bytes.load(Ordering::Relaxed) as f64 / (1024.0 * 1024.0),
                );
                last_frames = frames;
            }
            _ = &mut deadline => {
                info!("Capture time elapsed");
                break Ok(());
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for Ctrl-C")?;
                info!("Interrupted");
                break Ok(());
            }
            Some(err) = error_rx.recv() => {
                warn!(state = %session.state(), "Stream failed: {err}");
                break Err(err);
            }
        }
    };

    let total = session.frames_delivered();
    session.stop();
    println!("{total} frame(s) delivered");
    outcome.context("capture stopped early")
}
