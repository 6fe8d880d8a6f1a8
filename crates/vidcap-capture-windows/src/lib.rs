//! vidcap-capture-windows: Media Foundation implementation of
//! [`vidcap_core::CapturePlatform`].
//!
//! On non-Windows targets a stub is compiled that reports
//! `SubsystemUnavailable` from every entry point.
//!
//! # Windows pipeline
//!
//! ```text
//! CoInitializeEx (per thread) + MFStartup (once)
//!   │  MFEnumDeviceSources(VIDCAP)
//!   ▼
//! IMFActivate[] → (symbolic link, friendly name)
//!   │  ActivateObject → presentation descriptor → stream 0 media types
//!   ▼
//! BackendKind::Engine  → IMFCaptureEngine + preview sink   (push)
//! BackendKind::Reader  → async IMFSourceReader::ReadSample (pull)
//!   │
//!   ▼
//! SampleSink / EngineEventSink (vidcap-core dispatcher)
//! ```

pub mod status;
pub mod subtype;

// ── Platform split ─────────────────────────────────────────────────────────────

#[cfg(target_os = "windows")]
mod mf;
#[cfg(target_os = "windows")]
pub use mf::MediaFoundationPlatform;

#[cfg(not(target_os = "windows"))]
mod stub;
#[cfg(not(target_os = "windows"))]
pub use stub::MediaFoundationPlatform;
