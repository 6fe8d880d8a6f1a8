//! Media Foundation implementation of [`CapturePlatform`].

mod device;
mod engine;
mod media;
mod reader;
mod runtime;

use vidcap_core::{
    BackendKind, CaptureEngine, CaptureError, CapturePlatform, DeviceRecord, EngineSinks,
    FormatDescription,
};

use crate::status;

/// Convert an internal error to the public taxonomy, keeping the HRESULT
/// class (busy vs. other) when one is in the chain.
pub(crate) fn seam_error(operation: &str, err: anyhow::Error) -> CaptureError {
    if let Some(capture) = err.downcast_ref::<CaptureError>() {
        return capture.clone();
    }
    let code = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<windows::core::Error>())
        .map(|e| e.code().0);
    match code {
        Some(code) => status::capture_error(operation, code, &format!("{err:#}")),
        None => CaptureError::backend(operation, format!("{err:#}")),
    }
}

/// Capture devices reached through Media Foundation.
#[derive(Debug, Default)]
pub struct MediaFoundationPlatform {
    _private: (),
}

impl MediaFoundationPlatform {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CapturePlatform for MediaFoundationPlatform {
    fn name(&self) -> &'static str {
        "media-foundation"
    }

    fn initialize(&self) -> Result<(), CaptureError> {
        runtime::ensure_started()
    }

    fn enumerate(&self) -> Result<Vec<DeviceRecord>, CaptureError> {
        runtime::ensure_started()?;
        let sources = device::enumerate().map_err(|e| seam_error("MFEnumDeviceSources", e))?;
        Ok(sources
            .into_iter()
            .map(|source| DeviceRecord { id: source.id, name: source.name })
            .collect())
    }

    fn native_formats(&self, device_id: &str) -> Result<Vec<FormatDescription>, CaptureError> {
        runtime::ensure_started()?;
        device::native_formats(device_id).map_err(|e| seam_error("enumerate media types", e))
    }

    fn open_engine(
        &self,
        device_id: &str,
        backend: BackendKind,
        sinks: EngineSinks,
    ) -> Result<Box<dyn CaptureEngine>, CaptureError> {
        runtime::ensure_started()?;
        let source = device::find(device_id).map_err(|e| seam_error("activate device", e))?;
        tracing::debug!("Opening {} back end for {}", backend, source.name);
        match backend {
            BackendKind::Engine => engine::MfCaptureEngine::open(source, sinks)
                .map(|e| Box::new(e) as Box<dyn CaptureEngine>)
                .map_err(|e| seam_error("open capture engine", e)),
            BackendKind::Reader => reader::MfReader::open(source, sinks)
                .map(|r| Box::new(r) as Box<dyn CaptureEngine>)
                .map_err(|e| seam_error("open source reader", e)),
        }
    }
}
