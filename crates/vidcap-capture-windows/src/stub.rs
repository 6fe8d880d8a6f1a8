//! Non-Windows stub for MediaFoundationPlatform (CI + cross-compilation).

use vidcap_core::{
    BackendKind, CaptureEngine, CaptureError, CapturePlatform, DeviceRecord, EngineSinks,
    FormatDescription,
};

fn unavailable() -> CaptureError {
    CaptureError::SubsystemUnavailable {
        reason: "Media Foundation is only available on Windows".into(),
    }
}

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
        "media-foundation (stub)"
    }

    fn initialize(&self) -> Result<(), CaptureError> {
        tracing::debug!("MediaFoundationPlatform::initialize stub (non-Windows)");
        Err(unavailable())
    }

    fn enumerate(&self) -> Result<Vec<DeviceRecord>, CaptureError> {
        Err(unavailable())
    }

    fn native_formats(&self, _device_id: &str) -> Result<Vec<FormatDescription>, CaptureError> {
        Err(unavailable())
    }

    fn open_engine(
        &self,
        _device_id: &str,
        _backend: BackendKind,
        _sinks: EngineSinks,
    ) -> Result<Box<dyn CaptureEngine>, CaptureError> {
        Err(unavailable())
    }
}
