use std::sync::{Arc, OnceLock};

use crate::errors::CaptureError;
use crate::types::{BackendKind, FormatDescription, Frame, PixelFormat};

// MARK: - Records

/// A device as reported by the platform, before it is bound to an enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// Symbolic link / stable identifier.
    pub id: String,
    /// Friendly name, already decoded to UTF-8.
    pub name: String,
}

/// Native stream and media-type slot that realizes a requested format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSelection {
    pub stream_index: u32,
    pub media_type_index: u32,
}

// MARK: - Events

/// Asynchronous notifications raised by a capture engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The engine finished its asynchronous initialization.
    Initialized,
    /// Lifecycle error (initialization failure, or engine error once running).
    Error(CaptureError),
    /// Fatal error on the sample stream.
    StreamError { reason: String },
}

/// Receives samples from the subsystem's delivery thread.
pub trait SampleSink: Send + Sync {
    fn on_sample(&self, frame: &Frame<'_>);
}

/// Receives engine lifecycle events from the subsystem's event thread.
pub trait EngineEventSink: Send + Sync {
    fn on_event(&self, event: EngineEvent);
}

/// The two sinks handed to an engine when it is opened.
#[derive(Clone)]
pub struct EngineSinks {
    pub samples: Arc<dyn SampleSink>,
    pub events: Arc<dyn EngineEventSink>,
}

// MARK: - Platform traits

/// Entry point into a native capture subsystem.
///
/// `initialize` is called before every enumeration and must be idempotent;
/// implementations back it with an [`InitOnce`].
pub trait CapturePlatform: Send + Sync {
    fn name(&self) -> &'static str;

    fn initialize(&self) -> Result<(), CaptureError>;

    fn enumerate(&self) -> Result<Vec<DeviceRecord>, CaptureError>;

    /// Every format the device's first stream advertises, in driver order.
    fn native_formats(&self, device_id: &str) -> Result<Vec<FormatDescription>, CaptureError>;

    /// Create an engine for `device_id` and begin its asynchronous
    /// initialization. Completion is reported through `sinks.events` as
    /// [`EngineEvent::Initialized`] or [`EngineEvent::Error`].
    fn open_engine(
        &self,
        device_id: &str,
        backend: BackendKind,
        sinks: EngineSinks,
    ) -> Result<Box<dyn CaptureEngine>, CaptureError>;
}

/// One initialized engine bound to one device.
pub trait CaptureEngine: Send {
    /// Find the native stream/media type for `format`; `Ok(None)` if none.
    fn resolve(&mut self, format: &FormatDescription)
        -> Result<Option<StreamSelection>, CaptureError>;

    /// Point the output sink (or reader) at `selection`, delivering `target`.
    fn configure(&mut self, selection: &StreamSelection, target: PixelFormat)
        -> Result<(), CaptureError>;

    /// Arm asynchronous delivery: start the preview, or issue the first read.
    fn arm(&mut self) -> Result<(), CaptureError>;

    /// Stop delivery and release native objects. Must be idempotent and must
    /// not wait on the subsystem.
    fn shutdown(&mut self);
}

// MARK: - InitOnce

/// Single-initialization cell for process-wide subsystem startup.
///
/// The first caller runs the initializer; every later caller observes the
/// same outcome, including a failure.
pub struct InitOnce {
    cell: OnceLock<Result<(), CaptureError>>,
}

impl InitOnce {
    pub const fn new() -> Self {
        Self { cell: OnceLock::new() }
    }

    pub fn get_or_init(
        &self,
        init: impl FnOnce() -> Result<(), CaptureError>,
    ) -> Result<(), CaptureError> {
        self.cell.get_or_init(init).clone()
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.cell.get(), Some(Ok(())))
    }
}

impl Default for InitOnce {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn init_once_runs_initializer_once() {
        let once = InitOnce::new();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            once.get_or_init(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(once.is_initialized());
    }

    #[test]
    fn init_once_remembers_failure() {
        let once = InitOnce::new();
        let err = CaptureError::SubsystemUnavailable { reason: "no MF".into() };
        assert_eq!(once.get_or_init(|| Err(err.clone())), Err(err.clone()));
        assert_eq!(once.get_or_init(|| Ok(())), Err(err));
        assert!(!once.is_initialized());
    }
}
