use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::{FormatDescription, SessionState};

/// Errors surfaced by enumeration and capture.
///
/// Only [`CaptureError::DeviceBusyOrUnavailable`] is retryable; see
/// [`CaptureError::is_retryable`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Capture subsystem unavailable: {reason}")]
    SubsystemUnavailable { reason: String },

    #[error("No native format matches {requested}")]
    NoMatchingFormat { requested: FormatDescription },

    #[error("Device busy or unavailable: {reason}")]
    DeviceBusyOrUnavailable { reason: String },

    #[error("Capture engine did not initialize within {}ms", .timeout.as_millis())]
    InitializationTimeout { timeout: Duration },

    #[error("Stream error after start: {reason}")]
    RuntimeStreamError { reason: String },

    #[error("Device handle from enumeration {handle} is stale (current: {current})")]
    StaleDevice { handle: u64, current: u64 },

    #[error("Device not found: {id}")]
    DeviceNotFound { id: String },

    #[error("Device exposes no streams")]
    NoStreams,

    #[error("Operation invalid in state {state}")]
    InvalidState { state: SessionState },

    #[error("Platform error in {operation}: {reason}")]
    Backend { operation: String, reason: String },
}

impl CaptureError {
    pub fn backend(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Backend { operation: operation.into(), reason: reason.to_string() }
    }

    pub fn busy(reason: impl ToString) -> Self {
        Self::DeviceBusyOrUnavailable { reason: reason.to_string() }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DeviceBusyOrUnavailable { .. })
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Configuration invalid: {reason}")]
    Invalid { reason: String },
}
