use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::types::{BackendKind, FormatDescription, PixelFormat};

// MARK: - FormatFilter

/// Allow-list applied to formats during enumeration.
///
/// The default allows everything. [`FormatFilter::legacy`] restricts
/// enumeration to 320x240..=1280x720 in multiples of 10, 10..=30 fps in steps
/// of 5, NV12 or MJPEG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatFilter {
    #[serde(alias = "minWidth")]
    pub min_width: u32,
    #[serde(alias = "maxWidth")]
    pub max_width: u32,
    #[serde(alias = "minHeight")]
    pub min_height: u32,
    #[serde(alias = "maxHeight")]
    pub max_height: u32,
    /// Width and height must be multiples of this (1 = any).
    #[serde(alias = "sizeMultiple")]
    pub size_multiple: u32,
    #[serde(alias = "minFps")]
    pub min_fps: u32,
    #[serde(alias = "maxFps")]
    pub max_fps: u32,
    /// Frame rate must be a multiple of this (1 = any).
    #[serde(alias = "fpsMultiple")]
    pub fps_multiple: u32,
    /// `None` allows every pixel format.
    #[serde(alias = "pixelFormats")]
    pub pixel_formats: Option<Vec<PixelFormat>>,
}

impl Default for FormatFilter {
    fn default() -> Self {
        Self::permissive()
    }
}

impl FormatFilter {
    pub fn permissive() -> Self {
        Self {
            min_width: 0,
            max_width: u32::MAX,
            min_height: 0,
            max_height: u32::MAX,
            size_multiple: 1,
            min_fps: 0,
            max_fps: u32::MAX,
            fps_multiple: 1,
            pixel_formats: None,
        }
    }

    pub fn legacy() -> Self {
        Self {
            min_width: 320,
            max_width: 1280,
            min_height: 240,
            max_height: 720,
            size_multiple: 10,
            min_fps: 10,
            max_fps: 30,
            fps_multiple: 5,
            pixel_formats: Some(vec![PixelFormat::Nv12, PixelFormat::Mjpeg]),
        }
    }

    pub fn allows(&self, format: &FormatDescription) -> bool {
        let fps_ok = (self.min_fps..=self.max_fps).contains(&format.fps)
            && format.fps % self.fps_multiple.max(1) == 0;
        let multiple = self.size_multiple.max(1);
        let size_ok = format.width % multiple == 0
            && format.height % multiple == 0
            && (self.min_width..=self.max_width).contains(&format.width)
            && (self.min_height..=self.max_height).contains(&format.height);
        let pixel_ok = self
            .pixel_formats
            .as_ref()
            .map_or(true, |allowed| allowed.contains(&format.pixel_format));

        fps_ok && size_ok && pixel_ok
    }

    /// Keep only allowed formats, preserving enumeration order.
    pub fn apply(&self, formats: Vec<FormatDescription>) -> Vec<FormatDescription> {
        formats.into_iter().filter(|f| self.allows(f)).collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size_multiple == 0 || self.fps_multiple == 0 {
            return Err(ConfigError::Invalid {
                reason: "size_multiple and fps_multiple must be at least 1".into(),
            });
        }
        if self.min_width > self.max_width || self.min_height > self.max_height {
            return Err(ConfigError::Invalid { reason: "filter size range is empty".into() });
        }
        if self.min_fps > self.max_fps {
            return Err(ConfigError::Invalid { reason: "filter fps range is empty".into() });
        }
        if matches!(&self.pixel_formats, Some(list) if list.is_empty()) {
            return Err(ConfigError::Invalid { reason: "pixel_formats is empty".into() });
        }
        Ok(())
    }
}

// MARK: - SessionConfig

/// Capture session tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub backend: BackendKind,
    /// Upper bound on the wait for the engine's initialization event.
    #[serde(alias = "initTimeoutMs")]
    pub init_timeout_ms: u64,
    /// Extra attempts after a `DeviceBusyOrUnavailable` failure.
    #[serde(alias = "startRetries")]
    pub start_retries: u32,
    #[serde(alias = "retryBackoffMs")]
    pub retry_backoff_ms: u64,
    #[serde(alias = "maxRetryBackoffMs")]
    pub max_retry_backoff_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Engine,
            init_timeout_ms: 5_000,
            start_retries: 3,
            retry_backoff_ms: 100,
            max_retry_backoff_ms: 1_000,
        }
    }
}

impl SessionConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    /// Backoff before retry number `attempt` (1-based), doubling and capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self.retry_backoff_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(ms.min(self.max_retry_backoff_ms))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.init_timeout_ms == 0 {
            return Err(ConfigError::Invalid { reason: "init_timeout_ms must be non-zero".into() });
        }
        if self.retry_backoff_ms > self.max_retry_backoff_ms {
            return Err(ConfigError::Invalid {
                reason: "retry_backoff_ms exceeds max_retry_backoff_ms".into(),
            });
        }
        Ok(())
    }
}

// MARK: - VidcapConfig

/// Top-level configuration, usually read from a JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VidcapConfig {
    pub filter: FormatFilter,
    pub session: SessionConfig,
}

impl VidcapConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.filter.validate()?;
        self.session.validate()
    }
}
