use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// MARK: - PixelFormat

/// Pixel layout tag of a device format or a delivered frame.
///
/// Only `Nv12` and `Mjpeg` are produced by the legacy allow-list filter; the
/// remaining tags are carried so that a permissive filter can surface them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    #[default]
    Unknown,
    I420,
    Iyuv,
    Rgb24,
    Abgr,
    Argb,
    Argb4444,
    Rgb565,
    Argb1555,
    Yuy2,
    Yv12,
    Uyvy,
    Mjpeg,
    Nv21,
    Nv12,
    Bgra,
}

/// How a pixel format is laid out in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneLayout {
    /// Y plane followed by one interleaved chroma plane at half height.
    SemiPlanar,
    /// Y plane followed by two chroma planes at half width and half height.
    Planar,
    /// Single plane, fixed bytes per pixel.
    Packed { bytes_per_pixel: u32 },
    /// Variable-size bitstream (no stride).
    Compressed,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 16] = [
        Self::Unknown,
        Self::I420,
        Self::Iyuv,
        Self::Rgb24,
        Self::Abgr,
        Self::Argb,
        Self::Argb4444,
        Self::Rgb565,
        Self::Argb1555,
        Self::Yuy2,
        Self::Yv12,
        Self::Uyvy,
        Self::Mjpeg,
        Self::Nv21,
        Self::Nv12,
        Self::Bgra,
    ];

    pub fn layout(&self) -> PlaneLayout {
        match self {
            Self::Nv12 | Self::Nv21 => PlaneLayout::SemiPlanar,
            Self::I420 | Self::Iyuv | Self::Yv12 => PlaneLayout::Planar,
            Self::Rgb24 => PlaneLayout::Packed { bytes_per_pixel: 3 },
            Self::Abgr | Self::Argb | Self::Bgra => PlaneLayout::Packed { bytes_per_pixel: 4 },
            Self::Argb4444 | Self::Rgb565 | Self::Argb1555 | Self::Yuy2 | Self::Uyvy => {
                PlaneLayout::Packed { bytes_per_pixel: 2 }
            }
            Self::Mjpeg | Self::Unknown => PlaneLayout::Compressed,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.layout() == PlaneLayout::Compressed
    }

    /// Tightly packed stride of the first plane, `None` for compressed formats.
    pub fn min_stride(&self, width: u32) -> Option<u32> {
        match self.layout() {
            PlaneLayout::SemiPlanar | PlaneLayout::Planar => Some(width),
            PlaneLayout::Packed { bytes_per_pixel } => Some(width * bytes_per_pixel),
            PlaneLayout::Compressed => None,
        }
    }

    /// Size in bytes of a tightly packed frame, `None` for compressed formats.
    pub fn frame_size(&self, width: u32, height: u32) -> Option<usize> {
        let pixels = width as usize * height as usize;
        match self.layout() {
            PlaneLayout::SemiPlanar | PlaneLayout::Planar => Some(pixels * 3 / 2),
            PlaneLayout::Packed { bytes_per_pixel } => Some(pixels * bytes_per_pixel as usize),
            PlaneLayout::Compressed => None,
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unknown => "UNKNOWN",
            Self::I420 => "I420",
            Self::Iyuv => "IYUV",
            Self::Rgb24 => "RGB24",
            Self::Abgr => "ABGR",
            Self::Argb => "ARGB",
            Self::Argb4444 => "ARGB4444",
            Self::Rgb565 => "RGB565",
            Self::Argb1555 => "ARGB1555",
            Self::Yuy2 => "YUY2",
            Self::Yv12 => "YV12",
            Self::Uyvy => "UYVY",
            Self::Mjpeg => "MJPEG",
            Self::Nv21 => "NV21",
            Self::Nv12 => "NV12",
            Self::Bgra => "BGRA",
        };
        f.write_str(name)
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        if upper == "MJPG" {
            return Ok(Self::Mjpeg);
        }
        Self::ALL
            .iter()
            .copied()
            .find(|format| format.to_string() == upper)
            .ok_or_else(|| format!("unknown pixel format '{s}'"))
    }
}

// MARK: - FormatDescription

/// One discrete (resolution, frame rate, pixel format) combination advertised
/// by a device driver.
///
/// A description returned by enumeration is only guaranteed to be playable
/// when passed back unmodified to [`crate::CaptureSession::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FormatDescription {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    #[serde(alias = "pixelFormat")]
    pub pixel_format: PixelFormat,
}

impl FormatDescription {
    pub fn new(width: u32, height: u32, fps: u32, pixel_format: PixelFormat) -> Self {
        Self { width, height, fps, pixel_format }
    }

    /// Interval between frames in microseconds (0 when fps is 0).
    pub fn frame_interval_us(&self) -> u64 {
        if self.fps == 0 {
            return 0;
        }
        1_000_000 / self.fps as u64
    }
}

impl std::fmt::Display for FormatDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}@{} {}", self.width, self.height, self.fps, self.pixel_format)
    }
}

// MARK: - Device

/// A capture device from one enumeration snapshot.
///
/// `index` is only meaningful for the enumeration that produced the handle;
/// any later call to [`crate::DeviceManager::list_devices`] makes it stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub index: u32,
    pub name: String,
    /// Symbolic link of the device (stable per physical device).
    pub id: String,
    #[serde(skip)]
    pub(crate) generation: u64,
}

impl Device {
    pub(crate) fn new(index: u32, name: String, id: String, generation: u64) -> Self {
        Self { index, name, id, generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Name with control characters removed and surrounding whitespace trimmed.
    pub fn display_name(&self) -> String {
        self.name
            .chars()
            .filter(|c| !c.is_control())
            .collect::<String>()
            .trim()
            .to_owned()
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.index, self.display_name())
    }
}

// MARK: - BackendKind

/// Which platform pipeline delivers frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Capture Engine preview sink; the subsystem pushes samples.
    #[default]
    Engine,
    /// Source Reader; each completion re-requests the next sample.
    Reader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Push,
    Pull,
}

impl BackendKind {
    pub fn delivery(&self) -> Delivery {
        match self {
            Self::Engine => Delivery::Push,
            Self::Reader => Delivery::Pull,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Engine => write!(f, "engine"),
            Self::Reader => write!(f, "reader"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "engine" => Ok(Self::Engine),
            "reader" => Ok(Self::Reader),
            other => Err(format!("unknown backend '{other}' (expected engine|reader)")),
        }
    }
}

// MARK: - SessionState

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Initializing,
    Ready,
    Started,
    Stopped,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Started => "started",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

// MARK: - Frame

/// One plane of a delivered frame.
#[derive(Debug, Clone, Copy)]
pub struct Plane<'a> {
    pub data: &'a [u8],
    /// Bytes per row; 0 for compressed payloads.
    pub stride: u32,
}

/// A frame lent to the frame callback.
///
/// The buffers belong to the capture subsystem and are only valid for the
/// duration of the callback. Use [`Frame::to_owned`] to keep a copy.
#[derive(Debug, Clone)]
pub struct Frame<'a> {
    planes: Vec<Plane<'a>>,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Sample time in microseconds, as reported by the subsystem.
    pub timestamp_us: u64,
}

impl<'a> Frame<'a> {
    /// Split one contiguous buffer into planes according to `pixel_format`.
    ///
    /// `stride` is the row pitch of the first plane. Returns `None` if the
    /// buffer is shorter than the layout requires.
    pub fn from_contiguous(
        data: &'a [u8],
        stride: u32,
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        timestamp_us: u64,
    ) -> Option<Self> {
        let rows = height as usize;
        let pitch = stride as usize;
        let planes = match pixel_format.layout() {
            PlaneLayout::Compressed => vec![Plane { data, stride: 0 }],
            PlaneLayout::Packed { .. } => {
                let len = pitch * rows;
                vec![Plane { data: data.get(..len)?, stride }]
            }
            PlaneLayout::SemiPlanar => {
                let luma = pitch * rows;
                let chroma = pitch * rows.div_ceil(2);
                vec![
                    Plane { data: data.get(..luma)?, stride },
                    Plane { data: data.get(luma..luma + chroma)?, stride },
                ]
            }
            PlaneLayout::Planar => {
                let luma = pitch * rows;
                let chroma_pitch = pitch.div_ceil(2);
                let chroma = chroma_pitch * rows.div_ceil(2);
                let first = luma;
                let second = first + chroma;
                vec![
                    Plane { data: data.get(..first)?, stride },
                    Plane { data: data.get(first..second)?, stride: chroma_pitch as u32 },
                    Plane { data: data.get(second..second + chroma)?, stride: chroma_pitch as u32 },
                ]
            }
        };

        Some(Self { planes, width, height, pixel_format, timestamp_us })
    }

    pub fn planes(&self) -> &[Plane<'a>] {
        &self.planes
    }

    pub fn plane(&self, index: usize) -> Option<&Plane<'a>> {
        self.planes.get(index)
    }

    pub fn byte_len(&self) -> usize {
        self.planes.iter().map(|p| p.data.len()).sum()
    }

    /// Copy the frame out of the subsystem's buffers.
    pub fn to_owned(&self) -> OwnedFrame {
        OwnedFrame {
            planes: self
                .planes
                .iter()
                .map(|p| OwnedPlane { data: Bytes::copy_from_slice(p.data), stride: p.stride })
                .collect(),
            width: self.width,
            height: self.height,
            pixel_format: self.pixel_format,
            timestamp_us: self.timestamp_us,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OwnedPlane {
    pub data: Bytes,
    pub stride: u32,
}

/// A frame copied out of a callback; safe to keep and send across threads.
#[derive(Debug, Clone)]
pub struct OwnedFrame {
    pub planes: Vec<OwnedPlane>,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub timestamp_us: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_format_parses_case_insensitively() {
        assert_eq!("nv12".parse::<PixelFormat>(), Ok(PixelFormat::Nv12));
        assert_eq!("MJPG".parse::<PixelFormat>(), Ok(PixelFormat::Mjpeg));
        assert_eq!("argb4444".parse::<PixelFormat>(), Ok(PixelFormat::Argb4444));
        assert!("H264".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn pixel_format_serializes_uppercase() {
        let json = serde_json::to_string(&PixelFormat::Argb1555).unwrap();
        assert_eq!(json, "\"ARGB1555\"");
        let back: PixelFormat = serde_json::from_str("\"NV12\"").unwrap();
        assert_eq!(back, PixelFormat::Nv12);
    }

    #[test]
    fn nv12_frame_splits_into_luma_and_chroma() {
        let data = vec![0u8; 4 * 2 * 3 / 2];
        let frame = Frame::from_contiguous(&data, 4, 4, 2, PixelFormat::Nv12, 0).unwrap();
        assert_eq!(frame.planes().len(), 2);
        assert_eq!(frame.planes()[0].data.len(), 8);
        assert_eq!(frame.planes()[1].data.len(), 4);
        assert_eq!(frame.byte_len(), data.len());
    }

    #[test]
    fn i420_frame_has_three_planes() {
        let data = vec![0u8; 4 * 4 * 3 / 2];
        let frame = Frame::from_contiguous(&data, 4, 4, 4, PixelFormat::I420, 0).unwrap();
        let strides: Vec<u32> = frame.planes().iter().map(|p| p.stride).collect();
        assert_eq!(strides, vec![4, 2, 2]);
        assert_eq!(frame.byte_len(), 24);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let data = vec![0u8; 10];
        assert!(Frame::from_contiguous(&data, 4, 4, 4, PixelFormat::Nv12, 0).is_none());
        assert!(Frame::from_contiguous(&data, 8, 4, 4, PixelFormat::Yuy2, 0).is_none());
    }

    #[test]
    fn compressed_frame_keeps_whole_payload() {
        let data = vec![0xFFu8, 0xD8, 0x00, 0x01];
        let frame = Frame::from_contiguous(&data, 0, 640, 480, PixelFormat::Mjpeg, 7).unwrap();
        assert_eq!(frame.planes().len(), 1);
        assert_eq!(frame.planes()[0].stride, 0);
        let owned = frame.to_owned();
        assert_eq!(&owned.planes[0].data[..], &data[..]);
        assert_eq!(owned.timestamp_us, 7);
    }

    #[test]
    fn device_display_strips_control_characters() {
        let device = Device::new(1, "USB\u{0}Camera \n".into(), "\\\\?\\usb#vid".into(), 3);
        assert_eq!(device.display_name(), "USBCamera");
        assert_eq!(device.to_string(), "[1] USBCamera");
        assert_eq!(device.generation(), 3);
    }

    #[test]
    fn format_description_display_and_interval() {
        let f = FormatDescription::new(640, 480, 30, PixelFormat::Nv12);
        assert_eq!(f.to_string(), "640x480@30 NV12");
        assert_eq!(f.frame_interval_us(), 33_333);
        assert_eq!(FormatDescription::new(1, 1, 0, PixelFormat::Nv12).frame_interval_us(), 0);
    }

    #[test]
    fn backend_kind_maps_to_delivery() {
        assert_eq!(BackendKind::Engine.delivery(), Delivery::Push);
        assert_eq!(BackendKind::Reader.delivery(), Delivery::Pull);
        assert_eq!("Reader".parse::<BackendKind>(), Ok(BackendKind::Reader));
    }
}
