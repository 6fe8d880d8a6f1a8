//! Media type and sample helpers shared by both back ends.

use anyhow::{Context, Result};
use vidcap_core::{FormatDescription, Frame, PixelFormat, SampleSink};
use windows::core::GUID;
use windows::Win32::Media::MediaFoundation::{
    IMFAttributes, IMFMediaType, IMFSample, MF_MT_DEFAULT_STRIDE, MF_MT_FRAME_RATE,
    MF_MT_FRAME_SIZE, MF_MT_INTERLACE_MODE, MF_MT_PIXEL_ASPECT_RATIO, MF_MT_SUBTYPE,
};

use crate::subtype::{self, SUBTYPE_DATA2, SUBTYPE_DATA3, SUBTYPE_DATA4};

// ── Subtypes ───────────────────────────────────────────────────────────────────

pub fn subtype_guid(format: PixelFormat) -> GUID {
    GUID::from_values(subtype::code_for(format), SUBTYPE_DATA2, SUBTYPE_DATA3, SUBTYPE_DATA4)
}

pub fn pixel_format_of(guid: &GUID) -> PixelFormat {
    let video_subtype =
        guid.data2 == SUBTYPE_DATA2 && guid.data3 == SUBTYPE_DATA3 && guid.data4 == SUBTYPE_DATA4;
    if !video_subtype {
        return PixelFormat::Unknown;
    }
    subtype::format_for(guid.data1)
}

// ── Packed attributes ──────────────────────────────────────────────────────────

fn get_pair(attributes: &IMFAttributes, key: &GUID) -> Result<(u32, u32)> {
    let packed = unsafe { attributes.GetUINT64(key) }?;
    Ok(((packed >> 32) as u32, packed as u32))
}

fn set_pair(attributes: &IMFAttributes, key: &GUID, hi: u32, lo: u32) -> Result<()> {
    unsafe { attributes.SetUINT64(key, ((hi as u64) << 32) | lo as u64) }?;
    Ok(())
}

/// Read width, height, frame-rate numerator and subtype from a media type.
pub fn describe(media_type: &IMFMediaType) -> Result<FormatDescription> {
    let (width, height) = get_pair(media_type, &MF_MT_FRAME_SIZE).context("MF_MT_FRAME_SIZE")?;
    let (fps, _denominator) =
        get_pair(media_type, &MF_MT_FRAME_RATE).context("MF_MT_FRAME_RATE")?;
    let subtype = unsafe { media_type.GetGUID(&MF_MT_SUBTYPE) }.context("MF_MT_SUBTYPE")?;
    Ok(FormatDescription::new(width, height, fps, pixel_format_of(&subtype)))
}

/// Point `media_type` at `format` (subtype, frame size, `fps/1`).
pub fn retarget(media_type: &IMFMediaType, format: &FormatDescription) -> Result<()> {
    unsafe { media_type.SetGUID(&MF_MT_SUBTYPE, &subtype_guid(format.pixel_format)) }
        .context("set MF_MT_SUBTYPE")?;
    set_pair(media_type, &MF_MT_FRAME_SIZE, format.width, format.height)
        .context("set MF_MT_FRAME_SIZE")?;
    set_pair(media_type, &MF_MT_FRAME_RATE, format.fps, 1).context("set MF_MT_FRAME_RATE")
}

/// Copy size, rate, aspect ratio and interlace mode from the device type.
/// The last two are optional on some drivers.
pub fn copy_video_attributes(source: &IMFMediaType, sink: &IMFMediaType) -> Result<()> {
    for key in [MF_MT_FRAME_SIZE, MF_MT_FRAME_RATE] {
        let value = unsafe { source.GetUINT64(&key) }.context("read source frame attribute")?;
        unsafe { sink.SetUINT64(&key, value) }.context("write sink frame attribute")?;
    }
    if let Ok(value) = unsafe { source.GetUINT64(&MF_MT_PIXEL_ASPECT_RATIO) } {
        unsafe { sink.SetUINT64(&MF_MT_PIXEL_ASPECT_RATIO, value) }
            .context("set MF_MT_PIXEL_ASPECT_RATIO")?;
    }
    if let Ok(value) = unsafe { source.GetUINT32(&MF_MT_INTERLACE_MODE) } {
        unsafe { sink.SetUINT32(&MF_MT_INTERLACE_MODE, value) }
            .context("set MF_MT_INTERLACE_MODE")?;
    }
    Ok(())
}

// ── Delivered layout ───────────────────────────────────────────────────────────

/// Geometry of the frames a configured back end will deliver.
#[derive(Debug, Clone, Copy)]
pub struct Delivered {
    pub format: FormatDescription,
    pub stride: u32,
}

impl Delivered {
    pub fn new(format: FormatDescription, media_type: Option<&IMFMediaType>) -> Self {
        let default = format.pixel_format.min_stride(format.width).unwrap_or(0);
        let stride = media_type
            .and_then(|t| unsafe { t.GetUINT32(&MF_MT_DEFAULT_STRIDE) }.ok())
            .map(|s| s as i32)
            .filter(|s| *s > 0)
            .map_or(default, |s| s as u32);
        Self { format, stride }
    }
}

/// Lock `sample`'s buffer and hand it to `sink` as a [`Frame`].
pub fn deliver(sample: &IMFSample, layout: &Delivered, sink: &dyn SampleSink) -> Result<()> {
    // Sample time is in 100 ns units.
    let timestamp_us = unsafe { sample.GetSampleTime() }.unwrap_or(0).max(0) as u64 / 10;
    let buffer =
        unsafe { sample.ConvertToContiguousBuffer() }.context("ConvertToContiguousBuffer")?;

    let mut data: *mut u8 = std::ptr::null_mut();
    let mut length = 0u32;
    unsafe { buffer.Lock(&mut data, None, Some(&mut length as *mut u32)) }
        .context("IMFMediaBuffer::Lock")?;

    let result = if data.is_null() {
        Ok(())
    } else {
        let bytes = unsafe { std::slice::from_raw_parts(data, length as usize) };
        let f = &layout.format;
        let (stride, format) = (layout.stride, f.pixel_format);
        match Frame::from_contiguous(bytes, stride, f.width, f.height, format, timestamp_us) {
            Some(frame) => {
                sink.on_sample(&frame);
                Ok(())
            }
            None => Err(anyhow::anyhow!(
                "sample of {length} bytes is too short for {f} (stride {})",
                layout.stride
            )),
        }
    };

    unsafe { buffer.Unlock() }.context("IMFMediaBuffer::Unlock")?;
    result
}
