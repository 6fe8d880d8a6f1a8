//! Video capture source enumeration and format listing.

use std::ffi::c_void;

use anyhow::{Context, Result};
use vidcap_core::{CaptureError, FormatDescription};
use windows::core::{GUID, PWSTR};
use windows::Win32::Foundation::BOOL;
use windows::Win32::Media::MediaFoundation::{
    IMFActivate, IMFAttributes, IMFMediaSource, IMFStreamDescriptor, MFCreateAttributes,
    MFEnumDeviceSources, MF_DEVSOURCE_ATTRIBUTE_FRIENDLY_NAME,
    MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE, MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE_VIDCAP_GUID,
    MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE_VIDCAP_SYMBOLIC_LINK,
};
use windows::Win32::System::Com::CoTaskMemFree;

use super::media;
use crate::status::{self, StatusClass};

/// One enumerated device and its activation object.
pub struct DeviceSource {
    pub id: String,
    pub name: String,
    pub activate: IMFActivate,
}

pub fn create_attributes(capacity: u32) -> Result<IMFAttributes> {
    let mut attributes = None;
    unsafe { MFCreateAttributes(&mut attributes, capacity) }.context("MFCreateAttributes")?;
    attributes.context("MFCreateAttributes returned no attribute store")
}

fn allocated_string(activate: &IMFActivate, key: &GUID) -> Result<String> {
    let mut value = PWSTR::null();
    let mut length = 0u32;
    unsafe { activate.GetAllocatedString(key, &mut value, &mut length) }?;
    if value.is_null() {
        return Ok(String::new());
    }
    let text = String::from_utf16_lossy(unsafe {
        std::slice::from_raw_parts(value.0, length as usize)
    });
    unsafe { CoTaskMemFree(Some(value.0 as *const c_void)) };
    Ok(text)
}

/// All video capture sources, in the order Media Foundation reports them.
pub fn enumerate() -> Result<Vec<DeviceSource>> {
    let attributes = create_attributes(1)?;
    unsafe {
        attributes.SetGUID(
            &MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE,
            &MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE_VIDCAP_GUID,
        )
    }
    .context("set MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE")?;

    let mut raw: *mut Option<IMFActivate> = std::ptr::null_mut();
    let mut count = 0u32;
    unsafe { MFEnumDeviceSources(&attributes, &mut raw, &mut count) }
        .context("MFEnumDeviceSources")?;

    // Take ownership of every slot before the array is freed.
    let mut activates = Vec::with_capacity(count as usize);
    if !raw.is_null() {
        let slots = unsafe { std::slice::from_raw_parts_mut(raw, count as usize) };
        activates.extend(slots.iter_mut().filter_map(Option::take));
        unsafe { CoTaskMemFree(Some(raw as *const c_void)) };
    }

    activates
        .into_iter()
        .map(|activate| {
            let name = allocated_string(&activate, &MF_DEVSOURCE_ATTRIBUTE_FRIENDLY_NAME)
                .context("friendly name")?;
            let id = allocated_string(
                &activate,
                &MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE_VIDCAP_SYMBOLIC_LINK,
            )
            .context("symbolic link")?;
            Ok(DeviceSource { id, name, activate })
        })
        .collect()
}

/// Fresh activation object for the device with symbolic link `id`.
pub fn find(id: &str) -> Result<DeviceSource> {
    enumerate()?
        .into_iter()
        .find(|source| source.id == id)
        .ok_or_else(|| CaptureError::DeviceNotFound { id: id.to_owned() }.into())
}

/// Every media type advertised by the device's first stream.
pub fn native_formats(id: &str) -> Result<Vec<FormatDescription>> {
    let source = find(id)?;
    let media_source: IMFMediaSource =
        unsafe { source.activate.ActivateObject() }.context("IMFActivate::ActivateObject")?;

    let result = first_stream_formats(&media_source);

    unsafe {
        let _ = media_source.Shutdown();
        let _ = source.activate.ShutdownObject();
    }
    result
}

fn first_stream_formats(media_source: &IMFMediaSource) -> Result<Vec<FormatDescription>> {
    let presentation = unsafe { media_source.CreatePresentationDescriptor() }
        .context("CreatePresentationDescriptor")?;
    let streams = unsafe { presentation.GetStreamDescriptorCount() }
        .context("GetStreamDescriptorCount")?;
    if streams == 0 {
        return Err(CaptureError::NoStreams.into());
    }

    let mut selected = BOOL::default();
    let mut stream: Option<IMFStreamDescriptor> = None;
    unsafe { presentation.GetStreamDescriptorByIndex(0, &mut selected, &mut stream) }
        .context("GetStreamDescriptorByIndex")?;
    let stream = stream.context("stream 0 has no descriptor")?;
    let handler = unsafe { stream.GetMediaTypeHandler() }.context("GetMediaTypeHandler")?;
    let count = unsafe { handler.GetMediaTypeCount() }.context("GetMediaTypeCount")?;

    let mut formats = Vec::with_capacity(count as usize);
    for index in 0..count {
        let media_type = match unsafe { handler.GetMediaTypeByIndex(index) } {
            Ok(media_type) => media_type,
            Err(e) if status::classify(e.code().0) == StatusClass::Exhausted => break,
            Err(e) => {
                tracing::debug!("Skipping media type {}: {}", index, e);
                continue;
            }
        };
        match media::describe(&media_type) {
            Ok(format) => formats.push(format),
            Err(e) => tracing::debug!("Skipping media type {}: {:#}", index, e),
        }
    }
    Ok(formats)
}
