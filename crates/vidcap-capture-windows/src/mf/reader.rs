//! Source Reader back end: pull delivery.
//!
//! The reader runs in asynchronous mode. `arm` issues the first
//! `ReadSample`; every `OnReadSample` completion delivers at most one frame
//! and issues the next request while the engine is running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use vidcap_core::{
    position_of, CaptureEngine, CaptureError, EngineEvent, EngineSinks, FormatDescription,
    PixelFormat, StreamSelection,
};
use windows::core::{implement, HRESULT};
use windows::Win32::Media::MediaFoundation::{
    IMFActivate, IMFMediaEvent, IMFMediaSource, IMFSample, IMFSourceReader,
    IMFSourceReaderCallback, IMFSourceReaderCallback_Impl, MFCreateSourceReaderFromMediaSource,
    MF_READWRITE_DISABLE_CONVERTERS, MF_SOURCE_READERF_ENDOFSTREAM, MF_SOURCE_READERF_ERROR,
    MF_SOURCE_READER_ASYNC_CALLBACK, MF_SOURCE_READER_FIRST_VIDEO_STREAM,
};

use super::device::{create_attributes, DeviceSource};
use super::media::{self, Delivered};
use super::runtime::{self, Mta};
use super::seam_error;
use crate::status::{self, StatusClass};

const FIRST_VIDEO_STREAM: u32 = MF_SOURCE_READER_FIRST_VIDEO_STREAM.0 as u32;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Callback shim ──────────────────────────────────────────────────────────────

struct ReaderLink {
    sinks: EngineSinks,
    reader: Mutex<Option<Mta<IMFSourceReader>>>,
    layout: Mutex<Option<Delivered>>,
    running: AtomicBool,
}

impl ReaderLink {
    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn request_next(&self) -> windows::core::Result<()> {
        let reader = lock(&self.reader).as_ref().map(|r| r.0.clone());
        match reader {
            Some(reader) => unsafe {
                reader.ReadSample(FIRST_VIDEO_STREAM, 0, None, None, None, None)
            },
            None => Ok(()),
        }
    }

    fn fail(&self, reason: String) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::warn!("Source reader stopped: {}", reason);
            self.sinks.events.on_event(EngineEvent::StreamError { reason });
        }
    }
}

#[implement(IMFSourceReaderCallback)]
struct ReaderCallback {
    link: Arc<ReaderLink>,
}

impl IMFSourceReaderCallback_Impl for ReaderCallback_Impl {
    fn OnReadSample(
        &self,
        hrstatus: HRESULT,
        _dwstreamindex: u32,
        dwstreamflags: u32,
        _lltimestamp: i64,
        psample: Option<&IMFSample>,
    ) -> windows::core::Result<()> {
        let link = &self.link;
        if !link.running() {
            return Ok(());
        }
        if hrstatus.is_err() {
            link.fail(status::capture_error("ReadSample", hrstatus.0, "").to_string());
            return Ok(());
        }
        if dwstreamflags & MF_SOURCE_READERF_ERROR.0 as u32 != 0 {
            link.fail("source reader reported a stream error".into());
            return Ok(());
        }
        if dwstreamflags & MF_SOURCE_READERF_ENDOFSTREAM.0 as u32 != 0 {
            link.fail("end of stream".into());
            return Ok(());
        }

        // Stream ticks complete without a sample; only the re-arm matters.
        if let Some(sample) = psample {
            let layout = *lock(&link.layout);
            if let Some(layout) = layout {
                if let Err(e) = media::deliver(sample, &layout, link.sinks.samples.as_ref()) {
                    tracing::warn!("Dropping reader sample: {:#}", e);
                }
            }
        }

        if link.running() {
            if let Err(e) = link.request_next() {
                let err = status::capture_error("ReadSample", e.code().0, &e.message().to_string());
                link.fail(err.to_string());
            }
        }
        Ok(())
    }

    fn OnFlush(&self, _dwstreamindex: u32) -> windows::core::Result<()> {
        Ok(())
    }

    fn OnEvent(
        &self,
        _dwstreamindex: u32,
        _pevent: Option<&IMFMediaEvent>,
    ) -> windows::core::Result<()> {
        Ok(())
    }
}

// ── MfReader ───────────────────────────────────────────────────────────────────

pub struct MfReader {
    device_id: String,
    link: Arc<ReaderLink>,
    activate: Option<Mta<IMFActivate>>,
    _callback: Mta<IMFSourceReaderCallback>,
}

impl MfReader {
    /// Activate the device and create an asynchronous reader over it.
    ///
    /// Reader creation is synchronous, so `Initialized` is raised before
    /// this returns.
    pub fn open(source: DeviceSource, sinks: EngineSinks) -> Result<Self> {
        let media_source: IMFMediaSource =
            unsafe { source.activate.ActivateObject() }.context("IMFActivate::ActivateObject")?;

        let link = Arc::new(ReaderLink {
            sinks: sinks.clone(),
            reader: Mutex::new(None),
            layout: Mutex::new(None),
            running: AtomicBool::new(false),
        });
        let callback: IMFSourceReaderCallback = ReaderCallback { link: link.clone() }.into();

        let created = create_attributes(2).and_then(|attributes| {
            unsafe {
                attributes.SetUINT32(&MF_READWRITE_DISABLE_CONVERTERS, 1)?;
                attributes.SetUnknown(&MF_SOURCE_READER_ASYNC_CALLBACK, &callback)?;
            }
            unsafe { MFCreateSourceReaderFromMediaSource(&media_source, &attributes) }
                .context("MFCreateSourceReaderFromMediaSource")
        });
        let reader = match created {
            Ok(reader) => reader,
            Err(e) => {
                unsafe {
                    let _ = source.activate.ShutdownObject();
                }
                return Err(e);
            }
        };

        *lock(&link.reader) = Some(Mta(reader));
        tracing::info!("Source reader created for {}", source.name);
        sinks.events.on_event(EngineEvent::Initialized);

        Ok(Self {
            device_id: source.id,
            link,
            activate: Some(Mta(source.activate)),
            _callback: Mta(callback),
        })
    }

    fn reader(&self) -> Result<IMFSourceReader> {
        lock(&self.link.reader)
            .as_ref()
            .map(|r| r.0.clone())
            .context("source reader already shut down")
    }

    fn find_selection(&self, format: &FormatDescription) -> Result<Option<StreamSelection>> {
        let reader = self.reader()?;
        let mut advertised = Vec::new();
        loop {
            let index = advertised.len() as u32;
            let media_type = match unsafe { reader.GetNativeMediaType(FIRST_VIDEO_STREAM, index) } {
                Ok(media_type) => media_type,
                Err(e) if status::classify(e.code().0) == StatusClass::Exhausted => break,
                Err(e) => return Err(e).context("IMFSourceReader::GetNativeMediaType"),
            };
            advertised.push(
                media::describe(&media_type)
                    .unwrap_or(FormatDescription::new(0, 0, 0, PixelFormat::Unknown)),
            );
        }
        if advertised.is_empty() {
            return Err(CaptureError::NoStreams.into());
        }
        Ok(position_of(format, &advertised).map(|index| StreamSelection {
            stream_index: FIRST_VIDEO_STREAM,
            media_type_index: index as u32,
        }))
    }

    fn set_media_type(&self, selection: &StreamSelection, target: PixelFormat) -> Result<()> {
        let reader = self.reader()?;
        let native = unsafe {
            reader.GetNativeMediaType(selection.stream_index, selection.media_type_index)
        }
        .context("IMFSourceReader::GetNativeMediaType")?;

        let wanted = FormatDescription { pixel_format: target, ..media::describe(&native)? };
        media::retarget(&native, &wanted)?;
        unsafe { reader.SetCurrentMediaType(selection.stream_index, None, &native) }
            .context("IMFSourceReader::SetCurrentMediaType")?;

        let current = unsafe { reader.GetCurrentMediaType(selection.stream_index) }.ok();
        *lock(&self.link.layout) = Some(Delivered::new(wanted, current.as_ref()));
        tracing::debug!("Source reader configured for {}", wanted);
        Ok(())
    }
}

impl CaptureEngine for MfReader {
    fn resolve(
        &mut self,
        format: &FormatDescription,
    ) -> Result<Option<StreamSelection>, CaptureError> {
        runtime::ensure_com();
        self.find_selection(format).map_err(|e| seam_error("resolve media type", e))
    }

    fn configure(
        &mut self,
        selection: &StreamSelection,
        target: PixelFormat,
    ) -> Result<(), CaptureError> {
        runtime::ensure_com();
        self.set_media_type(selection, target).map_err(|e| seam_error("configure source reader", e))
    }

    fn arm(&mut self) -> Result<(), CaptureError> {
        runtime::ensure_com();
        self.link.running.store(true, Ordering::SeqCst);
        if let Err(e) = self.link.request_next() {
            self.link.running.store(false, Ordering::SeqCst);
            return Err(status::capture_error("ReadSample", e.code().0, &e.message().to_string()));
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        runtime::ensure_com();
        self.link.running.store(false, Ordering::SeqCst);
        if lock(&self.link.reader).take().is_some() {
            tracing::debug!("Source reader released for {}", self.device_id);
        }
        if let Some(activate) = self.activate.take() {
            if let Err(e) = unsafe { activate.ShutdownObject() } {
                tracing::debug!("IMFActivate::ShutdownObject: {}", e);
            }
        }
    }
}

impl Drop for MfReader {
    fn drop(&mut self) {
        self.shutdown();
    }
}
