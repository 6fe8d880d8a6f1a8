//! Capture Engine back end: push delivery through the preview sink.
//!
//! ```text
//! IMFCaptureEngineClassFactory::CreateInstance
//!   │  Initialize(event callback, D3D manager, USE_VIDEO_DEVICE_ONLY, IMFActivate)
//!   ▼  ... MF_CAPTURE_ENGINE_INITIALIZED ──▶ EngineEventSink
//! IMFCaptureSource::SetCurrentDeviceMediaType(stream, native type)
//!   │
//! IMFCapturePreviewSink::AddStream + SetSampleCallback
//!   │  StartPreview
//!   ▼
//! OnSample ──▶ SampleSink (work-queue thread)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use vidcap_core::{
    position_of, CaptureEngine, CaptureError, EngineEvent, EngineSinks, FormatDescription,
    PixelFormat, StreamSelection,
};
use windows::core::{implement, Interface, GUID};
use windows::Win32::Foundation::{E_UNEXPECTED, TRUE};
use windows::Win32::Graphics::Direct3D::{
    D3D_DRIVER_TYPE_HARDWARE, D3D_FEATURE_LEVEL, D3D_FEATURE_LEVEL_10_0, D3D_FEATURE_LEVEL_10_1,
    D3D_FEATURE_LEVEL_11_0, D3D_FEATURE_LEVEL_11_1, D3D_FEATURE_LEVEL_9_1, D3D_FEATURE_LEVEL_9_2,
    D3D_FEATURE_LEVEL_9_3,
};
use windows::Win32::Graphics::Direct3D10::ID3D10Multithread;
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D11Device, D3D11_CREATE_DEVICE_VIDEO_SUPPORT, D3D11_SDK_VERSION,
};
use windows::Win32::Media::MediaFoundation::{
    CLSID_MFCaptureEngine, CLSID_MFCaptureEngineClassFactory, IMFActivate, IMFCaptureEngine,
    IMFCaptureEngineClassFactory, IMFCaptureEngineOnEventCallback,
    IMFCaptureEngineOnEventCallback_Impl, IMFCaptureEngineOnSampleCallback,
    IMFCaptureEngineOnSampleCallback_Impl, IMFCapturePreviewSink, IMFCaptureSource,
    IMFDXGIDeviceManager, IMFMediaEvent, IMFMediaType, IMFSample, MFCreateDXGIDeviceManager,
    MFCreateMediaType, MFMediaType_Video, MF_CAPTURE_ENGINE_D3D_MANAGER,
    MF_CAPTURE_ENGINE_ERROR, MF_CAPTURE_ENGINE_INITIALIZED, MF_CAPTURE_ENGINE_PREVIEW_STARTED,
    MF_CAPTURE_ENGINE_PREVIEW_STOPPED, MF_CAPTURE_ENGINE_SINK_TYPE_PREVIEW,
    MF_CAPTURE_ENGINE_USE_VIDEO_DEVICE_ONLY, MF_MT_MAJOR_TYPE, MF_MT_SUBTYPE,
};
use windows::Win32::System::Com::{CoCreateInstance, CLSCTX_INPROC_SERVER};

use super::device::{create_attributes, DeviceSource};
use super::media::{self, Delivered};
use super::runtime::{self, Mta};
use super::seam_error;
use crate::status::{self, StatusClass};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Callback shim ──────────────────────────────────────────────────────────────

/// State shared between the engine and its COM callback.
#[derive(Default)]
struct CallbackLink {
    layout: Mutex<Option<Delivered>>,
    detached: AtomicBool,
}

/// Forwards Capture Engine callbacks to the session's sinks.
#[implement(IMFCaptureEngineOnEventCallback, IMFCaptureEngineOnSampleCallback)]
struct EngineCallback {
    sinks: EngineSinks,
    link: Arc<CallbackLink>,
}

impl IMFCaptureEngineOnEventCallback_Impl for EngineCallback_Impl {
    fn OnEvent(&self, pevent: Option<&IMFMediaEvent>) -> windows::core::Result<()> {
        let Some(event) = pevent else { return Ok(()) };
        if self.link.detached.load(Ordering::SeqCst) {
            return Ok(());
        }

        let hr = unsafe { event.GetStatus() }.unwrap_or(E_UNEXPECTED);
        let kind = unsafe { event.GetExtendedType() }.unwrap_or(GUID::zeroed());

        if kind == MF_CAPTURE_ENGINE_ERROR || hr.is_err() {
            // An error event always carries a failure code.
            let code = if hr.is_err() { hr.0 } else { E_UNEXPECTED.0 };
            let err = status::capture_error(event_name(&kind), code, "capture engine event");
            tracing::warn!("Capture engine error: {}", err);
            self.sinks.events.on_event(EngineEvent::Error(err));
        } else if kind == MF_CAPTURE_ENGINE_INITIALIZED {
            self.sinks.events.on_event(EngineEvent::Initialized);
        } else {
            tracing::debug!("Capture engine event {}", event_name(&kind));
        }
        Ok(())
    }
}

impl IMFCaptureEngineOnSampleCallback_Impl for EngineCallback_Impl {
    fn OnSample(&self, psample: Option<&IMFSample>) -> windows::core::Result<()> {
        let Some(sample) = psample else { return Ok(()) };
        if self.link.detached.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(layout) = *lock(&self.link.layout) else { return Ok(()) };
        if let Err(e) = media::deliver(sample, &layout, self.sinks.samples.as_ref()) {
            tracing::warn!("Dropping preview sample: {:#}", e);
        }
        Ok(())
    }
}

fn event_name(kind: &GUID) -> &'static str {
    match *kind {
        k if k == MF_CAPTURE_ENGINE_INITIALIZED => "initialize",
        k if k == MF_CAPTURE_ENGINE_PREVIEW_STARTED => "preview started",
        k if k == MF_CAPTURE_ENGINE_PREVIEW_STOPPED => "preview stopped",
        k if k == MF_CAPTURE_ENGINE_ERROR => "engine error",
        _ => "engine event",
    }
}

// ── D3D11 device manager ───────────────────────────────────────────────────────

struct D3dManager {
    manager: IMFDXGIDeviceManager,
    _device: ID3D11Device,
}

impl D3dManager {
    fn create() -> Result<Self> {
        const LEVELS: [D3D_FEATURE_LEVEL; 7] = [
            D3D_FEATURE_LEVEL_11_1,
            D3D_FEATURE_LEVEL_11_0,
            D3D_FEATURE_LEVEL_10_1,
            D3D_FEATURE_LEVEL_10_0,
            D3D_FEATURE_LEVEL_9_3,
            D3D_FEATURE_LEVEL_9_2,
            D3D_FEATURE_LEVEL_9_1,
        ];

        let mut device: Option<ID3D11Device> = None;
        unsafe {
            D3D11CreateDevice(
                None,
                D3D_DRIVER_TYPE_HARDWARE,
                None,
                D3D11_CREATE_DEVICE_VIDEO_SUPPORT,
                Some(&LEVELS),
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                None,
            )
        }
        .context("D3D11CreateDevice")?;
        let device = device.context("D3D11CreateDevice returned no device")?;

        let multithread: ID3D10Multithread = device.cast().context("cast ID3D10Multithread")?;
        unsafe {
            let _ = multithread.SetMultithreadProtected(TRUE);
        }

        let mut reset_token = 0u32;
        let mut manager: Option<IMFDXGIDeviceManager> = None;
        unsafe { MFCreateDXGIDeviceManager(&mut reset_token, &mut manager) }
            .context("MFCreateDXGIDeviceManager")?;
        let manager = manager.context("MFCreateDXGIDeviceManager returned no manager")?;
        unsafe { manager.ResetDevice(&device, reset_token) }.context("ResetDevice")?;

        Ok(Self { manager, _device: device })
    }
}

// ── MfCaptureEngine ────────────────────────────────────────────────────────────

pub struct MfCaptureEngine {
    device_id: String,
    engine: Option<Mta<IMFCaptureEngine>>,
    activate: Option<Mta<IMFActivate>>,
    _d3d: Option<Mta<D3dManager>>,
    sample_callback: Mta<IMFCaptureEngineOnSampleCallback>,
    link: Arc<CallbackLink>,
    previewing: bool,
}

impl MfCaptureEngine {
    /// Create the engine and start its asynchronous initialization.
    pub fn open(source: DeviceSource, sinks: EngineSinks) -> Result<Self> {
        let factory: IMFCaptureEngineClassFactory = unsafe {
            CoCreateInstance(&CLSID_MFCaptureEngineClassFactory, None, CLSCTX_INPROC_SERVER)
        }
        .context("CoCreateInstance(MFCaptureEngineClassFactory)")?;
        let engine: IMFCaptureEngine = unsafe { factory.CreateInstance(&CLSID_MFCaptureEngine) }
            .context("IMFCaptureEngineClassFactory::CreateInstance")?;

        let d3d = D3dManager::create()?;
        let attributes = create_attributes(2)?;
        unsafe {
            attributes.SetUINT32(&MF_CAPTURE_ENGINE_USE_VIDEO_DEVICE_ONLY, 1)?;
            attributes.SetUnknown(&MF_CAPTURE_ENGINE_D3D_MANAGER, &d3d.manager)?;
        }

        let link = Arc::new(CallbackLink::default());
        let event_callback: IMFCaptureEngineOnEventCallback =
            EngineCallback { sinks, link: link.clone() }.into();
        let sample_callback: IMFCaptureEngineOnSampleCallback =
            event_callback.cast().context("cast IMFCaptureEngineOnSampleCallback")?;

        unsafe { engine.Initialize(&event_callback, &attributes, None, &source.activate) }
            .context("IMFCaptureEngine::Initialize")?;
        tracing::info!("Capture engine initializing for {}", source.name);

        Ok(Self {
            device_id: source.id,
            engine: Some(Mta(engine)),
            activate: Some(Mta(source.activate)),
            _d3d: Some(Mta(d3d)),
            sample_callback: Mta(sample_callback),
            link,
            previewing: false,
        })
    }

    fn engine(&self) -> Result<&IMFCaptureEngine> {
        self.engine.as_deref().context("capture engine already shut down")
    }

    fn capture_source(&self) -> Result<IMFCaptureSource> {
        unsafe { self.engine()?.GetSource() }.context("IMFCaptureEngine::GetSource")
    }

    fn available_type(
        source: &IMFCaptureSource,
        stream: u32,
        index: u32,
    ) -> windows::core::Result<IMFMediaType> {
        let mut media_type = None;
        unsafe { source.GetAvailableDeviceMediaType(stream, index, Some(&mut media_type)) }?;
        media_type.ok_or_else(|| windows::core::Error::from(E_UNEXPECTED))
    }

    fn find_selection(&self, format: &FormatDescription) -> Result<Option<StreamSelection>> {
        let source = self.capture_source()?;
        let streams = unsafe { source.GetDeviceStreamCount() }.context("GetDeviceStreamCount")?;
        if streams == 0 {
            return Err(CaptureError::NoStreams.into());
        }

        for stream in 0..streams {
            let mut advertised = Vec::new();
            loop {
                let index = advertised.len() as u32;
                let media_type = match Self::available_type(&source, stream, index) {
                    Ok(media_type) => media_type,
                    Err(e) if status::classify(e.code().0) == StatusClass::Exhausted => break,
                    Err(e) => return Err(e).context("GetAvailableDeviceMediaType"),
                };
                // Unreadable types keep their slot so indices stay aligned.
                advertised.push(
                    media::describe(&media_type)
                        .unwrap_or(FormatDescription::new(0, 0, 0, PixelFormat::Unknown)),
                );
            }
            if let Some(index) = position_of(format, &advertised) {
                return Ok(Some(StreamSelection {
                    stream_index: stream,
                    media_type_index: index as u32,
                }));
            }
        }
        Ok(None)
    }

    fn attach_preview(&self, selection: &StreamSelection, target: PixelFormat) -> Result<()> {
        let source = self.capture_source()?;
        let native =
            Self::available_type(&source, selection.stream_index, selection.media_type_index)
                .context("GetAvailableDeviceMediaType")?;
        unsafe { source.SetCurrentDeviceMediaType(selection.stream_index, &native) }
            .context("SetCurrentDeviceMediaType")?;

        let sink = unsafe { self.engine()?.GetSink(MF_CAPTURE_ENGINE_SINK_TYPE_PREVIEW) }
            .context("GetSink(preview)")?;
        let preview: IMFCapturePreviewSink = sink.cast().context("cast IMFCapturePreviewSink")?;
        unsafe { preview.RemoveAllStreams() }.context("RemoveAllStreams")?;

        let sink_type = unsafe { MFCreateMediaType() }.context("MFCreateMediaType")?;
        unsafe {
            sink_type.SetGUID(&MF_MT_MAJOR_TYPE, &MFMediaType_Video)?;
            sink_type.SetGUID(&MF_MT_SUBTYPE, &media::subtype_guid(target))?;
        }
        media::copy_video_attributes(&native, &sink_type)?;

        let mut sink_stream = 0u32;
        unsafe {
            preview.AddStream(selection.stream_index, &sink_type, None, Some(&mut sink_stream))
        }
            .context("IMFCapturePreviewSink::AddStream")?;
        unsafe { preview.SetSampleCallback(sink_stream, &*self.sample_callback) }
            .context("SetSampleCallback")?;

        let delivered = FormatDescription { pixel_format: target, ..media::describe(&native)? };
        *lock(&self.link.layout) = Some(Delivered::new(delivered, Some(&sink_type)));
        tracing::debug!("Preview sink configured for {}", delivered);
        Ok(())
    }
}

impl CaptureEngine for MfCaptureEngine {
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
        self.attach_preview(selection, target).map_err(|e| seam_error("configure preview sink", e))
    }

    fn arm(&mut self) -> Result<(), CaptureError> {
        runtime::ensure_com();
        let engine = self.engine().map_err(|e| seam_error("StartPreview", e))?;
        unsafe { engine.StartPreview() }
            .context("IMFCaptureEngine::StartPreview")
            .map_err(|e| seam_error("StartPreview", e))?;
        self.previewing = true;
        Ok(())
    }

    fn shutdown(&mut self) {
        runtime::ensure_com();
        self.link.detached.store(true, Ordering::SeqCst);
        if let Some(engine) = self.engine.take() {
            if self.previewing {
                if let Err(e) = unsafe { engine.StopPreview() } {
                    tracing::debug!("StopPreview: {}", e);
                }
            }
            tracing::debug!("Capture engine released for {}", self.device_id);
        }
        self.previewing = false;
        if let Some(activate) = self.activate.take() {
            if let Err(e) = unsafe { activate.ShutdownObject() } {
                tracing::debug!("IMFActivate::ShutdownObject: {}", e);
            }
        }
        self._d3d = None;
    }
}

impl Drop for MfCaptureEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
