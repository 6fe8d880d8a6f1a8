//! In-process capture subsystem.
//!
//! Stands in for the OS capture stack in tests and in `vidcap --simulate`.
//! Engines run on their own threads and call back into the session exactly
//! like the native back ends: push mode emits on a timer, pull mode emits one
//! sample per outstanding read request and re-arms from the completion.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::errors::CaptureError;
use crate::matcher::position_of;
use crate::platform::{
    CaptureEngine, CapturePlatform, DeviceRecord, EngineEvent, EngineSinks, InitOnce,
    StreamSelection,
};
use crate::types::{BackendKind, Delivery, FormatDescription, Frame, PixelFormat};

const POLL: Duration = Duration::from_millis(20);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// MARK: - Scripting

/// How a simulated engine answers its asynchronous initialization.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InitBehavior {
    /// `Initialized` is raised before `open_engine` returns.
    #[default]
    Respond,
    /// `Initialized` is raised from another thread after the delay.
    Delayed(Duration),
    /// No event is ever raised.
    Silent,
    /// An `Error` event is raised with this reason.
    Fail(String),
}

/// One scripted device.
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub id: String,
    pub name: String,
    pub formats: Vec<FormatDescription>,
    pub has_streams: bool,
    /// Initialization attempts that report the device as busy before one succeeds.
    pub busy_attempts: u32,
    pub init: InitBehavior,
    /// Raise a stream error after this many frames.
    pub fail_after_frames: Option<u64>,
}

impl SimDevice {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            formats: Vec::new(),
            has_streams: true,
            busy_attempts: 0,
            init: InitBehavior::Respond,
            fail_after_frames: None,
        }
    }

    pub fn with_formats(mut self, formats: Vec<FormatDescription>) -> Self {
        self.formats = formats;
        self
    }

    pub fn without_streams(mut self) -> Self {
        self.has_streams = false;
        self
    }

    pub fn busy_for(mut self, attempts: u32) -> Self {
        self.busy_attempts = attempts;
        self
    }

    pub fn with_init(mut self, init: InitBehavior) -> Self {
        self.init = init;
        self
    }

    pub fn fail_after_frames(mut self, frames: u64) -> Self {
        self.fail_after_frames = Some(frames);
        self
    }
}

// MARK: - SimulatedPlatform

pub struct SimulatedPlatform {
    devices: Mutex<Vec<SimDevice>>,
    unavailable: Option<String>,
    frame_interval: Option<Duration>,
    startup: InitOnce,
    startups: AtomicU32,
    opens: AtomicU32,
    reads: Arc<AtomicU64>,
    engines: Mutex<Vec<(String, Weak<EngineCore>)>>,
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPlatform {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
            unavailable: None,
            frame_interval: None,
            startup: InitOnce::new(),
            startups: AtomicU32::new(0),
            opens: AtomicU32::new(0),
            reads: Arc::new(AtomicU64::new(0)),
            engines: Mutex::new(Vec::new()),
        }
    }

    /// A platform whose startup fails.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self { unavailable: Some(reason.into()), ..Self::new() }
    }

    /// Two webcams with typical format lists.
    pub fn demo() -> Self {
        Self::new()
            .with_device(SimDevice::new("sim://integrated", "Integrated Camera").with_formats(vec![
                FormatDescription::new(640, 480, 30, PixelFormat::Nv12),
                FormatDescription::new(1280, 720, 15, PixelFormat::Mjpeg),
                FormatDescription::new(1280, 720, 30, PixelFormat::Mjpeg),
                FormatDescription::new(1920, 1080, 30, PixelFormat::Mjpeg),
                FormatDescription::new(640, 480, 30, PixelFormat::Yuy2),
            ]))
            .with_device(SimDevice::new("sim://usb-hd", "USB HD Webcam").with_formats(vec![
                FormatDescription::new(320, 240, 15, PixelFormat::Nv12),
                FormatDescription::new(640, 480, 25, PixelFormat::Nv12),
                FormatDescription::new(800, 600, 20, PixelFormat::Mjpeg),
            ]))
    }

    pub fn with_device(self, device: SimDevice) -> Self {
        lock(&self.devices).push(device);
        self
    }

    /// Override the per-format frame interval.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = Some(interval);
        self
    }

    pub fn add_device(&self, device: SimDevice) {
        lock(&self.devices).push(device);
    }

    pub fn remove_device(&self, id: &str) {
        lock(&self.devices).retain(|d| d.id != id);
    }

    /// Times the process-wide startup actually ran.
    pub fn startup_count(&self) -> u32 {
        self.startups.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Read requests issued by pull-mode engines.
    pub fn read_requests(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Raise a fatal stream error on every live engine of `device_id`.
    pub fn inject_stream_error(&self, device_id: &str, reason: &str) -> bool {
        let cores: Vec<Arc<EngineCore>> = lock(&self.engines)
            .iter()
            .filter(|(id, _)| id == device_id)
            .filter_map(|(_, core)| core.upgrade())
            .collect();
        for core in &cores {
            core.sinks.events.on_event(EngineEvent::StreamError { reason: reason.to_owned() });
        }
        !cores.is_empty()
    }

    fn device(&self, id: &str) -> Result<SimDevice, CaptureError> {
        lock(&self.devices)
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| CaptureError::DeviceNotFound { id: id.to_owned() })
    }

    /// Consume one busy attempt, if any remain.
    fn take_busy(&self, id: &str) -> bool {
        let mut devices = lock(&self.devices);
        match devices.iter_mut().find(|d| d.id == id) {
            Some(device) if device.busy_attempts > 0 => {
                device.busy_attempts -= 1;
                true
            }
            _ => false,
        }
    }
}

impl CapturePlatform for SimulatedPlatform {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn initialize(&self) -> Result<(), CaptureError> {
        self.startup.get_or_init(|| {
            self.startups.fetch_add(1, Ordering::SeqCst);
            match &self.unavailable {
                Some(reason) => Err(CaptureError::SubsystemUnavailable { reason: reason.clone() }),
                None => {
                    info!("Simulated capture subsystem started");
                    Ok(())
                }
            }
        })
    }

    fn enumerate(&self) -> Result<Vec<DeviceRecord>, CaptureError> {
        self.initialize()?;
        Ok(lock(&self.devices)
            .iter()
            .map(|d| DeviceRecord { id: d.id.clone(), name: d.name.clone() })
            .collect())
    }

    fn native_formats(&self, device_id: &str) -> Result<Vec<FormatDescription>, CaptureError> {
        let device = self.device(device_id)?;
        if !device.has_streams {
            return Err(CaptureError::NoStreams);
        }
        Ok(device.formats)
    }

    fn open_engine(
        &self,
        device_id: &str,
        backend: BackendKind,
        sinks: EngineSinks,
    ) -> Result<Box<dyn CaptureEngine>, CaptureError> {
        self.initialize()?;
        let device = self.device(device_id)?;
        self.opens.fetch_add(1, Ordering::SeqCst);

        let core = Arc::new(EngineCore {
            sinks,
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        {
            let mut engines = lock(&self.engines);
            engines.retain(|(_, c)| c.strong_count() > 0);
            engines.push((device.id.clone(), Arc::downgrade(&core)));
        }

        if self.take_busy(device_id) {
            debug!(device = device_id, "Simulated device busy");
            core.sinks.events.on_event(EngineEvent::Error(CaptureError::busy(
                "device is in use by another application",
            )));
        } else {
            match &device.init {
                InitBehavior::Respond => core.sinks.events.on_event(EngineEvent::Initialized),
                InitBehavior::Delayed(delay) => {
                    let core = core.clone();
                    let delay = *delay;
                    thread::spawn(move || {
                        thread::sleep(delay);
                        if !core.closed.load(Ordering::SeqCst) {
                            core.sinks.events.on_event(EngineEvent::Initialized);
                        }
                    });
                }
                InitBehavior::Silent => debug!(device = device_id, "Simulated engine stays silent"),
                InitBehavior::Fail(reason) => core.sinks.events.on_event(EngineEvent::Error(
                    CaptureError::backend("initialize", reason),
                )),
            }
        }

        Ok(Box::new(SimEngine {
            core,
            device,
            backend,
            interval: self.frame_interval,
            reads: self.reads.clone(),
            configured: None,
            requests: None,
        }))
    }
}

// MARK: - SimEngine

struct EngineCore {
    sinks: EngineSinks,
    running: AtomicBool,
    /// Set on shutdown; late events from helper threads are dropped.
    closed: AtomicBool,
}

impl EngineCore {
    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

struct SimEngine {
    core: Arc<EngineCore>,
    device: SimDevice,
    backend: BackendKind,
    interval: Option<Duration>,
    reads: Arc<AtomicU64>,
    configured: Option<FormatDescription>,
    requests: Option<mpsc::Sender<()>>,
}

impl CaptureEngine for SimEngine {
    fn resolve(
        &mut self,
        format: &FormatDescription,
    ) -> Result<Option<StreamSelection>, CaptureError> {
        if !self.device.has_streams {
            return Err(CaptureError::NoStreams);
        }
        Ok(position_of(format, &self.device.formats)
            .map(|i| StreamSelection { stream_index: 0, media_type_index: i as u32 }))
    }

    fn configure(
        &mut self,
        selection: &StreamSelection,
        target: PixelFormat,
    ) -> Result<(), CaptureError> {
        let native = self
            .device
            .formats
            .get(selection.media_type_index as usize)
            .ok_or_else(|| CaptureError::backend("configure", "media type index out of range"))?;
        self.configured = Some(FormatDescription { pixel_format: target, ..*native });
        Ok(())
    }

    fn arm(&mut self) -> Result<(), CaptureError> {
        let format = self
            .configured
            .ok_or_else(|| CaptureError::backend("arm", "engine is not configured"))?;
        if self.core.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let interval = self
            .interval
            .unwrap_or_else(|| Duration::from_micros(format.frame_interval_us().max(1)));
        let worker = Worker {
            core: self.core.clone(),
            format,
            interval,
            fail_after: self.device.fail_after_frames,
        };

        match self.backend.delivery() {
            Delivery::Push => {
                thread::spawn(move || worker.push());
            }
            Delivery::Pull => {
                let (tx, rx) = mpsc::channel();
                let rearm = tx.clone();
                let reads = self.reads.clone();
                thread::spawn(move || worker.pull(rx, rearm, reads));
                self.reads.fetch_add(1, Ordering::SeqCst);
                tx.send(())
                    .map_err(|_| CaptureError::backend("ReadSample", "reader thread exited"))?;
                self.requests = Some(tx);
            }
        }
        debug!(
            device = %self.device.id,
            backend = %self.backend,
            %format,
            "Simulated delivery armed"
        );
        Ok(())
    }

    fn shutdown(&mut self) {
        self.core.closed.store(true, Ordering::SeqCst);
        if self.core.running.swap(false, Ordering::SeqCst) {
            debug!(device = %self.device.id, "Simulated engine shut down");
        }
        self.requests = None;
    }
}

impl Drop for SimEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// MARK: - Worker

struct Worker {
    core: Arc<EngineCore>,
    format: FormatDescription,
    interval: Duration,
    fail_after: Option<u64>,
}

impl Worker {
    fn push(self) {
        let payload = payload(&self.format);
        let mut sequence = 0u64;
        while self.core.running() {
            thread::sleep(self.interval);
            if !self.core.running() || !self.emit(&payload, sequence) {
                break;
            }
            sequence += 1;
        }
    }

    fn pull(self, requests: mpsc::Receiver<()>, rearm: mpsc::Sender<()>, reads: Arc<AtomicU64>) {
        let payload = payload(&self.format);
        let mut sequence = 0u64;
        loop {
            match requests.recv_timeout(POLL) {
                Ok(()) => {}
                Err(RecvTimeoutError::Timeout) if self.core.running() => continue,
                Err(_) => break,
            }
            if !self.core.running() {
                break;
            }
            thread::sleep(self.interval);
            if !self.core.running() || !self.emit(&payload, sequence) {
                break;
            }
            sequence += 1;

            if self.core.running() {
                reads.fetch_add(1, Ordering::SeqCst);
                if rearm.send(()).is_err() {
                    break;
                }
            }
        }
    }

    /// Deliver one sample. Returns false once the scripted failure fires.
    fn emit(&self, payload: &[u8], sequence: u64) -> bool {
        if self.fail_after.is_some_and(|limit| sequence >= limit) {
            warn!(frames = sequence, "Simulated device lost");
            self.core.sinks.events.on_event(EngineEvent::StreamError {
                reason: "simulated device removed".into(),
            });
            return false;
        }

        let f = &self.format;
        let stride = f.pixel_format.min_stride(f.width).unwrap_or(0);
        let timestamp_us = sequence * f.frame_interval_us();
        let format = f.pixel_format;
        match Frame::from_contiguous(payload, stride, f.width, f.height, format, timestamp_us) {
            Some(frame) => self.core.sinks.samples.on_sample(&frame),
            None => warn!(format = %f, "Simulated payload does not fit format"),
        }
        true
    }
}

fn payload(format: &FormatDescription) -> Vec<u8> {
    match format.pixel_format.frame_size(format.width, format.height) {
        Some(size) => vec![0x80; size],
        None => {
            let mut jpeg = vec![0u8; 4096];
            jpeg[..2].copy_from_slice(&[0xFF, 0xD8]);
            let end = jpeg.len() - 2;
            jpeg[end..].copy_from_slice(&[0xFF, 0xD9]);
            jpeg
        }
    }
}
