use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::dispatch::EventDispatcher;
use crate::errors::CaptureError;
use crate::manager::DeviceManager;
use crate::platform::{CaptureEngine, CapturePlatform, EngineEvent};
use crate::types::{Device, FormatDescription, Frame, SessionState};

/// An initialized engine and the device it was opened for.
struct BoundEngine {
    device_id: String,
    engine: Box<dyn CaptureEngine>,
}

/// Streams frames from one device in one format.
///
/// ```text
/// Idle ─start─▶ Initializing ─▶ Ready ─▶ Started ─stream error─▶ Stopped
///   ▲                                       │                       │
///   └──────────────────stop─────────────────┴───────────────────────┘
/// ```
///
/// The engine is initialized lazily by the first `start` and kept for a retry
/// on the same device. [`CaptureSession::stop`] releases it; dropping the
/// session stops it.
pub struct CaptureSession {
    platform: Arc<dyn CapturePlatform>,
    config: SessionConfig,
    dispatcher: EventDispatcher,
    engine: Option<BoundEngine>,
    lifecycle: Option<mpsc::UnboundedReceiver<EngineEvent>>,
    active_format: Option<FormatDescription>,
}

impl CaptureSession {
    pub fn new(platform: Arc<dyn CapturePlatform>, config: SessionConfig) -> Self {
        Self {
            platform,
            config,
            dispatcher: EventDispatcher::new(),
            engine: None,
            lifecycle: None,
            active_format: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.dispatcher.state()
    }

    /// Frames handed to the frame callback since the last successful start.
    pub fn frames_delivered(&self) -> u64 {
        self.dispatcher.frames_delivered()
    }

    /// Format being streamed, while started.
    pub fn active_format(&self) -> Option<FormatDescription> {
        match self.state() {
            SessionState::Started => self.active_format,
            _ => None,
        }
    }

    /// Called once per sample on the subsystem's delivery thread. The frame's
    /// buffers are only valid for the duration of the call.
    pub fn register_frame_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&Frame<'_>) + Send + 'static,
    {
        self.dispatcher.set_frame_callback(Box::new(callback));
    }

    /// Called with [`CaptureError::RuntimeStreamError`] when a started
    /// session fails.
    pub fn register_error_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&CaptureError) + Send + 'static,
    {
        self.dispatcher.set_error_callback(Box::new(callback));
    }

    // MARK: - Start

    /// Start streaming `format` from `device`.
    ///
    /// Only valid from [`SessionState::Idle`]. `DeviceBusyOrUnavailable` is
    /// retried with doubling backoff up to `start_retries` times; any other
    /// failure is returned immediately and leaves the session idle.
    pub async fn start(
        &mut self,
        devices: &DeviceManager,
        device: &Device,
        format: &FormatDescription,
    ) -> Result<(), CaptureError> {
        let state = self.state();
        if state != SessionState::Idle {
            return Err(CaptureError::InvalidState { state });
        }
        let device = devices.validate(device)?;

        let mut attempt = 0;
        loop {
            match self.try_start(device, format).await {
                Ok(()) => {
                    info!(
                        device = %device,
                        %format,
                        backend = %self.config.backend,
                        "Capture started"
                    );
                    return Ok(());
                }
                Err(err) if err.is_retryable() && attempt < self.config.start_retries => {
                    attempt += 1;
                    let delay = self.config.backoff_for(attempt);
                    warn!(
                        device = %device,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Device busy, retrying: {err}"
                    );
                    time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(device = %device, %format, "Capture start failed: {err}");
                    return Err(err);
                }
            }
        }
    }

    async fn try_start(
        &mut self,
        device: &Device,
        format: &FormatDescription,
    ) -> Result<(), CaptureError> {
        if self.engine.as_ref().is_some_and(|bound| bound.device_id != device.id) {
            debug!(device = %device, "Switching device; releasing previous engine");
            self.release_engine();
        }
        if let Some(err) = self.pending_error() {
            debug!("Releasing engine after error raised while idle: {err}");
            self.release_engine();
        }

        if self.engine.is_none() {
            self.dispatcher.set_state(SessionState::Initializing);
            match self.initialize_engine(device).await {
                Ok(bound) => self.engine = Some(bound),
                Err(err) => {
                    self.dispatcher.set_state(SessionState::Idle);
                    return Err(err);
                }
            }
        }
        self.dispatcher.set_state(SessionState::Ready);

        match self.configure_and_arm(format) {
            Ok(()) => Ok(()),
            Err(err) => {
                if err.is_retryable() {
                    self.release_engine();
                }
                self.dispatcher.set_state(SessionState::Idle);
                Err(err)
            }
        }
    }

    async fn initialize_engine(&mut self, device: &Device) -> Result<BoundEngine, CaptureError> {
        let rx = self.lifecycle.insert(self.dispatcher.listen());
        let mut engine =
            self.platform.open_engine(&device.id, self.config.backend, self.dispatcher.sinks())?;

        let timeout = self.config.init_timeout();
        let outcome = match time::timeout(timeout, wait_initialized(rx)).await {
            Ok(result) => result,
            Err(_) => Err(CaptureError::InitializationTimeout { timeout }),
        };

        match outcome {
            Ok(()) => {
                debug!(device = %device, "Engine initialized");
                Ok(BoundEngine { device_id: device.id.clone(), engine })
            }
            Err(err) => {
                engine.shutdown();
                Err(err)
            }
        }
    }

    fn configure_and_arm(&mut self, format: &FormatDescription) -> Result<(), CaptureError> {
        let bound = self
            .engine
            .as_mut()
            .ok_or(CaptureError::InvalidState { state: SessionState::Ready })?;

        let selection = bound
            .engine
            .resolve(format)?
            .ok_or(CaptureError::NoMatchingFormat { requested: *format })?;
        debug!(
            stream = selection.stream_index,
            media_type = selection.media_type_index,
            %format,
            "Resolved native media type"
        );
        bound.engine.configure(&selection, format.pixel_format)?;

        if let Some(err) = self.pending_error() {
            return Err(err);
        }

        self.dispatcher.reset_frames();
        self.active_format = Some(*format);
        self.dispatcher.set_state(SessionState::Started);
        let armed = match self.engine.as_mut() {
            Some(bound) => bound.engine.arm(),
            None => Err(CaptureError::InvalidState { state: SessionState::Ready }),
        };
        match armed {
            Ok(()) => {
                self.drain_lifecycle();
                Ok(())
            }
            Err(err) => {
                self.active_format = None;
                Err(err)
            }
        }
    }

    /// Re-route events the engine raised between the last pre-start check
    /// and the switch to started; errors among them fail the stream.
    fn drain_lifecycle(&mut self) {
        let Some(rx) = self.lifecycle.as_mut() else { return };
        while let Ok(event) = rx.try_recv() {
            self.dispatcher.redeliver(event);
        }
    }

    /// First error the engine raised while nobody was awaiting it.
    fn pending_error(&mut self) -> Option<CaptureError> {
        let rx = self.lifecycle.as_mut()?;
        while let Ok(event) = rx.try_recv() {
            match event {
                EngineEvent::Error(err) => return Some(err),
                EngineEvent::StreamError { reason } => {
                    return Some(CaptureError::backend("stream", reason))
                }
                EngineEvent::Initialized => {}
            }
        }
        None
    }

    fn release_engine(&mut self) {
        if let Some(mut bound) = self.engine.take() {
            bound.engine.shutdown();
            debug!(device = %bound.device_id, "Engine released");
        }
    }

    // MARK: - Stop

    /// Tear down delivery and release the engine. Idempotent; never waits on
    /// the subsystem.
    pub fn stop(&mut self) {
        let state = self.state();
        if state == SessionState::Idle && self.engine.is_none() && self.lifecycle.is_none() {
            return;
        }

        self.dispatcher.set_state(SessionState::Stopped);
        self.dispatcher.quiesce();
        self.release_engine();
        self.dispatcher.unlisten();
        self.lifecycle = None;
        self.active_format = None;
        self.dispatcher.set_state(SessionState::Idle);
        info!(from = %state, frames = self.frames_delivered(), "Capture stopped");
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn wait_initialized(
    rx: &mut mpsc::UnboundedReceiver<EngineEvent>,
) -> Result<(), CaptureError> {
    while let Some(event) = rx.recv().await {
        match event {
            EngineEvent::Initialized => return Ok(()),
            EngineEvent::Error(err) => return Err(err),
            EngineEvent::StreamError { reason } => {
                return Err(CaptureError::backend("initialize", reason))
            }
        }
    }
    Err(CaptureError::backend("initialize", "engine event channel closed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FormatFilter;
    use crate::sim::{InitBehavior, SimDevice, SimulatedPlatform};
    use crate::types::{BackendKind, PixelFormat};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn nv12() -> FormatDescription {
        FormatDescription::new(640, 480, 30, PixelFormat::Nv12)
    }

    fn mjpeg() -> FormatDescription {
        FormatDescription::new(1280, 720, 15, PixelFormat::Mjpeg)
    }

    fn camera(id: &str) -> SimDevice {
        SimDevice::new(id, id.to_uppercase()).with_formats(vec![nv12(), mjpeg()])
    }

    fn fast(platform: SimulatedPlatform) -> Arc<SimulatedPlatform> {
        Arc::new(platform.with_frame_interval(Duration::from_millis(2)))
    }

    fn setup(
        platform: &Arc<SimulatedPlatform>,
        config: SessionConfig,
    ) -> (DeviceManager, Vec<Device>, CaptureSession) {
        let mut manager = DeviceManager::new(platform.clone(), FormatFilter::default());
        let devices = manager.list_devices().unwrap();
        let session = CaptureSession::new(platform.clone(), config);
        (manager, devices, session)
    }

    fn quick_retries() -> SessionConfig {
        SessionConfig {
            retry_backoff_ms: 1,
            max_retry_backoff_ms: 4,
            start_retries: 2,
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn starts_and_delivers_frames() {
        let platform = fast(SimulatedPlatform::new().with_device(camera("cam-a")));
        let (manager, devices, mut session) = setup(&platform, SessionConfig::default());

        let sizes = Arc::new(Mutex::new(Vec::new()));
        let sink = sizes.clone();
        session.register_frame_callback(move |frame| {
            sink.lock().unwrap().push((frame.width, frame.height, frame.pixel_format));
        });

        session.start(&manager, &devices[0], &nv12()).await.unwrap();
        assert_eq!(session.state(), SessionState::Started);
        assert_eq!(session.active_format(), Some(nv12()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        session.stop();

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.active_format(), None);
        let sizes = sizes.lock().unwrap();
        assert!(!sizes.is_empty());
        assert!(sizes.iter().all(|&s| s == (640, 480, PixelFormat::Nv12)));
        assert_eq!(session.frames_delivered(), sizes.len() as u64);
    }

    #[tokio::test]
    async fn no_frames_after_stop_returns() {
        let platform = fast(SimulatedPlatform::new().with_device(camera("cam-a")));
        let (manager, devices, mut session) = setup(&platform, SessionConfig::default());
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        session.register_frame_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        session.start(&manager, &devices[0], &nv12()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.stop();
        let at_stop = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), at_stop);
    }

    #[tokio::test]
    async fn pull_delivery_rearms_until_stop() {
        let platform = fast(SimulatedPlatform::new().with_device(camera("cam-a")));
        let config = SessionConfig { backend: BackendKind::Reader, ..SessionConfig::default() };
        let (manager, devices, mut session) = setup(&platform, config);

        session.start(&manager, &devices[0], &mjpeg()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let delivered = session.frames_delivered();
        assert!(delivered >= 2, "delivered {delivered}");

        session.stop();
        let reads = platform.read_requests();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(platform.read_requests() <= reads + 1);
    }

    #[tokio::test]
    async fn unmatched_format_is_rejected_and_session_stays_idle() {
        let platform = fast(SimulatedPlatform::new().with_device(camera("cam-a")));
        let (manager, devices, mut session) = setup(&platform, SessionConfig::default());

        let wanted = FormatDescription::new(640, 480, 60, PixelFormat::Nv12);
        let err = session.start(&manager, &devices[0], &wanted).await.unwrap_err();
        assert_eq!(err, CaptureError::NoMatchingFormat { requested: wanted });
        assert_eq!(session.state(), SessionState::Idle);

        session.start(&manager, &devices[0], &nv12()).await.unwrap();
        assert_eq!(platform.open_count(), 1, "engine reused for the same device");
    }

    #[tokio::test]
    async fn switching_device_reinitializes_engine() {
        let platform = fast(
            SimulatedPlatform::new().with_device(camera("cam-a")).with_device(camera("cam-b")),
        );
        let (manager, devices, mut session) = setup(&platform, SessionConfig::default());

        let missing = FormatDescription::new(1, 1, 1, PixelFormat::Nv12);
        assert!(session.start(&manager, &devices[0], &missing).await.is_err());
        session.start(&manager, &devices[1], &nv12()).await.unwrap();
        assert_eq!(platform.open_count(), 2);
    }

    #[tokio::test]
    async fn start_is_invalid_unless_idle() {
        let platform = fast(SimulatedPlatform::new().with_device(camera("cam-a")));
        let (manager, devices, mut session) = setup(&platform, SessionConfig::default());
        session.start(&manager, &devices[0], &nv12()).await.unwrap();

        let err = session.start(&manager, &devices[0], &nv12()).await.unwrap_err();
        assert_eq!(err, CaptureError::InvalidState { state: SessionState::Started });
    }

    #[tokio::test]
    async fn stale_device_handle_is_rejected() {
        let platform = fast(SimulatedPlatform::new().with_device(camera("cam-a")));
        let (mut manager, devices, mut session) = setup(&platform, SessionConfig::default());
        manager.list_devices().unwrap();

        let err = session.start(&manager, &devices[0], &nv12()).await.unwrap_err();
        assert!(matches!(err, CaptureError::StaleDevice { .. }));
        assert_eq!(platform.open_count(), 0);
    }

    #[tokio::test]
    async fn busy_device_succeeds_within_retry_budget() {
        let platform = fast(SimulatedPlatform::new().with_device(camera("cam-a").busy_for(2)));
        let (manager, devices, mut session) = setup(&platform, quick_retries());

        session.start(&manager, &devices[0], &nv12()).await.unwrap();
        assert_eq!(session.state(), SessionState::Started);
        assert_eq!(platform.open_count(), 3);
    }

    #[tokio::test]
    async fn busy_device_fails_past_retry_budget() {
        let platform = fast(SimulatedPlatform::new().with_device(camera("cam-a").busy_for(5)));
        let (manager, devices, mut session) = setup(&platform, quick_retries());

        let err = session.start(&manager, &devices[0], &nv12()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(platform.open_count(), 3);
    }

    #[tokio::test]
    async fn init_failure_is_not_retried() {
        let platform = fast(SimulatedPlatform::new().with_device(
            camera("cam-a").with_init(InitBehavior::Fail("0xC00D3704".into())),
        ));
        let (manager, devices, mut session) = setup(&platform, quick_retries());

        let err = session.start(&manager, &devices[0], &nv12()).await.unwrap_err();
        assert!(matches!(err, CaptureError::Backend { .. }));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(platform.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_engine_times_out_and_stop_is_immediate() {
        let platform = Arc::new(
            SimulatedPlatform::new().with_device(camera("cam-a").with_init(InitBehavior::Silent)),
        );
        let config = SessionConfig { init_timeout_ms: 250, ..SessionConfig::default() };
        let (manager, devices, mut session) = setup(&platform, config);

        let began = tokio::time::Instant::now();
        let err = session.start(&manager, &devices[0], &nv12()).await.unwrap_err();
        assert_eq!(
            err,
            CaptureError::InitializationTimeout { timeout: Duration::from_millis(250) }
        );
        assert!(began.elapsed() <= Duration::from_millis(250) + Duration::from_millis(1));
        assert_eq!(session.state(), SessionState::Idle);

        session.stop();
        assert!(began.elapsed() <= Duration::from_millis(251));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn delayed_initialization_is_awaited() {
        let platform = fast(SimulatedPlatform::new().with_device(
            camera("cam-a").with_init(InitBehavior::Delayed(Duration::from_millis(20))),
        ));
        let (manager, devices, mut session) = setup(&platform, SessionConfig::default());
        session.start(&manager, &devices[0], &nv12()).await.unwrap();
        assert_eq!(session.state(), SessionState::Started);
    }

    #[tokio::test]
    async fn runtime_error_stops_session_and_fires_callback() {
        let platform = fast(SimulatedPlatform::new().with_device(camera("cam-a")));
        let (manager, devices, mut session) = setup(&platform, SessionConfig::default());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        session.register_error_callback(move |err| sink.lock().unwrap().push(err.clone()));

        session.start(&manager, &devices[0], &nv12()).await.unwrap();
        assert!(platform.inject_stream_error("cam-a", "device removed"));

        assert_eq!(session.state(), SessionState::Stopped);
        let frames = session.frames_delivered();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(session.frames_delivered(), frames);
        assert_eq!(
            *errors.lock().unwrap(),
            vec![CaptureError::RuntimeStreamError { reason: "device removed".into() }]
        );

        let err = session.start(&manager, &devices[0], &nv12()).await.unwrap_err();
        assert_eq!(err, CaptureError::InvalidState { state: SessionState::Stopped });
        session.stop();
        assert_eq!(session.state(), SessionState::Idle);
        session.start(&manager, &devices[0], &nv12()).await.unwrap();
    }

    #[tokio::test]
    async fn error_raised_while_ready_is_reported_after_start() {
        let platform = fast(SimulatedPlatform::new().with_device(camera("cam-a")));
        let (manager, devices, mut session) = setup(&platform, SessionConfig::default());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        session.register_error_callback(move |err| sink.lock().unwrap().push(err.clone()));

        session.start(&manager, &devices[0], &nv12()).await.unwrap();

        // Replay the window between the pre-start check and the state switch:
        // the error lands on the lifecycle channel while the session is ready.
        session.dispatcher.set_state(SessionState::Ready);
        session
            .dispatcher
            .sinks()
            .events
            .on_event(EngineEvent::StreamError { reason: "driver reset".into() });
        assert!(errors.lock().unwrap().is_empty());
        session.dispatcher.set_state(SessionState::Started);
        session.drain_lifecycle();

        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(
            *errors.lock().unwrap(),
            vec![CaptureError::RuntimeStreamError { reason: "driver reset".into() }]
        );
        session.stop();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn scripted_device_loss_reaches_error_callback() {
        let platform =
            fast(SimulatedPlatform::new().with_device(camera("cam-a").fail_after_frames(3)));
        let (manager, devices, mut session) = setup(&platform, SessionConfig::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        session.register_error_callback(move |err| {
            let _ = tx.send(err.clone());
        });

        session.start(&manager, &devices[0], &nv12()).await.unwrap();
        let err = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(err, CaptureError::RuntimeStreamError { .. }));
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.frames_delivered(), 3);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let platform = fast(SimulatedPlatform::new().with_device(camera("cam-a")));
        let (manager, devices, mut session) = setup(&platform, SessionConfig::default());

        session.stop();
        session.start(&manager, &devices[0], &nv12()).await.unwrap();
        session.stop();
        session.stop();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn drop_stops_delivery() {
        let platform = fast(SimulatedPlatform::new().with_device(camera("cam-a")));
        let (manager, devices, mut session) = setup(&platform, SessionConfig::default());
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        session.register_frame_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        session.start(&manager, &devices[0], &nv12()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(session);
        let at_drop = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), at_drop);
    }
}
