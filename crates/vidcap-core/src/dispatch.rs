//! Routes subsystem callbacks to the session.
//!
//! The platform sees two narrow sinks ([`SampleSink`], [`EngineEventSink`]);
//! both share one [`Shared`] block holding the session phase, the user
//! callbacks and the lifecycle channel the session awaits during start.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::errors::CaptureError;
use crate::platform::{EngineEvent, EngineEventSink, EngineSinks, SampleSink};
use crate::types::{Frame, SessionState};

pub type FrameCallback = Box<dyn FnMut(&Frame<'_>) + Send>;
pub type ErrorCallback = Box<dyn FnMut(&CaptureError) + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Shared {
    state: Mutex<SessionState>,
    frame_callback: Mutex<Option<FrameCallback>>,
    error_callback: Mutex<Option<ErrorCallback>>,
    lifecycle: Mutex<Option<mpsc::UnboundedSender<EngineEvent>>>,
    frames: AtomicU64,
}

impl Shared {
    fn fail_stream(&self, err: CaptureError) {
        {
            let mut state = lock(&self.state);
            if *state != SessionState::Started {
                debug!(state = %*state, "Ignoring stream error outside started state: {err}");
                return;
            }
            *state = SessionState::Stopped;
        }
        error!("Capture stream failed: {err}");
        if let Some(callback) = lock(&self.error_callback).as_mut() {
            callback(&err);
        }
    }

    fn forward(&self, event: EngineEvent) {
        match lock(&self.lifecycle).as_ref() {
            Some(tx) => {
                if tx.send(event).is_err() {
                    debug!("Lifecycle receiver dropped");
                }
            }
            None => debug!(?event, "No lifecycle listener; dropping event"),
        }
    }
}

struct FrameRoute(Arc<Shared>);

impl SampleSink for FrameRoute {
    fn on_sample(&self, frame: &Frame<'_>) {
        // The callback guard is held across the state check so that
        // `quiesce` cannot return while a started delivery is in flight.
        let mut callback = lock(&self.0.frame_callback);
        if *lock(&self.0.state) != SessionState::Started {
            trace!("Dropping sample outside started state");
            return;
        }
        self.0.frames.fetch_add(1, Ordering::Relaxed);
        if let Some(callback) = callback.as_mut() {
            callback(frame);
        }
    }
}

struct EventRoute(Arc<Shared>);

impl EngineEventSink for EventRoute {
    fn on_event(&self, event: EngineEvent) {
        let state = lock(&self.0.state);
        if *state != SessionState::Started {
            // Forward under the state guard: the session drains the channel
            // after it switches to started, so nothing slips between the two.
            self.0.forward(event);
            return;
        }
        drop(state);
        match event {
            EngineEvent::Error(err) => {
                self.0.fail_stream(CaptureError::RuntimeStreamError { reason: err.to_string() })
            }
            EngineEvent::StreamError { reason } => {
                self.0.fail_stream(CaptureError::RuntimeStreamError { reason })
            }
            EngineEvent::Initialized => debug!("Ignoring late initialized event"),
        }
    }
}

/// Session-side owner of the two sinks.
pub(crate) struct EventDispatcher {
    shared: Arc<Shared>,
    samples: Arc<FrameRoute>,
    events: Arc<EventRoute>,
}

impl EventDispatcher {
    pub(crate) fn new() -> Self {
        let shared = Arc::new(Shared::default());
        Self {
            samples: Arc::new(FrameRoute(shared.clone())),
            events: Arc::new(EventRoute(shared.clone())),
            shared,
        }
    }

    pub(crate) fn sinks(&self) -> EngineSinks {
        EngineSinks { samples: self.samples.clone(), events: self.events.clone() }
    }

    pub(crate) fn state(&self) -> SessionState {
        *lock(&self.shared.state)
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        let mut current = lock(&self.shared.state);
        if *current != state {
            debug!(from = %*current, to = %state, "Session state");
            *current = state;
        }
    }

    /// Route lifecycle events to a fresh channel and return its receiver.
    pub(crate) fn listen(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.shared.lifecycle) = Some(tx);
        rx
    }

    pub(crate) fn unlisten(&self) {
        lock(&self.shared.lifecycle).take();
    }

    pub(crate) fn set_frame_callback(&self, callback: FrameCallback) {
        *lock(&self.shared.frame_callback) = Some(callback);
    }

    pub(crate) fn set_error_callback(&self, callback: ErrorCallback) {
        *lock(&self.shared.error_callback) = Some(callback);
    }

    /// Re-route an event that was queued before the session started.
    pub(crate) fn redeliver(&self, event: EngineEvent) {
        self.events.on_event(event);
    }

    /// Wait for any frame callback already past the state check to return.
    /// Call after leaving the started state.
    pub(crate) fn quiesce(&self) {
        drop(lock(&self.shared.frame_callback));
    }

    pub(crate) fn frames_delivered(&self) -> u64 {
        self.shared.frames.load(Ordering::Relaxed)
    }

    pub(crate) fn reset_frames(&self) {
        self.shared.frames.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelFormat;
    use std::sync::atomic::AtomicU32;

    fn frame(data: &[u8]) -> Frame<'_> {
        Frame::from_contiguous(data, 0, 2, 2, PixelFormat::Mjpeg, 0).unwrap()
    }

    #[test]
    fn samples_only_reach_callback_when_started() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();
        dispatcher.set_frame_callback(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let sinks = dispatcher.sinks();
        let data = [0u8; 4];

        sinks.samples.on_sample(&frame(&data));
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        dispatcher.set_state(SessionState::Started);
        sinks.samples.on_sample(&frame(&data));
        sinks.samples.on_sample(&frame(&data));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.frames_delivered(), 2);

        dispatcher.set_state(SessionState::Idle);
        sinks.samples.on_sample(&frame(&data));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn lifecycle_events_are_forwarded_before_start() {
        let dispatcher = EventDispatcher::new();
        let mut rx = dispatcher.listen();
        dispatcher.set_state(SessionState::Initializing);
        dispatcher.sinks().events.on_event(EngineEvent::Initialized);
        assert_eq!(rx.try_recv().unwrap(), EngineEvent::Initialized);
    }

    #[test]
    fn stream_error_while_started_stops_and_notifies_once() {
        let dispatcher = EventDispatcher::new();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        dispatcher.set_error_callback(Box::new(move |err| sink.lock().unwrap().push(err.clone())));
        dispatcher.set_state(SessionState::Started);

        let events = dispatcher.sinks().events;
        events.on_event(EngineEvent::StreamError { reason: "unplugged".into() });
        events.on_event(EngineEvent::StreamError { reason: "again".into() });

        assert_eq!(dispatcher.state(), SessionState::Stopped);
        let errors = errors.lock().unwrap();
        assert_eq!(
            *errors,
            vec![CaptureError::RuntimeStreamError { reason: "unplugged".into() }]
        );
    }

    #[test]
    fn quiesce_waits_for_callback_in_flight() {
        use std::sync::atomic::AtomicBool;
        use std::sync::mpsc as std_mpsc;
        use std::thread;
        use std::time::Duration;

        let dispatcher = EventDispatcher::new();
        let (entered_tx, entered_rx) = std_mpsc::channel();
        let (release_tx, release_rx) = std_mpsc::channel::<()>();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        dispatcher.set_frame_callback(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = entered_tx.send(());
            let _ = release_rx.recv();
        }));
        dispatcher.set_state(SessionState::Started);
        let sinks = dispatcher.sinks();
        let quiesced = AtomicBool::new(false);
        let data = [0u8; 4];

        thread::scope(|scope| {
            scope.spawn(|| sinks.samples.on_sample(&frame(&data)));
            entered_rx.recv().unwrap();

            let stopper = scope.spawn(|| {
                dispatcher.set_state(SessionState::Stopped);
                dispatcher.quiesce();
                quiesced.store(true, Ordering::SeqCst);
            });
            thread::sleep(Duration::from_millis(30));
            assert!(!quiesced.load(Ordering::SeqCst), "quiesce returned during a callback");

            release_tx.send(()).unwrap();
            stopper.join().unwrap();
        });
        assert!(quiesced.load(Ordering::SeqCst));

        // Deliveries racing the stop see the new state under the callback guard.
        sinks.samples.on_sample(&frame(&data));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn error_queued_before_start_fails_the_stream_when_redelivered() {
        let dispatcher = EventDispatcher::new();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        dispatcher.set_error_callback(Box::new(move |err| sink.lock().unwrap().push(err.clone())));
        let mut rx = dispatcher.listen();

        dispatcher.set_state(SessionState::Ready);
        dispatcher.sinks().events.on_event(EngineEvent::StreamError { reason: "lost".into() });
        assert!(errors.lock().unwrap().is_empty());

        dispatcher.set_state(SessionState::Started);
        while let Ok(event) = rx.try_recv() {
            dispatcher.redeliver(event);
        }
        assert_eq!(dispatcher.state(), SessionState::Stopped);
        assert_eq!(
            *errors.lock().unwrap(),
            vec![CaptureError::RuntimeStreamError { reason: "lost".into() }]
        );
    }
}
