//! Biometrics service facade
//!
//! One place that enforces the per-modality single-operation rule and
//! translates engine/pipeline events into the wire-level event stream.
//! Fingerprint sessions are gated by an atomic action state; the face
//! pipeline carries its own gate.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::warn;

use face_pipeline::{FaceError, FaceEvent, FacePipeline};
use fprint_engine::{EngineError, FprintEngine, FprintEvent, SessionHandle};

const ACTION_IDLE: u8 = 0;
const ACTION_ENROLL: u8 = 1;
const ACTION_VERIFY: u8 = 2;

/// Errors surfaced to IPC callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("no biometric device available")]
    DeviceNotFound,

    #[error("another operation is already in progress")]
    DeviceBusy,

    #[error("permission denied")]
    PermissionDenied,

    #[error("no enrolled templates")]
    NoEnrolledTemplates,

    #[error("no action is in progress")]
    NoActionInProgress,

    #[error("operation not supported")]
    Unsupported,

    #[error("operation timed out")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable machine-readable code for the wire.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::DeviceNotFound => "device-not-found",
            ServiceError::DeviceBusy => "device-busy",
            ServiceError::PermissionDenied => "permission-denied",
            ServiceError::NoEnrolledTemplates => "no-enrolled-templates",
            ServiceError::NoActionInProgress => "no-action-in-progress",
            ServiceError::Unsupported => "unsupported",
            ServiceError::Timeout => "timeout",
            ServiceError::Internal(_) => "internal",
        }
    }
}

impl From<EngineError> for ServiceError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::DeviceNotFound => ServiceError::DeviceNotFound,
            EngineError::NoEnrolledTemplates => ServiceError::NoEnrolledTemplates,
            EngineError::Backend(fprint_backend::BackendError::Timeout) => ServiceError::Timeout,
            EngineError::Backend(fprint_backend::BackendError::Unsupported) => {
                ServiceError::Unsupported
            }
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

impl From<FaceError> for ServiceError {
    fn from(err: FaceError) -> Self {
        match err {
            FaceError::Busy => ServiceError::DeviceBusy,
            FaceError::NotRunning => ServiceError::NoActionInProgress,
            FaceError::Camera(_) | FaceError::Io(_) => ServiceError::DeviceNotFound,
            FaceError::Store(template_store::StoreError::NotFound(_)) => {
                ServiceError::NoEnrolledTemplates
            }
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

/// Events broadcast to subscribed IPC connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServiceEvent {
    FprintEnrollStatus {
        message: String,
        id: Option<String>,
        progress: u8,
        done: bool,
    },
    FprintVerifyStatus {
        message: String,
        id: Option<String>,
        matched: bool,
        done: bool,
    },
    FaceEnrollStatus {
        hint: String,
        id: Option<String>,
        progress: u8,
        done: bool,
    },
    FaceVerifyStatus {
        message: String,
        matched: bool,
        done: bool,
    },
}

impl From<FprintEvent> for ServiceEvent {
    fn from(event: FprintEvent) -> Self {
        match event {
            FprintEvent::EnrollStatus {
                message,
                id,
                progress,
                done,
            } => ServiceEvent::FprintEnrollStatus {
                message,
                id,
                progress,
                done,
            },
            FprintEvent::VerifyStatus {
                message,
                id,
                matched,
                done,
            } => ServiceEvent::FprintVerifyStatus {
                message,
                id,
                matched,
                done,
            },
        }
    }
}

impl From<FaceEvent> for ServiceEvent {
    fn from(event: FaceEvent) -> Self {
        match event {
            FaceEvent::EnrollStatus {
                hint,
                id,
                progress,
                done,
            } => ServiceEvent::FaceEnrollStatus {
                hint,
                id,
                progress,
                done,
            },
            FaceEvent::VerifyStatus {
                message,
                matched,
                done,
            } => ServiceEvent::FaceVerifyStatus {
                message,
                matched,
                done,
            },
        }
    }
}

pub struct BiometricsService {
    engine: Arc<FprintEngine>,
    pipeline: Arc<FacePipeline>,
    fp_action: AtomicU8,
    fp_session: Mutex<Option<SessionHandle>>,
    events: broadcast::Sender<ServiceEvent>,
}

impl BiometricsService {
    pub fn new(
        engine: Arc<FprintEngine>,
        pipeline: Arc<FacePipeline>,
        events: broadcast::Sender<ServiceEvent>,
    ) -> Self {
        Self {
            engine,
            pipeline,
            fp_action: AtomicU8::new(ACTION_IDLE),
            fp_session: Mutex::new(None),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    pub fn enroll_fprint_start(&self) -> Result<(), ServiceError> {
        self.fprint_start(ACTION_ENROLL)
    }

    pub fn verify_fprint_start(&self, target: Option<&str>) -> Result<(), ServiceError> {
        self.fprint_start_with(ACTION_VERIFY, target)
    }

    fn fprint_start(&self, action: u8) -> Result<(), ServiceError> {
        self.fprint_start_with(action, None)
    }

    fn fprint_start_with(&self, action: u8, target: Option<&str>) -> Result<(), ServiceError> {
        self.claim_fp_action(action)?;
        self.warn_if_face_active();

        let (tx, rx) = unbounded_channel();
        forward::<FprintEvent>(rx, self.events.clone());

        let started = if action == ACTION_ENROLL {
            self.engine.start_enroll(tx)
        } else {
            self.engine.start_verify(target, tx)
        };

        match started {
            Ok(handle) => {
                if let Ok(mut session) = self.fp_session.lock() {
                    *session = Some(handle);
                }
                Ok(())
            }
            Err(err) => {
                self.fp_action.store(ACTION_IDLE, Ordering::SeqCst);
                Err(err.into())
            }
        }
    }

    /// Stop the running fingerprint operation of the given kind. Joins
    /// the worker, so the action state is idle again on return.
    pub fn fprint_stop(&self, action_enroll: bool) -> Result<(), ServiceError> {
        let expected = if action_enroll {
            ACTION_ENROLL
        } else {
            ACTION_VERIFY
        };
        if self.fp_action.load(Ordering::SeqCst) != expected {
            return Err(ServiceError::NoActionInProgress);
        }

        let handle = self
            .fp_session
            .lock()
            .ok()
            .and_then(|mut session| session.take());
        match handle {
            Some(handle) => {
                handle.cancel_and_join();
                self.fp_action.store(ACTION_IDLE, Ordering::SeqCst);
                Ok(())
            }
            None => {
                self.fp_action.store(ACTION_IDLE, Ordering::SeqCst);
                Err(ServiceError::NoActionInProgress)
            }
        }
    }

    pub fn delete_enrolled_finger(&self, id: &str) -> Result<(), ServiceError> {
        self.engine
            .store()
            .remove(id)
            .map_err(|err| ServiceError::Internal(err.to_string()))
    }

    pub fn enroll_face_start(&self) -> Result<(), ServiceError> {
        self.warn_if_fprint_active();
        let (tx, rx) = unbounded_channel();
        forward::<FaceEvent>(rx, self.events.clone());
        self.pipeline.start_enroll(tx).map_err(ServiceError::from)
    }

    pub fn verify_face_start(&self, target: &str) -> Result<(), ServiceError> {
        self.warn_if_fprint_active();
        let (tx, rx) = unbounded_channel();
        forward::<FaceEvent>(rx, self.events.clone());
        self.pipeline
            .start_verify(target, tx)
            .map_err(ServiceError::from)
    }

    pub fn face_stop(&self) -> Result<(), ServiceError> {
        self.pipeline.stop().map_err(ServiceError::from)
    }

    pub fn delete_enrolled_face(&self, id: &str) -> Result<(), ServiceError> {
        self.pipeline
            .store()
            .remove(id)
            .map_err(|err| ServiceError::Internal(err.to_string()))
    }

    /// Claim the fingerprint action slot. A session that ran to its own
    /// terminal event leaves a finished worker behind; reap it and
    /// retry once before reporting busy.
    fn claim_fp_action(&self, action: u8) -> Result<(), ServiceError> {
        if self
            .fp_action
            .compare_exchange(ACTION_IDLE, action, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Ok(());
        }

        if let Ok(mut session) = self.fp_session.lock() {
            let finished = session
                .as_ref()
                .map(SessionHandle::is_finished)
                .unwrap_or(true);
            if finished {
                if let Some(handle) = session.take() {
                    handle.join();
                }
                self.fp_action.store(ACTION_IDLE, Ordering::SeqCst);
                drop(session);
                if self
                    .fp_action
                    .compare_exchange(ACTION_IDLE, action, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return Ok(());
                }
            }
        }
        Err(ServiceError::DeviceBusy)
    }

    // Concurrent fingerprint and face operations are permitted but
    // unusual for PAM flows, so they are logged.
    fn warn_if_face_active(&self) {
        if !self.pipeline.is_idle() {
            warn!("starting a fingerprint operation while a face operation is running");
        }
    }

    fn warn_if_fprint_active(&self) {
        if self.fp_action.load(Ordering::SeqCst) != ACTION_IDLE {
            warn!("starting a face operation while a fingerprint operation is running");
        }
    }
}

/// Drain a session's event channel into the broadcast stream. The
/// thread ends when the session worker drops its sender.
fn forward<E>(mut rx: UnboundedReceiver<E>, events: broadcast::Sender<ServiceEvent>)
where
    E: Into<ServiceEvent> + Send + 'static,
{
    thread::Builder::new()
        .name("event-forward".to_string())
        .spawn(move || {
            while let Some(event) = rx.blocking_recv() {
                // Send fails only when nobody is subscribed.
                let _ = events.send(event.into());
            }
        })
        .map(|_| ())
        .unwrap_or_else(|err| warn!(%err, "cannot spawn event forwarder"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use fprint_backend::mock::MockBackend;
    use fprint_backend::{AcquireStep, Backend, Registry, Template};
    use face_pipeline::{
        EyeDetector, FaceBox, FaceComparator, FaceDetector, Frame, FrameSource,
        LiveDataPublisher,
    };
    use template_store::{FaceStore, FingerprintStore};
    use std::time::Duration;

    struct StillCamera;

    impl FrameSource for StillCamera {
        fn next_frame(&mut self) -> Result<Frame, FaceError> {
            thread::sleep(Duration::from_millis(1));
            Ok(Frame::new(vec![64; 240 * 240 * 3], 240, 240))
        }
    }

    struct OneFace;

    impl FaceDetector for OneFace {
        fn detect_faces(&mut self, _gray: &[u8], _w: u32, _h: u32) -> Vec<FaceBox> {
            vec![FaceBox {
                x: 40,
                y: 40,
                w: 160,
                h: 160,
            }]
        }
    }

    struct BothEyes;

    impl EyeDetector for BothEyes {
        fn detect_eyes(&mut self, _gray: &[u8], _w: u32, _h: u32, face: &FaceBox) -> Vec<FaceBox> {
            vec![*face, *face]
        }
    }

    struct NeverMatches;

    impl FaceComparator for NeverMatches {
        fn compare(&self, _live: &Frame, _stored: &Frame) -> Result<bool, FaceError> {
            Ok(false)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        backend: Arc<MockBackend>,
        service: BiometricsService,
        events: broadcast::Receiver<ServiceEvent>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(MockBackend::new("mock"));

        let registry = Registry::with_backends(vec![Arc::clone(&backend) as Arc<dyn Backend>]);
        let fp_store = Arc::new(FingerprintStore::new(dir.path().join("fprint")));
        let engine = Arc::new(FprintEngine::new(registry, fp_store));

        let publisher =
            Arc::new(LiveDataPublisher::bind(dir.path().join("live.sock")).expect("bind"));
        let face_store = Arc::new(FaceStore::new(dir.path().join("faces")));
        let pipeline = Arc::new(FacePipeline::new(
            || Ok(Box::new(StillCamera) as Box<dyn FrameSource>),
            || {
                Ok((
                    Box::new(OneFace) as Box<dyn FaceDetector>,
                    Box::new(BothEyes) as Box<dyn EyeDetector>,
                ))
            },
            Arc::new(NeverMatches),
            publisher,
            face_store,
        ));

        let (events_tx, events_rx) = broadcast::channel(256);
        let service = BiometricsService::new(engine, pipeline, events_tx);
        Fixture {
            _dir: dir,
            backend,
            service,
            events: events_rx,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<ServiceEvent>) -> Vec<ServiceEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn second_fprint_start_is_busy_until_stop() {
        let mut fx = fixture();
        fx.service.enroll_fprint_start().expect("start");
        assert_eq!(
            fx.service.enroll_fprint_start(),
            Err(ServiceError::DeviceBusy)
        );

        fx.service.fprint_stop(true).expect("stop");
        // Worker joined: the slot is free again.
        fx.service.enroll_fprint_start().expect("restart");
        fx.service.fprint_stop(true).expect("stop again");
        drain(&mut fx.events);
    }

    #[test]
    fn stop_without_session_reports_no_action() {
        let fx = fixture();
        assert_eq!(
            fx.service.fprint_stop(true),
            Err(ServiceError::NoActionInProgress)
        );
        assert_eq!(fx.service.face_stop(), Err(ServiceError::NoActionInProgress));
    }

    #[test]
    fn stop_kind_must_match_the_running_action() {
        let fx = fixture();
        fx.service.enroll_fprint_start().expect("start");
        assert_eq!(
            fx.service.fprint_stop(false),
            Err(ServiceError::NoActionInProgress)
        );
        fx.service.fprint_stop(true).expect("stop");
    }

    #[test]
    fn cancelled_session_event_reaches_subscribers() {
        let mut fx = fixture();
        fx.service.enroll_fprint_start().expect("start");
        thread::sleep(Duration::from_millis(50));
        fx.service.fprint_stop(true).expect("stop");

        // Forwarding crosses a thread; give it a moment.
        thread::sleep(Duration::from_millis(100));
        let events = drain(&mut fx.events);
        assert!(events.iter().any(|event| matches!(
            event,
            ServiceEvent::FprintEnrollStatus { done: true, id: None, .. }
        )));
    }

    #[test]
    fn slot_recovers_after_natural_completion() {
        let mut fx = fixture();
        for _ in 0..fprint_engine::SAMPLES_REQUIRED {
            fx.backend
                .push_acquire(AcquireStep::Sample(Template::new(vec![1])));
        }
        fx.service.enroll_fprint_start().expect("start");

        // Wait for the session to finish on its own.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            thread::sleep(Duration::from_millis(20));
            let done = drain(&mut fx.events).iter().any(|event| {
                matches!(event, ServiceEvent::FprintEnrollStatus { done: true, .. })
            });
            if done || std::time::Instant::now() > deadline {
                break;
            }
        }

        // No stop call was made; the next start reaps the finished worker.
        fx.service.enroll_fprint_start().expect("restart");
        fx.service.fprint_stop(true).expect("stop");
    }

    #[test]
    fn verify_without_enrollments_is_typed() {
        let fx = fixture();
        assert_eq!(
            fx.service.verify_fprint_start(None),
            Err(ServiceError::NoEnrolledTemplates)
        );
        // The failed start released the slot.
        fx.service.enroll_fprint_start().expect("start");
        fx.service.fprint_stop(true).expect("stop");
    }

    #[test]
    fn deleting_missing_enrollments_is_internal() {
        let fx = fixture();
        let id = template_store::identity_hash(b"ghost");
        assert!(matches!(
            fx.service.delete_enrolled_finger(&id),
            Err(ServiceError::Internal(_))
        ));
        assert!(matches!(
            fx.service.delete_enrolled_face(&id),
            Err(ServiceError::Internal(_))
        ));
    }

    #[test]
    fn face_and_fprint_gates_are_independent() {
        let fx = fixture();
        fx.service.enroll_face_start().expect("face start");
        fx.service.enroll_fprint_start().expect("fprint start");
        fx.service.fprint_stop(true).expect("fprint stop");
        fx.service.face_stop().expect("face stop");
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(ServiceError::DeviceBusy.code(), "device-busy");
        assert_eq!(
            ServiceError::Internal("x".to_string()).code(),
            "internal"
        );
    }
}
