//! Fingerprint Session Engine
//!
//! Runs enrollment and verification as dedicated worker threads:
//! - one session per engine at a time, handed back as a [`SessionHandle`]
//! - workers drive the backend poll loop and push typed [`FprintEvent`]s
//!   into a channel; they never call back into the service
//! - cancellation is a shared flag plus `Backend::acquire_stop`, observed
//!   at poll boundaries, so stopping is bounded by one poll interval

mod enroll;
mod verify;

pub use enroll::{
    MSG_ENROLL_CANCELLED, MSG_ENROLL_COMPLETE, MSG_ENROLL_FAILED, MSG_TOO_MANY_RETRIES,
    PROMPT_PLACE_AGAIN, PROMPT_PLACE_FINGER, PROMPT_SAME_FINGER,
};
pub use verify::{
    MSG_MATCHED, MSG_NOT_RECOGNIZED, MSG_NO_MATCH_RETRY, MSG_VERIFY_CANCELLED, MSG_VERIFY_FAILED,
};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use fprint_backend::{Backend, BackendError, Registry, Template};
use template_store::{FingerprintStore, StoreError};

/// How long one capture attempt may wait for finger data.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared retry budget for one session. Guidance, unreadable captures
/// and non-matching attempts all draw from it.
pub const MAX_RETRIES: u32 = 20;

/// Samples merged into one registration template.
pub const SAMPLES_REQUIRED: usize = 3;

/// Engine error types
#[derive(Debug, Error)]
pub enum EngineError {
    /// No backend could produce an open reader
    #[error("no usable fingerprint device")]
    DeviceNotFound,

    /// Verification was requested but nothing is enrolled
    #[error("no enrolled fingerprint templates")]
    NoEnrolledTemplates,

    /// Backend failure during session setup
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Template store failure during session setup
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Progress events a session worker emits. Terminal events set `done`;
/// after a terminal event the worker exits and the handle can be joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FprintEvent {
    EnrollStatus {
        message: String,
        id: Option<String>,
        progress: u8,
        done: bool,
    },
    VerifyStatus {
        message: String,
        id: Option<String>,
        matched: bool,
        done: bool,
    },
}

/// A running session worker. Dropping the handle detaches the worker;
/// callers that need the idle state back must join through it.
pub struct SessionHandle {
    cancel: Arc<AtomicBool>,
    backend: Arc<dyn Backend>,
    thread: JoinHandle<()>,
}

impl SessionHandle {
    /// Request cancellation and wait for the worker to exit. The worker
    /// emits its own terminal event before this returns.
    pub fn cancel_and_join(self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.backend.acquire_stop();
        if self.thread.join().is_err() {
            warn!("fingerprint session worker panicked");
        }
    }

    /// Whether the worker already ran to completion on its own.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Join a worker that finished naturally.
    pub fn join(self) {
        if self.thread.join().is_err() {
            warn!("fingerprint session worker panicked");
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("backend", &self.backend.name())
            .field("finished", &self.thread.is_finished())
            .finish_non_exhaustive()
    }
}

/// Owns the backend registry and the template store, and spawns session
/// workers. Device and store preconditions are checked before any thread
/// starts, so callers get those failures synchronously.
pub struct FprintEngine {
    registry: Mutex<Registry>,
    store: Arc<FingerprintStore>,
}

impl FprintEngine {
    pub fn new(registry: Registry, store: Arc<FingerprintStore>) -> Self {
        Self {
            registry: Mutex::new(registry),
            store,
        }
    }

    pub fn store(&self) -> &Arc<FingerprintStore> {
        &self.store
    }

    /// Start an enrollment worker.
    pub fn start_enroll(
        &self,
        events: UnboundedSender<FprintEvent>,
    ) -> Result<SessionHandle, EngineError> {
        let active = self.open_device()?;
        let backend = Arc::clone(&active.backend);
        let cancel = Arc::new(AtomicBool::new(false));
        let store = Arc::clone(&self.store);

        let worker_cancel = Arc::clone(&cancel);
        let thread = thread::Builder::new()
            .name("fprint-enroll".to_string())
            .spawn(move || enroll::run(active, worker_cancel, events, store))
            .map_err(|_| BackendError::Fail)?;

        Ok(SessionHandle {
            cancel,
            backend,
            thread,
        })
    }

    /// Start a verification worker. With a target identity only that
    /// template is matched against; otherwise every persisted template
    /// is a candidate. Candidates are loaded before any device is
    /// touched, so an empty store never reaches the sensor.
    pub fn start_verify(
        &self,
        target: Option<&str>,
        events: UnboundedSender<FprintEvent>,
    ) -> Result<SessionHandle, EngineError> {
        let candidates = self.load_candidates(target)?;
        if candidates.is_empty() {
            return Err(EngineError::NoEnrolledTemplates);
        }

        let active = self.open_device()?;
        let backend = Arc::clone(&active.backend);
        let cancel = Arc::new(AtomicBool::new(false));

        let worker_cancel = Arc::clone(&cancel);
        let thread = thread::Builder::new()
            .name("fprint-verify".to_string())
            .spawn(move || verify::run(active, worker_cancel, events, candidates))
            .map_err(|_| BackendError::Fail)?;

        Ok(SessionHandle {
            cancel,
            backend,
            thread,
        })
    }

    fn open_device(&self) -> Result<fprint_backend::ActiveDevice, EngineError> {
        let mut registry = self.registry.lock().map_err(|_| BackendError::Fail)?;
        registry.open().map_err(|err| match err {
            BackendError::NoDevice | BackendError::OpenDeviceFail => EngineError::DeviceNotFound,
            other => EngineError::Backend(other),
        })
    }

    // A broken store reads as "nothing enrolled": verification degrades
    // instead of surfacing an internal error to the caller.
    fn load_candidates(&self, target: Option<&str>) -> Result<Vec<(String, Template)>, EngineError> {
        match target {
            Some(id) => match self.store.load(id) {
                Ok(bytes) => Ok(vec![(id.to_string(), Template::new(bytes))]),
                Err(err) => {
                    if !matches!(err, StoreError::NotFound(_)) {
                        warn!(%err, "cannot load verification target");
                    }
                    Err(EngineError::NoEnrolledTemplates)
                }
            },
            None => match self.store.load_all() {
                Ok(all) => Ok(all
                    .into_iter()
                    .map(|(id, bytes)| (id, Template::new(bytes)))
                    .collect()),
                Err(err) => {
                    warn!(%err, "cannot enumerate enrolled templates");
                    Err(EngineError::NoEnrolledTemplates)
                }
            },
        }
    }
}
