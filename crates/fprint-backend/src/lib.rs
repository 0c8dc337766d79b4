//! Fingerprint Backend Abstraction
//!
//! Uniform contract in front of vendor fingerprint SDKs:
//! - `Backend` / `Device` traits every vendor adapter implements
//! - Tagged acquire/verify outcomes so guidance can never be mistaken
//!   for a fatal error
//! - Manifest-driven discovery and a failover registry that keeps one
//!   "active" backend sticky across operations

mod drivers;
mod error;
pub mod mock;
mod registry;

pub use error::BackendError;
pub use registry::{ActiveDevice, Registry};

use std::time::Duration;

/// Poll interval the engine sleeps between `acquire_step` calls while a
/// device reports [`AcquireStep::NotReady`].
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Extracted fingerprint feature data for one or more samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    data: Vec<u8>,
}

impl Template {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl From<Vec<u8>> for Template {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

/// Mid-capture guidance a reader can give the user. These are expected
/// states during enrollment, not failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guidance {
    /// Swipe covered too little of the sensor
    SwipeTooShort,
    /// Finger was placed off-center
    CenterFinger,
    /// Finger must be lifted before the next capture
    RemoveFinger,
    /// Unspecified retry request from the SDK
    Retry,
    /// The SDK accepted this capture stage
    StagePassed,
}

impl Guidance {
    /// User-facing prompt for this guidance code.
    pub fn prompt(&self) -> &'static str {
        match self {
            Guidance::SwipeTooShort => "Swipe was too short, try again",
            Guidance::CenterFinger => "Center your finger on the sensor",
            Guidance::RemoveFinger => "Remove your finger, then place it again",
            Guidance::Retry => "Could not read your finger, try again",
            Guidance::StagePassed => "Good capture",
        }
    }
}

/// One non-blocking acquire poll step. The caller owns the deadline: it
/// sleeps [`POLL_INTERVAL`] on `NotReady` and compares elapsed time
/// against its per-attempt timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireStep {
    /// A complete feature template was captured
    Sample(Template),
    /// The SDK ran its own multi-sample enrollment internally and this
    /// template is the final registration record
    InternalComplete(Template),
    /// No finger data yet; poll again
    NotReady,
    /// The user needs to adjust; stays at the same enrollment stage
    Guidance(Guidance),
}

/// A vendor fingerprint backend. One value per vendor SDK, selected at
/// runtime by the registry. Implementations must tolerate `acquire_stop`
/// being called from a thread other than the one driving the device.
pub trait Backend: Send + Sync {
    /// Short stable driver name, matching the manifest `driver` key.
    fn name(&self) -> &str;

    /// Initialize SDK-wide resources.
    fn init(&self) -> Result<(), BackendError>;

    /// Release SDK-wide resources.
    fn finalize(&self) -> Result<(), BackendError>;

    /// Number of readers this backend can currently see.
    fn device_count(&self) -> Result<usize, BackendError>;

    /// Open the reader at `index`. `None` mirrors a null vendor handle.
    fn open_device(&self, index: usize) -> Option<Box<dyn Device>>;

    /// Ask the SDK to abort a blocking capture. Fire-and-forget; the
    /// capture loop still observes its own cancel flag within one poll
    /// interval. Default is a no-op for SDKs without a cancel entry point.
    fn acquire_stop(&self) {}
}

/// An opened reader. Created by [`Backend::open_device`], owned by one
/// session worker at a time and closed exactly once.
pub trait Device: Send {
    /// Poll for capture progress.
    fn acquire_step(&mut self) -> Result<AcquireStep, BackendError>;

    /// Native multi-template verification: capture internally and match
    /// against `candidates`, returning the matched index. Backends
    /// without this entry point return [`BackendError::Unsupported`] and
    /// the engine falls back to acquire-then-match.
    fn verify(&mut self, candidates: &[Template], timeout: Duration) -> Result<usize, BackendError> {
        let _ = (candidates, timeout);
        Err(BackendError::Unsupported)
    }

    /// Merge three same-finger samples into one registration template.
    fn merge(
        &mut self,
        first: &Template,
        second: &Template,
        third: &Template,
    ) -> Result<Template, BackendError>;

    /// Whether two templates come from the same finger.
    /// [`BackendError::Unsupported`] means the backend cannot cross-match
    /// and the caller treats the pair as matching.
    fn match_templates(&mut self, a: &Template, b: &Template) -> Result<bool, BackendError>;

    /// Close the reader. Must be idempotent-safe to call once; the
    /// registry guarantees exactly one call per opened handle.
    fn close(&mut self) -> Result<(), BackendError>;
}
