//! Backend error taxonomy

use thiserror::Error;

/// Fatal outcomes of a backend call. Guidance codes are not errors; they
/// travel in [`crate::AcquireStep::Guidance`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BackendError {
    /// Unspecified vendor SDK failure
    #[error("backend call failed")]
    Fail,

    /// The per-attempt deadline elapsed
    #[error("backend operation timed out")]
    Timeout,

    /// The backend found no readers
    #[error("no fingerprint device present")]
    NoDevice,

    /// A reader was enumerated but could not be opened
    #[error("failed to open fingerprint device")]
    OpenDeviceFail,

    /// The backend does not implement this entry point
    #[error("operation not supported by this backend")]
    Unsupported,
}
