//! Face Capture Pipeline
//!
//! Three cooperating worker loops move data from the camera to the
//! sample stage:
//! - capture: reads frames, publishes them on the live-data socket and
//!   hands a center-cropped copy to detection
//! - detection: runs face and eye detectors, publishes detected boxes
//!   and hands a face crop onward when exactly one face with both eyes
//!   is visible
//! - sample: quality-gates crops; enroll accumulates ten accepted
//!   samples, verify compares each crop against the stored images
//!
//! Every handoff is a single-slot lossy mailbox, so a busy consumer
//! drops frames instead of blocking the producer.

mod camera;
mod detect;
mod mailbox;
mod peer;
mod pipeline;
mod publisher;
pub mod wire;

pub use camera::{Frame, FrameSource, V4lCamera};
pub use detect::{EyeDetector, FaceBox, FaceDetector, GeometricEyeDetector, RustfaceDetector};
pub use mailbox::Mailbox;
pub use peer::{FaceComparator, PeerClient};
pub use pipeline::{
    FacePipeline, HINT_MOVE_BACK, HINT_MOVE_CLOSER, HINT_SAMPLE_OK, MSG_CAMERA_FAILED,
    MSG_FACE_CANCELLED, MSG_FACE_ENROLL_COMPLETE, MSG_FACE_ENROLL_FAILED, MSG_FACE_MATCHED,
    MSG_FACE_NOT_MATCHED,
};
pub use publisher::LiveDataPublisher;

use thiserror::Error;

/// Accepted samples needed to complete a face enrollment.
pub const FACE_SAMPLES_REQUIRED: usize = 10;

/// Side length a face crop should be close to before it is accepted.
pub const CROP_TARGET: u32 = 160;

/// Tolerated deviation from [`CROP_TARGET`], in pixels.
pub const CROP_TOLERANCE: u32 = 10;

/// Face pipeline error types
#[derive(Debug, Error)]
pub enum FaceError {
    /// Another face operation is already running
    #[error("face pipeline is busy")]
    Busy,

    /// Stop was requested while no operation was running
    #[error("no face operation in progress")]
    NotRunning,

    /// Camera produced something unusable
    #[error("camera error: {0}")]
    Camera(String),

    /// Detector model could not be loaded
    #[error("face detector error: {0}")]
    Detector(String),

    /// Comparison peer misbehaved
    #[error("comparison peer error: {0}")]
    Peer(String),

    /// Sample store failure
    #[error(transparent)]
    Store(#[from] template_store::StoreError),

    /// Socket or device I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Progress events emitted by the sample stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaceEvent {
    EnrollStatus {
        hint: String,
        id: Option<String>,
        progress: u8,
        done: bool,
    },
    VerifyStatus {
        message: String,
        matched: bool,
        done: bool,
    },
}

/// Where an individual crop falls against the accepted size band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CropQuality {
    Ok,
    TooSmall,
    TooLarge,
}

/// Classify a crop by its larger side against the target band
/// [`CROP_TARGET`] plus or minus [`CROP_TOLERANCE`].
pub fn crop_quality(width: u32, height: u32) -> CropQuality {
    let side = width.max(height);
    if side < CROP_TARGET - CROP_TOLERANCE {
        CropQuality::TooSmall
    } else if side > CROP_TARGET + CROP_TOLERANCE {
        CropQuality::TooLarge
    } else {
        CropQuality::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn quality_band_is_exactly_target_plus_minus_tolerance(
            width in 0u32..500,
            height in 0u32..500,
        ) {
            let side = width.max(height);
            let expected = if side < CROP_TARGET - CROP_TOLERANCE {
                CropQuality::TooSmall
            } else if side > CROP_TARGET + CROP_TOLERANCE {
                CropQuality::TooLarge
            } else {
                CropQuality::Ok
            };
            prop_assert_eq!(crop_quality(width, height), expected);
        }
    }

    #[test]
    fn band_edges_are_inclusive() {
        assert_eq!(crop_quality(CROP_TARGET - CROP_TOLERANCE, 10), CropQuality::Ok);
        assert_eq!(crop_quality(CROP_TARGET + CROP_TOLERANCE, 10), CropQuality::Ok);
        assert_eq!(
            crop_quality(CROP_TARGET - CROP_TOLERANCE - 1, 10),
            CropQuality::TooSmall
        );
        assert_eq!(
            crop_quality(CROP_TARGET + CROP_TOLERANCE + 1, 10),
            CropQuality::TooLarge
        );
    }
}
