//! Face and eye detection seams
//!
//! The pipeline only ever talks to the two traits; `RustfaceDetector`
//! wraps the SeetaFace engine and `GeometricEyeDetector` places eye
//! regions anthropometrically inside a face box.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::FaceError;

/// Axis-aligned detection box in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

/// Finds faces in a grayscale plane.
pub trait FaceDetector: Send {
    fn detect_faces(&mut self, gray: &[u8], width: u32, height: u32) -> Vec<FaceBox>;
}

/// Finds eyes within one detected face.
pub trait EyeDetector: Send {
    fn detect_eyes(&mut self, gray: &[u8], width: u32, height: u32, face: &FaceBox) -> Vec<FaceBox>;
}

/// SeetaFace frontal detector loaded from a model file on disk.
pub struct RustfaceDetector {
    model: rustface::Model,
}

impl RustfaceDetector {
    pub fn from_model_file(path: &Path) -> Result<Self, FaceError> {
        let file = std::fs::File::open(path)?;
        let model = rustface::read_model(std::io::BufReader::new(file))
            .map_err(|err| FaceError::Detector(format!("{}: {err}", path.display())))?;
        debug!(model = %path.display(), "face detection model loaded");
        Ok(Self { model })
    }
}

impl FaceDetector for RustfaceDetector {
    fn detect_faces(&mut self, gray: &[u8], width: u32, height: u32) -> Vec<FaceBox> {
        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(20);
        detector.set_score_thresh(2.0);
        detector.set_pyramid_scale_factor(0.8);
        detector.set_slide_window_step(4, 4);

        detector
            .detect(&rustface::ImageData::new(gray, width, height))
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                FaceBox {
                    x: bbox.x(),
                    y: bbox.y(),
                    w: bbox.width(),
                    h: bbox.height(),
                }
            })
            .collect()
    }
}

/// Eye regions at fixed anthropometric positions: centers at 30% and
/// 70% of the face width, 38% of its height, each a quarter of the face
/// wide. Faces too small to hold two such regions yield nothing, which
/// the pipeline reads as "eyes not visible".
pub struct GeometricEyeDetector;

impl EyeDetector for GeometricEyeDetector {
    fn detect_eyes(
        &mut self,
        _gray: &[u8],
        _width: u32,
        _height: u32,
        face: &FaceBox,
    ) -> Vec<FaceBox> {
        let eye = face.w / 4;
        if eye == 0 || face.h / 4 == 0 {
            return Vec::new();
        }
        let eye_y = face.y + (face.h as i32 * 38) / 100 - (eye as i32 / 2);
        let left_x = face.x + (face.w as i32 * 30) / 100 - (eye as i32 / 2);
        let right_x = face.x + (face.w as i32 * 70) / 100 - (eye as i32 / 2);
        vec![
            FaceBox {
                x: left_x,
                y: eye_y,
                w: eye,
                h: eye,
            },
            FaceBox {
                x: right_x,
                y: eye_y,
                w: eye,
                h: eye,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometric_eyes_sit_inside_the_face() {
        let face = FaceBox {
            x: 40,
            y: 40,
            w: 160,
            h: 160,
        };
        let eyes = GeometricEyeDetector.detect_eyes(&[], 240, 240, &face);
        assert_eq!(eyes.len(), 2);
        for eye in &eyes {
            assert!(eye.x >= face.x);
            assert!(eye.y >= face.y);
            assert!(eye.x + eye.w as i32 <= face.x + face.w as i32);
            assert!(eye.y + eye.h as i32 <= face.y + face.h as i32);
        }
        assert!(eyes[0].x < eyes[1].x);
    }

    #[test]
    fn tiny_faces_have_no_detectable_eyes() {
        let face = FaceBox {
            x: 0,
            y: 0,
            w: 3,
            h: 3,
        };
        assert!(GeometricEyeDetector.detect_eyes(&[], 64, 64, &face).is_empty());
    }

    #[test]
    fn face_box_serializes_to_plain_fields() {
        let json = serde_json::to_string(&FaceBox {
            x: 1,
            y: 2,
            w: 3,
            h: 4,
        })
        .expect("serialize");
        assert_eq!(json, r#"{"x":1,"y":2,"w":3,"h":4}"#);
    }
}
