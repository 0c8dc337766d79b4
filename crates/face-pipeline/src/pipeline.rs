//! Pipeline orchestration
//!
//! Owns the worker threads and the single-operation gate. `start_*`
//! wires capture, detection and the mode's sample stage together;
//! `stop` tears the whole chain down and releases the camera.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use image::RgbImage;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use template_store::FaceStore;

use crate::camera::{Frame, FrameSource};
use crate::detect::{EyeDetector, FaceBox, FaceDetector};
use crate::mailbox::Mailbox;
use crate::peer::FaceComparator;
use crate::publisher::LiveDataPublisher;
use crate::{crop_quality, wire, CropQuality, FaceError, FaceEvent, FACE_SAMPLES_REQUIRED};

pub const HINT_SAMPLE_OK: &str = "Sample captured, hold still";
pub const HINT_MOVE_CLOSER: &str = "Move closer to the camera";
pub const HINT_MOVE_BACK: &str = "Move back from the camera";
pub const MSG_FACE_ENROLL_COMPLETE: &str = "Face enrollment complete";
pub const MSG_FACE_ENROLL_FAILED: &str = "Face enrollment failed";
pub const MSG_FACE_MATCHED: &str = "Face matched";
pub const MSG_FACE_NOT_MATCHED: &str = "Face not recognized";
pub const MSG_FACE_CANCELLED: &str = "Face operation cancelled";
pub const MSG_CAMERA_FAILED: &str = "Camera stopped producing frames";

const MODE_IDLE: u8 = 0;
const MODE_ENROLL: u8 = 1;
const MODE_VERIFY: u8 = 2;

/// Consecutive camera failures tolerated before the session aborts.
const MAX_CAMERA_FAILURES: u32 = 10;

type CameraFactory = Box<dyn Fn() -> Result<Box<dyn FrameSource>, FaceError> + Send + Sync>;
type DetectorFactory =
    Box<dyn Fn() -> Result<(Box<dyn FaceDetector>, Box<dyn EyeDetector>), FaceError> + Send + Sync>;

pub struct FacePipeline {
    mode: AtomicU8,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    camera: CameraFactory,
    detectors: DetectorFactory,
    comparator: Arc<dyn FaceComparator>,
    publisher: Arc<LiveDataPublisher>,
    store: Arc<FaceStore>,
}

impl FacePipeline {
    pub fn new(
        camera: impl Fn() -> Result<Box<dyn FrameSource>, FaceError> + Send + Sync + 'static,
        detectors: impl Fn() -> Result<(Box<dyn FaceDetector>, Box<dyn EyeDetector>), FaceError>
            + Send
            + Sync
            + 'static,
        comparator: Arc<dyn FaceComparator>,
        publisher: Arc<LiveDataPublisher>,
        store: Arc<FaceStore>,
    ) -> Self {
        Self {
            mode: AtomicU8::new(MODE_IDLE),
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
            camera: Box::new(camera),
            detectors: Box::new(detectors),
            comparator,
            publisher,
            store,
        }
    }

    pub fn store(&self) -> &Arc<FaceStore> {
        &self.store
    }

    pub fn is_idle(&self) -> bool {
        self.mode.load(Ordering::SeqCst) == MODE_IDLE
    }

    /// Begin collecting enrollment samples.
    pub fn start_enroll(&self, events: UnboundedSender<FaceEvent>) -> Result<(), FaceError> {
        self.begin(MODE_ENROLL)?;
        let store = Arc::clone(&self.store);
        let enroll_events = events.clone();
        let running = Arc::clone(&self.running);
        let failure = FaceEvent::EnrollStatus {
            hint: MSG_CAMERA_FAILED.to_string(),
            id: None,
            progress: 0,
            done: true,
        };
        self.launch(failure, events, move |sample_mb| {
            enroll_stage(&running, &sample_mb, &store, &enroll_events)
        })
    }

    /// Begin live verification against one enrolled identity.
    pub fn start_verify(
        &self,
        target: &str,
        events: UnboundedSender<FaceEvent>,
    ) -> Result<(), FaceError> {
        self.begin(MODE_VERIFY)?;
        let stored = match self.load_target(target) {
            Ok(stored) => stored,
            Err(err) => {
                self.mode.store(MODE_IDLE, Ordering::SeqCst);
                return Err(err);
            }
        };

        let comparator = Arc::clone(&self.comparator);
        let verify_events = events.clone();
        let running = Arc::clone(&self.running);
        let failure = FaceEvent::VerifyStatus {
            message: MSG_CAMERA_FAILED.to_string(),
            matched: false,
            done: true,
        };
        self.launch(failure, events, move |sample_mb| {
            verify_stage(&running, &sample_mb, comparator.as_ref(), &stored, &verify_events)
        })
    }

    /// Tear the running operation down: clear the running flag, join all
    /// worker threads, release the camera, return to idle.
    pub fn stop(&self) -> Result<(), FaceError> {
        if self.mode.load(Ordering::SeqCst) == MODE_IDLE {
            return Err(FaceError::NotRunning);
        }
        self.running.store(false, Ordering::SeqCst);
        self.join_workers();
        self.mode.store(MODE_IDLE, Ordering::SeqCst);
        info!("face pipeline stopped");
        Ok(())
    }

    fn begin(&self, mode: u8) -> Result<(), FaceError> {
        if self
            .mode
            .compare_exchange(MODE_IDLE, mode, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Ok(());
        }

        // A session that completed on its own leaves the mode set until
        // someone joins its workers; reap it and retry once.
        if !self.running.load(Ordering::SeqCst) {
            let finished = self
                .workers
                .lock()
                .map(|workers| workers.iter().all(JoinHandle::is_finished))
                .unwrap_or(false);
            if finished {
                self.join_workers();
                self.mode.store(MODE_IDLE, Ordering::SeqCst);
                if self
                    .mode
                    .compare_exchange(MODE_IDLE, mode, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return Ok(());
                }
            }
        }
        Err(FaceError::Busy)
    }

    /// Open the camera and detectors, then spawn the three loops. Setup
    /// failures roll the mode back so the pipeline stays startable.
    fn launch<F>(
        &self,
        capture_failure: FaceEvent,
        events: UnboundedSender<FaceEvent>,
        sample_stage: F,
    ) -> Result<(), FaceError>
    where
        F: FnOnce(Arc<Mailbox<Frame>>) + Send + 'static,
    {
        let setup = (self.camera)().and_then(|camera| {
            let detectors = (self.detectors)()?;
            Ok((camera, detectors))
        });
        let (camera, (face_detector, eye_detector)) = match setup {
            Ok(parts) => parts,
            Err(err) => {
                self.mode.store(MODE_IDLE, Ordering::SeqCst);
                return Err(err);
            }
        };

        self.running.store(true, Ordering::SeqCst);
        let detect_mb: Arc<Mailbox<Frame>> = Arc::new(Mailbox::new());
        let sample_mb: Arc<Mailbox<Frame>> = Arc::new(Mailbox::new());

        let mut spawned: Vec<JoinHandle<()>> = Vec::with_capacity(3);

        let capture_running = Arc::clone(&self.running);
        let capture_publisher = Arc::clone(&self.publisher);
        let capture_mb = Arc::clone(&detect_mb);
        match thread::Builder::new()
            .name("face-capture".to_string())
            .spawn(move || {
                capture_stage(
                    camera,
                    &capture_running,
                    &capture_publisher,
                    &capture_mb,
                    capture_failure,
                    &events,
                )
            }) {
            Ok(handle) => spawned.push(handle),
            Err(err) => return self.abort_launch(spawned, err.into()),
        }

        let detect_running = Arc::clone(&self.running);
        let detect_publisher = Arc::clone(&self.publisher);
        let detect_out = Arc::clone(&sample_mb);
        match thread::Builder::new()
            .name("face-detect".to_string())
            .spawn(move || {
                detect_stage(
                    face_detector,
                    eye_detector,
                    &detect_running,
                    &detect_mb,
                    &detect_out,
                    &detect_publisher,
                )
            }) {
            Ok(handle) => spawned.push(handle),
            Err(err) => return self.abort_launch(spawned, err.into()),
        }

        match thread::Builder::new()
            .name("face-sample".to_string())
            .spawn(move || sample_stage(sample_mb))
        {
            Ok(handle) => spawned.push(handle),
            Err(err) => return self.abort_launch(spawned, err.into()),
        }

        match self.workers.lock() {
            Ok(mut workers) => workers.extend(spawned),
            Err(_) => return self.abort_launch(spawned, FaceError::Busy),
        }

        Ok(())
    }

    /// A launch that fails after some workers are already looping must
    /// not leave the mode claimed with nothing for `stop` to reach.
    fn abort_launch(&self, spawned: Vec<JoinHandle<()>>, err: FaceError) -> Result<(), FaceError> {
        self.running.store(false, Ordering::SeqCst);
        for handle in spawned {
            if handle.join().is_err() {
                warn!("face pipeline worker panicked");
            }
        }
        self.mode.store(MODE_IDLE, Ordering::SeqCst);
        Err(err)
    }

    fn join_workers(&self) {
        let handles: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(_) => return,
        };
        for handle in handles {
            if handle.join().is_err() {
                warn!("face pipeline worker panicked");
            }
        }
    }

    fn load_target(&self, target: &str) -> Result<Vec<Frame>, FaceError> {
        let images = self.store.load_images(target)?;
        if images.is_empty() {
            return Err(FaceError::Store(template_store::StoreError::NotFound(
                target.to_string(),
            )));
        }
        Ok(images.iter().map(Frame::from_image).collect())
    }
}

/// Capture loop: publish every frame, hand a centered square crop to
/// detection. Persistent camera failure aborts the whole session.
fn capture_stage(
    mut camera: Box<dyn FrameSource>,
    running: &AtomicBool,
    publisher: &LiveDataPublisher,
    detect_mb: &Mailbox<Frame>,
    failure: FaceEvent,
    events: &UnboundedSender<FaceEvent>,
) {
    let mut failures = 0u32;
    while running.load(Ordering::SeqCst) {
        match camera.next_frame() {
            Ok(frame) => {
                failures = 0;
                publisher.publish(&wire::encode_frame(&frame));
                detect_mb.try_offer(frame.center_square());
            }
            Err(err) => {
                failures += 1;
                warn!(%err, failures, "camera read failed");
                if failures >= MAX_CAMERA_FAILURES {
                    let _ = events.send(failure);
                    running.store(false, Ordering::SeqCst);
                    return;
                }
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

/// Detection loop: exactly one face with both eyes visible forwards a
/// face crop to the sample stage.
fn detect_stage(
    mut faces: Box<dyn FaceDetector>,
    mut eyes: Box<dyn EyeDetector>,
    running: &AtomicBool,
    detect_mb: &Mailbox<Frame>,
    sample_mb: &Mailbox<Frame>,
    publisher: &LiveDataPublisher,
) {
    while let Some(frame) = detect_mb.take(running) {
        let gray = frame.to_grayscale();
        let found = faces.detect_faces(&gray, frame.width, frame.height);
        match wire::encode_boxes(&found) {
            Ok(message) => publisher.publish(&message),
            Err(err) => warn!(%err, "cannot encode detected boxes"),
        }

        if found.len() != 1 {
            continue;
        }
        let face = found[0];
        if eyes.detect_eyes(&gray, frame.width, frame.height, &face).len() != 2 {
            continue;
        }
        if let Some(crop) = clamp_crop(&frame, &face) {
            sample_mb.try_offer(crop);
        }
    }
}

fn enroll_stage(
    running: &AtomicBool,
    sample_mb: &Mailbox<Frame>,
    store: &FaceStore,
    events: &UnboundedSender<FaceEvent>,
) {
    let mut samples: Vec<RgbImage> = Vec::new();
    let mut completed = false;

    while let Some(crop) = sample_mb.take(running) {
        match crop_quality(crop.width, crop.height) {
            CropQuality::TooSmall => hint(events, HINT_MOVE_CLOSER, samples.len()),
            CropQuality::TooLarge => hint(events, HINT_MOVE_BACK, samples.len()),
            CropQuality::Ok => {
                let Some(image) = crop.to_image() else {
                    continue;
                };
                samples.push(image);
                hint(events, HINT_SAMPLE_OK, samples.len());

                if samples.len() == FACE_SAMPLES_REQUIRED {
                    match store.save_samples(&samples) {
                        Ok(id) => {
                            info!(identity = %id, "face enrolled");
                            let _ = events.send(FaceEvent::EnrollStatus {
                                hint: MSG_FACE_ENROLL_COMPLETE.to_string(),
                                id: Some(id),
                                progress: 100,
                                done: true,
                            });
                        }
                        Err(err) => {
                            warn!(%err, "persisting face samples");
                            let _ = events.send(FaceEvent::EnrollStatus {
                                hint: MSG_FACE_ENROLL_FAILED.to_string(),
                                id: None,
                                progress: (samples.len() * 10).min(99) as u8,
                                done: true,
                            });
                        }
                    }
                    completed = true;
                    running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
    }

    if !completed {
        let _ = events.send(FaceEvent::EnrollStatus {
            hint: MSG_FACE_CANCELLED.to_string(),
            id: None,
            progress: ((samples.len() * 10).min(99)) as u8,
            done: true,
        });
    }
}

fn hint(events: &UnboundedSender<FaceEvent>, hint: &str, accepted: usize) {
    let _ = events.send(FaceEvent::EnrollStatus {
        hint: hint.to_string(),
        id: None,
        progress: ((accepted * 10).min(99)) as u8,
        done: false,
    });
}

/// Verify loop: compare each accepted crop against every stored image,
/// stopping at the first match, and keep reporting until stopped.
fn verify_stage(
    running: &AtomicBool,
    sample_mb: &Mailbox<Frame>,
    comparator: &dyn FaceComparator,
    stored: &[Frame],
    events: &UnboundedSender<FaceEvent>,
) {
    while let Some(crop) = sample_mb.take(running) {
        if crop_quality(crop.width, crop.height) != CropQuality::Ok {
            continue;
        }

        let mut matched = false;
        for image in stored {
            match comparator.compare(&crop, image) {
                Ok(true) => {
                    matched = true;
                    break;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(%err, "comparison peer failed");
                    break;
                }
            }
        }

        let _ = events.send(FaceEvent::VerifyStatus {
            message: if matched {
                MSG_FACE_MATCHED.to_string()
            } else {
                MSG_FACE_NOT_MATCHED.to_string()
            },
            matched,
            done: false,
        });
    }

    let _ = events.send(FaceEvent::VerifyStatus {
        message: MSG_FACE_CANCELLED.to_string(),
        matched: false,
        done: true,
    });
}

fn clamp_crop(frame: &Frame, face: &FaceBox) -> Option<Frame> {
    let x = face.x.max(0) as u32;
    let y = face.y.max(0) as u32;
    if x >= frame.width || y >= frame.height {
        return None;
    }
    let width = face.w.min(frame.width - x);
    let height = face.h.min(frame.height - y);
    frame.crop(x, y, width, height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    struct SyntheticCamera {
        frame: Frame,
    }

    impl FrameSource for SyntheticCamera {
        fn next_frame(&mut self) -> Result<Frame, FaceError> {
            // A real camera paces the loop; the stub does it here.
            thread::sleep(Duration::from_millis(1));
            Ok(self.frame.clone())
        }
    }

    struct FixedFaceDetector {
        face: FaceBox,
    }

    impl FaceDetector for FixedFaceDetector {
        fn detect_faces(&mut self, _gray: &[u8], _w: u32, _h: u32) -> Vec<FaceBox> {
            vec![self.face]
        }
    }

    struct AlwaysEyes;

    impl EyeDetector for AlwaysEyes {
        fn detect_eyes(&mut self, _gray: &[u8], _w: u32, _h: u32, face: &FaceBox) -> Vec<FaceBox> {
            vec![*face, *face]
        }
    }

    struct FixedComparator {
        verdict: bool,
    }

    impl FaceComparator for FixedComparator {
        fn compare(&self, _live: &Frame, _stored: &Frame) -> Result<bool, FaceError> {
            Ok(self.verdict)
        }
    }

    fn build(
        dir: &tempfile::TempDir,
        face: FaceBox,
        verdict: bool,
    ) -> FacePipeline {
        let publisher =
            Arc::new(LiveDataPublisher::bind(dir.path().join("live.sock")).expect("bind"));
        let store = Arc::new(FaceStore::new(dir.path().join("faces")));
        let frame = Frame::new(vec![128; 240 * 240 * 3], 240, 240);
        FacePipeline::new(
            move || {
                Ok(Box::new(SyntheticCamera {
                    frame: frame.clone(),
                }) as Box<dyn FrameSource>)
            },
            move || {
                Ok((
                    Box::new(FixedFaceDetector { face }) as Box<dyn FaceDetector>,
                    Box::new(AlwaysEyes) as Box<dyn EyeDetector>,
                ))
            },
            Arc::new(FixedComparator { verdict }),
            publisher,
            store,
        )
    }

    fn wait_for<F>(rx: &mut UnboundedReceiver<FaceEvent>, predicate: F) -> FaceEvent
    where
        F: Fn(&FaceEvent) -> bool,
    {
        loop {
            let event = rx.blocking_recv().expect("event stream ended");
            if predicate(&event) {
                return event;
            }
        }
    }

    fn in_band_face() -> FaceBox {
        FaceBox {
            x: 40,
            y: 40,
            w: 160,
            h: 160,
        }
    }

    #[test]
    fn enrollment_collects_ten_samples_and_persists_them() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = build(&dir, in_band_face(), false);
        let (tx, mut rx) = unbounded_channel();

        pipeline.start_enroll(tx).expect("start");
        let done = wait_for(&mut rx, |event| {
            matches!(event, FaceEvent::EnrollStatus { done: true, .. })
        });
        pipeline.stop().expect("stop");

        let FaceEvent::EnrollStatus {
            hint, id, progress, ..
        } = done
        else {
            panic!("wrong event kind");
        };
        assert_eq!(hint, MSG_FACE_ENROLL_COMPLETE);
        assert_eq!(progress, 100);

        let id = id.expect("identity");
        let images = pipeline.store().list_images(&id).expect("list");
        assert_eq!(images.len(), FACE_SAMPLES_REQUIRED);
    }

    #[test]
    fn out_of_band_crops_only_produce_hints() {
        let dir = tempfile::tempdir().expect("tempdir");
        let small_face = FaceBox {
            x: 40,
            y: 40,
            w: 80,
            h: 80,
        };
        let pipeline = build(&dir, small_face, false);
        let (tx, mut rx) = unbounded_channel();

        pipeline.start_enroll(tx).expect("start");
        let event = wait_for(&mut rx, |event| {
            matches!(event, FaceEvent::EnrollStatus { done: false, .. })
        });
        pipeline.stop().expect("stop");

        let FaceEvent::EnrollStatus { hint, progress, .. } = event else {
            panic!("wrong event kind");
        };
        assert_eq!(hint, HINT_MOVE_CLOSER);
        assert_eq!(progress, 0);
    }

    #[test]
    fn verify_reports_a_match_against_stored_samples() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = build(&dir, in_band_face(), true);
        let image = RgbImage::from_pixel(160, 160, image::Rgb([1, 2, 3]));
        let id = pipeline
            .store()
            .save_samples(&[image])
            .expect("seed enrollment");

        let (tx, mut rx) = unbounded_channel();
        pipeline.start_verify(&id, tx).expect("start");
        let event = wait_for(&mut rx, |event| {
            matches!(event, FaceEvent::VerifyStatus { .. })
        });
        pipeline.stop().expect("stop");

        assert_eq!(
            event,
            FaceEvent::VerifyStatus {
                message: MSG_FACE_MATCHED.to_string(),
                matched: true,
                done: false,
            }
        );
    }

    #[test]
    fn verify_against_unknown_identity_fails_synchronously() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = build(&dir, in_band_face(), true);
        let (tx, _rx) = unbounded_channel();

        let id = template_store::identity_hash(b"nobody");
        let err = pipeline.start_verify(&id, tx).expect_err("unknown identity");
        assert!(matches!(err, FaceError::Store(_)));
        assert!(pipeline.is_idle());
    }

    #[test]
    fn second_start_is_rejected_while_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = build(&dir, in_band_face(), false);
        let (tx, _rx) = unbounded_channel();
        let (tx2, _rx2) = unbounded_channel();

        pipeline.start_enroll(tx).expect("start");
        assert!(matches!(
            pipeline.start_enroll(tx2),
            Err(FaceError::Busy)
        ));
        pipeline.stop().expect("stop");
        assert!(pipeline.is_idle());
    }

    #[test]
    fn failed_launch_rolls_back_to_idle_and_stays_startable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = build(&dir, in_band_face(), false);

        // Claim the mode and start one looping worker, then drive the
        // abort path the way a failed spawn does mid-launch.
        pipeline.begin(MODE_ENROLL).expect("claim");
        pipeline.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&pipeline.running);
        let worker = thread::Builder::new()
            .name("face-capture".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
            })
            .expect("spawn");

        let io = std::io::Error::new(std::io::ErrorKind::Other, "no more threads");
        let err = pipeline
            .abort_launch(vec![worker], FaceError::Io(io))
            .expect_err("launch aborted");
        assert!(matches!(err, FaceError::Io(_)));
        assert!(pipeline.is_idle());
        assert!(!pipeline.running.load(Ordering::SeqCst));

        // The rollback left nothing claimed, so a fresh start works.
        let (tx, _rx) = unbounded_channel();
        pipeline.start_enroll(tx).expect("startable again");
        pipeline.stop().expect("stop");
    }

    #[test]
    fn stop_without_a_running_operation_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = build(&dir, in_band_face(), false);
        assert!(matches!(pipeline.stop(), Err(FaceError::NotRunning)));
    }
}
