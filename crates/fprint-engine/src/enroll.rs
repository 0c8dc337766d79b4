//! Enrollment worker
//!
//! COLLECT three cross-matching samples, MERGE them, self-verify the
//! composite against the first sample, then persist. A backend that runs
//! its own multi-sample enrollment internally short-circuits straight to
//! the save step with the template it returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use fprint_backend::{AcquireStep, ActiveDevice, BackendError, Device, Guidance, Template, POLL_INTERVAL};
use template_store::FingerprintStore;

use crate::{FprintEvent, ATTEMPT_TIMEOUT, MAX_RETRIES, SAMPLES_REQUIRED};

pub const PROMPT_PLACE_FINGER: &str = "Place your finger";
pub const PROMPT_PLACE_AGAIN: &str = "Place the same finger again";
pub const PROMPT_SAME_FINGER: &str = "Place the same finger";
pub const MSG_ENROLL_COMPLETE: &str = "Enrollment complete";
pub const MSG_ENROLL_CANCELLED: &str = "Enrollment cancelled";
pub const MSG_ENROLL_FAILED: &str = "Enrollment failed";
pub const MSG_TOO_MANY_RETRIES: &str = "Too many failed attempts";

/// One capture attempt, resolved by polling against a deadline.
pub(crate) enum Attempt {
    Step(AcquireStep),
    TimedOut,
    Cancelled,
}

/// Drive one capture attempt. The cancel flag is checked before every
/// poll, so a stop request is honored within one poll interval.
pub(crate) fn poll_acquire(
    device: &mut dyn Device,
    cancel: &AtomicBool,
) -> Result<Attempt, BackendError> {
    let deadline = Instant::now() + ATTEMPT_TIMEOUT;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return Ok(Attempt::Cancelled);
        }
        match device.acquire_step()? {
            AcquireStep::NotReady => {
                if Instant::now() >= deadline {
                    return Ok(Attempt::TimedOut);
                }
                thread::sleep(POLL_INTERVAL);
            }
            step => return Ok(Attempt::Step(step)),
        }
    }
}

pub(crate) fn run(
    mut active: ActiveDevice,
    cancel: Arc<AtomicBool>,
    events: UnboundedSender<FprintEvent>,
    store: Arc<FingerprintStore>,
) {
    drive(active.device.as_mut(), &cancel, &events, &store);
    if let Err(err) = active.close() {
        warn!(%err, "closing fingerprint device after enrollment");
    }
}

struct Reporter<'a> {
    events: &'a UnboundedSender<FprintEvent>,
    progress: u8,
}

impl Reporter<'_> {
    /// Raise progress for a completed collection stage. Clipped to 99:
    /// only a successful save reports 100.
    fn advance(&mut self, samples_collected: usize) {
        let stage = (samples_collected as u8).saturating_mul(25).min(99);
        self.progress = self.progress.max(stage);
    }

    fn status(&self, message: &str) {
        let _ = self.events.send(FprintEvent::EnrollStatus {
            message: message.to_string(),
            id: None,
            progress: self.progress,
            done: false,
        });
    }

    fn done(&self, message: &str, id: Option<String>, progress: u8) {
        let _ = self.events.send(FprintEvent::EnrollStatus {
            message: message.to_string(),
            id,
            progress,
            done: true,
        });
    }
}

fn drive(
    device: &mut dyn Device,
    cancel: &AtomicBool,
    events: &UnboundedSender<FprintEvent>,
    store: &FingerprintStore,
) {
    let mut reporter = Reporter {
        events,
        progress: 0,
    };
    let mut samples: Vec<Template> = Vec::with_capacity(SAMPLES_REQUIRED);
    let mut retries = 0u32;

    let composite = loop {
        if cancel.load(Ordering::SeqCst) {
            reporter.done(MSG_ENROLL_CANCELLED, None, reporter.progress);
            return;
        }

        reporter.status(if samples.is_empty() {
            PROMPT_PLACE_FINGER
        } else {
            PROMPT_PLACE_AGAIN
        });

        let attempt = match poll_acquire(device, cancel) {
            Ok(attempt) => attempt,
            Err(err) => {
                fail_or_cancel(&reporter, cancel, err, "enrollment capture");
                return;
            }
        };

        match attempt {
            Attempt::Cancelled => {
                reporter.done(MSG_ENROLL_CANCELLED, None, reporter.progress);
                return;
            }
            Attempt::TimedOut => {
                retries += 1;
                if retries > MAX_RETRIES {
                    reporter.done(MSG_TOO_MANY_RETRIES, None, reporter.progress);
                    return;
                }
                reporter.status(Guidance::Retry.prompt());
            }
            Attempt::Step(AcquireStep::Guidance(guidance)) => {
                retries += 1;
                if retries > MAX_RETRIES {
                    reporter.done(MSG_TOO_MANY_RETRIES, None, reporter.progress);
                    return;
                }
                reporter.status(guidance.prompt());
            }
            Attempt::Step(AcquireStep::NotReady) => {}
            Attempt::Step(AcquireStep::InternalComplete(template)) => {
                // Trusted only before any sample is collected; once the
                // cross-match chain has started it must run to the end.
                if samples.is_empty() {
                    debug!("backend completed enrollment internally");
                    break template;
                }
                warn!("ignoring internal completion mid-collection");
            }
            Attempt::Step(AcquireStep::Sample(template)) => {
                if let Some(first) = samples.first() {
                    match device.match_templates(&template, first) {
                        Ok(true) | Err(BackendError::Unsupported) => {}
                        Ok(false) => {
                            // A different finger restarts the collection
                            // but still draws from the retry budget, so
                            // a sensor that never captures two matching
                            // samples cannot loop forever.
                            samples.clear();
                            retries += 1;
                            if retries > MAX_RETRIES {
                                reporter.done(MSG_TOO_MANY_RETRIES, None, reporter.progress);
                                return;
                            }
                            reporter.status(PROMPT_SAME_FINGER);
                            continue;
                        }
                        Err(err) => {
                            fail_or_cancel(&reporter, cancel, err, "cross-match");
                            return;
                        }
                    }
                }

                samples.push(template);
                reporter.advance(samples.len());

                if samples.len() == SAMPLES_REQUIRED {
                    match merge_and_check(device, &samples) {
                        Ok(composite) => break composite,
                        Err(err) => {
                            fail_or_cancel(&reporter, cancel, err, "merge");
                            return;
                        }
                    }
                }
            }
        }
    };

    match store.save(composite.bytes()) {
        Ok(id) => {
            info!(identity = %id, "fingerprint enrolled");
            reporter.done(MSG_ENROLL_COMPLETE, Some(id), 100);
        }
        Err(err) => {
            warn!(%err, "persisting enrolled template");
            reporter.done(MSG_ENROLL_FAILED, None, reporter.progress);
        }
    }
}

/// Merge the three samples and confirm the composite still matches the
/// first capture before it is allowed to persist.
fn merge_and_check(
    device: &mut dyn Device,
    samples: &[Template],
) -> Result<Template, BackendError> {
    let composite = device.merge(&samples[0], &samples[1], &samples[2])?;
    match device.match_templates(&samples[0], &composite) {
        Ok(true) | Err(BackendError::Unsupported) => Ok(composite),
        Ok(false) => Err(BackendError::Fail),
        Err(err) => Err(err),
    }
}

/// Backends abort in-flight calls with an error once `acquire_stop` has
/// been issued; a set cancel flag reclassifies that exit as cancellation.
fn fail_or_cancel(reporter: &Reporter<'_>, cancel: &AtomicBool, err: BackendError, stage: &str) {
    if cancel.load(Ordering::SeqCst) {
        reporter.done(MSG_ENROLL_CANCELLED, None, reporter.progress);
    } else {
        warn!(%err, stage, "enrollment failed");
        reporter.done(MSG_ENROLL_FAILED, None, reporter.progress);
    }
}
