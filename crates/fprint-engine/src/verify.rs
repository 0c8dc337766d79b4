//! Verification worker
//!
//! Candidates are loaded before the worker spawns. Each attempt prefers
//! the backend's native multi-template verify; a backend without one
//! falls back to acquire-then-match against every candidate in order,
//! stopping at the first match. Guidance does not consume an attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use fprint_backend::{AcquireStep, ActiveDevice, BackendError, Device, Template};

use crate::enroll::{poll_acquire, Attempt, PROMPT_PLACE_FINGER};
use crate::{FprintEvent, ATTEMPT_TIMEOUT, MAX_RETRIES};

pub const MSG_MATCHED: &str = "Fingerprint matched";
pub const MSG_NOT_RECOGNIZED: &str = "Fingerprint not recognized";
pub const MSG_NO_MATCH_RETRY: &str = "No match, try again";
pub const MSG_VERIFY_CANCELLED: &str = "Verification cancelled";
pub const MSG_VERIFY_FAILED: &str = "Verification failed";

pub(crate) fn run(
    mut active: ActiveDevice,
    cancel: Arc<AtomicBool>,
    events: UnboundedSender<FprintEvent>,
    candidates: Vec<(String, Template)>,
) {
    drive(active.device.as_mut(), &cancel, &events, &candidates);
    if let Err(err) = active.close() {
        warn!(%err, "closing fingerprint device after verification");
    }
}

fn status(events: &UnboundedSender<FprintEvent>, message: &str) {
    let _ = events.send(FprintEvent::VerifyStatus {
        message: message.to_string(),
        id: None,
        matched: false,
        done: false,
    });
}

fn finish(events: &UnboundedSender<FprintEvent>, message: &str, id: Option<String>, matched: bool) {
    let _ = events.send(FprintEvent::VerifyStatus {
        message: message.to_string(),
        id,
        matched,
        done: true,
    });
}

enum AttemptResult {
    Matched(usize),
    NoMatch,
    Guidance(&'static str),
    Cancelled,
    Failed(BackendError),
}

fn drive(
    device: &mut dyn Device,
    cancel: &AtomicBool,
    events: &UnboundedSender<FprintEvent>,
    candidates: &[(String, Template)],
) {
    let templates: Vec<Template> = candidates
        .iter()
        .map(|(_, template)| template.clone())
        .collect();
    let mut native = true;
    let mut tries = 0u32;

    while tries < MAX_RETRIES {
        if cancel.load(Ordering::SeqCst) {
            finish(events, MSG_VERIFY_CANCELLED, None, false);
            return;
        }

        status(events, PROMPT_PLACE_FINGER);

        let result = if native {
            match device.verify(&templates, ATTEMPT_TIMEOUT) {
                Ok(index) => AttemptResult::Matched(index),
                Err(BackendError::Unsupported) => {
                    native = false;
                    continue;
                }
                Err(BackendError::Fail) | Err(BackendError::Timeout) => AttemptResult::NoMatch,
                Err(err) => AttemptResult::Failed(err),
            }
        } else {
            fallback_attempt(device, cancel, &templates)
        };

        match result {
            AttemptResult::Matched(index) => {
                let id = &candidates[index].0;
                info!(identity = %id, "fingerprint verified");
                finish(events, MSG_MATCHED, Some(id.clone()), true);
                return;
            }
            AttemptResult::NoMatch => {
                tries += 1;
                if tries < MAX_RETRIES {
                    status(events, MSG_NO_MATCH_RETRY);
                }
            }
            AttemptResult::Guidance(prompt) => {
                status(events, prompt);
            }
            AttemptResult::Cancelled => {
                finish(events, MSG_VERIFY_CANCELLED, None, false);
                return;
            }
            AttemptResult::Failed(err) => {
                if cancel.load(Ordering::SeqCst) {
                    finish(events, MSG_VERIFY_CANCELLED, None, false);
                } else {
                    warn!(%err, "verification failed");
                    finish(events, MSG_VERIFY_FAILED, None, false);
                }
                return;
            }
        }
    }

    // Exhausting the attempt budget is a no-match, not a cancellation.
    finish(events, MSG_NOT_RECOGNIZED, None, false);
}

/// Capture one sample and match it against each candidate in load order.
fn fallback_attempt(
    device: &mut dyn Device,
    cancel: &AtomicBool,
    templates: &[Template],
) -> AttemptResult {
    let sample = match poll_acquire(device, cancel) {
        Ok(Attempt::Cancelled) => return AttemptResult::Cancelled,
        Ok(Attempt::TimedOut) => return AttemptResult::NoMatch,
        Ok(Attempt::Step(AcquireStep::Guidance(guidance))) => {
            return AttemptResult::Guidance(guidance.prompt())
        }
        Ok(Attempt::Step(AcquireStep::Sample(template)))
        | Ok(Attempt::Step(AcquireStep::InternalComplete(template))) => template,
        Ok(Attempt::Step(AcquireStep::NotReady)) => return AttemptResult::NoMatch,
        Err(err) => return AttemptResult::Failed(err),
    };

    for (index, candidate) in templates.iter().enumerate() {
        match device.match_templates(&sample, candidate) {
            Ok(true) => return AttemptResult::Matched(index),
            Ok(false) | Err(BackendError::Unsupported) => {}
            Err(err) => return AttemptResult::Failed(err),
        }
    }
    AttemptResult::NoMatch
}
