//! Scriptable mock backend (no hardware required)
//!
//! Mirrors how a real vendor adapter behaves so the engine and registry
//! can be exercised without a reader attached: acquire results are fed
//! from a script, merge concatenates the three samples the way simple
//! vendor SDKs do, and match compares raw bytes unless a scripted
//! verdict is queued.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{AcquireStep, Backend, BackendError, Device, Template};

#[derive(Default)]
struct MockState {
    device_count: usize,
    open_succeeds: bool,
    acquire_script: Mutex<VecDeque<Result<AcquireStep, BackendError>>>,
    match_script: Mutex<VecDeque<Result<bool, BackendError>>>,
    verify_script: Mutex<VecDeque<Result<usize, BackendError>>>,
    stop_requested: AtomicBool,
    init_calls: AtomicUsize,
    finalize_calls: AtomicUsize,
    probe_calls: AtomicUsize,
    open_attempts: AtomicUsize,
    close_calls: AtomicUsize,
}

/// In-memory backend driven by scripted responses.
pub struct MockBackend {
    name: String,
    state: Arc<MockState>,
}

impl MockBackend {
    /// One virtual reader that opens successfully.
    pub fn new(name: &str) -> Self {
        Self::build(name, 1, true)
    }

    /// A backend that enumerates `count` readers.
    pub fn with_devices(name: &str, count: usize) -> Self {
        Self::build(name, count, true)
    }

    /// A backend whose readers enumerate but never open (null handles).
    pub fn failing_open(name: &str, count: usize) -> Self {
        Self::build(name, count, false)
    }

    fn build(name: &str, device_count: usize, open_succeeds: bool) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(MockState {
                device_count,
                open_succeeds,
                ..MockState::default()
            }),
        }
    }

    /// Queue the next `acquire_step` outcome.
    pub fn push_acquire(&self, step: AcquireStep) {
        self.state
            .acquire_script
            .lock()
            .expect("script lock")
            .push_back(Ok(step));
    }

    /// Queue an `acquire_step` failure.
    pub fn push_acquire_err(&self, err: BackendError) {
        self.state
            .acquire_script
            .lock()
            .expect("script lock")
            .push_back(Err(err));
    }

    /// Queue the next `match_templates` verdict. Without a queued
    /// verdict the mock compares raw bytes.
    pub fn push_match(&self, verdict: Result<bool, BackendError>) {
        self.state
            .match_script
            .lock()
            .expect("script lock")
            .push_back(verdict);
    }

    /// Queue the next native `verify` outcome. Without one the mock
    /// reports `Unsupported`, forcing the acquire-and-match fallback.
    pub fn push_verify(&self, outcome: Result<usize, BackendError>) {
        self.state
            .verify_script
            .lock()
            .expect("script lock")
            .push_back(outcome);
    }

    /// How many times this backend was probed (`device_count` calls).
    pub fn probe_count(&self) -> usize {
        self.state.probe_calls.load(Ordering::Relaxed)
    }

    pub fn init_count(&self) -> usize {
        self.state.init_calls.load(Ordering::Relaxed)
    }

    pub fn finalize_count(&self) -> usize {
        self.state.finalize_calls.load(Ordering::Relaxed)
    }

    pub fn open_attempts(&self) -> usize {
        self.state.open_attempts.load(Ordering::Relaxed)
    }

    pub fn close_count(&self) -> usize {
        self.state.close_calls.load(Ordering::Relaxed)
    }

    /// Whether `acquire_stop` was requested on this backend.
    pub fn stop_requested(&self) -> bool {
        self.state.stop_requested.load(Ordering::Relaxed)
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self) -> Result<(), BackendError> {
        self.state.init_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn finalize(&self) -> Result<(), BackendError> {
        self.state.finalize_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn device_count(&self) -> Result<usize, BackendError> {
        self.state.probe_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.state.device_count)
    }

    fn open_device(&self, _index: usize) -> Option<Box<dyn Device>> {
        self.state.open_attempts.fetch_add(1, Ordering::Relaxed);
        if self.state.open_succeeds {
            Some(Box::new(MockDevice {
                state: Arc::clone(&self.state),
            }))
        } else {
            None
        }
    }

    fn acquire_stop(&self) {
        self.state.stop_requested.store(true, Ordering::Relaxed);
    }
}

struct MockDevice {
    state: Arc<MockState>,
}

impl Device for MockDevice {
    fn acquire_step(&mut self) -> Result<AcquireStep, BackendError> {
        self.state
            .acquire_script
            .lock()
            .expect("script lock")
            .pop_front()
            // An exhausted script behaves like a sensor with no finger
            // on it, which lets timeout paths be exercised.
            .unwrap_or(Ok(AcquireStep::NotReady))
    }

    fn verify(
        &mut self,
        _candidates: &[Template],
        _timeout: Duration,
    ) -> Result<usize, BackendError> {
        self.state
            .verify_script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(Err(BackendError::Unsupported))
    }

    fn merge(
        &mut self,
        first: &Template,
        second: &Template,
        third: &Template,
    ) -> Result<Template, BackendError> {
        let mut merged =
            Vec::with_capacity(first.len() + second.len() + third.len());
        merged.extend_from_slice(first.bytes());
        merged.extend_from_slice(second.bytes());
        merged.extend_from_slice(third.bytes());
        Ok(Template::new(merged))
    }

    fn match_templates(&mut self, a: &Template, b: &Template) -> Result<bool, BackendError> {
        if let Some(verdict) = self
            .state
            .match_script
            .lock()
            .expect("script lock")
            .pop_front()
        {
            return verdict;
        }
        // Merged templates contain their source samples, so prefix or
        // containment counts as a same-finger match.
        let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
        Ok(!short.is_empty()
            && long
                .bytes()
                .windows(short.len())
                .any(|window| window == short.bytes()))
    }

    fn close(&mut self) -> Result<(), BackendError> {
        self.state.close_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_concatenates_samples() {
        let backend = MockBackend::new("mock");
        let mut device = backend.open_device(0).expect("device");
        let merged = device
            .merge(
                &Template::new(vec![1, 2]),
                &Template::new(vec![3]),
                &Template::new(vec![4, 5]),
            )
            .expect("merge");
        assert_eq!(merged.bytes(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn default_match_is_containment() {
        let backend = MockBackend::new("mock");
        let mut device = backend.open_device(0).expect("device");
        let sample = Template::new(vec![3, 4]);
        let merged = Template::new(vec![1, 2, 3, 4, 5]);
        assert!(device.match_templates(&sample, &merged).expect("match"));
        assert!(!device
            .match_templates(&Template::new(vec![9]), &merged)
            .expect("match"));
    }

    #[test]
    fn exhausted_script_reads_as_not_ready() {
        let backend = MockBackend::new("mock");
        let mut device = backend.open_device(0).expect("device");
        assert_eq!(device.acquire_step(), Ok(AcquireStep::NotReady));
    }
}
