//! Single-slot lossy mailbox
//!
//! Producers never block: `try_offer` drops the value when the consumer
//! holds the slot, and overwrites a value the consumer has not picked up
//! yet, so the consumer always sees the freshest frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

const TAKE_WAIT: Duration = Duration::from_millis(100);

pub struct Mailbox<T> {
    slot: Mutex<Option<T>>,
    available: Condvar,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            available: Condvar::new(),
        }
    }

    /// Deposit a value without blocking. Returns false when the value
    /// was dropped because the consumer holds the slot.
    pub fn try_offer(&self, value: T) -> bool {
        match self.slot.try_lock() {
            Ok(mut slot) => {
                *slot = Some(value);
                self.available.notify_one();
                true
            }
            Err(_) => false,
        }
    }

    /// Wait for a value while `running` stays set. Re-checks the flag
    /// every [`TAKE_WAIT`], so a stopping pipeline wakes its consumers
    /// within one interval.
    pub fn take(&self, running: &AtomicBool) -> Option<T> {
        let mut slot = self.slot.lock().ok()?;
        loop {
            if let Some(value) = slot.take() {
                return Some(value);
            }
            if !running.load(Ordering::SeqCst) {
                return None;
            }
            slot = self.available.wait_timeout(slot, TAKE_WAIT).ok()?.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn offered_value_is_taken() {
        let mailbox = Mailbox::new();
        let running = AtomicBool::new(true);
        assert!(mailbox.try_offer(7));
        assert_eq!(mailbox.take(&running), Some(7));
    }

    #[test]
    fn newer_offer_replaces_an_unconsumed_one() {
        let mailbox = Mailbox::new();
        let running = AtomicBool::new(true);
        assert!(mailbox.try_offer(1));
        assert!(mailbox.try_offer(2));
        assert_eq!(mailbox.take(&running), Some(2));
    }

    #[test]
    fn take_returns_none_once_stopped() {
        let mailbox: Mailbox<u8> = Mailbox::new();
        let running = AtomicBool::new(false);
        assert_eq!(mailbox.take(&running), None);
    }

    #[test]
    fn stopping_wakes_a_blocked_consumer() {
        let mailbox: Arc<Mailbox<u8>> = Arc::new(Mailbox::new());
        let running = Arc::new(AtomicBool::new(true));

        let consumer = {
            let mailbox = Arc::clone(&mailbox);
            let running = Arc::clone(&running);
            std::thread::spawn(move || mailbox.take(&running))
        };

        std::thread::sleep(Duration::from_millis(50));
        running.store(false, Ordering::SeqCst);
        assert_eq!(consumer.join().expect("join"), None);
    }
}
