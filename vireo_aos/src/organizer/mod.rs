//! Organizer threads.
//!
//! Organizers turn raw runtime measurements into controller events. Each
//! runs on its own system thread that alternates between ACTIVE and
//! PASSIVE:
//!
//! ```text
//!            raise() / activate()
//!   PASSIVE ─────────────────────▶ ACTIVE ──┐ while take(): process
//!      ▲                                    │
//!      └──────── passivate(timeout) ◀───────┘
//! ```
//!
//! - [`method_sample`]: hot-method detection from sampled CMIDs
//! - [`call_density`]: prologue/epilogue vs. backedge sample ratio
//! - [`osr`]: on-stack-replacement requests from application threads

pub mod call_density;
pub mod method_sample;
pub mod osr;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

pub use call_density::{CallDensityListener, SampleSite};
pub use method_sample::MethodSampleOrganizer;
pub use osr::OsrOrganizer;

// =============================================================================
// Organizer Signal
// =============================================================================

/// Activation handshake between producers and one organizer thread.
///
/// `pending` is the durable signal. The wake-up is best effort: producers
/// that lose the test-and-set race on `queue_lock` simply skip the wake, and
/// the organizer's bounded sleep picks the work up later.
#[derive(Debug, Default)]
pub(crate) struct OrganizerSignal {
    pending: AtomicBool,
    queue_lock: AtomicBool,
    sleeping: Mutex<bool>,
    wake: Condvar,
    stopped: AtomicBool,
}

impl OrganizerSignal {
    /// Record work and try to wake the organizer.
    pub(crate) fn raise(&self) {
        self.pending.store(true, Ordering::Release);
        self.activate();
    }

    /// Wake the organizer if it is passive and the lock bit is free.
    /// Returns whether a sleeping organizer was woken.
    pub(crate) fn activate(&self) -> bool {
        if self.queue_lock.swap(true, Ordering::Acquire) {
            return false;
        }
        let woke = {
            let mut sleeping = self.sleeping.lock();
            let was = std::mem::replace(&mut *sleeping, false);
            if was {
                self.wake.notify_one();
            }
            was
        };
        self.queue_lock.store(false, Ordering::Release);
        woke
    }

    /// Consume the pending flag.
    #[inline]
    pub(crate) fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    /// Sleep until activated, stopped or `timeout` elapses.
    pub(crate) fn passivate(&self, timeout: Duration) {
        if self.queue_lock.swap(true, Ordering::Acquire) {
            // A producer is activating right now; stay active.
            return;
        }
        let mut sleeping = self.sleeping.lock();
        *sleeping = true;
        self.queue_lock.store(false, Ordering::Release);
        if !self.pending.load(Ordering::Acquire) && !self.is_stopped() {
            self.wake.wait_for(&mut sleeping, timeout);
        }
        *sleeping = false;
    }

    /// Make every current and future `passivate` return promptly.
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _sleeping = self.sleeping.lock();
        self.wake.notify_all();
    }

    #[inline]
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_pending_is_consumed_once() {
        let signal = OrganizerSignal::default();
        assert!(!signal.take());
        signal.raise();
        assert!(signal.take());
        assert!(!signal.take());
    }

    #[test]
    fn test_raise_wakes_passive_organizer() {
        let signal = Arc::new(OrganizerSignal::default());
        let organizer = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || {
                let start = Instant::now();
                signal.passivate(Duration::from_secs(10));
                start.elapsed()
            })
        };
        // Retry until the organizer is asleep and gets woken, or it skipped
        // sleeping because it saw the lock bit taken.
        while !organizer.is_finished() && !signal.activate() {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(organizer.join().unwrap() < Duration::from_secs(10));
    }

    #[test]
    fn test_passivate_returns_immediately_with_pending_work() {
        let signal = OrganizerSignal::default();
        signal.raise();
        let start = Instant::now();
        signal.passivate(Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(signal.take());
    }

    #[test]
    fn test_lost_wakeup_only_delays() {
        let signal = OrganizerSignal::default();
        // A producer holding the lock bit cannot wake anyone.
        signal.queue_lock.store(true, Ordering::Release);
        signal.pending.store(true, Ordering::Release);
        assert!(!signal.activate());
        signal.queue_lock.store(false, Ordering::Release);
        // The flag survives for the organizer's next pass.
        signal.passivate(Duration::from_millis(1));
        assert!(signal.take());
    }
}
