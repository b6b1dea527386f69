//! Method-sample organizer.
//!
//! Application threads record the CMID executing at each timer sample into a
//! small buffer. When the buffer is full the organizer folds it into the
//! cumulative sample table and reports every distinct sampled method to the
//! controller, with its cumulative sample count as the event priority.
//!
//! Code that cannot be improved is filtered out: trap code, and opt code at
//! or above the filter opt level.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use vireo_core::{Cmid, CompilerTier, OptLevel, VireoError, VireoResult};
use vireo_jit::CompiledMethodRegistry;

use super::OrganizerSignal;
use crate::event::{ControllerEvent, HotMethodEvent};
use crate::listener::AosEventListener;
use crate::queue::PriorityQueue;

/// Organizer turning sampled CMIDs into hot-method events.
pub struct MethodSampleOrganizer {
    buffer: Mutex<Vec<Cmid>>,
    capacity: usize,
    samples: Mutex<FxHashMap<Cmid, f64>>,
    filter_opt_level: OptLevel,
    signal: OrganizerSignal,
    park_timeout: Duration,
    registry: Arc<CompiledMethodRegistry>,
    queue: Arc<PriorityQueue<ControllerEvent>>,
    listener: Arc<dyn AosEventListener>,
}

impl MethodSampleOrganizer {
    /// Organizer reporting after every `capacity` samples.
    pub fn new(
        capacity: usize,
        filter_opt_level: OptLevel,
        park_timeout: Duration,
        registry: Arc<CompiledMethodRegistry>,
        queue: Arc<PriorityQueue<ControllerEvent>>,
        listener: Arc<dyn AosEventListener>,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            samples: Mutex::new(FxHashMap::default()),
            filter_opt_level,
            signal: OrganizerSignal::default(),
            park_timeout,
            registry,
            queue,
            listener,
        }
    }

    /// Record one sample. Returns `true` when this sample filled the
    /// buffer. Samples arriving while the buffer is full are dropped.
    pub fn record_sample(&self, cmid: Cmid) -> bool {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.capacity {
            return false;
        }
        buffer.push(cmid);
        let full = buffer.len() == self.capacity;
        drop(buffer);
        if full {
            self.signal.raise();
        }
        full
    }

    /// Cumulative samples attributed to `cmid`.
    pub fn sample_count(&self, cmid: Cmid) -> f64 {
        self.samples.lock().get(&cmid).copied().unwrap_or(0.0)
    }

    /// Forget the samples of `cmid`, e.g. once it has been replaced.
    pub fn reset_samples(&self, cmid: Cmid) {
        self.samples.lock().remove(&cmid);
        if let Some(cm) = self.registry.get(cmid) {
            cm.set_samples_reset();
        }
    }

    /// Drop the cumulative samples of code a sweep reclaimed.
    pub fn forget_reclaimed(&self, reclaimed: &[Cmid]) {
        if reclaimed.is_empty() {
            return;
        }
        let mut samples = self.samples.lock();
        for cmid in reclaimed {
            samples.remove(cmid);
        }
    }

    /// Number of CMIDs with cumulative samples.
    pub fn tracked_methods(&self) -> usize {
        self.samples.lock().len()
    }

    fn is_filtered(&self, tier: CompilerTier) -> bool {
        match tier {
            CompilerTier::Trap => true,
            CompilerTier::Opt { level } => level >= self.filter_opt_level,
            _ => false,
        }
    }

    /// Process the current buffer. Returns the number of events queued.
    pub fn threshold_reached(&self) -> usize {
        let batch = std::mem::take(&mut *self.buffer.lock());
        if batch.is_empty() {
            return 0;
        }
        self.listener.organizer_threshold_reached(batch.len());

        let mut unique: SmallVec<[Cmid; 16]> = SmallVec::new();
        {
            let mut samples = self.samples.lock();
            for &cmid in &batch {
                *samples.entry(cmid).or_insert(0.0) += 1.0;
                if !unique.contains(&cmid) {
                    unique.push(cmid);
                }
            }
        }

        let mut queued = 0;
        for cmid in unique {
            // Already reclaimed code produces no event.
            let Some(cm) = self.registry.get(cmid) else {
                continue;
            };
            if self.is_filtered(cm.tier()) {
                continue;
            }
            let ns = self.sample_count(cmid);
            let event = HotMethodEvent::new(cm, ns);
            self.listener.controller_notified_for_hotness(&event);
            if self.queue.insert(ns, event.into()) {
                queued += 1;
            }
        }
        queued
    }

    /// Organizer loop: process each full buffer, sleep in between.
    pub fn run(&self) {
        debug!(target: "vireo::aos", "method sample organizer started filter_opt_level={}", self.filter_opt_level);
        while !self.signal.is_stopped() {
            while self.signal.take() {
                self.threshold_reached();
            }
            self.signal.passivate(self.park_timeout);
        }
    }

    /// Run the loop on a dedicated thread.
    pub fn spawn(self: &Arc<Self>) -> VireoResult<JoinHandle<()>> {
        let organizer = Arc::clone(self);
        thread::Builder::new()
            .name("vireo-method-sample-organizer".into())
            .spawn(move || organizer.run())
            .map_err(|e| {
                error!(target: "vireo::aos", "failed to spawn method sample organizer: {e}");
                VireoError::ThreadSpawn {
                    name: "vireo-method-sample-organizer",
                    reason: e.to_string(),
                }
            })
    }

    /// Make [`run`](Self::run) return.
    pub fn stop(&self) {
        self.signal.stop();
    }
}

impl std::fmt::Debug for MethodSampleOrganizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodSampleOrganizer")
            .field("capacity", &self.capacity)
            .field("filter_opt_level", &self.filter_opt_level)
            .field("buffered", &self.buffer.lock().len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::NullListener;
    use vireo_core::{MethodId, MethodInfo, TypeId, TypeInfo};

    struct Fixture {
        registry: Arc<CompiledMethodRegistry>,
        queue: Arc<PriorityQueue<ControllerEvent>>,
        organizer: MethodSampleOrganizer,
    }

    fn fixture(capacity: usize) -> Fixture {
        let registry = Arc::new(CompiledMethodRegistry::for_testing());
        let queue = Arc::new(PriorityQueue::new());
        let organizer = MethodSampleOrganizer::new(
            capacity,
            2,
            Duration::from_millis(5),
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::new(NullListener),
        );
        Fixture {
            registry,
            queue,
            organizer,
        }
    }

    fn create(fx: &Fixture, id: u32, tier: CompilerTier) -> Cmid {
        let m = MethodInfo::new(MethodId(id), "s", TypeInfo::new(TypeId(1), "demo.M")).into_ref();
        fx.registry.create(m, tier).unwrap().id()
    }

    fn drain(queue: &PriorityQueue<ControllerEvent>) -> Vec<(f64, Cmid)> {
        std::iter::from_fn(|| queue.try_take())
            .map(|(p, e)| match e {
                ControllerEvent::HotMethod(h) => (p, h.cmid()),
                other => panic!("unexpected {}", other.kind()),
            })
            .collect()
    }

    #[test]
    fn test_buffer_fills_then_drops() {
        let fx = fixture(2);
        let a = create(&fx, 1, CompilerTier::Baseline);
        assert!(!fx.organizer.record_sample(a));
        assert!(fx.organizer.record_sample(a));
        assert!(!fx.organizer.record_sample(a));
        assert!(fx.organizer.signal.take());
    }

    #[test]
    fn test_duplicates_reported_once_with_cumulative_count() {
        let fx = fixture(4);
        let a = create(&fx, 1, CompilerTier::Baseline);
        let b = create(&fx, 2, CompilerTier::Opt { level: 0 });
        for cmid in [a, b, a, a] {
            fx.organizer.record_sample(cmid);
        }
        assert_eq!(fx.organizer.threshold_reached(), 2);
        assert_eq!(drain(&fx.queue), vec![(3.0, a), (1.0, b)]);

        for cmid in [b, b, b, b] {
            fx.organizer.record_sample(cmid);
        }
        fx.organizer.threshold_reached();
        assert_eq!(drain(&fx.queue), vec![(5.0, b)]);
        assert_eq!(fx.organizer.sample_count(a), 3.0);
    }

    #[test]
    fn test_trap_and_high_opt_filtered() {
        let fx = fixture(3);
        let trap = fx.registry.create_trap().unwrap().id();
        let opt2 = create(&fx, 1, CompilerTier::Opt { level: 2 });
        let opt1 = create(&fx, 2, CompilerTier::Opt { level: 1 });
        for cmid in [trap, opt2, opt1] {
            fx.organizer.record_sample(cmid);
        }
        assert_eq!(fx.organizer.threshold_reached(), 1);
        assert_eq!(drain(&fx.queue), vec![(1.0, opt1)]);
    }

    #[test]
    fn test_reclaimed_code_skipped() {
        let fx = fixture(1);
        fx.organizer.record_sample(Cmid::new(99));
        assert_eq!(fx.organizer.threshold_reached(), 0);
        assert!(fx.queue.is_empty());
    }

    #[test]
    fn test_reset_samples_flags_method() {
        let fx = fixture(1);
        let a = create(&fx, 1, CompilerTier::Baseline);
        fx.organizer.record_sample(a);
        fx.organizer.threshold_reached();
        fx.organizer.reset_samples(a);
        assert_eq!(fx.organizer.sample_count(a), 0.0);
        assert!(fx.registry.get(a).unwrap().is_samples_reset());
    }

    #[test]
    fn test_forget_reclaimed_keeps_live_counts() {
        let fx = fixture(3);
        let a = create(&fx, 1, CompilerTier::Baseline);
        let b = create(&fx, 2, CompilerTier::Baseline);
        fx.organizer.record_sample(a);
        fx.organizer.record_sample(b);
        fx.organizer.record_sample(b);
        fx.organizer.threshold_reached();
        assert_eq!(fx.organizer.tracked_methods(), 2);

        fx.organizer.forget_reclaimed(&[a]);
        assert_eq!(fx.organizer.sample_count(a), 0.0);
        assert_eq!(fx.organizer.sample_count(b), 2.0);
        assert_eq!(fx.organizer.tracked_methods(), 1);
    }

    #[test]
    fn test_organizer_thread_processes_full_buffer() {
        let fx = fixture(2);
        let a = create(&fx, 1, CompilerTier::Baseline);
        let organizer = Arc::new(fx.organizer);
        let handle = organizer.spawn().unwrap();
        organizer.record_sample(a);
        organizer.record_sample(a);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while fx.queue.is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        organizer.stop();
        handle.join().unwrap();
        assert_eq!(drain(&fx.queue), vec![(2.0, a)]);
    }
}
