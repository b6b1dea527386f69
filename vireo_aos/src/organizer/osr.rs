//! On-stack-replacement organizer.
//!
//! A thread that wants its running frame replaced records the request on
//! itself and raises the organizer. The organizer sweeps every live thread,
//! clears each raised request flag and forwards the request to the
//! controller at a fixed, high priority.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, trace};
use vireo_core::{VireoError, VireoResult};
use vireo_jit::osr::OsrExecutionState;
use vireo_jit::{ThreadRegistry, VmThread};

use super::OrganizerSignal;
use crate::event::ControllerEvent;
use crate::listener::AosEventListener;
use crate::queue::PriorityQueue;

/// Organizer forwarding OSR requests to the controller.
pub struct OsrOrganizer {
    signal: OrganizerSignal,
    threads: Arc<ThreadRegistry>,
    queue: Arc<PriorityQueue<ControllerEvent>>,
    priority: f64,
    park_timeout: Duration,
    listener: Arc<dyn AosEventListener>,
}

impl OsrOrganizer {
    /// Organizer scanning `threads`, queueing at `priority`.
    pub fn new(
        threads: Arc<ThreadRegistry>,
        queue: Arc<PriorityQueue<ControllerEvent>>,
        priority: f64,
        park_timeout: Duration,
        listener: Arc<dyn AosEventListener>,
    ) -> Self {
        Self {
            signal: OrganizerSignal::default(),
            threads,
            queue,
            priority,
            park_timeout,
            listener,
        }
    }

    /// Record `state` on `thread` and wake the organizer.
    pub fn request_osr(&self, thread: &VmThread, state: OsrExecutionState) {
        trace!(target: "vireo::osr", "{} requests osr of {} at bc {}", thread.id(), state.from_cmid, state.bc_index);
        thread.request_osr(state);
        self.signal.raise();
    }

    /// Forward every pending request. Returns how many were queued.
    pub fn process_osr_requests(&self) -> usize {
        let mut queued = 0;
        for thread in self.threads.all_threads() {
            let Some(state) = thread.take_osr_request() else {
                continue;
            };
            let from = state.from_cmid;
            if self.queue.insert(
                self.priority,
                ControllerEvent::OnStackReplacement {
                    thread: Arc::clone(&thread),
                    state,
                },
            ) {
                queued += 1;
            } else {
                // Nobody will ever answer; let the thread continue in place.
                self.listener.controller_did_nothing(from, "queue closed");
                thread.activate();
            }
        }
        queued
    }

    /// Organizer loop.
    pub fn run(&self) {
        debug!(target: "vireo::osr", "osr organizer started priority={}", self.priority);
        while !self.signal.is_stopped() {
            while self.signal.take() {
                self.process_osr_requests();
            }
            self.signal.passivate(self.park_timeout);
        }
    }

    /// Run the loop on a dedicated thread.
    pub fn spawn(self: &Arc<Self>) -> VireoResult<JoinHandle<()>> {
        let organizer = Arc::clone(self);
        thread::Builder::new()
            .name("vireo-osr-organizer".into())
            .spawn(move || organizer.run())
            .map_err(|e| {
                error!(target: "vireo::osr", "failed to spawn osr organizer: {e}");
                VireoError::ThreadSpawn {
                    name: "vireo-osr-organizer",
                    reason: e.to_string(),
                }
            })
    }

    /// Make [`run`](Self::run) return.
    pub fn stop(&self) {
        self.signal.stop();
    }
}

impl std::fmt::Debug for OsrOrganizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsrOrganizer")
            .field("priority", &self.priority)
            .field("threads", &self.threads.len())
            .finish_non_exhaustive()
    }
}
