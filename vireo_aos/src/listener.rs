//! Diagnostic notifications.
//!
//! The adaptive system reports what it does through an [`AosEventListener`].
//! Notifications are purely observational: nothing they return is consumed.

use std::time::Duration;

use log::{debug, info, trace, warn};
use vireo_core::{Cmid, CompilerTier, MethodId, ThreadId, VireoError};
use vireo_jit::SweepReport;

use crate::event::HotMethodEvent;
use crate::plan::ControllerPlan;

/// Observer of adaptive-system activity. Every method defaults to a no-op.
#[allow(unused_variables)]
pub trait AosEventListener: Send + Sync {
    /// The method-sample organizer processed a full sample buffer.
    fn organizer_threshold_reached(&self, num_samples: usize) {}

    /// A hot method was queued for the controller.
    fn controller_notified_for_hotness(&self, event: &HotMethodEvent) {}

    /// The controller woke up for an event.
    fn controller_awoke(&self, queue_len: usize) {}

    /// The controller examined an event and decided to do nothing.
    fn controller_did_nothing(&self, cmid: Cmid, reason: &str) {}

    /// A compilation was dispatched for `plan`.
    fn plan_dispatched(&self, plan: &ControllerPlan) {}

    /// `plan` completed and produced `new_cmid`.
    fn compilation_completed(&self, plan: &ControllerPlan, new_cmid: Cmid, time: Duration) {}

    /// `plan` was aborted.
    fn compilation_aborted(&self, plan: &ControllerPlan, error: &VireoError) {}

    /// A thread asked to replace a frame running `cmid`.
    fn osr_requested(&self, thread: ThreadId, cmid: Cmid) {}

    /// Glue was staged on `thread`.
    fn osr_installed(&self, thread: ThreadId, from: Cmid, to: Cmid) {}

    /// The registry reclaimed obsolete code.
    fn obsolete_swept(&self, report: &SweepReport) {}
}

/// Listener that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullListener;

impl AosEventListener for NullListener {}

/// Listener that forwards every notification to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogListener;

const TARGET: &str = "vireo::aos";

fn method_of(plan: &ControllerPlan) -> (MethodId, CompilerTier) {
    (plan.method().id(), plan.compilation().target)
}

impl AosEventListener for LogListener {
    fn organizer_threshold_reached(&self, num_samples: usize) {
        trace!(target: TARGET, "organizer threshold reached samples={num_samples}");
    }

    fn controller_notified_for_hotness(&self, event: &HotMethodEvent) {
        debug!(
            target: TARGET,
            "controller notified cmid={} tier={} samples={:.1}",
            event.cmid(),
            event.prev_compiler(),
            event.num_samples()
        );
    }

    fn controller_awoke(&self, queue_len: usize) {
        trace!(target: TARGET, "controller awoke queue_len={queue_len}");
    }

    fn controller_did_nothing(&self, cmid: Cmid, reason: &str) {
        debug!(target: TARGET, "controller did nothing cmid={cmid} reason={reason}");
    }

    fn plan_dispatched(&self, plan: &ControllerPlan) {
        let (method, target) = method_of(plan);
        info!(
            target: TARGET,
            "recompilation dispatched method={method} from={} target={target} priority={:.2}",
            plan.source_cmid(),
            plan.priority()
        );
    }

    fn compilation_completed(&self, plan: &ControllerPlan, new_cmid: Cmid, time: Duration) {
        let (method, target) = method_of(plan);
        info!(
            target: TARGET,
            "recompilation completed method={method} target={target} cmid={new_cmid} time_us={}",
            time.as_micros()
        );
    }

    fn compilation_aborted(&self, plan: &ControllerPlan, error: &VireoError) {
        let (method, target) = method_of(plan);
        warn!(target: TARGET, "recompilation aborted method={method} target={target} error={error}");
    }

    fn osr_requested(&self, thread: ThreadId, cmid: Cmid) {
        debug!(target: TARGET, "OSR requested thread={thread} cmid={cmid}");
    }

    fn osr_installed(&self, thread: ThreadId, from: Cmid, to: Cmid) {
        info!(target: TARGET, "OSR installed thread={thread} from={from} to={to}");
    }

    fn obsolete_swept(&self, report: &SweepReport) {
        debug!(
            target: TARGET,
            "obsolete methods swept reclaimed={} retained={} walked={}",
            report.reclaimed,
            report.retained,
            report.walked
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records notification names for assertions.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingListener {
        pub(crate) events: Mutex<Vec<String>>,
    }

    impl RecordingListener {
        pub(crate) fn names(&self) -> Vec<String> {
            self.events.lock().clone()
        }

        fn push(&self, s: String) {
            self.events.lock().push(s);
        }
    }

    impl AosEventListener for RecordingListener {
        fn controller_notified_for_hotness(&self, event: &HotMethodEvent) {
            self.push(format!("hot {}", event.cmid()));
        }

        fn controller_did_nothing(&self, cmid: Cmid, reason: &str) {
            self.push(format!("nothing {cmid} {reason}"));
        }

        fn compilation_completed(&self, _plan: &ControllerPlan, new_cmid: Cmid, _time: Duration) {
            self.push(format!("completed {new_cmid}"));
        }

        fn compilation_aborted(&self, plan: &ControllerPlan, _error: &VireoError) {
            self.push(format!("aborted {}", plan.method().id()));
        }

        fn osr_installed(&self, thread: ThreadId, _from: Cmid, to: Cmid) {
            self.push(format!("osr {thread} {to}"));
        }
    }

    #[test]
    fn test_defaults_are_no_ops() {
        let listener = NullListener;
        listener.controller_awoke(3);
        listener.osr_requested(ThreadId(1), Cmid::new(2));
        LogListener.controller_did_nothing(Cmid::new(1), "test");
    }
}
