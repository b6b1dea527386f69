//! Invocation-counter triggered recompilation.
//!
//! Baseline code decrements a per-CMID counter on every invocation. When it
//! reaches zero the method is recompiled at a fixed opt level, bypassing the
//! controller queue and the cost model. The counter is then pinned to
//! `i32::MAX` so the trip path is not re-entered, and a per-CMID processed
//! bit guards against the storm of trips that can race in before the pin is
//! visible. The processed bit is one-shot: it is never cleared.

use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use vireo_core::{Cmid, CompilerTier, OptLevel};

use crate::dispatch::CompilationDispatcher;
use crate::plan::{CompilationPlan, ControllerPlan, PlanStatus};
use crate::recompiler::{CompileJob, Recompiler};

/// Extra slots allocated past the requested id on growth.
const GROWTH_SLACK: usize = 500;

#[derive(Debug, Default)]
struct CounterTable {
    counts: Vec<i32>,
    processed: Vec<bool>,
}

impl CounterTable {
    fn ensure(&mut self, index: usize) {
        if index < self.counts.len() {
            return;
        }
        let new_len = (self.counts.len() * 2).max(index + GROWTH_SLACK);
        self.counts.resize(new_len, 0);
        self.processed.resize(new_len, false);
    }
}

/// Per-CMID invocation counters of baseline code.
#[derive(Debug)]
pub struct InvocationCounts {
    table: Mutex<CounterTable>,
    threshold: i32,
    opt_level: OptLevel,
    priority: f64,
    recompiler: Arc<Recompiler>,
    dispatcher: Arc<CompilationDispatcher>,
}

impl InvocationCounts {
    /// Counters armed with `threshold`, recompiling at `opt_level`.
    pub fn new(
        threshold: i32,
        opt_level: OptLevel,
        priority: f64,
        recompiler: Arc<Recompiler>,
        dispatcher: Arc<CompilationDispatcher>,
    ) -> Self {
        Self {
            table: Mutex::new(CounterTable::default()),
            threshold,
            opt_level,
            priority,
            recompiler,
            dispatcher,
        }
    }

    /// Arm the counter of freshly compiled baseline code.
    pub fn allocate_counter(&self, cmid: Cmid) {
        let mut table = self.table.lock();
        table.ensure(cmid.index());
        table.counts[cmid.index()] = self.threshold;
    }

    /// Current counter value, if allocated.
    pub fn count(&self, cmid: Cmid) -> Option<i32> {
        self.table.lock().counts.get(cmid.index()).copied()
    }

    /// Whether the trip path already ran for `cmid`.
    pub fn is_processed(&self, cmid: Cmid) -> bool {
        self.table
            .lock()
            .processed
            .get(cmid.index())
            .copied()
            .unwrap_or(false)
    }

    /// Count one invocation. Returns the plan issued if this invocation
    /// tripped the counter.
    pub fn record_invocation(&self, cmid: Cmid) -> Option<Arc<ControllerPlan>> {
        let tripped = {
            let mut table = self.table.lock();
            let count = table.counts.get_mut(cmid.index())?;
            *count = count.saturating_sub(1);
            *count <= 0
        };
        if tripped { self.counter_tripped(cmid) } else { None }
    }

    /// Handle a counter underflow for `cmid`. Issues at most one plan per
    /// CMID over the process lifetime.
    pub fn counter_tripped(&self, cmid: Cmid) -> Option<Arc<ControllerPlan>> {
        {
            let mut table = self.table.lock();
            table.ensure(cmid.index());
            table.counts[cmid.index()] = i32::MAX;
            if table.processed[cmid.index()] {
                return None;
            }
            table.processed[cmid.index()] = true;
        }

        let cm = self.recompiler.registry().get(cmid)?;
        if cm.tier() != CompilerTier::Baseline {
            debug!(target: "vireo::aos", "counter tripped for non-baseline {cmid} tier={}", cm.tier());
            return None;
        }
        let method = cm.method()?.clone();

        let plan = Arc::new(
            ControllerPlan::new(
                CompilationPlan::opt(method, self.opt_level),
                cmid,
                self.recompiler.clock(),
                self.priority,
            )
            .with_estimates(self.priority, self.priority)
            .with_status(PlanStatus::InProgress),
        );
        let memory = self.recompiler.memory();
        if !memory.insert_if_admissible(Arc::clone(&plan)) {
            memory.counters().note_did_nothing();
            self.recompiler
                .listener()
                .controller_did_nothing(cmid, "already planned");
            return None;
        }
        self.dispatcher.dispatch(CompileJob::Recompile(Arc::clone(&plan)));
        Some(plan)
    }
}

// =============================================================================
// Tests
// =============================================================================
