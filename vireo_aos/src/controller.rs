//! The controller decision loop.
//!
//! ```text
//!   organizers ──▶ PriorityQueue<ControllerEvent> ──▶ Controller::run
//!                                                        │
//!            ┌───────────────────────────────────────────┤
//!            ▼                                           ▼
//!   HotMethod: admission gate                   OnStackReplacement:
//!              strategy                                  plan OsrBase2Opt
//!              plan InProgress                           dispatch
//!              dispatch
//! ```
//!
//! The loop never waits for a compilation; the next event is serviced as
//! soon as the previous one has been dispatched.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, info};
use vireo_core::{Cmid, CompilerTier, VireoError, VireoResult};
use vireo_jit::VmThread;
use vireo_jit::osr::OsrExecutionState;

use crate::config::AosConfig;
use crate::dispatch::CompilationDispatcher;
use crate::event::{ControllerEvent, HotMethodEvent};
use crate::plan::{CompilationPlan, ControllerPlan, PlanStatus};
use crate::queue::PriorityQueue;
use crate::recompiler::{CompileJob, Recompiler};
use crate::strategy::RecompilationStrategy;

/// Drains the controller input queue and turns events into plans.
pub struct Controller {
    config: AosConfig,
    queue: Arc<PriorityQueue<ControllerEvent>>,
    strategy: Box<dyn RecompilationStrategy>,
    recompiler: Arc<Recompiler>,
    dispatcher: Arc<CompilationDispatcher>,
}

impl Controller {
    /// Controller consuming `queue`.
    pub fn new(
        config: AosConfig,
        queue: Arc<PriorityQueue<ControllerEvent>>,
        strategy: Box<dyn RecompilationStrategy>,
        recompiler: Arc<Recompiler>,
        dispatcher: Arc<CompilationDispatcher>,
    ) -> Self {
        Self {
            config,
            queue,
            strategy,
            recompiler,
            dispatcher,
        }
    }

    /// Input queue.
    #[inline]
    pub fn queue(&self) -> &Arc<PriorityQueue<ControllerEvent>> {
        &self.queue
    }

    /// Plan executor shared with the workers.
    #[inline]
    pub fn recompiler(&self) -> &Arc<Recompiler> {
        &self.recompiler
    }

    /// Compilation workers.
    #[inline]
    pub fn dispatcher(&self) -> &Arc<CompilationDispatcher> {
        &self.dispatcher
    }

    /// Block on the queue and process events until it is shut down.
    pub fn run(&self) {
        info!(target: "vireo::aos", "controller thread started");
        while let Some((priority, event)) = self.queue.take() {
            self.process_event(event, priority);
        }
        info!(target: "vireo::aos", "controller thread exiting");
    }

    /// Run the loop on a dedicated thread.
    pub fn spawn(self: &Arc<Self>) -> VireoResult<JoinHandle<()>> {
        let controller = Arc::clone(self);
        thread::Builder::new()
            .name("vireo-controller".into())
            .spawn(move || controller.run())
            .map_err(|e| {
                error!(target: "vireo::aos", "failed to spawn controller thread: {e}");
                VireoError::ThreadSpawn {
                    name: "vireo-controller",
                    reason: e.to_string(),
                }
            })
    }

    /// Close the input queue. Threads behind queued OSR events are released
    /// to continue in their current code. Returns how many events were
    /// discarded.
    pub fn shutdown(&self) -> usize {
        let pending = self.queue.shutdown();
        let discarded = pending.len();
        for event in pending {
            if let ControllerEvent::OnStackReplacement { thread, state } = event {
                thread.activate();
                self.recompiler
                    .listener()
                    .controller_did_nothing(state.from_cmid, "controller shut down");
            }
        }
        if discarded > 0 {
            debug!(target: "vireo::aos", "controller discarded {discarded} queued events");
        }
        discarded
    }

    /// Process every queued event without blocking. Returns how many were
    /// processed.
    pub fn drain(&self) -> usize {
        let mut n = 0;
        while let Some((priority, event)) = self.queue.try_take() {
            self.process_event(event, priority);
            n += 1;
        }
        n
    }

    /// Act on one event. Returns the plan created, if any.
    pub fn process_event(&self, event: ControllerEvent, priority: f64) -> Option<Arc<ControllerPlan>> {
        self.recompiler.tick();
        let memory = self.recompiler.memory();
        memory.counters().note_awoken();
        self.recompiler.listener().controller_awoke(self.queue.len());

        match event {
            ControllerEvent::HotMethod(event) => self.consider_hot_method(&event),
            ControllerEvent::OnStackReplacement { thread, state } => {
                self.on_stack_replacement(thread, state, priority)
            }
        }
    }

    fn did_nothing(&self, event_cmid: Cmid, reason: &str) -> Option<Arc<ControllerPlan>> {
        self.recompiler.memory().counters().note_did_nothing();
        self.recompiler.listener().controller_did_nothing(event_cmid, reason);
        None
    }

    fn consider_hot_method(&self, event: &HotMethodEvent) -> Option<Arc<ControllerPlan>> {
        let Some(method) = event.method().cloned() else {
            return self.did_nothing(event.cmid(), "trap code");
        };
        let memory = self.recompiler.memory();
        memory.counters().note_considered();

        if !memory.should_consider_for_initial_recompilation(method.id()) {
            return self.did_nothing(event.cmid(), "already planned");
        }
        let current = method.current_cmid();
        if !current.is_none() && current != event.cmid() {
            return self.did_nothing(event.cmid(), "stale code");
        }
        let Some(choice) = self.strategy.consider_hot_method(event, &self.config) else {
            return self.did_nothing(event.cmid(), "not profitable");
        };
        if choice.target.opt_level() <= event.prev_compiler().opt_level() {
            return self.did_nothing(event.cmid(), "non-improving target");
        }

        let plan = Arc::new(
            ControllerPlan::new(
                CompilationPlan {
                    method,
                    target: choice.target,
                    instrumentation: None,
                    osr: None,
                },
                event.cmid(),
                self.recompiler.clock(),
                choice.benefit,
            )
            .with_estimates(choice.expected_speedup, choice.expected_compilation_time)
            .with_status(PlanStatus::InProgress),
        );
        if !memory.insert_if_admissible(Arc::clone(&plan)) {
            return self.did_nothing(event.cmid(), "already planned");
        }
        self.dispatcher.dispatch(CompileJob::Recompile(Arc::clone(&plan)));
        Some(plan)
    }

    /// Opt level for OSR code: the level of the method's latest completed
    /// plan, else the configured maximum.
    fn osr_target(&self, state: &OsrExecutionState) -> CompilerTier {
        let level = self
            .recompiler
            .memory()
            .plan_list(state.method.id())
            .and_then(|list| {
                list.snapshot()
                    .iter()
                    .rev()
                    .filter(|p| p.status() == PlanStatus::Completed)
                    .find_map(|p| p.compilation().opt_level())
            })
            .unwrap_or(self.config.max_opt_level);
        CompilerTier::Opt { level }
    }

    fn on_stack_replacement(
        &self,
        thread: Arc<VmThread>,
        state: OsrExecutionState,
        priority: f64,
    ) -> Option<Arc<ControllerPlan>> {
        let from_cmid = state.from_cmid;
        self.recompiler.listener().osr_requested(thread.id(), from_cmid);

        let from_tier = self.recompiler.registry().get(from_cmid).map(|cm| cm.tier());
        let target = self.osr_target(&state);
        let refused = if !self.config.enable_osr {
            Some("OSR disabled")
        } else {
            match from_tier {
                None => Some("unknown source code"),
                Some(CompilerTier::Baseline) => None,
                Some(tier) if tier.opt_level() < target.opt_level() && tier.is_opt() => None,
                Some(_) => Some("source tier not below target"),
            }
        };
        if let Some(reason) = refused {
            // The thread suspended itself for this request; let it continue.
            thread.activate();
            return self.did_nothing(from_cmid, reason);
        }

        debug!(
            target: "vireo::aos",
            "OSR plan thread={} from={from_cmid} target={target}",
            thread.id()
        );
        let plan = Arc::new(
            ControllerPlan::new(
                CompilationPlan {
                    method: state.method.clone(),
                    target,
                    instrumentation: None,
                    osr: Some(state),
                },
                from_cmid,
                self.recompiler.clock(),
                priority,
            )
            .with_status(PlanStatus::OsrBase2Opt),
        );
        self.recompiler.memory().insert(Arc::clone(&plan));
        self.dispatcher.dispatch(CompileJob::Osr {
            plan: Arc::clone(&plan),
            thread,
        });
        Some(plan)
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("pending", &self.queue.len())
            .field("recompiler", &self.recompiler)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
