//! The assembled adaptive optimization system.
//!
//! [`AdaptiveSystem`] owns the registry, the controller memory and every
//! system thread, and is the surface the rest of the runtime talks to:
//!
//! - baseline compiler: [`on_baseline_compiled`](AdaptiveSystem::on_baseline_compiled)
//! - baseline code: [`record_invocation`](AdaptiveSystem::record_invocation)
//! - timer interrupt: [`record_method_sample`](AdaptiveSystem::record_method_sample)
//! - yieldpoints in long loops: [`request_osr`](AdaptiveSystem::request_osr)
//! - collector: [`gc_safe_point`](AdaptiveSystem::gc_safe_point)
//!
//! With `compiler_threads == 0` nothing is spawned: samples and OSR requests
//! are organized and decided on the calling thread, and compilation runs
//! inline. This is the mode tests use.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use log::{error, info};
use parking_lot::Mutex;
use vireo_core::exit::ProcessTerminator;
use vireo_core::{
    Cmid, CompilerTier, ExitCoordinator, MemoryManager, MethodRef, Terminator, UnboundedMemory,
    VireoResult,
};
use vireo_jit::osr::{OsrExecutionState, OsrSlotTable};
use vireo_jit::{
    CodeInfo, CompiledMethod, CompiledMethodRegistry, RegistryConfig, SpaceReport, SweepReport,
    ThreadRegistry, TierOpsTable, VmThread,
};

use crate::compiler::Compiler;
use crate::config::AosConfig;
use crate::controller::Controller;
use crate::dispatch::CompilationDispatcher;
use crate::invocation_counts::InvocationCounts;
use crate::listener::{AosEventListener, LogListener};
use crate::memory::{AosReport, ControllerMemory, RecompilationSummary};
use crate::organizer::call_density::CallDensityReport;
use crate::organizer::{CallDensityListener, MethodSampleOrganizer, OsrOrganizer, SampleSite};
use crate::plan::ControllerPlan;
use crate::queue::PriorityQueue;
use crate::strategy::{CostBenefitStrategy, RecompilationStrategy};

// =============================================================================
// Builder
// =============================================================================

/// Collaborators of an [`AdaptiveSystem`] before boot.
pub struct AdaptiveSystemBuilder {
    config: AosConfig,
    compiler: Arc<dyn Compiler>,
    strategy: Box<dyn RecompilationStrategy>,
    listener: Arc<dyn AosEventListener>,
    memory_manager: Arc<dyn MemoryManager>,
    registry_config: RegistryConfig,
    threads: Arc<ThreadRegistry>,
    terminator: Arc<dyn Terminator>,
    tier_ops: TierOpsTable,
}

impl AdaptiveSystemBuilder {
    /// Replace the cost/benefit strategy.
    pub fn with_strategy(mut self, strategy: Box<dyn RecompilationStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Replace the logging listener.
    pub fn with_listener(mut self, listener: Arc<dyn AosEventListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Memory manager consulted when the registry grows.
    pub fn with_memory_manager(mut self, memory_manager: Arc<dyn MemoryManager>) -> Self {
        self.memory_manager = memory_manager;
        self
    }

    /// Registry sizing.
    pub fn with_registry_config(mut self, config: RegistryConfig) -> Self {
        self.registry_config = config;
        self
    }

    /// The scheduler's thread list, scanned by the OSR organizer.
    pub fn with_threads(mut self, threads: Arc<ThreadRegistry>) -> Self {
        self.threads = threads;
        self
    }

    /// Process-exit backend.
    pub fn with_terminator(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = terminator;
        self
    }

    /// Per-tier operations, for hosts that register their own compilers.
    pub fn with_tier_ops(mut self, tier_ops: TierOpsTable) -> Self {
        self.tier_ops = tier_ops;
        self
    }

    /// Wire every component together and start the system threads.
    pub fn boot(self) -> VireoResult<AdaptiveSystem> {
        let config = self.config;
        let registry = Arc::new(CompiledMethodRegistry::new(
            self.registry_config,
            Arc::clone(&self.memory_manager),
        ));
        let memory = Arc::new(ControllerMemory::new());
        let queue = Arc::new(PriorityQueue::new());

        let recompiler = Arc::new(crate::recompiler::Recompiler::new(
            Arc::clone(&registry),
            Arc::clone(&memory),
            self.compiler,
            Arc::clone(&self.listener),
            Arc::new(OsrSlotTable::new()),
        ));
        let dispatcher = Arc::new(CompilationDispatcher::new(
            Arc::clone(&recompiler),
            config.compiler_threads,
        ));
        let counters = config.enable_invocation_counters.then(|| {
            InvocationCounts::new(
                config.invocation_count_threshold,
                config.invocation_count_opt_level,
                config.invocation_plan_priority,
                Arc::clone(&recompiler),
                Arc::clone(&dispatcher),
            )
        });
        let controller = Arc::new(Controller::new(
            config.clone(),
            Arc::clone(&queue),
            self.strategy,
            recompiler,
            dispatcher,
        ));
        let sampler = Arc::new(MethodSampleOrganizer::new(
            config.method_sample_size * config.num_processors as usize,
            config.filter_opt_level,
            config.organizer_park_timeout,
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&self.listener),
        ));
        let osr = Arc::new(OsrOrganizer::new(
            Arc::clone(&self.threads),
            Arc::clone(&queue),
            config.osr_priority,
            config.organizer_park_timeout,
            Arc::clone(&self.listener),
        ));

        let system = AdaptiveSystem {
            exit: ExitCoordinator::new(config.num_processors, self.terminator),
            synchronous: config.compiler_threads == 0,
            config,
            registry,
            memory,
            threads: self.threads,
            memory_manager: self.memory_manager,
            listener: self.listener,
            queue,
            controller,
            counters,
            sampler,
            osr,
            call_density: CallDensityListener::new(),
            tier_ops: self.tier_ops,
            handles: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        };

        if !system.synchronous {
            // Dropping `system` on a spawn failure stops whatever did start.
            let mut handles = system.handles.lock();
            handles.push(system.controller.spawn()?);
            handles.push(system.sampler.spawn()?);
            handles.push(system.osr.spawn()?);
        }
        info!(
            target: "vireo::aos",
            "adaptive system booted compiler_threads={} osr={} invocation_counters={}",
            system.config.compiler_threads,
            system.config.enable_osr,
            system.config.enable_invocation_counters
        );
        Ok(system)
    }
}

impl std::fmt::Debug for AdaptiveSystemBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveSystemBuilder")
            .field("config", &self.config)
            .field("registry_config", &self.registry_config)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Adaptive System
// =============================================================================

/// A booted adaptive optimization system.
pub struct AdaptiveSystem {
    config: AosConfig,
    synchronous: bool,
    registry: Arc<CompiledMethodRegistry>,
    memory: Arc<ControllerMemory>,
    threads: Arc<ThreadRegistry>,
    memory_manager: Arc<dyn MemoryManager>,
    listener: Arc<dyn AosEventListener>,
    queue: Arc<PriorityQueue<crate::event::ControllerEvent>>,
    controller: Arc<Controller>,
    counters: Option<InvocationCounts>,
    sampler: Arc<MethodSampleOrganizer>,
    osr: Arc<OsrOrganizer>,
    call_density: CallDensityListener,
    tier_ops: TierOpsTable,
    exit: ExitCoordinator,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl AdaptiveSystem {
    /// Start configuring a system that compiles with `compiler`.
    pub fn builder(config: AosConfig, compiler: Arc<dyn Compiler>) -> AdaptiveSystemBuilder {
        AdaptiveSystemBuilder {
            config,
            compiler,
            strategy: Box::new(CostBenefitStrategy::default()),
            listener: Arc::new(LogListener),
            memory_manager: Arc::new(UnboundedMemory),
            registry_config: RegistryConfig::default(),
            threads: Arc::new(ThreadRegistry::new()),
            terminator: Arc::new(ProcessTerminator),
            tier_ops: TierOpsTable::standard(),
        }
    }

    /// Active configuration.
    #[inline]
    pub fn config(&self) -> &AosConfig {
        &self.config
    }

    /// Whether decisions and compilations run on the calling thread.
    #[inline]
    pub fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    /// Compiled-method registry.
    #[inline]
    pub fn registry(&self) -> &Arc<CompiledMethodRegistry> {
        &self.registry
    }

    /// Plan history.
    #[inline]
    pub fn memory(&self) -> &Arc<ControllerMemory> {
        &self.memory
    }

    /// Thread list scanned for OSR requests.
    #[inline]
    pub fn threads(&self) -> &Arc<ThreadRegistry> {
        &self.threads
    }

    /// Controller.
    #[inline]
    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Invocation counters, when enabled.
    #[inline]
    pub fn invocation_counts(&self) -> Option<&InvocationCounts> {
        self.counters.as_ref()
    }

    /// Method-sample organizer.
    #[inline]
    pub fn sampler(&self) -> &Arc<MethodSampleOrganizer> {
        &self.sampler
    }

    /// Exit coordinator. Shutdown fails through it when a system thread
    /// panicked; embedders route their own fatal paths through it too.
    #[inline]
    pub fn exit(&self) -> &ExitCoordinator {
        &self.exit
    }

    /// Register freshly compiled baseline code for `method` and make it the
    /// method's current code. Code it replaces is retired.
    pub fn on_baseline_compiled(
        &self,
        method: &MethodRef,
        code: CodeInfo,
    ) -> VireoResult<Arc<CompiledMethod>> {
        let cm = self.registry.create(method.clone(), CompilerTier::Baseline)?;
        cm.compile_complete(code);
        let old = method.replace_compiled_method(cm.id());
        if old.is_none() {
            self.memory_manager.notify_type_resolved(method.declaring_type());
        }
        self.controller.recompiler().retire(old, cm.id());
        self.memory.counters().note_baseline_compiled();
        if let Some(counters) = &self.counters {
            counters.allocate_counter(cm.id());
        }
        Ok(cm)
    }

    /// Count one invocation of baseline code `cmid`. Returns the plan issued
    /// when the counter tripped.
    pub fn record_invocation(&self, cmid: Cmid) -> Option<Arc<ControllerPlan>> {
        self.counters.as_ref()?.record_invocation(cmid)
    }

    /// Record one timer sample of `cmid` taken at `site`.
    pub fn record_method_sample(&self, cmid: Cmid, site: SampleSite) {
        self.call_density.update(site);
        if self.sampler.record_sample(cmid) && self.synchronous {
            self.sampler.threshold_reached();
            self.controller.drain();
        }
    }

    /// Ask for the frame described by `state` to be replaced. `thread` must
    /// be registered in [`threads`](Self::threads); it should park until
    /// activated.
    pub fn request_osr(&self, thread: &VmThread, state: OsrExecutionState) {
        self.osr.request_osr(thread, state);
        if self.synchronous {
            self.osr.process_osr_requests();
            self.controller.drain();
        }
    }

    /// Collector hook at a stop-the-world safe point. `frames` names the
    /// compiled method of every frame on every thread stack. Obsolete code
    /// not among them is reclaimed.
    pub fn gc_safe_point<I>(&self, frames: I) -> SweepReport
    where
        I: IntoIterator<Item = Cmid>,
    {
        if !self.memory_manager.is_gc_enabled() {
            return SweepReport::default();
        }
        let mut scan = self.registry.begin_stack_scan();
        for cmid in frames {
            scan.mark_frame(cmid);
        }
        let proof = scan.finish();
        let report = self.registry.sweep_obsolete(&proof);
        self.sampler.forget_reclaimed(&report.reclaimed_ids);
        if report.walked {
            self.listener.obsolete_swept(&report);
        }
        report
    }

    /// Controller counters.
    pub fn report(&self) -> AosReport {
        self.memory.counters().snapshot()
    }

    /// Opt-level paths taken by recompiled methods.
    pub fn final_method_stats(&self) -> RecompilationSummary {
        self.memory.final_method_stats()
    }

    /// Code footprint by tier.
    pub fn space_report(&self) -> SpaceReport {
        self.registry.space_report()
    }

    /// Name of the compiler that produced `cmid`, if it is still registered.
    pub fn compiler_name(&self, cmid: Cmid) -> Option<&'static str> {
        self.registry
            .get(cmid)
            .map(|cm| self.tier_ops.compiler_name(&cm))
    }

    /// Call density of the samples seen so far.
    pub fn call_density(&self) -> CallDensityReport {
        self.call_density.report()
    }

    /// Stop every system thread. Compilations in progress finish. Queued
    /// jobs are aborted, and threads waiting on a queued OSR request are
    /// released. A panicked system thread ends in `sys_fail`. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.controller.shutdown();
        self.sampler.stop();
        self.osr.stop();
        let handles = std::mem::take(&mut *self.handles.lock());
        let mut panicked = 0;
        for handle in handles {
            if handle.join().is_err() {
                error!(target: "vireo::aos", "adaptive system thread panicked");
                panicked += 1;
            }
        }
        panicked += self.controller.dispatcher().shutdown();
        info!(target: "vireo::aos", "adaptive system shut down\n{}", self.report());
        if panicked > 0 {
            self.exit
                .sys_fail(&format!("{panicked} adaptive system threads panicked"));
        }
    }
}

impl Drop for AdaptiveSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for AdaptiveSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveSystem")
            .field("config", &self.config)
            .field("compiled_methods", &self.registry.num_compiled_methods())
            .field("methods_with_plans", &self.memory.num_methods())
            .field("queued_events", &self.queue.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
