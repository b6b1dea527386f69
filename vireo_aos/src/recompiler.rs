//! Plan execution.
//!
//! The [`Recompiler`] runs a dispatched plan to completion on whichever
//! thread picked it up: it calls the compiler, reconstructs the OSR points of
//! the result, registers the new code and finishes the plan.
//!
//! ```text
//!   Recompile(plan) ──▶ compile ──▶ registry.create ──▶ plan Completed
//!                          │                            earlier plans Outdated
//!                          │                            method code replaced
//!                          │                            old code obsolete
//!                          └── error ──▶ plan AbortedCompilationError
//!
//!   Osr(plan, thread) ──▶ compile ──▶ special-for-OSR ──▶ install glue
//!                          └── any error ──▶ plan AbortedCompilationError
//!                     (the thread is always reactivated)
//!
//!   abandoned job ──▶ plan AbortedCompilationError, OSR thread reactivated
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use vireo_core::{Cmid, CompilerTier, VireoError, VireoResult};
use vireo_jit::osr::{CodeInstaller, OsrPointConstructor, OsrSlotTable};
use vireo_jit::{CompiledMethod, CompiledMethodRegistry, VmThread};

use crate::compiler::{CompilationRequest, Compiler};
use crate::listener::AosEventListener;
use crate::memory::ControllerMemory;
use crate::plan::{ControllerPlan, PlanStatus};

/// A unit of compilation work.
#[derive(Debug, Clone)]
pub enum CompileJob {
    /// Recompile a method and install the result as its code.
    Recompile(Arc<ControllerPlan>),
    /// Compile OSR-specialized code and redirect one suspended thread.
    Osr {
        /// Plan carrying the frame's execution state.
        plan: Arc<ControllerPlan>,
        /// Thread waiting for the new code.
        thread: Arc<VmThread>,
    },
}

impl CompileJob {
    /// Plan being executed.
    pub fn plan(&self) -> &Arc<ControllerPlan> {
        match self {
            CompileJob::Recompile(plan) | CompileJob::Osr { plan, .. } => plan,
        }
    }
}

/// Executes plans. Shared by the controller, the invocation counters and
/// the compilation workers.
pub struct Recompiler {
    registry: Arc<CompiledMethodRegistry>,
    memory: Arc<ControllerMemory>,
    compiler: Arc<dyn Compiler>,
    listener: Arc<dyn AosEventListener>,
    installer: CodeInstaller,
    osr_slots: Arc<OsrSlotTable>,
    clock: AtomicU64,
}

impl Recompiler {
    /// Recompiler registering its results in `registry`.
    pub fn new(
        registry: Arc<CompiledMethodRegistry>,
        memory: Arc<ControllerMemory>,
        compiler: Arc<dyn Compiler>,
        listener: Arc<dyn AosEventListener>,
        osr_slots: Arc<OsrSlotTable>,
    ) -> Self {
        Self {
            installer: CodeInstaller::new(Arc::clone(&registry)),
            registry,
            memory,
            compiler,
            listener,
            osr_slots,
            clock: AtomicU64::new(0),
        }
    }

    /// Current controller clock.
    #[inline]
    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }

    /// Advance the controller clock, returning the new value.
    #[inline]
    pub fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Registry new code is entered into.
    #[inline]
    pub fn registry(&self) -> &Arc<CompiledMethodRegistry> {
        &self.registry
    }

    /// Plan history.
    #[inline]
    pub fn memory(&self) -> &Arc<ControllerMemory> {
        &self.memory
    }

    /// Diagnostics sink.
    #[inline]
    pub fn listener(&self) -> &Arc<dyn AosEventListener> {
        &self.listener
    }

    /// Run `job` to completion on the calling thread.
    pub fn run(&self, job: CompileJob) {
        match job {
            CompileJob::Recompile(plan) => self.recompile(&plan),
            CompileJob::Osr { plan, thread } => self.replace_frame(&plan, &thread),
        }
    }

    fn compile(&self, plan: &ControllerPlan) -> VireoResult<Arc<CompiledMethod>> {
        plan.mark_initiated(self.clock());
        let request = CompilationRequest::from(plan.compilation());
        let output = self.compiler.compile(&request)?;

        // Malformed OSR points abort the compilation before anything is
        // registered.
        let mut code = output.code;
        for site in &output.osr_points {
            let point = OsrPointConstructor.construct(plan.method(), &site.barriers, site.innermost)?;
            code.osr_points.push(point);
        }

        let cm = self.registry.create(plan.method().clone(), request.tier)?;
        cm.compile_complete(code);
        Ok(cm)
    }

    fn recompile(&self, plan: &ControllerPlan) {
        match self.compile(plan) {
            Ok(cm) => {
                plan.finish(PlanStatus::Completed, cm.id(), self.clock());
                if let Some(list) = plan.plan_list() {
                    self.memory.outdate_others(&list, plan);
                }
                self.retire(plan.method().replace_compiled_method(cm.id()), cm.id());
                self.memory.counters().note_outcome(true);
                self.listener
                    .compilation_completed(plan, cm.id(), cm.compilation_time());
            }
            Err(error) => self.abort(plan, &error),
        }
    }

    /// Mark the code `old` obsolete now that `new` replaced it.
    pub(crate) fn retire(&self, old: Cmid, new: Cmid) {
        if old.is_none() || old == new {
            return;
        }
        let Some(old_cm) = self.registry.get(old) else {
            return;
        };
        if old_cm.tier() == CompilerTier::Baseline {
            old_cm.set_outdated();
        }
        self.registry.mark_obsolete(&old_cm);
    }

    fn replace_frame(&self, plan: &ControllerPlan, thread: &VmThread) {
        let result = plan
            .compilation()
            .osr
            .as_ref()
            .ok_or_else(|| VireoError::MalformedOsrPoint("OSR plan without execution state".into()))
            .and_then(|state| {
                let cm = self.compile(plan)?;
                cm.set_special_for_osr(&self.osr_slots)?;
                self.installer.install(thread, state, &cm)?;
                Ok((state.from_cmid, cm))
            });

        match result {
            Ok((from, cm)) => {
                plan.finish(PlanStatus::Completed, cm.id(), self.clock());
                self.memory.counters().note_outcome(true);
                self.listener.osr_installed(thread.id(), from, cm.id());
            }
            Err(error) => self.abort(plan, &error),
        }
        thread.activate();
    }

    /// Finish `job` without compiling it, after its queue was shut down.
    ///
    /// The plan is aborted so it never stays in progress, and an OSR thread is
    /// released to continue in its current code.
    pub fn abandon(&self, job: CompileJob) {
        self.abort(job.plan(), &VireoError::QueueClosed);
        if let CompileJob::Osr { thread, .. } = job {
            thread.activate();
        }
    }

    fn abort(&self, plan: &ControllerPlan, error: &VireoError) {
        plan.finish(PlanStatus::AbortedCompilationError, Cmid::NONE, self.clock());
        self.memory.counters().note_outcome(false);
        self.listener.compilation_aborted(plan, error);
    }
}

impl std::fmt::Debug for Recompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recompiler")
            .field("compiler", &self.compiler.name())
            .field("clock", &self.clock())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompilerOutput, OsrPointSite};
    use crate::listener::tests::RecordingListener;
    use crate::plan::CompilationPlan;
    use vireo_core::{MethodId, MethodInfo, MethodRef, ThreadId, TypeId, TypeInfo};
    use vireo_jit::osr::{FrameSaveLayout, OsrBarrier, OsrExecutionState, TypeCode, ValueLocation};
    use vireo_jit::{CodeInfo, MachineCode};

    struct Fixture {
        registry: Arc<CompiledMethodRegistry>,
        memory: Arc<ControllerMemory>,
        listener: Arc<RecordingListener>,
        slots: Arc<OsrSlotTable>,
        method: MethodRef,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: Arc::new(CompiledMethodRegistry::for_testing()),
                memory: Arc::new(ControllerMemory::new()),
                listener: Arc::new(RecordingListener::default()),
                slots: Arc::new(OsrSlotTable::new()),
                method: MethodInfo::new(MethodId(1), "run", TypeInfo::new(TypeId(3), "demo.R"))
                    .with_bytecode_len(64)
                    .into_ref(),
            }
        }

        fn recompiler<C: Compiler + 'static>(&self, compiler: C) -> Recompiler {
            Recompiler::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.memory),
                Arc::new(compiler),
                self.listener.clone(),
                Arc::clone(&self.slots),
            )
        }

        fn baseline(&self) -> Arc<CompiledMethod> {
            let cm = self.registry.create(self.method.clone(), CompilerTier::Baseline).unwrap();
            cm.compile_complete(
                CodeInfo::new(MachineCode::new(0x1000, 0x100))
                    .with_save_layout(FrameSaveLayout::standard_baseline()),
            );
            self.method.replace_compiled_method(cm.id());
            cm
        }

        fn plan(&self, from: Cmid, level: u8) -> Arc<ControllerPlan> {
            let plan = Arc::new(
                ControllerPlan::new(CompilationPlan::opt(self.method.clone(), level), from, 0, 1.0)
                    .with_status(PlanStatus::InProgress),
            );
            self.memory.insert(Arc::clone(&plan));
            plan
        }
    }

    fn ok_compiler(req: &CompilationRequest) -> VireoResult<CompilerOutput> {
        let start = 0x8000 + 0x1000 * req.tier.opt_level().unwrap_or(0) as usize;
        Ok(CompilerOutput::new(
            CodeInfo::new(MachineCode::new(start, 0x200)).with_save_layout(FrameSaveLayout::opt(2, 16)),
        ))
    }

    #[test]
    fn test_success_installs_and_retires_old_code() {
        let fx = Fixture::new();
        let base = fx.baseline();
        let plan = fx.plan(base.id(), 1);

        fx.recompiler(ok_compiler).run(CompileJob::Recompile(Arc::clone(&plan)));

        assert_eq!(plan.status(), PlanStatus::Completed);
        let new = fx.registry.get(plan.result_cmid()).unwrap();
        assert_eq!(new.tier(), CompilerTier::Opt { level: 1 });
        assert_eq!(fx.method.current_cmid(), new.id());
        assert!(base.is_obsolete());
        assert!(base.is_outdated());
        assert_eq!(fx.listener.names(), vec![format!("completed {}", new.id())]);
    }

    #[test]
    fn test_later_completion_outdates_earlier_plan() {
        let fx = Fixture::new();
        let base = fx.baseline();
        let recompiler = fx.recompiler(ok_compiler);

        let first = fx.plan(base.id(), 0);
        recompiler.run(CompileJob::Recompile(Arc::clone(&first)));
        let second = fx.plan(first.result_cmid(), 2);
        recompiler.run(CompileJob::Recompile(Arc::clone(&second)));

        assert_eq!(first.status(), PlanStatus::Outdated);
        assert_eq!(second.status(), PlanStatus::Completed);
        assert!(fx.registry.get(first.result_cmid()).unwrap().is_obsolete());
    }

    #[test]
    fn test_failure_leaves_old_code_active() {
        let fx = Fixture::new();
        let base = fx.baseline();
        let plan = fx.plan(base.id(), 1);
        let failing = |req: &CompilationRequest| -> VireoResult<CompilerOutput> {
            Err(VireoError::compilation_failed(req.method.id(), req.tier, "register allocation"))
        };

        fx.recompiler(failing).run(CompileJob::Recompile(Arc::clone(&plan)));

        assert_eq!(plan.status(), PlanStatus::AbortedCompilationError);
        assert!(plan.result_cmid().is_none());
        assert_eq!(fx.method.current_cmid(), base.id());
        assert!(!base.is_obsolete());
        assert_eq!(fx.registry.num_compiled_methods(), 1);
        assert_eq!(fx.memory.counters().snapshot().aborted, 1);
    }

    #[test]
    fn test_malformed_osr_point_aborts() {
        let fx = Fixture::new();
        let base = fx.baseline();
        let plan = fx.plan(base.id(), 1);
        let method = fx.method.clone();
        let bad_points = move |req: &CompilationRequest| -> VireoResult<CompilerOutput> {
            let mut barrier = OsrBarrier::new(method.clone(), 4)
                .with_local(TypeCode::Int, Some(ValueLocation::Register(3)));
            barrier.operands.clear();
            Ok(ok_compiler(req)?.with_osr_point(OsrPointSite {
                barriers: vec![barrier],
                innermost: 0,
            }))
        };

        fx.recompiler(bad_points).run(CompileJob::Recompile(Arc::clone(&plan)));
        assert_eq!(plan.status(), PlanStatus::AbortedCompilationError);
        assert_eq!(fx.registry.num_compiled_methods(), 1);
    }

    #[test]
    fn test_osr_job_installs_glue_and_activates() {
        let fx = Fixture::new();
        let base = fx.baseline();
        let thread = Arc::new(VmThread::new(ThreadId(1), 1024));
        thread.stack().write_frame(512, 640, base.id());
        let state = OsrExecutionState::new(thread.id(), fx.method.clone(), base.id(), 12, 512, 448);

        let plan = Arc::new(
            ControllerPlan::new(
                CompilationPlan::opt(fx.method.clone(), 1).with_osr(state),
                base.id(),
                0,
                5.0,
            )
            .with_status(PlanStatus::OsrBase2Opt),
        );
        fx.memory.insert(Arc::clone(&plan));
        assert!(fx.memory.requested_osr(&fx.registry, base.id()));

        fx.recompiler(ok_compiler).run(CompileJob::Osr {
            plan: Arc::clone(&plan),
            thread: Arc::clone(&thread),
        });

        assert_eq!(plan.status(), PlanStatus::Completed);
        let target = fx.registry.get(plan.result_cmid()).unwrap();
        assert!(target.is_special_for_osr());
        // OSR code serves one frame; the method keeps its code.
        assert_eq!(fx.method.current_cmid(), base.id());
        assert!(thread.is_waiting_for_osr());
        assert!(thread.park_timeout(std::time::Duration::ZERO));
        assert_eq!(thread.post_thread_switch().unwrap().target, target.id());
    }

    #[test]
    fn test_osr_job_with_corrupt_frame_aborts_and_activates() {
        let fx = Fixture::new();
        let base = fx.baseline();
        let thread = Arc::new(VmThread::new(ThreadId(2), 1024));
        let state = OsrExecutionState::new(thread.id(), fx.method.clone(), base.id(), 0, 512, 448);
        let plan = Arc::new(
            ControllerPlan::new(CompilationPlan::opt(fx.method.clone(), 1).with_osr(state), base.id(), 0, 5.0)
                .with_status(PlanStatus::OsrBase2Opt),
        );

        fx.recompiler(ok_compiler).run(CompileJob::Osr {
            plan: Arc::clone(&plan),
            thread: Arc::clone(&thread),
        });

        assert_eq!(plan.status(), PlanStatus::AbortedCompilationError);
        assert!(!thread.is_waiting_for_osr());
        assert!(thread.park_timeout(std::time::Duration::ZERO));
    }
}
