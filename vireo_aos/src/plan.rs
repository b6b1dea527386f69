//! Recompilation decisions.
//!
//! A [`ControllerPlan`] records one decision to recompile a method and tracks
//! it to completion:
//!
//! ```text
//!   Uninitialized ──▶ InProgress ──┬──▶ Completed ──▶ Outdated
//!                                  └──▶ AbortedCompilationError
//!
//!   Uninitialized ──▶ OsrBase2Opt ──┬──▶ Completed
//!                                   └──▶ AbortedCompilationError
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use vireo_core::{Cmid, CompilerTier, MethodRef, OptLevel};
use vireo_jit::osr::OsrExecutionState;

use crate::memory::PlanList;

// =============================================================================
// Plan Status
// =============================================================================

/// Lifecycle state of a [`ControllerPlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PlanStatus {
    /// Created but not yet dispatched.
    Uninitialized = 0,
    /// Compilation dispatched and not yet finished.
    InProgress = 1,
    /// Compilation succeeded and the result was installed.
    Completed = 2,
    /// The compiler reported a failure.
    AbortedCompilationError = 3,
    /// A later plan for the same method completed.
    Outdated = 4,
    /// On-stack replacement of baseline code with opt code is in flight.
    OsrBase2Opt = 5,
}

impl PlanStatus {
    #[inline]
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => PlanStatus::InProgress,
            2 => PlanStatus::Completed,
            3 => PlanStatus::AbortedCompilationError,
            4 => PlanStatus::Outdated,
            5 => PlanStatus::OsrBase2Opt,
            _ => PlanStatus::Uninitialized,
        }
    }

    /// Whether a plan in this state blocks a fresh initial recompilation.
    #[inline]
    pub const fn blocks_initial_recompilation(self) -> bool {
        matches!(
            self,
            PlanStatus::Completed
                | PlanStatus::InProgress
                | PlanStatus::AbortedCompilationError
                | PlanStatus::Outdated
        )
    }

    /// Whether the plan ended in success (possibly since superseded).
    #[inline]
    pub const fn is_completed_or_outdated(self) -> bool {
        matches!(self, PlanStatus::Completed | PlanStatus::Outdated)
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlanStatus::Uninitialized => "uninitialized",
            PlanStatus::InProgress => "in-progress",
            PlanStatus::Completed => "completed",
            PlanStatus::AbortedCompilationError => "aborted",
            PlanStatus::Outdated => "outdated",
            PlanStatus::OsrBase2Opt => "osr-base2opt",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Compilation Plan
// =============================================================================

/// Profiling the compiler should weave into the generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstrumentationPlan {
    /// Count taken/not-taken edges of conditional branches.
    pub edge_counters: bool,
    /// Count executed yield points.
    pub yieldpoint_counters: bool,
}

/// What to compile and how.
#[derive(Debug, Clone)]
pub struct CompilationPlan {
    /// Method to compile.
    pub method: MethodRef,
    /// Tier to compile at.
    pub target: CompilerTier,
    /// Optional instrumentation.
    pub instrumentation: Option<InstrumentationPlan>,
    /// Frame state the code must be specialized to enter mid-method.
    pub osr: Option<OsrExecutionState>,
}

impl CompilationPlan {
    /// Plain compilation of `method` at opt `level`.
    pub fn opt(method: MethodRef, level: OptLevel) -> Self {
        Self {
            method,
            target: CompilerTier::Opt { level },
            instrumentation: None,
            osr: None,
        }
    }

    /// Request instrumentation.
    #[inline]
    pub fn with_instrumentation(mut self, plan: InstrumentationPlan) -> Self {
        self.instrumentation = Some(plan);
        self
    }

    /// Specialize for entry at an OSR point.
    #[inline]
    pub fn with_osr(mut self, state: OsrExecutionState) -> Self {
        self.osr = Some(state);
        self
    }

    /// Opt level targeted, if the target is optimized code.
    #[inline]
    pub fn opt_level(&self) -> Option<OptLevel> {
        self.target.opt_level()
    }
}

// =============================================================================
// Controller Plan
// =============================================================================

/// One recompilation decision and its outcome.
pub struct ControllerPlan {
    compilation: CompilationPlan,
    source_cmid: Cmid,
    priority: f64,
    expected_speedup: f64,
    expected_compilation_time: f64,
    created_at: u64,
    initiated_at: AtomicU64,
    completed_at: AtomicU64,
    status: AtomicU8,
    result_cmid: AtomicU32,
    plan_list: OnceLock<Weak<PlanList>>,
}

impl ControllerPlan {
    /// New, uninitialized plan.
    pub fn new(
        compilation: CompilationPlan,
        source_cmid: Cmid,
        created_at: u64,
        priority: f64,
    ) -> Self {
        Self {
            compilation,
            source_cmid,
            priority,
            expected_speedup: 1.0,
            expected_compilation_time: 0.0,
            created_at,
            initiated_at: AtomicU64::new(0),
            completed_at: AtomicU64::new(0),
            status: AtomicU8::new(PlanStatus::Uninitialized as u8),
            result_cmid: AtomicU32::new(Cmid::NONE.as_u32()),
            plan_list: OnceLock::new(),
        }
    }

    /// Record the cost model's estimates.
    #[inline]
    pub fn with_estimates(mut self, expected_speedup: f64, expected_compilation_time: f64) -> Self {
        self.expected_speedup = expected_speedup;
        self.expected_compilation_time = expected_compilation_time;
        self
    }

    /// Start in `status` instead of `Uninitialized`.
    #[inline]
    pub fn with_status(self, status: PlanStatus) -> Self {
        self.status.store(status as u8, Ordering::Relaxed);
        self
    }

    /// What to compile.
    #[inline]
    pub fn compilation(&self) -> &CompilationPlan {
        &self.compilation
    }

    /// Method being recompiled.
    #[inline]
    pub fn method(&self) -> &MethodRef {
        &self.compilation.method
    }

    /// Compiled method whose profile triggered the plan.
    #[inline]
    pub fn source_cmid(&self) -> Cmid {
        self.source_cmid
    }

    /// Queue priority the plan was issued at.
    #[inline]
    pub fn priority(&self) -> f64 {
        self.priority
    }

    /// Estimated speedup over the current code.
    #[inline]
    pub fn expected_speedup(&self) -> f64 {
        self.expected_speedup
    }

    /// Estimated compile time in milliseconds.
    #[inline]
    pub fn expected_compilation_time(&self) -> f64 {
        self.expected_compilation_time
    }

    /// Controller clock when the plan was created.
    #[inline]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Controller clock when compilation was dispatched.
    #[inline]
    pub fn initiated_at(&self) -> u64 {
        self.initiated_at.load(Ordering::Relaxed)
    }

    /// Controller clock when compilation finished.
    #[inline]
    pub fn completed_at(&self) -> u64 {
        self.completed_at.load(Ordering::Relaxed)
    }

    /// Current status.
    #[inline]
    pub fn status(&self) -> PlanStatus {
        PlanStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Compiled method produced by the plan, or [`Cmid::NONE`].
    #[inline]
    pub fn result_cmid(&self) -> Cmid {
        Cmid::new(self.result_cmid.load(Ordering::Acquire))
    }

    /// Plan list this plan was inserted into.
    pub fn plan_list(&self) -> Option<Arc<PlanList>> {
        self.plan_list.get().and_then(Weak::upgrade)
    }

    pub(crate) fn attach(&self, list: &Arc<PlanList>) {
        let _ = self.plan_list.set(Arc::downgrade(list));
    }

    pub(crate) fn set_status(&self, status: PlanStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn mark_initiated(&self, clock: u64) {
        self.initiated_at.store(clock, Ordering::Relaxed);
    }

    pub(crate) fn finish(&self, status: PlanStatus, result: Cmid, clock: u64) {
        self.completed_at.store(clock, Ordering::Relaxed);
        self.result_cmid.store(result.as_u32(), Ordering::Release);
        self.set_status(status);
    }
}

impl fmt::Debug for ControllerPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerPlan")
            .field("method", &self.compilation.method.id())
            .field("target", &self.compilation.target)
            .field("source_cmid", &self.source_cmid)
            .field("status", &self.status())
            .field("result_cmid", &self.result_cmid())
            .field("priority", &self.priority)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
