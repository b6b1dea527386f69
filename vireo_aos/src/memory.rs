//! Controller memory: the recompilation history of every method.
//!
//! ```text
//!   DashMap<MethodId, Arc<PlanList>>        (sharded, never globally locked)
//!        │
//!        └─▶ PlanList ── Mutex<Vec<Arc<ControllerPlan>>>  (append-only)
//!                          plan 0 ─ plan 1 ─ ... ─ latest
//! ```
//!
//! Every query about one method takes only that method's list lock, so
//! bookkeeping for unrelated methods never serializes.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxBuildHasher;
use vireo_core::tier::MAX_OPT_LEVEL;
use vireo_core::{Cmid, CompilerTier, MethodId, OptLevel};
use vireo_jit::{CompiledMethod, CompiledMethodRegistry};

use crate::plan::{ControllerPlan, PlanStatus};

const NUM_LEVELS: usize = MAX_OPT_LEVEL as usize + 1;

// =============================================================================
// Plan List
// =============================================================================

/// Append-only list of the plans issued for one method.
#[derive(Debug)]
pub struct PlanList {
    method: MethodId,
    plans: Mutex<Vec<Arc<ControllerPlan>>>,
}

impl PlanList {
    fn new(method: MethodId) -> Self {
        Self {
            method,
            plans: Mutex::new(Vec::new()),
        }
    }

    /// Method the plans belong to.
    #[inline]
    pub fn method(&self) -> MethodId {
        self.method
    }

    /// Number of plans issued.
    pub fn len(&self) -> usize {
        self.plans.lock().len()
    }

    /// Whether no plan was issued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the plans in insertion order.
    pub fn snapshot(&self) -> Vec<Arc<ControllerPlan>> {
        self.plans.lock().clone()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<Arc<ControllerPlan>>> {
        self.plans.lock()
    }
}

// =============================================================================
// Counters
// =============================================================================

/// Process-lifetime controller statistics. Reporting only.
#[derive(Debug, Default)]
pub struct ControllerCounters {
    awoken: AtomicU64,
    did_nothing: AtomicU64,
    methods_considered: AtomicU64,
    methods_scheduled: AtomicU64,
    num_base: AtomicU64,
    num_opt: [AtomicU64; NUM_LEVELS],
    completed: AtomicU64,
    aborted: AtomicU64,
}

impl ControllerCounters {
    #[inline]
    pub(crate) fn note_awoken(&self) {
        self.awoken.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn note_did_nothing(&self) {
        self.did_nothing.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn note_considered(&self) {
        self.methods_considered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn note_baseline_compiled(&self) {
        self.num_base.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn note_outcome(&self, completed: bool) {
        let counter = if completed { &self.completed } else { &self.aborted };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn note_scheduled(&self, level: Option<OptLevel>) {
        self.methods_scheduled.fetch_add(1, Ordering::Relaxed);
        if let Some(slot) = level.and_then(|l| self.num_opt.get(l as usize)) {
            slot.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Point-in-time copy.
    pub fn snapshot(&self) -> AosReport {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        AosReport {
            awoken: load(&self.awoken),
            did_nothing: load(&self.did_nothing),
            methods_considered: load(&self.methods_considered),
            methods_scheduled: load(&self.methods_scheduled),
            num_base: load(&self.num_base),
            num_opt: std::array::from_fn(|i| load(&self.num_opt[i])),
            completed: load(&self.completed),
            aborted: load(&self.aborted),
        }
    }
}

/// Snapshot of [`ControllerCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AosReport {
    /// Times the controller woke up for an event.
    pub awoken: u64,
    /// Events that led to no plan.
    pub did_nothing: u64,
    /// Hot methods examined by the strategy.
    pub methods_considered: u64,
    /// Plans inserted.
    pub methods_scheduled: u64,
    /// Baseline compilations observed.
    pub num_base: u64,
    /// Plans inserted per opt level.
    pub num_opt: [u64; NUM_LEVELS],
    /// Plans that completed.
    pub completed: u64,
    /// Plans aborted by a compilation error.
    pub aborted: u64,
}

impl fmt::Display for AosReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Controller awoken: {}", self.awoken)?;
        writeln!(f, "  Controller did nothing: {}", self.did_nothing)?;
        writeln!(f, "  Methods considered: {}", self.methods_considered)?;
        writeln!(f, "  Methods scheduled for recompilation: {}", self.methods_scheduled)?;
        writeln!(f, "  Baseline compilations: {}", self.num_base)?;
        for (level, n) in self.num_opt.iter().enumerate() {
            writeln!(f, "  Opt level {level} plans: {n}")?;
        }
        write!(f, "  Completed: {}, aborted: {}", self.completed, self.aborted)
    }
}

// =============================================================================
// Recompilation Summary
// =============================================================================

/// Bit for opt level `level` in a [`RecompilationSummary`] path pattern.
#[inline]
pub const fn level_bit(level: OptLevel) -> u8 {
    1 << level
}

/// How recompiled methods travelled through opt levels 0..=2.
///
/// Each method contributes one bit pattern: bit `n` is set when some plan
/// for it completed at opt level `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecompilationSummary {
    /// Methods per bit pattern; index 0 counts methods with no success.
    pub methods_by_path: [u64; 8],
    /// Repeated level-2 recompilations per bit pattern.
    pub level2_recompilations_by_path: [u64; 8],
}

impl RecompilationSummary {
    /// Methods that completed at least one recompilation.
    pub fn unique_methods(&self) -> u64 {
        self.methods_by_path[1..].iter().sum()
    }

    /// Total repeated level-2 recompilations.
    pub fn level2_recompilations(&self) -> u64 {
        self.level2_recompilations_by_path.iter().sum()
    }
}

impl fmt::Display for RecompilationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for pattern in 1..8u8 {
            f.write_str("    Base")?;
            for level in 0..=2 {
                if pattern & level_bit(level) != 0 {
                    write!(f, " -> {level}")?;
                }
            }
            let i = pattern as usize;
            write!(f, ": {}", self.methods_by_path[i])?;
            match self.level2_recompilations_by_path[i] {
                0 => writeln!(f)?,
                n => writeln!(f, " ({n} opt level 2 recomps)")?,
            }
        }
        writeln!(f, "  Num recompilations at level 2: {}", self.level2_recompilations())?;
        write!(f, "  Num unique methods recompiled: {}", self.unique_methods())
    }
}

// =============================================================================
// Controller Memory
// =============================================================================

/// Per-method history of recompilation plans.
#[derive(Debug, Default)]
pub struct ControllerMemory {
    table: DashMap<MethodId, Arc<PlanList>, FxBuildHasher>,
    counters: ControllerCounters,
}

impl ControllerMemory {
    /// Empty memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Statistics.
    #[inline]
    pub fn counters(&self) -> &ControllerCounters {
        &self.counters
    }

    /// Number of methods with at least one plan.
    pub fn num_methods(&self) -> usize {
        self.table.len()
    }

    /// Plan list of `method`, if any plan was issued.
    pub fn plan_list(&self, method: MethodId) -> Option<Arc<PlanList>> {
        self.table.get(&method).map(|entry| Arc::clone(entry.value()))
    }

    fn list_for(&self, method: MethodId) -> Arc<PlanList> {
        // The shard guard is released before the list lock is taken.
        let entry = self
            .table
            .entry(method)
            .or_insert_with(|| Arc::new(PlanList::new(method)));
        Arc::clone(entry.value())
    }

    /// Append `plan` to its method's list, creating the list on first use.
    pub fn insert(&self, plan: Arc<ControllerPlan>) {
        let list = self.list_for(plan.method().id());
        let mut plans = list.lock();
        self.append(&list, &mut plans, plan);
    }

    /// Append `plan` only if no existing plan blocks an initial
    /// recompilation of its method. The check and the append happen under
    /// one acquisition of the list lock.
    pub fn insert_if_admissible(&self, plan: Arc<ControllerPlan>) -> bool {
        let list = self.list_for(plan.method().id());
        let mut plans = list.lock();
        if plans.iter().any(|p| p.status().blocks_initial_recompilation()) {
            return false;
        }
        self.append(&list, &mut plans, plan);
        true
    }

    fn append(&self, list: &Arc<PlanList>, plans: &mut Vec<Arc<ControllerPlan>>, plan: Arc<ControllerPlan>) {
        self.counters.note_scheduled(plan.compilation().opt_level());
        plan.attach(list);
        plans.push(plan);
    }

    /// False if some plan for `method` is completed, in progress, aborted
    /// or outdated.
    pub fn should_consider_for_initial_recompilation(&self, method: MethodId) -> bool {
        self.plan_list(method).is_none_or(|list| {
            !list
                .lock()
                .iter()
                .any(|p| p.status().blocks_initial_recompilation())
        })
    }

    /// Most recently inserted plan for `method`.
    pub fn find_latest_plan(&self, method: MethodId) -> Option<Arc<ControllerPlan>> {
        self.plan_list(method)?.lock().last().cloned()
    }

    /// Plan that produced `cm`.
    pub fn find_matching_plan(&self, cm: &CompiledMethod) -> Option<Arc<ControllerPlan>> {
        let method = cm.method()?.id();
        self.plan_list(method)?
            .lock()
            .iter()
            .find(|p| p.result_cmid() == cm.id())
            .cloned()
    }

    /// Whether some plan for `method` is in `status`.
    pub fn plan_with_status(&self, method: MethodId, status: PlanStatus) -> bool {
        self.plan_list(method)
            .is_some_and(|list| list.lock().iter().any(|p| p.status() == status))
    }

    /// Whether a plan for `method` completed at opt `level`.
    pub fn completed_plan_with_opt_level(&self, method: MethodId, level: OptLevel) -> bool {
        self.plan_list(method).is_some_and(|list| {
            list.lock().iter().any(|p| {
                p.status() == PlanStatus::Completed && p.compilation().opt_level() == Some(level)
            })
        })
    }

    /// Whether `cmid` is baseline code whose method has an on-stack
    /// replacement to opt code in flight.
    pub fn requested_osr(&self, registry: &CompiledMethodRegistry, cmid: Cmid) -> bool {
        let Some(cm) = registry.get(cmid) else {
            return false;
        };
        if cm.tier() != CompilerTier::Baseline {
            return false;
        }
        cm.method()
            .is_some_and(|m| self.plan_with_status(m.id(), PlanStatus::OsrBase2Opt))
    }

    /// Mark every completed plan of `list` other than `keep` outdated.
    pub(crate) fn outdate_others(&self, list: &PlanList, keep: &ControllerPlan) {
        for plan in list.lock().iter() {
            if !std::ptr::eq(Arc::as_ptr(plan), keep) && plan.status() == PlanStatus::Completed {
                plan.set_status(PlanStatus::Outdated);
            }
        }
    }

    /// Opt-level paths taken by every recompiled method.
    pub fn final_method_stats(&self) -> RecompilationSummary {
        let mut summary = RecompilationSummary::default();
        for entry in self.table.iter() {
            let mut pattern = 0u8;
            let mut level2 = 0u64;
            for plan in entry.value().lock().iter() {
                if !plan.status().is_completed_or_outdated() {
                    continue;
                }
                let Some(level) = plan.compilation().opt_level().filter(|l| *l <= 2) else {
                    continue;
                };
                if level == 2 && pattern & level_bit(2) != 0 {
                    level2 += 1;
                }
                pattern |= level_bit(level);
            }
            summary.methods_by_path[pattern as usize] += 1;
            summary.level2_recompilations_by_path[pattern as usize] += level2;
        }
        summary
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::CompilationPlan;
    use vireo_core::{MethodInfo, MethodRef, TypeId, TypeInfo};
    use vireo_jit::{CodeInfo, MachineCode};

    fn method(id: u32) -> MethodRef {
        MethodInfo::new(MethodId(id), format!("m{id}"), TypeInfo::new(TypeId(5), "demo.Mem")).into_ref()
    }

    fn plan(m: &MethodRef, level: OptLevel, status: PlanStatus) -> Arc<ControllerPlan> {
        Arc::new(
            ControllerPlan::new(CompilationPlan::opt(m.clone(), level), Cmid::new(1), 0, 1.0)
                .with_status(status),
        )
    }

    #[test]
    fn test_insert_creates_list_and_links_plan() {
        let memory = ControllerMemory::new();
        let m = method(1);
        assert!(memory.find_latest_plan(m.id()).is_none());

        let p = plan(&m, 1, PlanStatus::InProgress);
        memory.insert(Arc::clone(&p));
        let list = p.plan_list().unwrap();
        assert_eq!(list.method(), m.id());
        assert_eq!(list.len(), 1);
        assert_eq!(memory.num_methods(), 1);

        let report = memory.counters().snapshot();
        assert_eq!(report.methods_scheduled, 1);
        assert_eq!(report.num_opt[1], 1);
    }

    #[test]
    fn test_latest_plan_is_last_inserted() {
        let memory = ControllerMemory::new();
        let m = method(1);
        memory.insert(plan(&m, 0, PlanStatus::Completed));
        let second = plan(&m, 2, PlanStatus::InProgress);
        memory.insert(Arc::clone(&second));
        assert!(Arc::ptr_eq(&memory.find_latest_plan(m.id()).unwrap(), &second));
    }

    #[test]
    fn test_admission_gate() {
        let memory = ControllerMemory::new();
        let m = method(1);
        assert!(memory.should_consider_for_initial_recompilation(m.id()));

        memory.insert(plan(&m, 1, PlanStatus::OsrBase2Opt));
        assert!(memory.should_consider_for_initial_recompilation(m.id()));

        for status in [
            PlanStatus::InProgress,
            PlanStatus::Completed,
            PlanStatus::AbortedCompilationError,
            PlanStatus::Outdated,
        ] {
            let other = method(10 + status as u32);
            memory.insert(plan(&other, 1, status));
            assert!(!memory.should_consider_for_initial_recompilation(other.id()));
        }
    }

    #[test]
    fn test_insert_if_admissible_rejects_second() {
        let memory = ControllerMemory::new();
        let m = method(3);
        assert!(memory.insert_if_admissible(plan(&m, 1, PlanStatus::InProgress)));
        assert!(!memory.insert_if_admissible(plan(&m, 1, PlanStatus::InProgress)));
        assert_eq!(memory.plan_list(m.id()).unwrap().len(), 1);
        assert_eq!(memory.counters().snapshot().methods_scheduled, 1);
    }

    #[test]
    fn test_status_queries() {
        let memory = ControllerMemory::new();
        let m = method(4);
        memory.insert(plan(&m, 0, PlanStatus::Outdated));
        memory.insert(plan(&m, 2, PlanStatus::Completed));
        assert!(memory.plan_with_status(m.id(), PlanStatus::Outdated));
        assert!(!memory.plan_with_status(m.id(), PlanStatus::InProgress));
        assert!(memory.completed_plan_with_opt_level(m.id(), 2));
        assert!(!memory.completed_plan_with_opt_level(m.id(), 0));
        assert!(!memory.plan_with_status(method(99).id(), PlanStatus::Completed));
    }

    #[test]
    fn test_find_matching_plan_by_result_cmid() {
        let registry = CompiledMethodRegistry::for_testing();
        let memory = ControllerMemory::new();
        let m = method(5);
        let cm = registry.create(m.clone(), CompilerTier::Opt { level: 1 }).unwrap();

        let p = plan(&m, 1, PlanStatus::InProgress);
        memory.insert(Arc::clone(&p));
        assert!(memory.find_matching_plan(&cm).is_none());
        p.finish(PlanStatus::Completed, cm.id(), 1);
        assert!(Arc::ptr_eq(&memory.find_matching_plan(&cm).unwrap(), &p));
    }

    #[test]
    fn test_requested_osr_only_for_baseline() {
        let registry = CompiledMethodRegistry::for_testing();
        let memory = ControllerMemory::new();
        let m = method(6);
        let base = registry.create(m.clone(), CompilerTier::Baseline).unwrap();
        base.compile_complete(CodeInfo::new(MachineCode::new(0x100, 0x40)));
        let opt = registry.create(m.clone(), CompilerTier::Opt { level: 0 }).unwrap();

        assert!(!memory.requested_osr(&registry, base.id()));
        memory.insert(plan(&m, 1, PlanStatus::OsrBase2Opt));
        assert!(memory.requested_osr(&registry, base.id()));
        assert!(!memory.requested_osr(&registry, opt.id()));
        assert!(!memory.requested_osr(&registry, Cmid::new(500)));
    }

    #[test]
    fn test_outdate_others() {
        let memory = ControllerMemory::new();
        let m = method(7);
        let old = plan(&m, 0, PlanStatus::Completed);
        let aborted = plan(&m, 1, PlanStatus::AbortedCompilationError);
        let new = plan(&m, 2, PlanStatus::Completed);
        for p in [&old, &aborted, &new] {
            memory.insert(Arc::clone(p));
        }
        memory.outdate_others(&new.plan_list().unwrap(), &new);
        assert_eq!(old.status(), PlanStatus::Outdated);
        assert_eq!(aborted.status(), PlanStatus::AbortedCompilationError);
        assert_eq!(new.status(), PlanStatus::Completed);
    }

    #[test]
    fn test_final_method_stats() {
        let memory = ControllerMemory::new();
        let a = method(1);
        memory.insert(plan(&a, 0, PlanStatus::Outdated));
        memory.insert(plan(&a, 1, PlanStatus::Outdated));
        memory.insert(plan(&a, 2, PlanStatus::Outdated));
        memory.insert(plan(&a, 2, PlanStatus::Completed));
        let b = method(2);
        memory.insert(plan(&b, 1, PlanStatus::Completed));
        let c = method(3);
        memory.insert(plan(&c, 2, PlanStatus::AbortedCompilationError));

        let summary = memory.final_method_stats();
        assert_eq!(summary.methods_by_path[0b111], 1);
        assert_eq!(summary.level2_recompilations_by_path[0b111], 1);
        assert_eq!(summary.methods_by_path[0b010], 1);
        assert_eq!(summary.methods_by_path[0], 1);
        assert_eq!(summary.unique_methods(), 2);

        let text = summary.to_string();
        assert!(text.contains("Base -> 0 -> 1 -> 2: 1 (1 opt level 2 recomps)"));
        assert!(text.contains("Num unique methods recompiled: 2"));
    }

    #[test]
    fn test_report_display() {
        let memory = ControllerMemory::new();
        memory.counters().note_awoken();
        memory.counters().note_did_nothing();
        let text = memory.counters().snapshot().to_string();
        assert!(text.contains("Controller awoken: 1"));
        assert!(text.contains("Controller did nothing: 1"));
    }
}
