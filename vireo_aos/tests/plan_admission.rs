//! Property: however hot-method events, counter trips and rebaselining
//! interleave, a method never has two plans in progress and is recompiled
//! at most once outside of OSR.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use proptest::prelude::*;
use vireo_aos::{
    AdaptiveSystem, AosConfig, CompilationRequest, CompilerOutput, ControllerMemory, NullListener,
    PlanStatus, SampleSite,
};
use vireo_core::{MethodId, MethodInfo, MethodRef, TypeId, TypeInfo, VireoError, VireoResult};
use vireo_jit::{CodeInfo, MachineCode, RegistryConfig};

const METHODS: u32 = 4;

#[derive(Debug, Clone)]
enum Op {
    Sample(u32),
    Trip(u32),
    Rebaseline(u32),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..METHODS).prop_map(Op::Sample),
        2 => (0..METHODS).prop_map(Op::Trip),
        1 => (0..METHODS).prop_map(Op::Rebaseline),
    ]
}

fn method(id: u32) -> MethodRef {
    MethodInfo::new(MethodId(id), format!("p{id}"), TypeInfo::new(TypeId(8), "prop.M"))
        .with_bytecode_len(40)
        .into_ref()
}

fn in_progress(memory: &ControllerMemory, method: MethodId) -> usize {
    memory.plan_list(method).map_or(0, |list| {
        list.snapshot()
            .iter()
            .filter(|p| p.status() == PlanStatus::InProgress)
            .count()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_at_most_one_plan_in_progress(
        ops in proptest::collection::vec(arb_op(), 1..40),
        failing in 0..METHODS,
    ) {
        let memory_slot: Arc<OnceLock<Arc<ControllerMemory>>> = Arc::new(OnceLock::new());
        let violations = Arc::new(AtomicUsize::new(0));

        let compiler = {
            let memory_slot = Arc::clone(&memory_slot);
            let violations = Arc::clone(&violations);
            move |req: &CompilationRequest| -> VireoResult<CompilerOutput> {
                if let Some(memory) = memory_slot.get() {
                    if in_progress(memory, req.method.id()) != 1 {
                        violations.fetch_add(1, Ordering::Relaxed);
                    }
                }
                if req.method.id().0 == failing {
                    return Err(VireoError::compilation_failed(req.method.id(), req.tier, "injected"));
                }
                Ok(CompilerOutput::new(CodeInfo::new(MachineCode::new(
                    0x80_000 + req.method.id().0 as usize * 0x1000,
                    0x100,
                ))))
            }
        };
        let system = AdaptiveSystem::builder(
            AosConfig::for_testing().with_invocation_count_threshold(1_000),
            Arc::new(compiler),
        )
        .with_listener(Arc::new(NullListener))
        .with_registry_config(RegistryConfig::for_testing())
        .boot()
        .unwrap();
        prop_assert!(memory_slot.set(Arc::clone(system.memory())).is_ok());

        let methods: Vec<MethodRef> = (0..METHODS).map(method).collect();
        let mut baselines = Vec::new();
        for m in &methods {
            let cm = system
                .on_baseline_compiled(m, CodeInfo::new(MachineCode::new(0x1000 * (m.id().0 as usize + 1), 0x80)))
                .unwrap();
            baselines.push(cm.id());
        }

        for op in ops {
            match op {
                Op::Sample(i) => {
                    let cmid = methods[i as usize].current_cmid();
                    system.record_method_sample(cmid, SampleSite::Prologue);
                    system.record_method_sample(cmid, SampleSite::Epilogue);
                }
                Op::Trip(i) => {
                    system.invocation_counts().unwrap().counter_tripped(baselines[i as usize]);
                }
                Op::Rebaseline(i) => {
                    let m = &methods[i as usize];
                    let cm = system
                        .on_baseline_compiled(m, CodeInfo::new(MachineCode::new(0x40_000 + m.id().0 as usize * 0x100, 0x80)))
                        .unwrap();
                    baselines[i as usize] = cm.id();
                }
            }
        }

        prop_assert_eq!(violations.load(Ordering::Relaxed), 0);
        for m in &methods {
            let plans = system
                .memory()
                .plan_list(m.id())
                .map(|list| list.snapshot())
                .unwrap_or_default();
            let recompilations = plans
                .iter()
                .filter(|p| p.status() != PlanStatus::OsrBase2Opt)
                .count();
            prop_assert!(recompilations <= 1);
            prop_assert_eq!(in_progress(system.memory(), m.id()), 0);
            if m.id().0 == failing {
                prop_assert!(plans.iter().all(|p| p.status() == PlanStatus::AbortedCompilationError));
            }
        }
    }
}
