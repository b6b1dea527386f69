//! Property: OSR operand flattening is lossless.
//!
//! For any chain of clean barriers, the reconstructed OSR point's flat
//! operand vector, split by each frame's live local and stack tag counts,
//! yields exactly the operands each barrier recorded, innermost frame first.

use proptest::prelude::*;
use vireo_core::{MethodId, MethodInfo, MethodRef, TypeId, TypeInfo};
use vireo_jit::osr::{OsrBarrier, OsrPointConstructor, TypeCode, ValueLocation};

fn arb_type_code() -> impl Strategy<Value = TypeCode> {
    prop_oneof![
        Just(TypeCode::Void),
        Just(TypeCode::Int),
        Just(TypeCode::Long),
        Just(TypeCode::Float),
        Just(TypeCode::Double),
        Just(TypeCode::Ref),
        Just(TypeCode::ReturnAddress),
        Just(TypeCode::Word),
    ]
}

fn arb_location() -> impl Strategy<Value = ValueLocation> {
    prop_oneof![
        (0u16..64).prop_map(ValueLocation::Register),
        (-512i32..0).prop_map(ValueLocation::Stack),
        any::<u64>().prop_map(ValueLocation::Constant),
    ]
}

/// One frame: (local tags, stack tags, bc index). Operands are generated to
/// match the live tags.
fn arb_frame() -> impl Strategy<Value = (Vec<(TypeCode, ValueLocation)>, Vec<(TypeCode, ValueLocation)>, u32)> {
    (
        proptest::collection::vec((arb_type_code(), arb_location()), 0..8),
        proptest::collection::vec((arb_type_code(), arb_location()), 0..5),
        0u32..500,
    )
}

fn method(id: u32) -> MethodRef {
    MethodInfo::new(MethodId(id), format!("f{id}"), TypeInfo::new(TypeId(9), "demo.Inline"))
        .with_bytecode_len(512)
        .into_ref()
}

fn live(slots: &[(TypeCode, ValueLocation)]) -> Vec<ValueLocation> {
    slots
        .iter()
        .filter(|(t, _)| t.is_live())
        .map(|(_, loc)| *loc)
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_flatten_then_split_recovers_frames(
        frames in proptest::collection::vec(arb_frame(), 1..5)
    ) {
        // barriers[0] is the outermost (compiled) method; each later barrier is
        // inlined into the previous one, so the last index is innermost.
        let methods: Vec<MethodRef> = (0..frames.len() as u32).map(|i| method(i + 1)).collect();
        let barriers: Vec<OsrBarrier> = frames
            .iter()
            .enumerate()
            .map(|(i, (locals, stack, bc))| {
                let mut bar = OsrBarrier::new(methods[i].clone(), *bc);
                for (t, loc) in locals {
                    bar = bar.with_local(*t, t.is_live().then_some(*loc));
                }
                for (t, loc) in stack {
                    bar = bar.with_stack(*t, t.is_live().then_some(*loc));
                }
                if i > 0 {
                    bar = bar.inlined_into(i - 1);
                }
                bar
            })
            .collect();

        let innermost = barriers.len() - 1;
        let point = OsrPointConstructor
            .construct(&methods[0], &barriers, innermost)
            .expect("clean chain must construct");

        let expected_total: usize = frames
            .iter()
            .map(|(l, s, _)| live(l).len() + live(s).len())
            .sum();
        prop_assert_eq!(point.operands().len(), expected_total);
        prop_assert_eq!(point.inline_depth(), frames.len());

        let split = point.split();
        for (k, part) in split.iter().enumerate() {
            let (locals, stack, bc) = &frames[frames.len() - 1 - k];
            prop_assert_eq!(part.frame.bc_index, *bc);
            prop_assert_eq!(part.locals.to_vec(), live(locals));
            prop_assert_eq!(part.stack.to_vec(), live(stack));
        }
    }

    #[test]
    fn prop_dropping_an_operand_is_rejected(
        frame in arb_frame().prop_filter("needs a live local", |(l, _, _)| l.iter().any(|(t, _)| t.is_live()))
    ) {
        let m = method(1);
        let (locals, stack, bc) = frame;
        let mut bar = OsrBarrier::new(m.clone(), bc);
        for (t, loc) in &locals {
            bar = bar.with_local(*t, t.is_live().then_some(*loc));
        }
        for (t, loc) in &stack {
            bar = bar.with_stack(*t, t.is_live().then_some(*loc));
        }
        bar.operands.pop();
        prop_assert!(OsrPointConstructor.construct(&m, &[bar], 0).is_err());
    }
}
