//! Per-tier operations.
//!
//! Code that walks frames needs a few answers that depend on which compiler
//! produced the frame: how exceptions are delivered into it, what the
//! producing compiler is called, and whether a given instruction lies in
//! uninterruptible code. Instead of virtual dispatch on the compiled method,
//! each tier tag owns an entry in a [`TierOpsTable`]. New tiers register their
//! entry at boot.

use parking_lot::RwLock;
use vireo_core::CompilerTier;

use crate::compiled_method::CompiledMethod;

/// How exceptions unwind through frames of a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionDeliverer {
    /// Frames are walked using the baseline frame layout.
    BaselineFrame,
    /// Frames are walked using the optimizing compiler's maps.
    OptFrame,
    /// The exception is rethrown after returning to managed code.
    NativeReturn,
    /// Frames of this tier never catch exceptions.
    Unwind,
}

/// Operations registered for one tier tag.
#[derive(Debug, Clone, Copy)]
pub struct TierOps {
    /// Human-readable compiler name.
    pub compiler_name: &'static str,
    /// Exception delivery strategy.
    pub exception_deliverer: ExceptionDeliverer,
    /// Whether the instruction at `offset` lies in uninterruptible code.
    pub is_within_uninterruptible_code: fn(&CompiledMethod, usize) -> bool,
}

fn method_is_uninterruptible(cm: &CompiledMethod, _offset: usize) -> bool {
    cm.method().is_some_and(|m| m.is_uninterruptible())
}

fn never(_cm: &CompiledMethod, _offset: usize) -> bool {
    false
}

fn always(_cm: &CompiledMethod, _offset: usize) -> bool {
    true
}

impl TierOps {
    /// Entry for the hardware-trap pseudo method.
    pub const TRAP: TierOps = TierOps {
        compiler_name: "hardware trap",
        exception_deliverer: ExceptionDeliverer::Unwind,
        is_within_uninterruptible_code: never,
    };

    /// Entry for the baseline compiler.
    pub const BASELINE: TierOps = TierOps {
        compiler_name: "baseline compiler",
        exception_deliverer: ExceptionDeliverer::BaselineFrame,
        is_within_uninterruptible_code: method_is_uninterruptible,
    };

    /// Entry for the optimizing compiler.
    pub const OPT: TierOps = TierOps {
        compiler_name: "optimizing compiler",
        exception_deliverer: ExceptionDeliverer::OptFrame,
        is_within_uninterruptible_code: method_is_uninterruptible,
    };

    /// Entry for native-transition stubs.
    pub const NATIVE: TierOps = TierOps {
        compiler_name: "native transition compiler",
        exception_deliverer: ExceptionDeliverer::NativeReturn,
        is_within_uninterruptible_code: always,
    };
}

/// Registration table keyed by tier tag.
#[derive(Debug)]
pub struct TierOpsTable {
    ops: RwLock<[Option<TierOps>; CompilerTier::NUM_TAGS]>,
}

impl Default for TierOpsTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl TierOpsTable {
    /// Empty table.
    pub fn empty() -> Self {
        Self {
            ops: RwLock::new([None; CompilerTier::NUM_TAGS]),
        }
    }

    /// Table with every built-in tier registered.
    pub fn standard() -> Self {
        let table = Self::empty();
        table.register(CompilerTier::Trap, TierOps::TRAP);
        table.register(CompilerTier::Baseline, TierOps::BASELINE);
        table.register(CompilerTier::Opt { level: 0 }, TierOps::OPT);
        table.register(CompilerTier::NativeTransition, TierOps::NATIVE);
        table
    }

    /// Register or replace the entry for `tier`'s tag.
    pub fn register(&self, tier: CompilerTier, ops: TierOps) {
        self.ops.write()[tier.tag()] = Some(ops);
    }

    /// Entry for `tier`'s tag.
    #[inline]
    pub fn get(&self, tier: CompilerTier) -> Option<TierOps> {
        self.ops.read()[tier.tag()]
    }

    /// Name of the compiler that produced `cm`.
    pub fn compiler_name(&self, cm: &CompiledMethod) -> &'static str {
        self.get(cm.tier()).map_or("unknown compiler", |o| o.compiler_name)
    }

    /// Exception delivery for frames of `cm`.
    pub fn exception_deliverer(&self, cm: &CompiledMethod) -> Option<ExceptionDeliverer> {
        self.get(cm.tier()).map(|o| o.exception_deliverer)
    }

    /// Whether the return address `ip` lies in uninterruptible code of `cm`.
    pub fn is_within_uninterruptible_code(&self, cm: &CompiledMethod, ip: usize) -> bool {
        let Some(ops) = self.get(cm.tier()) else {
            return false;
        };
        let offset = cm.instruction_offset(ip).unwrap_or(0);
        (ops.is_within_uninterruptible_code)(cm, offset)
    }
}
