//! Recompilation strategy.
//!
//! The cost/benefit model assumes a method will run for as long in the
//! future as it has run so far, as estimated from its samples:
//!
//! ```text
//!   T_future(cur)   = samples * sample_interval
//!   cost(L)         = compile_time(L) + T_future(cur) * speedup(cur) / speedup(L)
//!   choose L > cur with the smallest cost(L), if cost(L) < T_future(cur)
//! ```
//!
//! Compile time and speedup per tier come from [`CompilerDna`].

use vireo_core::{CompilerTier, OptLevel};

use crate::config::AosConfig;
use crate::event::HotMethodEvent;

// =============================================================================
// Compiler DNA
// =============================================================================

/// Measured characteristics of each compiler tier.
///
/// Index 0 is the baseline compiler; index `n + 1` is opt level `n`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompilerDna {
    /// Bytecodes compiled per millisecond.
    pub compile_rates: [f64; 4],
    /// Execution speed relative to baseline code.
    pub speedups: [f64; 4],
}

impl Default for CompilerDna {
    fn default() -> Self {
        Self {
            compile_rates: [909.46, 10.50, 4.36, 2.89],
            speedups: [1.00, 4.26, 6.07, 7.30],
        }
    }
}

impl CompilerDna {
    /// Highest opt level the DNA describes.
    pub const MAX_MODELLED_LEVEL: OptLevel = 2;

    fn index(tier: CompilerTier) -> Option<usize> {
        match tier {
            CompilerTier::Baseline => Some(0),
            CompilerTier::Opt { level } if level <= Self::MAX_MODELLED_LEVEL => {
                Some(level as usize + 1)
            }
            _ => None,
        }
    }

    /// Speed of `tier` relative to baseline, if modelled.
    pub fn speedup(&self, tier: CompilerTier) -> Option<f64> {
        Self::index(tier).map(|i| self.speedups[i])
    }

    /// Estimated milliseconds to compile `bytecode_len` bytecodes at `tier`.
    pub fn compile_time_ms(&self, tier: CompilerTier, bytecode_len: u32) -> Option<f64> {
        Self::index(tier).map(|i| f64::from(bytecode_len) / self.compile_rates[i])
    }
}

// =============================================================================
// Strategy
// =============================================================================

/// A decision to recompile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecompilationChoice {
    /// Tier to compile at; always above the sampled code's tier.
    pub target: CompilerTier,
    /// Speedup over the sampled code.
    pub expected_speedup: f64,
    /// Estimated compile time in milliseconds.
    pub expected_compilation_time: f64,
    /// Estimated milliseconds saved; used as the plan priority.
    pub benefit: f64,
}

/// Decides whether and how to recompile a hot method.
pub trait RecompilationStrategy: Send + Sync {
    /// Choose a target strictly above the event's tier, or `None`.
    fn consider_hot_method(&self, event: &HotMethodEvent, config: &AosConfig) -> Option<RecompilationChoice>;
}

/// The analytic cost/benefit model.
#[derive(Debug, Clone, Default)]
pub struct CostBenefitStrategy {
    dna: CompilerDna,
}

impl CostBenefitStrategy {
    /// Strategy with the given compiler characteristics.
    pub fn new(dna: CompilerDna) -> Self {
        Self { dna }
    }

    /// Compiler characteristics in use.
    #[inline]
    pub fn dna(&self) -> &CompilerDna {
        &self.dna
    }
}

impl RecompilationStrategy for CostBenefitStrategy {
    fn consider_hot_method(&self, event: &HotMethodEvent, config: &AosConfig) -> Option<RecompilationChoice> {
        let current = event.prev_compiler();
        let current_speedup = self.dna.speedup(current)?;
        let bytecode_len = event.method()?.bytecode_len();

        let future_ms = event.num_samples() * config.sample_interval.as_secs_f64() * 1000.0;
        let first = current.opt_level().map_or(0, |l| l + 1);
        let last = config.max_opt_level.min(CompilerDna::MAX_MODELLED_LEVEL);

        let mut best: Option<(f64, RecompilationChoice)> = None;
        for level in first..=last {
            let target = CompilerTier::Opt { level };
            let (Some(speedup), Some(compile_ms)) = (
                self.dna.speedup(target),
                self.dna.compile_time_ms(target, bytecode_len),
            ) else {
                continue;
            };
            let cost = compile_ms + future_ms * current_speedup / speedup;
            if best.as_ref().is_none_or(|(c, _)| cost < *c) {
                best = Some((
                    cost,
                    RecompilationChoice {
                        target,
                        expected_speedup: speedup / current_speedup,
                        expected_compilation_time: compile_ms,
                        benefit: future_ms - cost,
                    },
                ));
            }
        }

        best.filter(|(cost, _)| *cost < future_ms).map(|(_, choice)| choice)
    }
}

// =============================================================================
// Tests
// =============================================================================
