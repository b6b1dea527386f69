//! Compiler tiers.
//!
//! A compiled method is produced by exactly one tier. The optimizing tier
//! carries its optimization level as payload; the other tiers are plain tags.

use std::fmt;

/// Optimization level of the optimizing compiler (0 is the cheapest).
pub type OptLevel = u8;

/// Highest optimization level the optimizing compiler supports.
pub const MAX_OPT_LEVEL: OptLevel = 4;

/// Tier that produced a compiled method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompilerTier {
    /// Hardware-trap pseudo method.
    Trap,
    /// Fast, non-optimizing compiler.
    Baseline,
    /// Optimizing compiler at the given level.
    Opt {
        /// Optimization level.
        level: OptLevel,
    },
    /// Native-transition stubs.
    NativeTransition,
}

impl CompilerTier {
    /// Number of distinct tier tags.
    pub const NUM_TAGS: usize = 4;

    /// Dense tag index used by per-tier tables.
    #[inline]
    pub const fn tag(self) -> usize {
        match self {
            CompilerTier::Trap => 0,
            CompilerTier::Baseline => 1,
            CompilerTier::Opt { .. } => 2,
            CompilerTier::NativeTransition => 3,
        }
    }

    /// Whether this is optimized code.
    #[inline]
    pub const fn is_opt(self) -> bool {
        matches!(self, CompilerTier::Opt { .. })
    }

    /// Optimization level, or `None` for non-optimizing tiers.
    #[inline]
    pub const fn opt_level(self) -> Option<OptLevel> {
        match self {
            CompilerTier::Opt { level } => Some(level),
            _ => None,
        }
    }

    /// Short lowercase name of the tier tag.
    pub const fn tag_name(self) -> &'static str {
        match self {
            CompilerTier::Trap => "trap",
            CompilerTier::Baseline => "baseline",
            CompilerTier::Opt { .. } => "opt",
            CompilerTier::NativeTransition => "native",
        }
    }
}

impl fmt::Display for CompilerTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompilerTier::Opt { level } => write!(f, "opt{level}"),
            other => f.write_str(other.tag_name()),
        }
    }
}
