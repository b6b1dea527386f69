//! Error types for the adaptive runtime.
//!
//! Failures fall into a few classes with very different consequences:
//! - Compilation failures are recoverable; the controller records them on the
//!   plan and keeps running the old code.
//! - Registry exhaustion and unknown CMIDs are reported to the caller.
//! - Structural violations (malformed OSR points, corrupted frames) abort
//!   only the operation in progress.

use thiserror::Error;

use crate::ids::{Cmid, MethodId, ThreadId};
use crate::tier::CompilerTier;

/// Result alias used throughout Vireo.
pub type VireoResult<T> = Result<T, VireoError>;

/// Errors raised by the adaptive runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VireoError {
    /// The compiler rejected or failed a request.
    #[error("compilation of {method} at {tier} failed: {reason}")]
    CompilationFailed {
        /// Method being compiled.
        method: MethodId,
        /// Requested tier.
        tier: CompilerTier,
        /// Compiler-provided reason.
        reason: String,
    },

    /// The memory manager refused to grow the compiled-method table.
    #[error("compiled-method table exhausted (requested {requested} slots)")]
    RegistryExhausted {
        /// Slot count that could not be allocated.
        requested: usize,
    },

    /// A CMID outside the issued range or referring to a reclaimed slot.
    #[error("invalid compiled method id {0}")]
    InvalidCmid(Cmid),

    /// A frame on a thread stack named a compiled method that does not exist.
    #[error("stack corruption: frame at fp offset {fp_offset} names unknown {cmid}")]
    StackCorruption {
        /// Frame-pointer offset of the offending frame.
        fp_offset: usize,
        /// Id read from the frame.
        cmid: Cmid,
    },

    /// OSR point construction found an inconsistent barrier chain.
    #[error("malformed OSR point: {0}")]
    MalformedOsrPoint(String),

    /// An instruction address that does not belong to the compiled method.
    #[error("address {ip:#x} is outside {cmid} (owned by {owner:?})")]
    InstructionOutOfRange {
        /// Method that was asked.
        cmid: Cmid,
        /// Offending address.
        ip: usize,
        /// Method actually containing the address, if any.
        owner: Option<Cmid>,
    },

    /// OSR installation targeted code without an OSR entry slot.
    #[error("{0} is not specialized for on-stack replacement")]
    NotSpecialForOsr(Cmid),

    /// OSR was requested out of a frame whose tier has no glue template.
    #[error("cannot replace a {tier} frame of {cmid}")]
    UnsupportedOsrOrigin {
        /// Compiled method owning the frame.
        cmid: Cmid,
        /// Its tier.
        tier: CompilerTier,
    },

    /// The controller queue or the compilation job queue has been shut down.
    #[error("work queue closed")]
    QueueClosed,

    /// The referenced thread is not known to the thread registry.
    #[error("{0} is not registered")]
    ThreadNotRegistered(ThreadId),

    /// A system thread could not be started.
    #[error("failed to spawn {name} thread: {reason}")]
    ThreadSpawn {
        /// Thread name.
        name: &'static str,
        /// Operating system error.
        reason: String,
    },
}

impl VireoError {
    /// Convenience constructor for compiler failures.
    pub fn compilation_failed(
        method: MethodId,
        tier: CompilerTier,
        reason: impl Into<String>,
    ) -> Self {
        VireoError::CompilationFailed {
            method,
            tier,
            reason: reason.into(),
        }
    }

    /// Whether the operation that raised this may be retried with the old
    /// code remaining active.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VireoError::CompilationFailed { .. }
                | VireoError::MalformedOsrPoint(_)
                | VireoError::QueueClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VireoError::compilation_failed(
            MethodId(3),
            CompilerTier::Opt { level: 1 },
            "register pressure",
        );
        assert_eq!(
            err.to_string(),
            "compilation of m#3 at opt1 failed: register pressure"
        );
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_stack_corruption_not_recoverable() {
        let err = VireoError::StackCorruption {
            fp_offset: 64,
            cmid: Cmid::new(9),
        };
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("cm#9"));
    }
}
