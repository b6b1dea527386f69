//! OSR code installation.
//!
//! Given a thread suspended inside a frame that should continue in freshly
//! compiled code, the installer generates the glue that unwinds the
//! thread-switch frame and jumps into the new code's OSR entry, and stages it
//! on the thread. The thread runs the glue the next time it comes back from a
//! thread switch.
//!
//! ```text
//!   high ┌───────────────────┐
//!        │  caller frames    │
//!        ├───────────────────┤ ◀─ from_fp   (frame being replaced)
//!        │  old frame        │
//!        ├───────────────────┤ ◀─ ts_fp     (thread-switch frame)
//!        │  yield point      │
//!   low  └───────────────────┘ ◀─ SP
//!
//!   sp2fp = from_fp - ts_fp - 2 * WORD_SIZE
//! ```

use std::sync::Arc;

use log::info;
use vireo_core::{Cmid, MethodRef, ThreadId, VireoError, VireoResult, WORD_SIZE};

use crate::compiled_method::CompiledMethod;
use crate::osr::glue::{GlueCode, GlueEmitter, GlueTemplate, PortableEmitter};
use crate::registry::CompiledMethodRegistry;
use crate::thread::{OsrBridge, VmThread};

/// Runtime state of a frame that requested on-stack replacement.
#[derive(Debug, Clone)]
pub struct OsrExecutionState {
    /// Requesting thread.
    pub thread: ThreadId,
    /// Method executing in the frame.
    pub method: MethodRef,
    /// Compiled method the frame currently runs.
    pub from_cmid: Cmid,
    /// Bytecode index at which execution continues.
    pub bc_index: u32,
    /// Frame pointer offset of the frame to replace.
    pub from_fp_offset: usize,
    /// Frame pointer offset of the thread-switch frame above it.
    pub ts_fp_offset: usize,
}

impl OsrExecutionState {
    /// Describe a requesting frame.
    pub fn new(
        thread: ThreadId,
        method: MethodRef,
        from_cmid: Cmid,
        bc_index: u32,
        from_fp_offset: usize,
        ts_fp_offset: usize,
    ) -> Self {
        Self {
            thread,
            method,
            from_cmid,
            bc_index,
            from_fp_offset,
            ts_fp_offset,
        }
    }

    /// Distance the glue moves SP to reach the replaced frame.
    pub fn sp_to_fp(&self) -> VireoResult<i32> {
        let span = self
            .from_fp_offset
            .checked_sub(self.ts_fp_offset)
            .and_then(|d| d.checked_sub(2 * WORD_SIZE as usize))
            .ok_or(VireoError::StackCorruption {
                fp_offset: self.from_fp_offset,
                cmid: self.from_cmid,
            })?;
        i32::try_from(span).map_err(|_| VireoError::StackCorruption {
            fp_offset: self.from_fp_offset,
            cmid: self.from_cmid,
        })
    }
}

/// Stages OSR glue on suspended threads.
#[derive(Debug, Clone)]
pub struct CodeInstaller {
    registry: Arc<CompiledMethodRegistry>,
}

impl CodeInstaller {
    /// Installer resolving frames through `registry`.
    pub fn new(registry: Arc<CompiledMethodRegistry>) -> Self {
        Self { registry }
    }

    /// Install glue into `thread` so its frame continues in `target`, using
    /// the portable encoding.
    pub fn install(
        &self,
        thread: &VmThread,
        state: &OsrExecutionState,
        target: &CompiledMethod,
    ) -> VireoResult<()> {
        self.install_with(thread, state, target, PortableEmitter::new())
    }

    /// Install glue produced by a caller-supplied emitter.
    pub fn install_with<E>(
        &self,
        thread: &VmThread,
        state: &OsrExecutionState,
        target: &CompiledMethod,
        emitter: E,
    ) -> VireoResult<()>
    where
        E: GlueEmitter<Output = GlueCode>,
    {
        let slot = target
            .osr_slot()
            .ok_or(VireoError::NotSpecialForOsr(target.id()))?;

        let corrupt = |cmid| VireoError::StackCorruption {
            fp_offset: state.from_fp_offset,
            cmid,
        };
        let from_cmid = thread
            .stack()
            .frame_cmid(state.from_fp_offset)
            .ok_or_else(|| corrupt(Cmid::NONE))?;
        let from = self.registry.get(from_cmid).ok_or_else(|| corrupt(from_cmid))?;

        let sp2fp = state.sp_to_fp()?;
        let glue = GlueTemplate::new(from.save_layout())
            .emit_into(sp2fp, slot, emitter)
            .ok_or(VireoError::UnsupportedOsrOrigin {
                cmid: from.id(),
                tier: from.tier(),
            })?;

        thread.install_osr_bridge(OsrBridge {
            glue,
            target: target.id(),
            from_fp_offset: state.from_fp_offset,
            ts_fp_offset: state.ts_fp_offset,
        });
        info!(
            target: "vireo::osr",
            "OSR code installation succeeded thread={} from={} to={} sp2fp={sp2fp}",
            thread.id(),
            from.id(),
            target.id()
        );
        Ok(())
    }
}
