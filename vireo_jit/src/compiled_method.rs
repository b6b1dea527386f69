//! Compiled methods and their lifecycle.
//!
//! A [`CompiledMethod`] is one machine-code version of a source method. Many
//! versions of the same method may be valid at once: the newest one is
//! installed for new calls while older ones keep running in frames that were
//! entered earlier.
//!
//! # Lifecycle
//!
//! ```text
//!   created ──compile_complete──▶ COMPILED
//!                                    │
//!                        replaced    ▼        stack scan
//!                                OBSOLETE ◀────────────▶ OBSOLETE|ACTIVE_ON_STACK
//!                                    │   sweep clears ACTIVE
//!                  sweep while not   ▼
//!                  on any stack   reclaimed (slot nulled)
//! ```
//!
//! Status bits only move forward, with the exception of `ACTIVE_ON_STACK`
//! which is set by stack scans and cleared by every sweep.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use vireo_core::{Cmid, CompilerTier, MethodRef, VireoError, VireoResult};

use crate::osr::glue::FrameSaveLayout;
use crate::osr::point::OsrPoint;
use crate::osr::slots::{OsrSlot, OsrSlotTable};

bitflags::bitflags! {
    /// Status bits of a compiled method.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MethodStatus: u8 {
        /// Referenced by at least one frame seen by the latest stack scan.
        const ACTIVE_ON_STACK = 0x01;
        /// Superseded by a newer version.
        const OBSOLETE = 0x02;
        /// Must not be entered any more.
        const INVALID = 0x04;
        /// Machine code is available.
        const COMPILED = 0x08;
        /// Baseline code whose profile is stale.
        const OUTDATED = 0x10;
        /// Samples attributed to this version have been reset.
        const SAMPLES_RESET = 0x20;
        /// Entered through an OSR slot.
        const SPECIAL_FOR_OSR = 0x40;
    }
}

/// Opaque machine-code handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineCode {
    start: usize,
    size: usize,
}

impl MachineCode {
    /// Describe `size` bytes of code starting at `start`.
    #[inline]
    pub const fn new(start: usize, size: usize) -> Self {
        Self { start, size }
    }

    /// First byte of the code, also its entry point.
    #[inline]
    pub const fn start(&self) -> usize {
        self.start
    }

    /// Code size in bytes.
    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// One past the last byte.
    #[inline]
    pub const fn end(&self) -> usize {
        self.start + self.size
    }
}

/// Everything the compiler hands over when code is finished.
#[derive(Debug, Clone)]
pub struct CodeInfo {
    /// The machine code.
    pub code: MachineCode,
    /// Size of GC maps and other metadata.
    pub map_bytes: usize,
    /// Wall time spent compiling.
    pub compilation_time: Duration,
    /// Frame save layout used by the OSR glue.
    pub save_layout: FrameSaveLayout,
    /// Reconstructed OSR points, in the order the compiler reported them.
    pub osr_points: Vec<OsrPoint>,
}

impl CodeInfo {
    /// Code without metadata.
    pub fn new(code: MachineCode) -> Self {
        Self {
            code,
            map_bytes: 0,
            compilation_time: Duration::ZERO,
            save_layout: FrameSaveLayout::None,
            osr_points: Vec::new(),
        }
    }

    /// Set the metadata size.
    #[inline]
    pub fn with_map_bytes(mut self, bytes: usize) -> Self {
        self.map_bytes = bytes;
        self
    }

    /// Set the compilation time.
    #[inline]
    pub fn with_compilation_time(mut self, time: Duration) -> Self {
        self.compilation_time = time;
        self
    }

    /// Set the frame save layout.
    #[inline]
    pub fn with_save_layout(mut self, layout: FrameSaveLayout) -> Self {
        self.save_layout = layout;
        self
    }

    /// Attach an OSR point.
    #[inline]
    pub fn with_osr_point(mut self, point: OsrPoint) -> Self {
        self.osr_points.push(point);
        self
    }
}

// =============================================================================
// Compiled Method
// =============================================================================

/// One machine-code version of a method.
#[derive(Debug)]
pub struct CompiledMethod {
    id: Cmid,
    /// `None` only for the hardware-trap pseudo method.
    method: Option<MethodRef>,
    tier: CompilerTier,
    info: OnceLock<CodeInfo>,
    status: AtomicU8,
    osr_slot: OnceLock<OsrSlot>,
}

impl CompiledMethod {
    pub(crate) fn new(id: Cmid, method: Option<MethodRef>, tier: CompilerTier) -> Self {
        Self {
            id,
            method,
            tier,
            info: OnceLock::new(),
            status: AtomicU8::new(0),
            osr_slot: OnceLock::new(),
        }
    }

    /// Compiled-method id.
    #[inline]
    pub fn id(&self) -> Cmid {
        self.id
    }

    /// Source method, absent for the hardware-trap method.
    #[inline]
    pub fn method(&self) -> Option<&MethodRef> {
        self.method.as_ref()
    }

    /// Producing tier.
    #[inline]
    pub fn tier(&self) -> CompilerTier {
        self.tier
    }

    /// Current status bits.
    #[inline]
    pub fn status(&self) -> MethodStatus {
        MethodStatus::from_bits_truncate(self.status.load(Ordering::Acquire))
    }

    #[inline]
    fn set(&self, bits: MethodStatus) {
        self.status.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    /// Record the finished code. Only the first call has any effect.
    pub fn compile_complete(&self, info: CodeInfo) {
        if self.info.set(info).is_ok() {
            self.set(MethodStatus::COMPILED);
        }
    }

    /// Compiler output, once compiled.
    #[inline]
    pub fn code_info(&self) -> Option<&CodeInfo> {
        self.info.get()
    }

    /// Machine code, once compiled.
    #[inline]
    pub fn code(&self) -> Option<MachineCode> {
        self.info.get().map(|i| i.code)
    }

    /// OSR points of the compiled code, empty until compiled.
    pub fn osr_points(&self) -> &[OsrPoint] {
        self.info
            .get()
            .map(|i| i.osr_points.as_slice())
            .unwrap_or_default()
    }

    /// Frame save layout, [`FrameSaveLayout::None`] until compiled.
    pub fn save_layout(&self) -> &FrameSaveLayout {
        const NONE: &FrameSaveLayout = &FrameSaveLayout::None;
        self.info.get().map_or(NONE, |i| &i.save_layout)
    }

    /// Compilation wall time.
    pub fn compilation_time(&self) -> Duration {
        self.info
            .get()
            .map_or(Duration::ZERO, |i| i.compilation_time)
    }

    /// Whether code is available.
    #[inline]
    pub fn is_compiled(&self) -> bool {
        self.status().contains(MethodStatus::COMPILED)
    }

    /// Whether this version has been superseded.
    #[inline]
    pub fn is_obsolete(&self) -> bool {
        self.status().contains(MethodStatus::OBSOLETE)
    }

    /// Whether the latest stack scan saw this version.
    #[inline]
    pub fn is_active_on_stack(&self) -> bool {
        self.status().contains(MethodStatus::ACTIVE_ON_STACK)
    }

    /// Whether this version must no longer be entered.
    #[inline]
    pub fn is_invalid(&self) -> bool {
        self.status().contains(MethodStatus::INVALID)
    }

    /// Whether this baseline version's profile is stale.
    #[inline]
    pub fn is_outdated(&self) -> bool {
        self.status().contains(MethodStatus::OUTDATED)
    }

    /// Whether samples for this version were reset.
    #[inline]
    pub fn is_samples_reset(&self) -> bool {
        self.status().contains(MethodStatus::SAMPLES_RESET)
    }

    /// Whether this version is entered through an OSR slot.
    #[inline]
    pub fn is_special_for_osr(&self) -> bool {
        self.status().contains(MethodStatus::SPECIAL_FOR_OSR)
    }

    /// Forbid further entry.
    pub fn set_invalid(&self) {
        self.set(MethodStatus::INVALID);
    }

    /// Only the registry marks methods obsolete, so that the sweep is told.
    pub(crate) fn set_obsolete(&self) {
        self.set(MethodStatus::OBSOLETE);
    }

    /// Record that a frame of this version is on some thread stack.
    pub fn set_active_on_stack(&self) {
        self.set(MethodStatus::ACTIVE_ON_STACK);
    }

    pub(crate) fn clear_active_on_stack(&self) {
        self.status
            .fetch_and(!MethodStatus::ACTIVE_ON_STACK.bits(), Ordering::AcqRel);
    }

    /// Mark baseline code's profile as stale.
    ///
    /// Returns `false` without changing anything for non-baseline code.
    pub fn set_outdated(&self) -> bool {
        if self.tier != CompilerTier::Baseline {
            return false;
        }
        self.set(MethodStatus::OUTDATED);
        true
    }

    /// Record that samples for this version were reset.
    pub fn set_samples_reset(&self) {
        self.set(MethodStatus::SAMPLES_RESET);
    }

    /// Publish this version's entry point in an OSR slot.
    ///
    /// Idempotent: a second call returns the slot allocated by the first.
    pub fn set_special_for_osr(&self, slots: &OsrSlotTable) -> VireoResult<OsrSlot> {
        let code = self.code().ok_or(VireoError::NotSpecialForOsr(self.id))?;
        let slot = *self.osr_slot.get_or_init(|| slots.allocate(code.start()));
        self.set(MethodStatus::SPECIAL_FOR_OSR);
        Ok(slot)
    }

    /// OSR entry slot, if specialized.
    #[inline]
    pub fn osr_slot(&self) -> Option<OsrSlot> {
        self.osr_slot.get().copied()
    }

    /// Whether `ip`, a return address, lies inside this code.
    ///
    /// Return addresses point just past the call, so the range is
    /// `start < ip <= end`.
    #[inline]
    pub fn contains_return_address(&self, ip: usize) -> bool {
        match self.code() {
            Some(code) => !(ip <= code.start() || ip > code.end()),
            None => false,
        }
    }

    /// Offset of `ip` inside this code.
    ///
    /// Trap and native-transition methods always report offset zero.
    pub fn instruction_offset(&self, ip: usize) -> VireoResult<usize> {
        if matches!(
            self.tier,
            CompilerTier::Trap | CompilerTier::NativeTransition
        ) {
            return Ok(0);
        }
        match self.code() {
            Some(code) if self.contains_return_address(ip) => Ok(ip - code.start()),
            _ => Err(VireoError::InstructionOutOfRange {
                cmid: self.id,
                ip,
                owner: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vireo_core::{MethodId, MethodInfo, TypeId, TypeInfo};

    fn method() -> MethodRef {
        MethodInfo::new(MethodId(1), "loop", TypeInfo::new(TypeId(4), "demo.A"))
            .with_bytecode_len(30)
            .into_ref()
    }

    fn compiled(tier: CompilerTier) -> CompiledMethod {
        let cm = CompiledMethod::new(Cmid::new(1), Some(method()), tier);
        cm.compile_complete(CodeInfo::new(MachineCode::new(0x1000, 0x100)));
        cm
    }

    #[test]
    fn test_compile_complete_sets_flag() {
        let cm = CompiledMethod::new(Cmid::new(1), Some(method()), CompilerTier::Baseline);
        assert!(!cm.is_compiled());
        assert!(cm.code().is_none());
        cm.compile_complete(
            CodeInfo::new(MachineCode::new(0x1000, 0x40))
                .with_compilation_time(Duration::from_micros(250)),
        );
        assert!(cm.is_compiled());
        assert_eq!(cm.code().unwrap().end(), 0x1040);
        assert_eq!(cm.compilation_time(), Duration::from_micros(250));
    }

    #[test]
    fn test_return_address_range() {
        let cm = compiled(CompilerTier::Baseline);
        assert!(!cm.contains_return_address(0x1000));
        assert!(cm.contains_return_address(0x1001));
        assert!(cm.contains_return_address(0x1100));
        assert!(!cm.contains_return_address(0x1101));
    }

    #[test]
    fn test_instruction_offset() {
        let cm = compiled(CompilerTier::Opt { level: 1 });
        assert_eq!(cm.instruction_offset(0x1010).unwrap(), 0x10);
        assert!(matches!(
            cm.instruction_offset(0x2000),
            Err(VireoError::InstructionOutOfRange { owner: None, .. })
        ));

        let trap = CompiledMethod::new(Cmid::new(2), None, CompilerTier::Trap);
        assert_eq!(trap.instruction_offset(0xdead).unwrap(), 0);
    }

    #[test]
    fn test_outdated_only_for_baseline() {
        let opt = compiled(CompilerTier::Opt { level: 0 });
        assert!(!opt.set_outdated());
        assert!(!opt.is_outdated());

        let base = compiled(CompilerTier::Baseline);
        assert!(base.set_outdated());
        assert!(base.is_outdated());
    }

    #[test]
    fn test_active_on_stack_toggles() {
        let cm = compiled(CompilerTier::Baseline);
        cm.set_obsolete();
        cm.set_active_on_stack();
        assert!(cm.is_active_on_stack());
        cm.clear_active_on_stack();
        assert!(!cm.is_active_on_stack());
        assert!(cm.is_obsolete());
    }

    #[test]
    fn test_special_for_osr_idempotent() {
        let slots = OsrSlotTable::new();
        let cm = compiled(CompilerTier::Opt { level: 2 });
        let a = cm.set_special_for_osr(&slots).unwrap();
        let b = cm.set_special_for_osr(&slots).unwrap();
        assert_eq!(a, b);
        assert_eq!(slots.len(), 1);
        assert_eq!(slots.read(a), Some(0x1000));
        assert!(cm.is_special_for_osr());

        let uncompiled = CompiledMethod::new(Cmid::new(9), Some(method()), CompilerTier::Baseline);
        assert_eq!(
            uncompiled.set_special_for_osr(&slots),
            Err(VireoError::NotSpecialForOsr(Cmid::new(9)))
        );
    }
}
