//! Portable glue-code builder for on-stack replacement.
//!
//! When a suspended frame is replaced, a short instruction sequence must run
//! on the victim thread: it unwinds the thread-switch frame, restores the
//! callee-saved state of the frame being replaced and jumps into the new
//! code. The sequence depends on the tier that produced the old frame, but not
//! on the target architecture. It is therefore produced in two steps:
//!
//! ```text
//!   FrameSaveLayout ──▶ GlueTemplate::generate ──▶ [GlueInst] ──▶ GlueEmitter
//!     (per tier)          (tier-correct order)     (portable)     (per target)
//! ```
//!
//! Supporting a new target only requires a new [`GlueEmitter`].

use smallvec::SmallVec;
use vireo_core::{VireoError, VireoResult, WORD_SIZE};

use super::slots::OsrSlot;

// =============================================================================
// Registers and Save Layouts
// =============================================================================

/// A general-purpose register of the modelled target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Gpr(pub u8);

impl Gpr {
    /// Scratch register the glue jumps through.
    pub const SCRATCH: Gpr = Gpr(0);
    /// Register holding the global table of contents.
    pub const TOC: Gpr = Gpr(6);
    /// Baseline-reserved register saved in every baseline frame.
    pub const BASELINE_SAVED: Gpr = Gpr(3);
    /// First register of the non-volatile range.
    pub const FIRST_NONVOLATILE: Gpr = Gpr(3);
}

/// A register saved at a fixed offset from the frame pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedReg {
    /// Register to restore.
    pub reg: Gpr,
    /// Save-slot offset relative to SP once SP equals the old FP.
    pub offset: i32,
}

/// Where a compiled method's frames keep caller state.
///
/// Recorded by the compiler with the code; the glue template reads it to
/// decide which registers to restore and in which order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FrameSaveLayout {
    /// The tier has no replaceable frames.
    #[default]
    None,
    /// Baseline frames save the TOC and a fixed set of registers.
    Baseline {
        /// Offset of the saved TOC.
        toc_save_offset: i32,
        /// Further saved registers, restored in order.
        saved: SmallVec<[SavedReg; 2]>,
    },
    /// Optimized frames save a contiguous run of non-volatile registers.
    Opt {
        /// First saved non-volatile register.
        first_nonvolatile: u8,
        /// Number of saved non-volatile registers.
        num_nonvolatile: u8,
        /// Distance from the frame pointer to the first save slot.
        nonvolatile_offset: i32,
    },
}

impl FrameSaveLayout {
    /// Standard baseline layout: TOC one word below FP, the reserved register
    /// two words below.
    pub fn standard_baseline() -> Self {
        let mut saved = SmallVec::new();
        saved.push(SavedReg {
            reg: Gpr::BASELINE_SAVED,
            offset: -2 * WORD_SIZE,
        });
        FrameSaveLayout::Baseline {
            toc_save_offset: -WORD_SIZE,
            saved,
        }
    }

    /// Optimized layout saving `count` non-volatile registers starting at
    /// `offset` bytes below FP.
    pub fn opt(count: u8, offset: i32) -> Self {
        FrameSaveLayout::Opt {
            first_nonvolatile: Gpr::FIRST_NONVOLATILE.0,
            num_nonvolatile: count,
            nonvolatile_offset: offset,
        }
    }
}

// =============================================================================
// Glue Instructions
// =============================================================================

/// One portable glue instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlueInst {
    /// `SP += delta`
    AdjustSp {
        /// Byte delta.
        delta: i32,
    },
    /// `dst = [SP + offset]`
    RestoreFromSp {
        /// Destination register.
        dst: Gpr,
        /// Byte offset from SP.
        offset: i32,
    },
    /// `dst = [TOC + slot]`
    LoadOsrSlot {
        /// Destination register.
        dst: Gpr,
        /// OSR slot holding the entry address.
        slot: OsrSlot,
    },
    /// `dst = thread_context.toc`
    LoadContextToc {
        /// Destination register.
        dst: Gpr,
    },
    /// `dst = [base + slot]`
    LoadOsrSlotFrom {
        /// Destination register.
        dst: Gpr,
        /// Register holding the table base.
        base: Gpr,
        /// OSR slot holding the entry address.
        slot: OsrSlot,
    },
    /// `thread_context.fp = pop()`
    PopFramePointer,
    /// `jump target`
    JumpReg {
        /// Register holding the destination.
        target: Gpr,
    },
}

/// Target-specific sink for glue instructions.
pub trait GlueEmitter {
    /// Product of emission.
    type Output;

    /// Append one instruction.
    fn emit(&mut self, inst: &GlueInst);

    /// Finish emission.
    fn finish(self) -> Self::Output;
}

impl GlueEmitter for Vec<GlueInst> {
    type Output = Vec<GlueInst>;

    fn emit(&mut self, inst: &GlueInst) {
        self.push(*inst);
    }

    fn finish(self) -> Self::Output {
        self
    }
}

// =============================================================================
// Template
// =============================================================================

/// Tier-parameterized glue template.
#[derive(Debug, Clone, Copy)]
pub struct GlueTemplate<'a> {
    layout: &'a FrameSaveLayout,
}

/// Instruction sequence produced by a template.
pub type GlueSequence = SmallVec<[GlueInst; 16]>;

impl<'a> GlueTemplate<'a> {
    /// Template for frames with the given save layout.
    pub fn new(layout: &'a FrameSaveLayout) -> Self {
        Self { layout }
    }

    /// Generate the sequence for a frame `sp2fp` bytes above the current SP,
    /// resuming at the entry held in `slot`.
    ///
    /// Returns `None` for layouts without replaceable frames.
    pub fn generate(&self, sp2fp: i32, slot: OsrSlot) -> Option<GlueSequence> {
        let mut seq = GlueSequence::new();
        match self.layout {
            FrameSaveLayout::None => return None,
            FrameSaveLayout::Baseline {
                toc_save_offset,
                saved,
            } => {
                // The slot load needs the callee's TOC, so it precedes the
                // TOC restore.
                seq.push(GlueInst::AdjustSp { delta: sp2fp });
                seq.push(GlueInst::LoadOsrSlot {
                    dst: Gpr::SCRATCH,
                    slot,
                });
                seq.push(GlueInst::RestoreFromSp {
                    dst: Gpr::TOC,
                    offset: *toc_save_offset,
                });
                for s in saved {
                    seq.push(GlueInst::RestoreFromSp {
                        dst: s.reg,
                        offset: s.offset,
                    });
                }
                seq.push(GlueInst::PopFramePointer);
                seq.push(GlueInst::JumpReg { target: Gpr::SCRATCH });
            }
            FrameSaveLayout::Opt {
                first_nonvolatile,
                num_nonvolatile,
                nonvolatile_offset,
            } => {
                let mut offset = *nonvolatile_offset;
                for i in 0..*num_nonvolatile {
                    seq.push(GlueInst::RestoreFromSp {
                        dst: Gpr(first_nonvolatile + i),
                        offset: sp2fp - offset,
                    });
                    offset += WORD_SIZE;
                }
                seq.push(GlueInst::AdjustSp { delta: sp2fp });
                seq.push(GlueInst::PopFramePointer);
                seq.push(GlueInst::LoadContextToc { dst: Gpr::SCRATCH });
                seq.push(GlueInst::LoadOsrSlotFrom {
                    dst: Gpr::SCRATCH,
                    base: Gpr::SCRATCH,
                    slot,
                });
                seq.push(GlueInst::JumpReg { target: Gpr::SCRATCH });
            }
        }
        Some(seq)
    }

    /// Generate and feed the sequence to `emitter`.
    pub fn emit_into<E: GlueEmitter>(
        &self,
        sp2fp: i32,
        slot: OsrSlot,
        mut emitter: E,
    ) -> Option<E::Output> {
        let seq = self.generate(sp2fp, slot)?;
        for inst in &seq {
            emitter.emit(inst);
        }
        Some(emitter.finish())
    }
}

// =============================================================================
// Portable Encoding
// =============================================================================

const OP_ADJUST_SP: u8 = 0x01;
const OP_RESTORE: u8 = 0x02;
const OP_LOAD_SLOT: u8 = 0x03;
const OP_LOAD_CTX_TOC: u8 = 0x04;
const OP_LOAD_SLOT_FROM: u8 = 0x05;
const OP_POP_FP: u8 = 0x06;
const OP_JUMP: u8 = 0x07;

/// Finished glue code in the portable byte encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlueCode {
    bytes: Box<[u8]>,
    num_insts: usize,
}

impl GlueCode {
    /// Encoded bytes.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of encoded instructions.
    #[inline]
    pub fn len(&self) -> usize {
        self.num_insts
    }

    /// Whether no instruction was emitted.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_insts == 0
    }

    /// Decode back into instructions.
    pub fn decode(&self) -> VireoResult<Vec<GlueInst>> {
        let mut out = Vec::with_capacity(self.num_insts);
        let mut r = Reader {
            bytes: &self.bytes,
            pos: 0,
        };
        while r.pos < r.bytes.len() {
            let inst = match r.u8()? {
                OP_ADJUST_SP => GlueInst::AdjustSp { delta: r.i32()? },
                OP_RESTORE => GlueInst::RestoreFromSp {
                    dst: Gpr(r.u8()?),
                    offset: r.i32()?,
                },
                OP_LOAD_SLOT => GlueInst::LoadOsrSlot {
                    dst: Gpr(r.u8()?),
                    slot: OsrSlot(r.u32()?),
                },
                OP_LOAD_CTX_TOC => GlueInst::LoadContextToc { dst: Gpr(r.u8()?) },
                OP_LOAD_SLOT_FROM => GlueInst::LoadOsrSlotFrom {
                    dst: Gpr(r.u8()?),
                    base: Gpr(r.u8()?),
                    slot: OsrSlot(r.u32()?),
                },
                OP_POP_FP => GlueInst::PopFramePointer,
                OP_JUMP => GlueInst::JumpReg { target: Gpr(r.u8()?) },
                other => {
                    return Err(VireoError::MalformedOsrPoint(format!(
                        "unknown glue opcode {other:#04x} at byte {}",
                        r.pos - 1
                    )));
                }
            };
            out.push(inst);
        }
        Ok(out)
    }
}

/// Emitter producing the portable byte encoding.
#[derive(Debug, Default)]
pub struct PortableEmitter {
    buf: Vec<u8>,
    num_insts: usize,
}

impl PortableEmitter {
    /// Create an empty emitter.
    pub fn new() -> Self {
        Self::default()
    }
}

impl GlueEmitter for PortableEmitter {
    type Output = GlueCode;

    fn emit(&mut self, inst: &GlueInst) {
        let buf = &mut self.buf;
        match *inst {
            GlueInst::AdjustSp { delta } => {
                buf.push(OP_ADJUST_SP);
                buf.extend_from_slice(&delta.to_le_bytes());
            }
            GlueInst::RestoreFromSp { dst, offset } => {
                buf.push(OP_RESTORE);
                buf.push(dst.0);
                buf.extend_from_slice(&offset.to_le_bytes());
            }
            GlueInst::LoadOsrSlot { dst, slot } => {
                buf.push(OP_LOAD_SLOT);
                buf.push(dst.0);
                buf.extend_from_slice(&slot.0.to_le_bytes());
            }
            GlueInst::LoadContextToc { dst } => {
                buf.push(OP_LOAD_CTX_TOC);
                buf.push(dst.0);
            }
            GlueInst::LoadOsrSlotFrom { dst, base, slot } => {
                buf.push(OP_LOAD_SLOT_FROM);
                buf.push(dst.0);
                buf.push(base.0);
                buf.extend_from_slice(&slot.0.to_le_bytes());
            }
            GlueInst::PopFramePointer => buf.push(OP_POP_FP),
            GlueInst::JumpReg { target } => {
                buf.push(OP_JUMP);
                buf.push(target.0);
            }
        }
        self.num_insts += 1;
    }

    fn finish(self) -> GlueCode {
        GlueCode {
            bytes: self.buf.into_boxed_slice(),
            num_insts: self.num_insts,
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> VireoResult<[u8; N]> {
        let end = self.pos + N;
        let chunk = self.bytes.get(self.pos..end).ok_or_else(|| {
            VireoError::MalformedOsrPoint(format!("truncated glue code at byte {}", self.pos))
        })?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(chunk);
        Ok(out)
    }

    fn u8(&mut self) -> VireoResult<u8> {
        Ok(self.take::<1>()?[0])
    }

    fn u32(&mut self) -> VireoResult<u32> {
        Ok(u32::from_le_bytes(self.take::<4>()?))
    }

    fn i32(&mut self) -> VireoResult<i32> {
        Ok(i32::from_le_bytes(self.take::<4>()?))
    }
}
