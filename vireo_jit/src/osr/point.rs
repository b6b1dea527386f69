//! OSR point construction.
//!
//! After inlining, an OSR point inside optimized code may sit several
//! inlined frames deep. Each inlined body left an OSR *barrier* recording the
//! bytecode state of its frame; barriers link outward through their call
//! sites. Reconstruction walks that chain and folds it into a single
//! [`OsrPoint`] holding per-frame type information and one flat operand
//! vector:
//!
//! ```text
//!   barriers (innermost ─▶ outermost)
//!   ┌────────────┐   caller   ┌────────────┐   caller   ┌────────────┐
//!   │ inlined g  │──────────▶│ inlined f  │──────────▶│ compiled m │
//!   └────────────┘            └────────────┘            └────────────┘
//!
//!   operands: | locals g | stack g | locals f | stack f | locals m | stack m |
//! ```
//!
//! Void type tags mark dead slots and carry no operand, so every frame
//! contributes exactly as many operands as it has non-void tags.

use std::fmt;

use smallvec::SmallVec;
use vireo_core::{MethodId, MethodInfo, MethodRef, VireoError, VireoResult};

// =============================================================================
// Type Codes and Locations
// =============================================================================

/// Type tag of a local or stack slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCode {
    /// Dead slot, or the second half of a long/double.
    Void,
    /// 32-bit integer.
    Int,
    /// 64-bit integer.
    Long,
    /// 32-bit float.
    Float,
    /// 64-bit float.
    Double,
    /// Object reference.
    Ref,
    /// Bytecode return address.
    ReturnAddress,
    /// Machine word.
    Word,
}

impl TypeCode {
    /// Single-character descriptor.
    pub const fn as_char(self) -> char {
        match self {
            TypeCode::Void => 'V',
            TypeCode::Int => 'I',
            TypeCode::Long => 'J',
            TypeCode::Float => 'F',
            TypeCode::Double => 'D',
            TypeCode::Ref => 'L',
            TypeCode::ReturnAddress => 'R',
            TypeCode::Word => 'W',
        }
    }

    /// Parse a single-character descriptor.
    pub const fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'V' => TypeCode::Void,
            'I' => TypeCode::Int,
            'J' => TypeCode::Long,
            'F' => TypeCode::Float,
            'D' => TypeCode::Double,
            'L' => TypeCode::Ref,
            'R' => TypeCode::ReturnAddress,
            'W' => TypeCode::Word,
            _ => return None,
        })
    }

    /// Whether this tag carries an operand.
    #[inline]
    pub const fn is_live(self) -> bool {
        !matches!(self, TypeCode::Void)
    }
}

/// Tag list of one frame's locals or expression stack.
pub type TypeCodes = SmallVec<[TypeCode; 8]>;

/// Parse a descriptor string such as `"ILVJ"` into tags.
pub fn parse_type_codes(desc: &str) -> VireoResult<TypeCodes> {
    desc.chars()
        .map(|c| {
            TypeCode::from_char(c).ok_or_else(|| {
                VireoError::MalformedOsrPoint(format!("unknown type code {c:?} in {desc:?}"))
            })
        })
        .collect()
}

fn count_live(codes: &[TypeCode]) -> usize {
    codes.iter().filter(|c| c.is_live()).count()
}

/// Where a live value is held at the OSR point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueLocation {
    /// Symbolic register of the compiled code.
    Register(u16),
    /// Frame slot at an FP-relative offset.
    Stack(i32),
    /// Known constant, materialized at entry.
    Constant(u64),
}

impl ValueLocation {
    /// Whether this is a register location.
    #[inline]
    pub const fn is_register(&self) -> bool {
        matches!(self, ValueLocation::Register(_))
    }

    /// Whether this is a constant.
    #[inline]
    pub const fn is_constant(&self) -> bool {
        matches!(self, ValueLocation::Constant(_))
    }
}

// =============================================================================
// Barriers
// =============================================================================

/// Bytecode state of one (possibly inlined) frame.
#[derive(Debug, Clone)]
pub struct OsrBarrier {
    /// Method this frame executes.
    pub method: MethodRef,
    /// Bytecode index, including any OSR prologue.
    pub bc_index: u32,
    /// Local variable tags.
    pub local_types: TypeCodes,
    /// Expression stack tags.
    pub stack_types: TypeCodes,
    /// One location per live tag, locals first.
    pub operands: Vec<ValueLocation>,
    /// Index of the barrier for the enclosing call site, if inlined.
    pub caller: Option<usize>,
}

impl OsrBarrier {
    /// Barrier for the outermost frame.
    pub fn new(method: MethodRef, bc_index: u32) -> Self {
        Self {
            method,
            bc_index,
            local_types: TypeCodes::new(),
            stack_types: TypeCodes::new(),
            operands: Vec::new(),
            caller: None,
        }
    }

    /// Append a local slot.
    pub fn with_local(mut self, ty: TypeCode, loc: Option<ValueLocation>) -> Self {
        self.local_types.push(ty);
        self.operands.extend(loc);
        self
    }

    /// Append an expression stack slot.
    pub fn with_stack(mut self, ty: TypeCode, loc: Option<ValueLocation>) -> Self {
        self.stack_types.push(ty);
        self.operands.extend(loc);
        self
    }

    /// Link to the barrier of the enclosing call site.
    pub fn inlined_into(mut self, caller: usize) -> Self {
        self.caller = Some(caller);
        self
    }

    /// Number of live tags.
    pub fn num_live(&self) -> usize {
        count_live(&self.local_types) + count_live(&self.stack_types)
    }

    /// Whether operand count matches the live tags.
    #[inline]
    pub fn is_clean(&self) -> bool {
        self.num_live() == self.operands.len()
    }
}

// =============================================================================
// OSR Point
// =============================================================================

/// Type information of one frame at an OSR point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameTypeInfo {
    /// Executing method.
    pub method_id: MethodId,
    /// Bytecode index, with any OSR prologue removed.
    pub bc_index: u32,
    /// Local variable tags.
    pub local_types: TypeCodes,
    /// Expression stack tags.
    pub stack_types: TypeCodes,
}

impl FrameTypeInfo {
    fn num_live_locals(&self) -> usize {
        count_live(&self.local_types)
    }

    fn num_live(&self) -> usize {
        self.num_live_locals() + count_live(&self.stack_types)
    }
}

/// One frame's share of the flat operand vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOperands<'a> {
    /// Frame type information.
    pub frame: &'a FrameTypeInfo,
    /// Live locals.
    pub locals: &'a [ValueLocation],
    /// Live stack slots.
    pub stack: &'a [ValueLocation],
}

/// A fully reconstructed OSR point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsrPoint {
    frames: SmallVec<[FrameTypeInfo; 4]>,
    operands: Vec<ValueLocation>,
}

impl OsrPoint {
    /// Frames, innermost first.
    #[inline]
    pub fn frames(&self) -> &[FrameTypeInfo] {
        &self.frames
    }

    /// Flat operand vector.
    #[inline]
    pub fn operands(&self) -> &[ValueLocation] {
        &self.operands
    }

    /// Number of frames.
    #[inline]
    pub fn inline_depth(&self) -> usize {
        self.frames.len()
    }

    /// Split the operand vector back into per-frame locals and stack.
    pub fn split(&self) -> SmallVec<[FrameOperands<'_>; 4]> {
        let mut out = SmallVec::new();
        let mut at = 0;
        for frame in &self.frames {
            let locals = frame.num_live_locals();
            let total = frame.num_live();
            out.push(FrameOperands {
                frame,
                locals: &self.operands[at..at + locals],
                stack: &self.operands[at + locals..at + total],
            });
            at += total;
        }
        out
    }
}

impl fmt::Display for OsrPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OsrPoint[")?;
        for (i, frame) in self.frames.iter().enumerate() {
            if i > 0 {
                write!(f, " <- ")?;
            }
            let locals: String = frame.local_types.iter().map(|t| t.as_char()).collect();
            let stack: String = frame.stack_types.iter().map(|t| t.as_char()).collect();
            write!(f, "{}@{} L:{locals} S:{stack}", frame.method_id, frame.bc_index)?;
        }
        write!(f, "; {} operands]", self.operands.len())
    }
}

// =============================================================================
// Constructor
// =============================================================================

fn malformed(msg: impl Into<String>) -> VireoError {
    VireoError::MalformedOsrPoint(msg.into())
}

/// Builds [`OsrPoint`]s from barrier chains.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsrPointConstructor;

impl OsrPointConstructor {
    /// Reconstruct the OSR point whose innermost barrier is
    /// `barriers[innermost]`, inside code being compiled for `compiling`.
    pub fn construct(
        &self,
        compiling: &MethodInfo,
        barriers: &[OsrBarrier],
        innermost: usize,
    ) -> VireoResult<OsrPoint> {
        // Step 1: collect the chain from inner to outer.
        let mut chain: SmallVec<[&OsrBarrier; 4]> = SmallVec::new();
        let mut next = Some(innermost);
        while let Some(index) = next {
            let bar = barriers
                .get(index)
                .ok_or_else(|| malformed(format!("call site names missing barrier {index}")))?;
            if chain.len() == barriers.len() {
                return Err(malformed("barrier chain is cyclic"));
            }
            if !bar.is_clean() {
                return Err(malformed(format!(
                    "barrier {index} for {} has {} operands but {} live tags",
                    bar.method.id(),
                    bar.operands.len(),
                    bar.num_live()
                )));
            }
            chain.push(bar);
            next = bar.caller;
        }

        let Some(outermost) = chain.last() else {
            return Err(malformed("inline depth is 0"));
        };
        if outermost.method.id() != compiling.id() {
            return Err(malformed(format!(
                "outermost barrier belongs to {}, not the compiled {}",
                outermost.method.id(),
                compiling.id()
            )));
        }

        // Step 2: per-frame type information.
        let mut frames = SmallVec::with_capacity(chain.len());
        let mut total_operands = 0;
        for bar in &chain {
            let bc_index = if bar.method.is_osr_specialized() {
                bar.bc_index
                    .checked_sub(bar.method.osr_prologue_len())
                    .ok_or_else(|| {
                        malformed(format!(
                            "bc index {} lies inside the OSR prologue of {}",
                            bar.bc_index,
                            bar.method.id()
                        ))
                    })?
            } else {
                bar.bc_index
            };
            frames.push(FrameTypeInfo {
                method_id: bar.method.id(),
                bc_index,
                local_types: bar.local_types.clone(),
                stack_types: bar.stack_types.clone(),
            });
            total_operands += bar.operands.len();
        }

        // Step 3: flatten operands.
        let mut operands = Vec::with_capacity(total_operands);
        for bar in &chain {
            operands.extend_from_slice(&bar.operands);
        }
        let live_tags: usize = frames.iter().map(FrameTypeInfo::num_live).sum();
        if operands.len() != total_operands || operands.len() != live_tags {
            return Err(malformed(format!(
                "copied {} operands, expected {live_tags}",
                operands.len()
            )));
        }

        Ok(OsrPoint { frames, operands })
    }
}
