//! On-stack replacement.
//!
//! - [`point`]: compile-time reconstruction of OSR points from inlining barriers
//! - [`glue`]: tier-parameterized glue templates and emitters
//! - [`slots`]: the global table of OSR entry slots
//! - [`installer`]: staging glue on a suspended thread

pub mod glue;
pub mod installer;
pub mod point;
pub mod slots;

pub use glue::{FrameSaveLayout, GlueCode, GlueEmitter, GlueInst, GlueTemplate, PortableEmitter};
pub use installer::{CodeInstaller, OsrExecutionState};
pub use point::{
    FrameOperands, FrameTypeInfo, OsrBarrier, OsrPoint, OsrPointConstructor, TypeCode,
    ValueLocation,
};
pub use slots::{OsrSlot, OsrSlotTable};
