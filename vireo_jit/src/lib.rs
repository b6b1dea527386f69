//! Vireo JIT - compiled code bookkeeping and on-stack replacement.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    CompiledMethodRegistry                    │
//! │   CMID ─▶ CompiledMethod   (create / get / find_by_address)  │
//! │   mark_obsolete ─▶ StackScan ─▶ ScanProof ─▶ sweep_obsolete  │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │
//!        ┌───────────────────────┼────────────────────────┐
//!        ▼                       ▼                        ▼
//! ┌──────────────┐      ┌─────────────────┐      ┌────────────────┐
//! │  TierOps     │      │  OSR point      │      │ CodeInstaller  │
//! │  table       │      │  construction   │      │ + glue emitter │
//! └──────────────┘      └─────────────────┘      └───────┬────────┘
//!                                                        ▼
//!                                               ┌────────────────┐
//!                                               │   VmThread     │
//!                                               └────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod compiled_method;
pub mod osr;
pub mod registry;
pub mod thread;
pub mod tier_ops;

pub use compiled_method::{CodeInfo, CompiledMethod, MachineCode, MethodStatus};
pub use registry::{
    CompiledMethodRegistry, RegistryConfig, ScanProof, SpaceReport, StackScan, SweepReport,
};
pub use thread::{OsrBridge, ThreadRegistry, VmThread};
pub use tier_ops::{ExceptionDeliverer, TierOps, TierOpsTable};
