//! Vireo Core - shared vocabulary of the adaptive runtime.
//!
//! This crate holds everything the JIT-side and controller-side crates need
//! to agree on without depending on each other:
//!
//! - **Identifiers**: [`Cmid`], [`MethodId`], [`TypeId`], [`ThreadId`]
//! - **Tiers**: [`CompilerTier`] and optimization levels
//! - **Handles**: [`MethodRef`] / [`TypeRef`] supplied by the class loader
//! - **Collaborators**: [`MemoryManager`] and [`Terminator`]
//! - **Errors**: [`VireoError`] / [`VireoResult`]
//! - **Exit coordination**: the recursive-shutdown guard in [`exit`]
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐
//! │  vireo_aos   │───▶│  vireo_jit   │
//! └──────┬───────┘    └──────┬───────┘
//!        │                   │
//!        └────────┬──────────┘
//!                 ▼
//!          ┌─────────────┐
//!          │ vireo_core  │
//!          └─────────────┘
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod exit;
pub mod ids;
pub mod memory;
pub mod method;
pub mod tier;

pub use error::{VireoError, VireoResult};
pub use exit::{ExitCoordinator, ExitRoutine, Terminator};
pub use ids::{Cmid, MethodId, ThreadId, TypeId};
pub use memory::{CappedMemory, MemoryManager, UnboundedMemory};
pub use method::{MethodInfo, MethodRef, TypeInfo, TypeRef};
pub use tier::{CompilerTier, OptLevel};

/// Size in bytes of one machine word on the modelled target.
pub const WORD_SIZE: i32 = 8;
