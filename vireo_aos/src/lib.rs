//! Vireo AOS - the adaptive optimization system.
//!
//! Decides which running methods to recompile, drives the compiler and
//! replaces live frames through on-stack replacement.
//!
//! # Architecture
//!
//! ```text
//!  app threads                      system threads
//!  ───────────                      ──────────────
//!  timer sample ──▶ MethodSampleOrganizer ──┐
//!                                           │ HotMethodEvent
//!  long loop ────▶ OsrOrganizer ────────────┤ OnStackReplacement
//!                                           ▼
//!                               PriorityQueue<ControllerEvent>
//!                                           │
//!                                           ▼
//!                 Controller ── RecompilationStrategy (cost/benefit)
//!                     │
//!                     ├── ControllerMemory (plan history per method)
//!                     ▼
//!  baseline code ─▶ InvocationCounts ─▶ CompilationDispatcher ─▶ Recompiler
//!                                                                 │
//!                              registry.create / mark_obsolete ◀──┤
//!                              CodeInstaller (OSR glue) ◀─────────┘
//! ```
//!
//! [`AdaptiveSystem`] wires everything together.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use vireo_aos::{AdaptiveSystem, AosConfig, CompilationRequest, CompilerOutput};
//! use vireo_core::{MethodId, MethodInfo, TypeId, TypeInfo, VireoResult};
//! use vireo_jit::{CodeInfo, MachineCode};
//!
//! let compiler = |_: &CompilationRequest| -> VireoResult<CompilerOutput> {
//!     Ok(CompilerOutput::new(CodeInfo::new(MachineCode::new(0x4000, 0x80))))
//! };
//! let system = AdaptiveSystem::builder(AosConfig::for_testing(), Arc::new(compiler))
//!     .boot()
//!     .unwrap();
//!
//! let m = MethodInfo::new(MethodId(1), "main", TypeInfo::new(TypeId(1), "app.Main")).into_ref();
//! let base = system
//!     .on_baseline_compiled(&m, CodeInfo::new(MachineCode::new(0x1000, 0x40)))
//!     .unwrap();
//! for _ in 0..system.config().invocation_count_threshold {
//!     system.record_invocation(base.id());
//! }
//! assert_ne!(m.current_cmid(), base.id());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod compiler;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod event;
pub mod invocation_counts;
pub mod listener;
pub mod memory;
pub mod organizer;
pub mod plan;
pub mod queue;
pub mod recompiler;
pub mod strategy;
pub mod system;

pub use compiler::{CompilationRequest, Compiler, CompilerOutput, OsrPointSite};
pub use config::AosConfig;
pub use controller::Controller;
pub use dispatch::CompilationDispatcher;
pub use event::{ControllerEvent, HotMethodEvent};
pub use invocation_counts::InvocationCounts;
pub use listener::{AosEventListener, LogListener, NullListener};
pub use memory::{AosReport, ControllerMemory, PlanList, RecompilationSummary};
pub use organizer::{CallDensityListener, MethodSampleOrganizer, OsrOrganizer, SampleSite};
pub use plan::{CompilationPlan, ControllerPlan, InstrumentationPlan, PlanStatus};
pub use queue::PriorityQueue;
pub use recompiler::{CompileJob, Recompiler};
pub use strategy::{CompilerDna, CostBenefitStrategy, RecompilationChoice, RecompilationStrategy};
pub use system::{AdaptiveSystem, AdaptiveSystemBuilder};
