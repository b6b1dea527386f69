//! The compiler collaborator.
//!
//! The controller never generates code itself. It hands a
//! [`CompilationRequest`] to a [`Compiler`] and registers whatever comes back.

use std::time::Duration;

use vireo_core::{CompilerTier, MethodRef, VireoResult};
use vireo_jit::CodeInfo;
use vireo_jit::osr::{OsrBarrier, OsrExecutionState};

use crate::plan::{CompilationPlan, InstrumentationPlan};

// =============================================================================
// Request
// =============================================================================

/// A request to compile one method at one tier.
#[derive(Debug, Clone)]
pub struct CompilationRequest {
    /// Method to compile.
    pub method: MethodRef,
    /// Target tier.
    pub tier: CompilerTier,
    /// Optional instrumentation.
    pub instrumentation: Option<InstrumentationPlan>,
    /// Frame to specialize the code for, when compiling for OSR.
    pub osr: Option<OsrExecutionState>,
}

impl CompilationRequest {
    /// Plain request.
    pub fn new(method: MethodRef, tier: CompilerTier) -> Self {
        Self {
            method,
            tier,
            instrumentation: None,
            osr: None,
        }
    }

    /// Whether the code must support entry at an OSR point.
    #[inline]
    pub fn is_osr(&self) -> bool {
        self.osr.is_some()
    }
}

impl From<&CompilationPlan> for CompilationRequest {
    fn from(plan: &CompilationPlan) -> Self {
        Self {
            method: plan.method.clone(),
            tier: plan.target,
            instrumentation: plan.instrumentation,
            osr: plan.osr.clone(),
        }
    }
}

// =============================================================================
// Output
// =============================================================================

/// Inlining barriers recorded at one OSR-eligible point of the new code.
#[derive(Debug, Clone)]
pub struct OsrPointSite {
    /// Barriers, callers before callees.
    pub barriers: Vec<OsrBarrier>,
    /// Index of the innermost barrier.
    pub innermost: usize,
}

/// What a successful compilation produces.
#[derive(Debug, Clone)]
pub struct CompilerOutput {
    /// Code and maps.
    pub code: CodeInfo,
    /// OSR points to validate before installation.
    pub osr_points: Vec<OsrPointSite>,
}

impl CompilerOutput {
    /// Output with no OSR points.
    pub fn new(code: CodeInfo) -> Self {
        Self {
            code,
            osr_points: Vec::new(),
        }
    }

    /// Add an OSR point.
    #[inline]
    pub fn with_osr_point(mut self, site: OsrPointSite) -> Self {
        self.osr_points.push(site);
        self
    }

    /// Time the compiler reported spending.
    #[inline]
    pub fn compilation_time(&self) -> Duration {
        self.code.compilation_time
    }
}

// =============================================================================
// Compiler Trait
// =============================================================================

/// A code generator the controller can dispatch to from any thread.
pub trait Compiler: Send + Sync {
    /// Compile `request`. Failure is reported through the error, never by
    /// panicking.
    fn compile(&self, request: &CompilationRequest) -> VireoResult<CompilerOutput>;

    /// Name used in diagnostics.
    fn name(&self) -> &str {
        "compiler"
    }
}

impl<F> Compiler for F
where
    F: Fn(&CompilationRequest) -> VireoResult<CompilerOutput> + Send + Sync,
{
    fn compile(&self, request: &CompilationRequest) -> VireoResult<CompilerOutput> {
        self(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vireo_core::{MethodId, MethodInfo, TypeId, TypeInfo, VireoError};
    use vireo_jit::MachineCode;

    #[test]
    fn test_closure_compiler() {
        let compiler = |req: &CompilationRequest| -> VireoResult<CompilerOutput> {
            if req.tier == CompilerTier::Baseline {
                return Err(VireoError::compilation_failed(req.method.id(), req.tier, "refused"));
            }
            Ok(CompilerOutput::new(CodeInfo::new(MachineCode::new(0x4000, 0x10))))
        };
        let m = MethodInfo::new(MethodId(1), "f", TypeInfo::new(TypeId(1), "demo.C")).into_ref();

        let plan = CompilationPlan::opt(m.clone(), 2);
        let req = CompilationRequest::from(&plan);
        assert!(!req.is_osr());
        assert_eq!(compiler.compile(&req).unwrap().code.code.start(), 0x4000);
        assert!(compiler.compile(&CompilationRequest::new(m, CompilerTier::Baseline)).is_err());
        assert_eq!(compiler.name(), "compiler");
    }
}
