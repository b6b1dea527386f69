//! Controller input events.

use std::fmt;
use std::sync::Arc;

use vireo_core::{Cmid, CompilerTier, MethodRef};
use vireo_jit::CompiledMethod;
use vireo_jit::VmThread;
use vireo_jit::osr::OsrExecutionState;

/// A compiled method the organizers found hot.
///
/// Immutable once created; consumed exactly once by the controller.
#[derive(Debug, Clone)]
pub struct HotMethodEvent {
    cm: Arc<CompiledMethod>,
    num_samples: f64,
}

impl HotMethodEvent {
    /// Event for `cm` with its accumulated sample count.
    pub fn new(cm: Arc<CompiledMethod>, num_samples: f64) -> Self {
        Self { cm, num_samples }
    }

    /// Sampled compiled method.
    #[inline]
    pub fn compiled_method(&self) -> &Arc<CompiledMethod> {
        &self.cm
    }

    /// Accumulated samples.
    #[inline]
    pub fn num_samples(&self) -> f64 {
        self.num_samples
    }

    /// Id of the sampled compiled method.
    #[inline]
    pub fn cmid(&self) -> Cmid {
        self.cm.id()
    }

    /// Source method, absent for trap code.
    #[inline]
    pub fn method(&self) -> Option<&MethodRef> {
        self.cm.method()
    }

    /// Whether the sampled code is optimized.
    #[inline]
    pub fn is_opt_compiled(&self) -> bool {
        self.cm.tier().is_opt()
    }

    /// Opt level of the sampled code, or -1.
    #[inline]
    pub fn opt_compiled_level(&self) -> i32 {
        self.cm.tier().opt_level().map_or(-1, i32::from)
    }

    /// Tier that produced the sampled code.
    #[inline]
    pub fn prev_compiler(&self) -> CompilerTier {
        self.cm.tier()
    }
}

impl fmt::Display for HotMethodEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.method().map_or("<trap>", |m| m.name());
        write!(
            f,
            "HotMethodEvent {name} {} tier={} samples={:.1}",
            self.cmid(),
            self.prev_compiler(),
            self.num_samples
        )
    }
}

/// Work item on the controller's priority queue.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// A hot method to consider for recompilation.
    HotMethod(HotMethodEvent),
    /// A suspended thread asking to leave its current frame's code.
    OnStackReplacement {
        /// Requesting thread.
        thread: Arc<VmThread>,
        /// Frame to replace.
        state: OsrExecutionState,
    },
}

impl ControllerEvent {
    /// Short name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerEvent::HotMethod(_) => "hot-method",
            ControllerEvent::OnStackReplacement { .. } => "osr",
        }
    }
}

impl From<HotMethodEvent> for ControllerEvent {
    fn from(event: HotMethodEvent) -> Self {
        ControllerEvent::HotMethod(event)
    }
}
