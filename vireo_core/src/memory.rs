//! Memory-manager collaborator.

use crate::error::{VireoError, VireoResult};
use crate::method::TypeInfo;

/// The slice of the memory manager the adaptive system depends on.
pub trait MemoryManager: Send + Sync {
    /// Reserve backing storage for an array of `len` slots.
    ///
    /// Returning an error means the allocation was refused; callers surface
    /// it as [`VireoError::RegistryExhausted`].
    fn allocate_array(&self, len: usize) -> VireoResult<()>;

    /// Informs the collector that a type's layout is now fixed.
    fn notify_type_resolved(&self, ty: &TypeInfo);

    /// Whether collection may currently run.
    fn is_gc_enabled(&self) -> bool;
}

/// Memory manager that never refuses an allocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnboundedMemory;

impl MemoryManager for UnboundedMemory {
    fn allocate_array(&self, _len: usize) -> VireoResult<()> {
        Ok(())
    }

    fn notify_type_resolved(&self, _ty: &TypeInfo) {}

    fn is_gc_enabled(&self) -> bool {
        true
    }
}

/// Memory manager with a hard cap on array length.
#[derive(Debug, Clone, Copy)]
pub struct CappedMemory {
    /// Largest array length that will be granted.
    pub max_len: usize,
}

impl MemoryManager for CappedMemory {
    fn allocate_array(&self, len: usize) -> VireoResult<()> {
        if len > self.max_len {
            return Err(VireoError::RegistryExhausted { requested: len });
        }
        Ok(())
    }

    fn notify_type_resolved(&self, _ty: &TypeInfo) {}

    fn is_gc_enabled(&self) -> bool {
        true
    }
}
