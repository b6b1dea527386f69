//! Method and type handles.
//!
//! These are the only pieces of class metadata the adaptive system touches.
//! The class loader owns the full metadata; Vireo keeps `Arc` handles.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::ids::{Cmid, MethodId, TypeId};

/// Shared handle to a declaring type.
pub type TypeRef = Arc<TypeInfo>;

/// Shared handle to a source method.
pub type MethodRef = Arc<MethodInfo>;

/// Declaring type of a method.
#[derive(Debug)]
pub struct TypeInfo {
    /// Type id.
    pub id: TypeId,
    /// Fully qualified name, for diagnostics.
    pub name: Arc<str>,
}

impl TypeInfo {
    /// Create a new type handle.
    pub fn new(id: TypeId, name: impl Into<Arc<str>>) -> TypeRef {
        Arc::new(Self {
            id,
            name: name.into(),
        })
    }

    /// The root object type.
    pub fn root_object() -> TypeRef {
        Self::new(TypeId::ROOT_OBJECT, "Object")
    }

    /// Whether this is the root object type.
    #[inline]
    pub fn is_root_object(&self) -> bool {
        self.id == TypeId::ROOT_OBJECT
    }
}

/// A source method.
///
/// Besides identity the handle records which compiled version is currently
/// installed, so the controller can swap versions and retire the old one.
#[derive(Debug)]
pub struct MethodInfo {
    id: MethodId,
    name: Arc<str>,
    declaring_type: TypeRef,
    bytecode_len: u32,
    /// Length of the synthesized prologue when this method is a copy
    /// specialized for on-stack replacement.
    osr_prologue_len: Option<u32>,
    uninterruptible: bool,
    current: AtomicU32,
}

impl MethodInfo {
    /// Start describing a method.
    pub fn new(id: MethodId, name: impl Into<Arc<str>>, declaring_type: TypeRef) -> Self {
        Self {
            id,
            name: name.into(),
            declaring_type,
            bytecode_len: 0,
            osr_prologue_len: None,
            uninterruptible: false,
            current: AtomicU32::new(0),
        }
    }

    /// Set the bytecode length.
    #[inline]
    pub fn with_bytecode_len(mut self, len: u32) -> Self {
        self.bytecode_len = len;
        self
    }

    /// Mark this method as a copy specialized for OSR entry, whose bytecode
    /// starts with a synthesized prologue of `len` bytes.
    #[inline]
    pub fn with_osr_prologue(mut self, len: u32) -> Self {
        self.osr_prologue_len = Some(len);
        self
    }

    /// Mark this method as uninterruptible.
    #[inline]
    pub fn with_uninterruptible(mut self) -> Self {
        self.uninterruptible = true;
        self
    }

    /// Finish building and share the handle.
    #[inline]
    pub fn into_ref(self) -> MethodRef {
        Arc::new(self)
    }

    /// Method id.
    #[inline]
    pub fn id(&self) -> MethodId {
        self.id
    }

    /// Method name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declaring type.
    #[inline]
    pub fn declaring_type(&self) -> &TypeRef {
        &self.declaring_type
    }

    /// Bytecode length, used by compile-time estimates.
    #[inline]
    pub fn bytecode_len(&self) -> u32 {
        self.bytecode_len
    }

    /// Whether this method is a copy specialized for OSR entry.
    #[inline]
    pub fn is_osr_specialized(&self) -> bool {
        self.osr_prologue_len.is_some()
    }

    /// Length of the OSR prologue (0 for ordinary methods).
    #[inline]
    pub fn osr_prologue_len(&self) -> u32 {
        self.osr_prologue_len.unwrap_or(0)
    }

    /// Whether thread switches are forbidden inside this method.
    #[inline]
    pub fn is_uninterruptible(&self) -> bool {
        self.uninterruptible
    }

    /// Currently installed compiled version.
    #[inline]
    pub fn current_cmid(&self) -> Cmid {
        Cmid::new(self.current.load(Ordering::Acquire))
    }

    /// Install a new compiled version, returning the one it replaced.
    pub fn replace_compiled_method(&self, cmid: Cmid) -> Cmid {
        Cmid::new(self.current.swap(cmid.as_u32(), Ordering::AcqRel))
    }
}
