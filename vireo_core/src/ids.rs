//! Strongly typed identifiers.
//!
//! Every identifier is a thin `u32` newtype so that a compiled-method id can
//! never be confused with a method id or a thread id at a call site.

use std::fmt;

/// Compiled-method identifier.
///
/// CMIDs are issued monotonically by the registry starting at 1 and are never
/// reused. The value 0 is reserved as "no compiled method".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Cmid(u32);

impl Cmid {
    /// The reserved "no compiled method" id.
    pub const NONE: Cmid = Cmid(0);

    /// Wrap a raw id.
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw numeric value, also the registry slot index.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Slot index in the registry table.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Whether this is the reserved id.
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Cmid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cm#{}", self.0)
    }
}

/// Source method identifier, assigned by the class loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodId(pub u32);

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m#{}", self.0)
    }
}

/// Declaring type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(pub u32);

impl TypeId {
    /// Id of the root object type every other type derives from.
    pub const ROOT_OBJECT: TypeId = TypeId(0);
}

/// Green-thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmid_none() {
        assert!(Cmid::NONE.is_none());
        assert!(!Cmid::new(1).is_none());
        assert_eq!(Cmid::default(), Cmid::NONE);
    }

    #[test]
    fn test_cmid_display() {
        assert_eq!(Cmid::new(42).to_string(), "cm#42");
        assert_eq!(Cmid::new(7).index(), 7);
    }
}
