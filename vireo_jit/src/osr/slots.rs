//! Global table of OSR entry slots.
//!
//! Code specialized for on-stack replacement is entered indirectly: the glue
//! loads the entry address from a slot in this table and jumps to it.

use std::fmt;

use parking_lot::RwLock;

/// Index of a slot in the [`OsrSlotTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OsrSlot(pub u32);

impl fmt::Display for OsrSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "osr-slot#{}", self.0)
    }
}

/// Append-only table of OSR entry addresses.
#[derive(Debug, Default)]
pub struct OsrSlotTable {
    entries: RwLock<Vec<usize>>,
}

impl OsrSlotTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a slot holding `entry`.
    pub fn allocate(&self, entry: usize) -> OsrSlot {
        let mut entries = self.entries.write();
        entries.push(entry);
        OsrSlot((entries.len() - 1) as u32)
    }

    /// Entry address held in `slot`.
    #[inline]
    pub fn read(&self, slot: OsrSlot) -> Option<usize> {
        self.entries.read().get(slot.0 as usize).copied()
    }

    /// Number of allocated slots.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no slot has been allocated.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
