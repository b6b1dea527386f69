//! Registry of compiled methods, indexed by CMID.
//!
//! The registry owns every [`CompiledMethod`] the runtime has produced and
//! answers three questions on hot paths: "which method has this id", "which
//! method contains this return address" and "which versions can be
//! reclaimed".
//!
//! # Layout
//!
//! ```text
//!  slot:   0      1      2      3     ...   current   ...   capacity-1
//!        ┌──────┬──────┬──────┬──────┬─────┬───────┬─────┬──────────┐
//!        │unused│ cm#1 │ cm#2 │ None │ ... │ cm#n  │free │   free   │
//!        └──────┴──────┴──────┴──────┴─────┴───────┴─────┴──────────┘
//!                              ▲ reclaimed by a sweep
//! ```
//!
//! CMIDs are handed out monotonically starting at 1 and never reused; slot 0
//! is never populated. The table doubles whenever the next id would not fit,
//! by publishing one more chunk; slots already handed out never move.
//!
//! # Concurrency
//!
//! Lookups are lock-free: they read atomics only, never allocate and never
//! wait for creation, growth or sweeping. Creation serializes on an append
//! lock that readers never take, and asks the memory manager for growth
//! before taking it. A new chunk is published before `current_id`, which is
//! stored with release ordering after the slot is filled, so a reader that
//! observes an id always observes its entry.
//!
//! # Reclamation
//!
//! Sweeping requires a [`ScanProof`]: evidence that every thread stack has
//! been scanned (at a safe point) and each live frame's method marked
//! `ACTIVE_ON_STACK`. A proof is consumed by the first sweep that uses it, so
//! sweeping twice without a new scan cannot reclaim a method that the first
//! sweep saw on a stack.

use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{
    AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering, fence,
};
use std::sync::{Arc, OnceLock};

use log::{debug, warn};
use parking_lot::Mutex;
use vireo_core::{
    Cmid, CompilerTier, MemoryManager, MethodRef, UnboundedMemory, VireoError, VireoResult,
};

use crate::compiled_method::CompiledMethod;

// =============================================================================
// Configuration
// =============================================================================

/// Registry sizing.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Slots allocated up front.
    pub initial_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 16_000,
        }
    }
}

impl RegistryConfig {
    /// Tiny table so tests cross the growth boundary quickly.
    pub fn for_testing() -> Self {
        Self {
            initial_capacity: 4,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Registry counters.
#[derive(Debug, Default)]
pub struct RegistryStats {
    created: AtomicU64,
    grown: AtomicU64,
    failed_lookups: AtomicU64,
    reclaimed: AtomicU64,
    sweeps: AtomicU64,
}

/// Point-in-time copy of [`RegistryStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStatsSnapshot {
    /// Compiled methods created.
    pub created: u64,
    /// Table growth events.
    pub grown: u64,
    /// Lookups with an out-of-range id.
    pub failed_lookups: u64,
    /// Slots reclaimed by sweeps.
    pub reclaimed: u64,
    /// Sweeps that actually walked the table.
    pub sweeps: u64,
}

impl RegistryStats {
    /// Copy the counters.
    pub fn snapshot(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            created: self.created.load(Ordering::Relaxed),
            grown: self.grown.load(Ordering::Relaxed),
            failed_lookups: self.failed_lookups.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Stack Scan
// =============================================================================

/// An in-progress stack scan.
///
/// Obtained from [`CompiledMethodRegistry::begin_stack_scan`] while the world
/// is stopped; every frame found on every thread stack is reported through
/// [`StackScan::mark_frame`].
#[derive(Debug)]
pub struct StackScan<'r> {
    registry: &'r CompiledMethodRegistry,
    epoch: u64,
    marked: usize,
}

impl StackScan<'_> {
    /// Mark the compiled method owning a live frame. Returns `false` when the
    /// id is unknown.
    pub fn mark_frame(&mut self, cmid: Cmid) -> bool {
        match self.registry.get(cmid) {
            Some(cm) => {
                cm.set_active_on_stack();
                self.marked += 1;
                true
            }
            None => false,
        }
    }

    /// Finish the scan.
    pub fn finish(self) -> ScanProof {
        debug!(
            target: "vireo::registry",
            "stack scan epoch={} marked_frames={}", self.epoch, self.marked
        );
        ScanProof { epoch: self.epoch }
    }
}

/// Evidence that a full stack scan completed.
#[derive(Debug)]
pub struct ScanProof {
    epoch: u64,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Obsolete entries whose slot was nulled.
    pub reclaimed: usize,
    /// Ids of the reclaimed entries.
    pub reclaimed_ids: Vec<Cmid>,
    /// Obsolete entries kept because they were on a stack.
    pub retained: usize,
    /// Whether the table was walked at all.
    pub walked: bool,
}

// =============================================================================
// Space Report
// =============================================================================

/// Per-tier code footprint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierSpace {
    /// Compiled methods.
    pub methods: usize,
    /// Machine-code bytes.
    pub code_bytes: usize,
    /// Metadata bytes.
    pub map_bytes: usize,
}

/// Code footprint of every live compiled method, by tier tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpaceReport {
    tiers: [TierSpace; CompilerTier::NUM_TAGS],
}

impl SpaceReport {
    /// Footprint of one tier tag.
    pub fn tier(&self, tier: CompilerTier) -> TierSpace {
        self.tiers[tier.tag()]
    }

    /// Footprint summed over every tier.
    pub fn total(&self) -> TierSpace {
        self.tiers.iter().fold(TierSpace::default(), |acc, t| TierSpace {
            methods: acc.methods + t.methods,
            code_bytes: acc.code_bytes + t.code_bytes,
            map_bytes: acc.map_bytes + t.map_bytes,
        })
    }
}

impl fmt::Display for SpaceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const TAGS: [CompilerTier; CompilerTier::NUM_TAGS] = [
            CompilerTier::Trap,
            CompilerTier::Baseline,
            CompilerTier::Opt { level: 0 },
            CompilerTier::NativeTransition,
        ];
        writeln!(f, "Compiled code space report")?;
        for tier in TAGS {
            let t = self.tier(tier);
            if t.methods == 0 {
                continue;
            }
            writeln!(
                f,
                "  {:<9} methods={:<6} code={:<10} maps={}",
                tier.tag_name(),
                t.methods,
                t.code_bytes,
                t.map_bytes
            )?;
        }
        let total = self.total();
        write!(
            f,
            "  total     methods={:<6} code={:<10} maps={}",
            total.methods, total.code_bytes, total.map_bytes
        )
    }
}

// =============================================================================
// Slot Table
// =============================================================================

const MAX_CHUNKS: usize = usize::BITS as usize;

type Slot = AtomicPtr<CompiledMethod>;

fn empty_chunk(len: usize) -> Box<[Slot]> {
    (0..len).map(|_| AtomicPtr::new(ptr::null_mut())).collect()
}

/// Append-only slot storage.
///
/// Chunk 0 holds `base` slots and chunk `k >= 1` holds `base << (k - 1)`, so
/// each published chunk doubles the capacity. Chunks never move once
/// published. A non-null slot owns one strong count of its entry.
struct SlotTable {
    base: usize,
    chunks: Box<[OnceLock<Box<[Slot]>>]>,
    capacity: AtomicUsize,
    _owns: PhantomData<Arc<CompiledMethod>>,
}

impl SlotTable {
    fn new(base: usize) -> Self {
        let chunks: Box<[OnceLock<Box<[Slot]>>]> = (0..MAX_CHUNKS).map(|_| OnceLock::new()).collect();
        let _ = chunks[0].set(empty_chunk(base));
        Self {
            base,
            chunks,
            capacity: AtomicUsize::new(base),
            _owns: PhantomData,
        }
    }

    #[inline]
    fn locate(&self, index: usize) -> (usize, usize) {
        if index < self.base {
            return (0, index);
        }
        let k = (index / self.base).ilog2() as usize;
        (k + 1, index - (self.base << k))
    }

    #[inline]
    fn slot(&self, index: usize) -> Option<&Slot> {
        let (chunk, offset) = self.locate(index);
        self.chunks.get(chunk)?.get()?.get(offset)
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Publish the next chunk. Callers serialize on the append lock.
    fn grow(&self) -> Option<usize> {
        let capacity = self.capacity.load(Ordering::Relaxed);
        let new_len = capacity.checked_mul(2)?;
        let (chunk, _) = self.locate(capacity);
        self.chunks.get(chunk)?.set(empty_chunk(capacity)).ok()?;
        self.capacity.store(new_len, Ordering::Release);
        Some(new_len)
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut Slot> {
        self.chunks
            .iter_mut()
            .filter_map(OnceLock::get_mut)
            .flat_map(|chunk| chunk.iter_mut())
    }
}

/// Marks a thread as possibly holding a reference read out of a slot.
struct ReadGuard<'r>(&'r AtomicUsize);

impl<'r> ReadGuard<'r> {
    #[inline]
    fn enter(readers: &'r AtomicUsize) -> Self {
        readers.fetch_add(1, Ordering::SeqCst);
        Self(readers)
    }
}

impl Drop for ReadGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Registry
// =============================================================================

/// CMID-indexed table of compiled methods.
pub struct CompiledMethodRegistry {
    slots: SlotTable,
    append: Mutex<()>,
    readers: AtomicUsize,
    retired: Mutex<Vec<Arc<CompiledMethod>>>,
    current_id: AtomicU32,
    scan_for_obsolete: AtomicBool,
    scan_epoch: AtomicU64,
    swept_epoch: AtomicU64,
    memory: Arc<dyn MemoryManager>,
    stats: RegistryStats,
}

impl Default for CompiledMethodRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default(), Arc::new(UnboundedMemory))
    }
}

impl CompiledMethodRegistry {
    /// Create a registry backed by `memory`.
    pub fn new(config: RegistryConfig, memory: Arc<dyn MemoryManager>) -> Self {
        Self {
            slots: SlotTable::new(config.initial_capacity.max(2)),
            append: Mutex::new(()),
            readers: AtomicUsize::new(0),
            retired: Mutex::new(Vec::new()),
            current_id: AtomicU32::new(0),
            scan_for_obsolete: AtomicBool::new(false),
            scan_epoch: AtomicU64::new(0),
            swept_epoch: AtomicU64::new(0),
            memory,
            stats: RegistryStats::default(),
        }
    }

    /// Registry with a small table and unbounded memory.
    pub fn for_testing() -> Self {
        Self::new(RegistryConfig::for_testing(), Arc::new(UnboundedMemory))
    }

    /// Register a new compiled method for `method` at `tier`.
    pub fn create(&self, method: MethodRef, tier: CompilerTier) -> VireoResult<Arc<CompiledMethod>> {
        self.insert_with(|id| CompiledMethod::new(id, Some(method), tier))
    }

    /// Register the hardware-trap pseudo method.
    pub fn create_trap(&self) -> VireoResult<Arc<CompiledMethod>> {
        self.insert_with(|id| CompiledMethod::new(id, None, CompilerTier::Trap))
    }

    fn insert_with(
        &self,
        build: impl FnOnce(Cmid) -> CompiledMethod,
    ) -> VireoResult<Arc<CompiledMethod>> {
        // The memory manager is consulted outside the append lock so that it
        // may collect, scan stacks or read the registry while it decides.
        let mut approved = self.slots.capacity();
        let append = loop {
            approved = approved.max(self.slots.capacity());
            let next = self.current_id.load(Ordering::Acquire) as usize + 1;
            if next >= approved {
                let new_len = approved
                    .checked_mul(2)
                    .ok_or(VireoError::RegistryExhausted { requested: usize::MAX })?;
                self.memory.allocate_array(new_len)?;
                approved = new_len;
                continue;
            }
            let guard = self.append.lock();
            if (self.current_id.load(Ordering::Relaxed) as usize + 1) < approved {
                break guard;
            }
        };

        let next = self.current_id.load(Ordering::Relaxed) + 1;
        let index = next as usize;
        while index >= self.slots.capacity() {
            let new_len = self
                .slots
                .grow()
                .ok_or(VireoError::RegistryExhausted { requested: index + 1 })?;
            self.stats.grown.fetch_add(1, Ordering::Relaxed);
            debug!(target: "vireo::registry", "grew compiled-method table to {new_len} slots");
        }
        let slot = self
            .slots
            .slot(index)
            .ok_or(VireoError::RegistryExhausted { requested: index + 1 })?;

        let cm = Arc::new(build(Cmid::new(next)));
        slot.store(Arc::into_raw(Arc::clone(&cm)).cast_mut(), Ordering::SeqCst);
        self.current_id.store(next, Ordering::Release);
        drop(append);
        self.stats.created.fetch_add(1, Ordering::Relaxed);
        Ok(cm)
    }

    /// Entry in slot `index`, borrowed for as long as `_guard` is held.
    #[inline]
    fn peek<'g>(&'g self, _guard: &'g ReadGuard<'_>, index: usize) -> Option<&'g CompiledMethod> {
        let raw = self.slots.slot(index)?.load(Ordering::SeqCst);
        // Safety: a non-null slot owns a strong count. A sweep that clears the
        // slot parks that count on the retired list and releases it only once
        // no read guard is live, so the entry outlives `_guard`.
        unsafe { raw.cast_const().as_ref() }
    }

    #[inline]
    fn share(cm: &CompiledMethod) -> Arc<CompiledMethod> {
        let raw = ptr::from_ref(cm);
        // Safety: `cm` came from `peek`, so it lives inside an `Arc` whose
        // count is still held by its slot or by the retired list.
        unsafe {
            Arc::increment_strong_count(raw);
            Arc::from_raw(raw)
        }
    }

    /// Look up a compiled method. Never blocks.
    ///
    /// Ids outside `1..=current` are logged and yield `None`, as do slots
    /// reclaimed by a sweep.
    pub fn get(&self, cmid: Cmid) -> Option<Arc<CompiledMethod>> {
        let current = self.current_id.load(Ordering::Acquire);
        if cmid.is_none() || cmid.as_u32() > current {
            self.stats.failed_lookups.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: "vireo::registry",
                "invalid compiled method id {} (issued range 1..={current})", cmid.as_u32()
            );
            return None;
        }
        let guard = ReadGuard::enter(&self.readers);
        self.peek(&guard, cmid.index()).map(Self::share)
    }

    /// Compiled method whose code contains the return address `ip`.
    pub fn find_by_code_address(&self, ip: usize) -> Option<Arc<CompiledMethod>> {
        let current = self.current_id.load(Ordering::Acquire) as usize;
        let guard = ReadGuard::enter(&self.readers);
        (1..=current)
            .filter_map(|index| self.peek(&guard, index))
            .find(|cm| cm.is_compiled() && cm.contains_return_address(ip))
            .map(Self::share)
    }

    /// Offset of `ip` inside `cmid`'s code, naming the real owner on failure.
    pub fn instruction_offset(&self, cmid: Cmid, ip: usize) -> VireoResult<usize> {
        let cm = self.get(cmid).ok_or(VireoError::InvalidCmid(cmid))?;
        cm.instruction_offset(ip).map_err(|_| VireoError::InstructionOutOfRange {
            cmid,
            ip,
            owner: self.find_by_code_address(ip).map(|owner| owner.id()),
        })
    }

    /// Highest CMID issued so far.
    #[inline]
    pub fn num_compiled_methods(&self) -> u32 {
        self.current_id.load(Ordering::Acquire)
    }

    /// Current table size in slots.
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Registry counters.
    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }

    /// Mark a superseded version obsolete so a later sweep can reclaim it.
    ///
    /// Methods declared by the root object type are never retired.
    pub fn mark_obsolete(&self, cm: &CompiledMethod) {
        if cm
            .method()
            .is_some_and(|m| m.declaring_type().is_root_object())
        {
            return;
        }
        cm.set_obsolete();
        fence(Ordering::SeqCst);
        self.scan_for_obsolete.store(true, Ordering::Release);
    }

    /// Whether a sweep has work to do.
    #[inline]
    pub fn scan_needed(&self) -> bool {
        self.scan_for_obsolete.load(Ordering::Acquire)
    }

    /// Start a stack scan. Must be called with all mutators stopped.
    pub fn begin_stack_scan(&self) -> StackScan<'_> {
        let epoch = self.scan_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        StackScan {
            registry: self,
            epoch,
            marked: 0,
        }
    }

    /// Reclaim obsolete versions that the scan did not find on any stack.
    ///
    /// `ACTIVE_ON_STACK` is cleared on every entry that had it; obsolete
    /// entries among them keep the scan-needed bit raised for the next cycle.
    /// A proof already used (or older than one used) makes this a no-op.
    /// Cleared entries are released once no lookup is in flight, at the
    /// latest by a later sweep.
    pub fn sweep_obsolete(&self, proof: &ScanProof) -> SweepReport {
        let mut report = SweepReport::default();
        if self.swept_epoch.fetch_max(proof.epoch, Ordering::AcqRel) >= proof.epoch {
            return report;
        }
        if !self.scan_for_obsolete.swap(false, Ordering::AcqRel) {
            return report;
        }

        let current = self.current_id.load(Ordering::Acquire) as usize;
        let mut cleared = Vec::new();
        {
            let guard = ReadGuard::enter(&self.readers);
            for index in 1..=current {
                let Some(cm) = self.peek(&guard, index) else { continue };
                if cm.is_active_on_stack() {
                    if cm.is_obsolete() {
                        self.scan_for_obsolete.store(true, Ordering::Release);
                        report.retained += 1;
                    }
                    cm.clear_active_on_stack();
                } else if cm.is_obsolete() {
                    let Some(slot) = self.slots.slot(index) else { continue };
                    let raw = ptr::from_ref(cm).cast_mut();
                    if slot
                        .compare_exchange(raw, ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        report.reclaimed += 1;
                        report.reclaimed_ids.push(cm.id());
                        // Safety: the slot's strong count moves to `cleared`.
                        cleared.push(unsafe { Arc::from_raw(raw.cast_const()) });
                    }
                }
            }
        }
        report.walked = true;

        let mut retired = self.retired.lock();
        retired.append(&mut cleared);
        if self.readers.load(Ordering::SeqCst) == 0 {
            retired.clear();
        }
        drop(retired);

        self.stats.sweeps.fetch_add(1, Ordering::Relaxed);
        self.stats
            .reclaimed
            .fetch_add(report.reclaimed as u64, Ordering::Relaxed);
        debug!(
            target: "vireo::registry",
            "swept obsolete methods reclaimed={} retained={}", report.reclaimed, report.retained
        );
        report
    }

    /// Footprint of every live compiled method.
    pub fn space_report(&self) -> SpaceReport {
        let mut report = SpaceReport::default();
        let current = self.current_id.load(Ordering::Acquire) as usize;
        let guard = ReadGuard::enter(&self.readers);
        for cm in (1..=current).filter_map(|index| self.peek(&guard, index)) {
            let entry = &mut report.tiers[cm.tier().tag()];
            entry.methods += 1;
            if let Some(info) = cm.code_info() {
                entry.code_bytes += info.code.size();
                entry.map_bytes += info.map_bytes;
            }
        }
        report
    }
}

impl Drop for CompiledMethodRegistry {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            let raw = std::mem::replace(slot.get_mut(), ptr::null_mut());
            if !raw.is_null() {
                // Safety: exclusive access, and the slot owned this count.
                drop(unsafe { Arc::from_raw(raw.cast_const()) });
            }
        }
    }
}

impl fmt::Debug for CompiledMethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledMethodRegistry")
            .field("current_id", &self.num_compiled_methods())
            .field("capacity", &self.capacity())
            .field("scan_needed", &self.scan_needed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiled_method::{CodeInfo, MachineCode};
    use std::sync::{Weak, mpsc};
    use std::thread;
    use std::time::Duration;
    use vireo_core::memory::CappedMemory;
    use vireo_core::{MethodId, MethodInfo, TypeId, TypeInfo};

    fn method(id: u32) -> MethodRef {
        MethodInfo::new(MethodId(id), format!("m{id}"), TypeInfo::new(TypeId(7), "demo.Work"))
            .with_bytecode_len(20)
            .into_ref()
    }

    fn compiled(reg: &CompiledMethodRegistry, id: u32, start: usize) -> Arc<CompiledMethod> {
        let cm = reg.create(method(id), CompilerTier::Baseline).unwrap();
        cm.compile_complete(CodeInfo::new(MachineCode::new(start, 0x100)).with_map_bytes(16));
        cm
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let reg = CompiledMethodRegistry::for_testing();
        let a = reg.create(method(1), CompilerTier::Baseline).unwrap();
        let b = reg.create(method(2), CompilerTier::Baseline).unwrap();
        assert_eq!(a.id(), Cmid::new(1));
        assert_eq!(b.id(), Cmid::new(2));
        assert_eq!(reg.num_compiled_methods(), 2);
    }

    #[test]
    fn test_get_out_of_range() {
        let reg = CompiledMethodRegistry::for_testing();
        reg.create(method(1), CompilerTier::Baseline).unwrap();
        assert!(reg.get(Cmid::NONE).is_none());
        assert!(reg.get(Cmid::new(2)).is_none());
        assert!(reg.get(Cmid::new(1)).is_some());
        assert_eq!(reg.stats().snapshot().failed_lookups, 2);
    }

    #[test]
    fn test_growth_preserves_entries() {
        let reg = CompiledMethodRegistry::for_testing();
        let initial = reg.capacity();
        let created: Vec<_> = (0..initial as u32 + 1)
            .map(|i| reg.create(method(i), CompilerTier::Baseline).unwrap())
            .collect();
        assert_eq!(reg.capacity(), initial * 2);
        for cm in &created {
            assert!(Arc::ptr_eq(cm, &reg.get(cm.id()).unwrap()));
        }
        assert_eq!(reg.stats().snapshot().grown, 1);
    }

    #[test]
    fn test_growth_refused_by_memory_manager() {
        let reg = CompiledMethodRegistry::new(
            RegistryConfig::for_testing(),
            Arc::new(CappedMemory { max_len: 4 }),
        );
        for i in 0..3 {
            reg.create(method(i), CompilerTier::Baseline).unwrap();
        }
        assert_eq!(
            reg.create(method(9), CompilerTier::Baseline).unwrap_err(),
            VireoError::RegistryExhausted { requested: 8 }
        );
        assert_eq!(reg.num_compiled_methods(), 3);
    }

    #[test]
    fn test_find_by_code_address() {
        let reg = CompiledMethodRegistry::for_testing();
        let a = compiled(&reg, 1, 0x1000);
        let b = compiled(&reg, 2, 0x2000);
        reg.create(method(3), CompilerTier::Baseline).unwrap();

        assert_eq!(reg.find_by_code_address(0x1080).unwrap().id(), a.id());
        assert_eq!(reg.find_by_code_address(0x2100).unwrap().id(), b.id());
        assert!(reg.find_by_code_address(0x2000).is_none());
        assert!(reg.find_by_code_address(0x9000).is_none());
    }

    #[test]
    fn test_instruction_offset_names_owner() {
        let reg = CompiledMethodRegistry::for_testing();
        let a = compiled(&reg, 1, 0x1000);
        let b = compiled(&reg, 2, 0x2000);
        assert_eq!(reg.instruction_offset(a.id(), 0x1004).unwrap(), 4);
        assert_eq!(
            reg.instruction_offset(a.id(), 0x2004),
            Err(VireoError::InstructionOutOfRange {
                cmid: a.id(),
                ip: 0x2004,
                owner: Some(b.id()),
            })
        );
    }

    #[test]
    fn test_root_object_methods_never_obsolete() {
        let reg = CompiledMethodRegistry::for_testing();
        let root = MethodInfo::new(MethodId(1), "hashCode", TypeInfo::root_object()).into_ref();
        let cm = reg.create(root, CompilerTier::Baseline).unwrap();
        reg.mark_obsolete(&cm);
        assert!(!cm.is_obsolete());
        assert!(!reg.scan_needed());
    }

    #[test]
    fn test_sweep_reclaims_only_inactive_obsolete() {
        let reg = CompiledMethodRegistry::for_testing();
        let live = compiled(&reg, 1, 0x1000);
        let on_stack = compiled(&reg, 2, 0x2000);
        let dead = compiled(&reg, 3, 0x3000);
        reg.mark_obsolete(&on_stack);
        reg.mark_obsolete(&dead);

        let mut scan = reg.begin_stack_scan();
        assert!(scan.mark_frame(on_stack.id()));
        assert!(scan.mark_frame(live.id()));
        let proof = scan.finish();

        let report = reg.sweep_obsolete(&proof);
        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.retained, 1);
        assert!(reg.get(dead.id()).is_none());
        assert!(reg.get(on_stack.id()).is_some());
        assert!(!on_stack.is_active_on_stack());
        assert!(!live.is_active_on_stack());
        assert!(reg.scan_needed());
        assert_eq!(report.reclaimed_ids, vec![dead.id()]);
        // The table's reference was released; only ours is left.
        assert_eq!(Arc::strong_count(&dead), 1);
    }

    /// Reads the registry from another thread whenever growth is requested.
    #[derive(Default)]
    struct ReadingMemory {
        registry: OnceLock<Weak<CompiledMethodRegistry>>,
        reads: parking_lot::Mutex<Vec<Option<bool>>>,
    }

    impl MemoryManager for ReadingMemory {
        fn allocate_array(&self, _len: usize) -> VireoResult<()> {
            let Some(registry) = self.registry.get().and_then(Weak::upgrade) else {
                return Ok(());
            };
            let (tx, rx) = mpsc::channel();
            thread::spawn(move || {
                let _ = tx.send(registry.get(Cmid::new(1)).is_some());
            });
            self.reads.lock().push(rx.recv_timeout(Duration::from_millis(500)).ok());
            Ok(())
        }

        fn notify_type_resolved(&self, _ty: &TypeInfo) {}

        fn is_gc_enabled(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_lookup_completes_while_table_grows() {
        let memory = Arc::new(ReadingMemory::default());
        let reg = Arc::new(CompiledMethodRegistry::new(
            RegistryConfig::for_testing(),
            memory.clone(),
        ));
        assert!(memory.registry.set(Arc::downgrade(&reg)).is_ok());

        for i in 0..4 {
            reg.create(method(i), CompilerTier::Baseline).unwrap();
        }
        assert_eq!(*memory.reads.lock(), vec![Some(true)]);
        assert_eq!(reg.capacity(), 8);
    }

    #[test]
    fn test_concurrent_create_and_get() {
        let reg = CompiledMethodRegistry::for_testing();
        thread::scope(|s| {
            for t in 0..4u32 {
                let reg = &reg;
                s.spawn(move || {
                    for i in 0..50 {
                        let cm = reg.create(method(t * 100 + i), CompilerTier::Baseline).unwrap();
                        assert!(Arc::ptr_eq(&cm, &reg.get(cm.id()).unwrap()));
                    }
                });
            }
            s.spawn(|| {
                for _ in 0..200 {
                    let current = reg.num_compiled_methods();
                    if current > 0 {
                        assert!(reg.get(Cmid::new(current)).is_some());
                    }
                }
            });
        });
        assert_eq!(reg.num_compiled_methods(), 200);
        assert_eq!(reg.stats().snapshot().created, 200);
        for id in 1..=200 {
            assert_eq!(reg.get(Cmid::new(id)).unwrap().id(), Cmid::new(id));
        }
    }

    #[test]
    fn test_sweep_twice_without_scan_is_noop() {
        let reg = CompiledMethodRegistry::for_testing();
        let cm = compiled(&reg, 1, 0x1000);
        reg.mark_obsolete(&cm);

        let mut scan = reg.begin_stack_scan();
        scan.mark_frame(cm.id());
        let proof = scan.finish();

        assert_eq!(reg.sweep_obsolete(&proof).retained, 1);
        let second = reg.sweep_obsolete(&proof);
        assert!(!second.walked);
        assert!(reg.get(cm.id()).is_some());

        // A fresh scan that no longer sees the frame allows reclamation.
        let proof = reg.begin_stack_scan().finish();
        assert_eq!(reg.sweep_obsolete(&proof).reclaimed, 1);
        assert!(reg.get(cm.id()).is_none());
        assert!(!reg.scan_needed());
    }

    #[test]
    fn test_sweep_skipped_when_nothing_obsolete() {
        let reg = CompiledMethodRegistry::for_testing();
        compiled(&reg, 1, 0x1000);
        let report = reg.sweep_obsolete(&reg.begin_stack_scan().finish());
        assert!(!report.walked);
        assert_eq!(reg.stats().snapshot().sweeps, 0);
    }

    #[test]
    fn test_space_report() {
        let reg = CompiledMethodRegistry::for_testing();
        compiled(&reg, 1, 0x1000);
        compiled(&reg, 2, 0x2000);
        let opt = reg
            .create(method(3), CompilerTier::Opt { level: 1 })
            .unwrap();
        opt.compile_complete(CodeInfo::new(MachineCode::new(0x3000, 0x40)));
        reg.create_trap().unwrap();

        let report = reg.space_report();
        assert_eq!(report.tier(CompilerTier::Baseline).methods, 2);
        assert_eq!(report.tier(CompilerTier::Baseline).code_bytes, 0x200);
        assert_eq!(report.tier(CompilerTier::Baseline).map_bytes, 32);
        assert_eq!(report.tier(CompilerTier::Opt { level: 0 }).code_bytes, 0x40);
        assert_eq!(report.total().methods, 4);
        assert!(report.to_string().contains("baseline"));
    }
}
