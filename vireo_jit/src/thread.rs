//! Green threads as seen by the adaptive system.
//!
//! The scheduler owns threads; Vireo only needs a thread's stack memory, the
//! OSR handshake fields and a way to park and wake it. The OSR handshake is:
//!
//! ```text
//!  application thread           OSR organizer / controller
//!  ──────────────────           ──────────────────────────
//!  request_osr(state)
//!    requesting_osr = true ───▶ take_osr_request()
//!  park()                         ... compile, install ...
//!                               install_osr_bridge(bridge)
//!                                 bridge = Some(..); fence(Release)
//!                                 waiting_for_osr = true
//!                               activate()
//!  post_thread_switch() ◀───────
//!    waiting_for_osr? take bridge (Acquire)
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering, fence};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use vireo_core::{Cmid, ThreadId, VireoError, VireoResult, WORD_SIZE};

use crate::osr::OsrExecutionState;
use crate::osr::glue::GlueCode;

/// Offset from a frame pointer to the word holding the frame's CMID.
pub const STACKFRAME_METHOD_ID_OFFSET: i32 = -WORD_SIZE;

/// Offset from a frame pointer to the saved caller frame pointer.
pub const STACKFRAME_FRAME_POINTER_OFFSET: i32 = 0;

// =============================================================================
// Thread Stack
// =============================================================================

/// A thread's stack memory, addressed by byte offset from its base.
#[derive(Debug)]
pub struct ThreadStack {
    bytes: Mutex<Vec<u8>>,
}

impl ThreadStack {
    /// Zeroed stack of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0; size]),
        }
    }

    /// Stack size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    /// Whether the stack has no memory.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(offset: usize, delta: i32) -> Option<usize> {
        offset.checked_add_signed(delta as isize)
    }

    /// Read the word at `offset`.
    pub fn read_word(&self, offset: usize) -> Option<i64> {
        let bytes = self.bytes.lock();
        let end = offset.checked_add(WORD_SIZE as usize)?;
        let chunk = bytes.get(offset..end)?;
        let mut word = [0u8; WORD_SIZE as usize];
        word.copy_from_slice(chunk);
        Some(i64::from_le_bytes(word))
    }

    /// Write the word at `offset`. Returns `false` if it lies outside the
    /// stack.
    pub fn write_word(&self, offset: usize, value: i64) -> bool {
        let mut bytes = self.bytes.lock();
        let Some(end) = offset.checked_add(WORD_SIZE as usize) else {
            return false;
        };
        match bytes.get_mut(offset..end) {
            Some(chunk) => {
                chunk.copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    /// Lay out a frame header at `fp_offset`.
    pub fn write_frame(&self, fp_offset: usize, caller_fp: usize, cmid: Cmid) -> bool {
        let (Some(fp), Some(id)) = (
            Self::slot(fp_offset, STACKFRAME_FRAME_POINTER_OFFSET),
            Self::slot(fp_offset, STACKFRAME_METHOD_ID_OFFSET),
        ) else {
            return false;
        };
        self.write_word(fp, caller_fp as i64) && self.write_word(id, i64::from(cmid.as_u32()))
    }

    /// CMID recorded in the frame at `fp_offset`.
    pub fn frame_cmid(&self, fp_offset: usize) -> Option<Cmid> {
        let at = Self::slot(fp_offset, STACKFRAME_METHOD_ID_OFFSET)?;
        let raw = self.read_word(at)?;
        u32::try_from(raw).ok().map(Cmid::new)
    }
}

// =============================================================================
// OSR Bridge
// =============================================================================

/// Glue code staged on a thread, consumed at its next thread switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsrBridge {
    /// The glue to run.
    pub glue: GlueCode,
    /// Compiled method being entered.
    pub target: Cmid,
    /// Frame pointer offset of the replaced frame.
    pub from_fp_offset: usize,
    /// Frame pointer offset of the thread-switch frame above it.
    pub ts_fp_offset: usize,
}

// =============================================================================
// VM Thread
// =============================================================================

/// A green thread.
#[derive(Debug)]
pub struct VmThread {
    id: ThreadId,
    stack: ThreadStack,
    requesting_osr: AtomicBool,
    waiting_for_osr: AtomicBool,
    osr_request: Mutex<Option<OsrExecutionState>>,
    bridge: Mutex<Option<OsrBridge>>,
    permit: Mutex<bool>,
    wake: Condvar,
}

impl VmThread {
    /// Create a thread with `stack_size` bytes of stack.
    pub fn new(id: ThreadId, stack_size: usize) -> Self {
        Self {
            id,
            stack: ThreadStack::new(stack_size),
            requesting_osr: AtomicBool::new(false),
            waiting_for_osr: AtomicBool::new(false),
            osr_request: Mutex::new(None),
            bridge: Mutex::new(None),
            permit: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    /// Thread id.
    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Stack memory.
    #[inline]
    pub fn stack(&self) -> &ThreadStack {
        &self.stack
    }

    /// Record an OSR request. The flag is raised after the request is stored.
    pub fn request_osr(&self, state: OsrExecutionState) {
        *self.osr_request.lock() = Some(state);
        self.requesting_osr.store(true, Ordering::Release);
    }

    /// Whether an OSR request is pending.
    #[inline]
    pub fn is_requesting_osr(&self) -> bool {
        self.requesting_osr.load(Ordering::Acquire)
    }

    /// Clear the request flag and take the pending request, if any.
    pub fn take_osr_request(&self) -> Option<OsrExecutionState> {
        if !self.requesting_osr.swap(false, Ordering::AcqRel) {
            return None;
        }
        self.osr_request.lock().take()
    }

    /// Stage glue code. The waiting flag is published after a release fence
    /// so the consumer always sees a complete bridge.
    pub fn install_osr_bridge(&self, bridge: OsrBridge) {
        *self.bridge.lock() = Some(bridge);
        fence(Ordering::Release);
        self.waiting_for_osr.store(true, Ordering::Release);
    }

    /// Whether glue is staged and not yet consumed.
    #[inline]
    pub fn is_waiting_for_osr(&self) -> bool {
        self.waiting_for_osr.load(Ordering::Acquire)
    }

    /// Called by the thread itself after a thread switch: take staged glue.
    pub fn post_thread_switch(&self) -> Option<OsrBridge> {
        if !self.waiting_for_osr.swap(false, Ordering::Acquire) {
            return None;
        }
        self.bridge.lock().take()
    }

    /// Block until [`activate`](Self::activate) is called.
    pub fn park(&self) {
        let mut permit = self.permit.lock();
        while !*permit {
            self.wake.wait(&mut permit);
        }
        *permit = false;
    }

    /// Block until activated or `timeout` elapses. Returns whether the
    /// thread was activated.
    pub fn park_timeout(&self, timeout: Duration) -> bool {
        let mut permit = self.permit.lock();
        if !*permit {
            self.wake.wait_for(&mut permit, timeout);
        }
        std::mem::replace(&mut *permit, false)
    }

    /// Wake the thread, or let its next `park` return immediately.
    pub fn activate(&self) {
        *self.permit.lock() = true;
        self.wake.notify_one();
    }
}

// =============================================================================
// Thread Registry
// =============================================================================

/// The scheduler's list of live threads.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: RwLock<Vec<Arc<VmThread>>>,
    next_id: AtomicU32,
}

impl ThreadRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a thread.
    pub fn spawn(&self, stack_size: usize) -> Arc<VmThread> {
        let id = ThreadId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let thread = Arc::new(VmThread::new(id, stack_size));
        self.threads.write().push(Arc::clone(&thread));
        thread
    }

    /// Remove a thread that has terminated.
    pub fn unregister(&self, id: ThreadId) -> VireoResult<Arc<VmThread>> {
        let mut threads = self.threads.write();
        let pos = threads
            .iter()
            .position(|t| t.id() == id)
            .ok_or(VireoError::ThreadNotRegistered(id))?;
        Ok(threads.swap_remove(pos))
    }

    /// Look up a thread.
    pub fn get(&self, id: ThreadId) -> VireoResult<Arc<VmThread>> {
        self.threads
            .read()
            .iter()
            .find(|t| t.id() == id)
            .cloned()
            .ok_or(VireoError::ThreadNotRegistered(id))
    }

    /// Snapshot of every live thread.
    pub fn all_threads(&self) -> Vec<Arc<VmThread>> {
        self.threads.read().clone()
    }

    /// Number of live threads.
    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    /// Whether no thread is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osr::glue::{GlueEmitter, PortableEmitter};
    use vireo_core::{MethodId, MethodInfo, TypeId, TypeInfo};

    fn request(thread: ThreadId) -> OsrExecutionState {
        let method = MethodInfo::new(MethodId(1), "spin", TypeInfo::new(TypeId(2), "demo.S"))
            .into_ref();
        OsrExecutionState::new(thread, method, Cmid::new(1), 12, 256, 192)
    }

    #[test]
    fn test_stack_frame_roundtrip() {
        let stack = ThreadStack::new(512);
        assert!(stack.write_frame(256, 320, Cmid::new(17)));
        assert_eq!(stack.frame_cmid(256), Some(Cmid::new(17)));
        assert_eq!(stack.read_word(256), Some(320));
        assert!(!stack.write_word(510, 1));
        assert_eq!(stack.frame_cmid(4), None);
    }

    #[test]
    fn test_osr_request_taken_once() {
        let thread = VmThread::new(ThreadId(1), 64);
        assert!(thread.take_osr_request().is_none());
        thread.request_osr(request(thread.id()));
        assert!(thread.is_requesting_osr());
        assert!(thread.take_osr_request().is_some());
        assert!(!thread.is_requesting_osr());
        assert!(thread.take_osr_request().is_none());
    }

    #[test]
    fn test_bridge_consumed_at_thread_switch() {
        let thread = VmThread::new(ThreadId(1), 64);
        assert!(thread.post_thread_switch().is_none());
        let bridge = OsrBridge {
            glue: PortableEmitter::new().finish(),
            target: Cmid::new(4),
            from_fp_offset: 256,
            ts_fp_offset: 192,
        };
        thread.install_osr_bridge(bridge.clone());
        assert!(thread.is_waiting_for_osr());
        assert_eq!(thread.post_thread_switch(), Some(bridge));
        assert!(!thread.is_waiting_for_osr());
        assert!(thread.post_thread_switch().is_none());
    }

    #[test]
    fn test_activate_before_park_is_not_lost() {
        let thread = Arc::new(VmThread::new(ThreadId(1), 64));
        thread.activate();
        thread.park();
        assert!(!thread.park_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_park_wakes_on_activate() {
        let thread = Arc::new(VmThread::new(ThreadId(1), 64));
        let t = Arc::clone(&thread);
        let handle = std::thread::spawn(move || t.park());
        std::thread::sleep(Duration::from_millis(10));
        thread.activate();
        handle.join().unwrap();
    }

    #[test]
    fn test_thread_registry() {
        let threads = ThreadRegistry::new();
        let a = threads.spawn(128);
        let b = threads.spawn(128);
        assert_ne!(a.id(), b.id());
        assert_eq!(threads.all_threads().len(), 2);
        assert!(Arc::ptr_eq(&threads.get(b.id()).unwrap(), &b));
        threads.unregister(a.id()).unwrap();
        assert_eq!(
            threads.get(a.id()).unwrap_err(),
            VireoError::ThreadNotRegistered(a.id())
        );
        assert_eq!(threads.len(), 1);
    }
}
