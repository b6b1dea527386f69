//! Process exit coordination with a recursive-shutdown guard.
//!
//! Failing while already failing is common in a runtime: the failure path
//! prints a traceback, the traceback faults, the fault handler calls
//! `sys_fail` again. Each exit routine therefore counts how deeply it has been
//! re-entered and the coordinator dies abruptly once a routine is nested past
//! a bounded depth.
//!
//! ```text
//!   depth 1            normal exit path
//!   depth 2 ..= warn   "recursive call" warnings are logged
//!   depth > max        die_abruptly(EXIT_STATUS_RECURSIVELY_SHUTTING_DOWN)
//! ```
//!
//! The bound is widened by `num_processors - 1` because several processors
//! can legitimately be inside the same routine at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use log::{error, warn};

/// Exit status reported after an internal failure.
pub const EXIT_STATUS_SYSFAIL: i32 = 125;

/// Exit status reported when the exit path itself recursed too deeply.
pub const EXIT_STATUS_RECURSIVELY_SHUTTING_DOWN: i32 = 128;

/// Nesting depth tolerated inside one exit routine.
pub const MAX_SYSTEM_TROUBLE_RECURSION_DEPTH: u32 = 3;

/// Additional nesting during which recursion warnings are still logged.
pub const MAX_RECURSION_DEPTH_BEFORE_QUIET: u32 = 3;

/// Performs the actual process exit.
pub trait Terminator: Send + Sync {
    /// Orderly exit with the given status.
    fn terminate(&self, status: i32);

    /// Emergency exit that must not run any further runtime code.
    fn die_abruptly(&self, status: i32);
}

/// Terminator backed by [`std::process::exit`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessTerminator;

impl Terminator for ProcessTerminator {
    fn terminate(&self, status: i32) {
        std::process::exit(status);
    }

    fn die_abruptly(&self, status: i32) {
        std::process::exit(status);
    }
}

/// The guarded exit routines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitRoutine {
    /// Internal failure.
    SysFail,
    /// Raw process exit.
    SysExit,
    /// Orderly shutdown.
    Shutdown,
}

impl ExitRoutine {
    const fn index(self) -> usize {
        match self {
            ExitRoutine::SysFail => 0,
            ExitRoutine::SysExit => 1,
            ExitRoutine::Shutdown => 2,
        }
    }

    /// Routine name used in diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            ExitRoutine::SysFail => "sys_fail",
            ExitRoutine::SysExit => "sys_exit",
            ExitRoutine::Shutdown => "shutdown",
        }
    }
}

/// Coordinates `sys_fail`, `sys_exit` and `shutdown`.
pub struct ExitCoordinator {
    depths: [AtomicU32; 3],
    num_processors: u32,
    died_abruptly: AtomicBool,
    terminator: Arc<dyn Terminator>,
}

impl ExitCoordinator {
    /// Create a coordinator for a runtime with `num_processors` processors.
    pub fn new(num_processors: u32, terminator: Arc<dyn Terminator>) -> Self {
        Self {
            depths: [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)],
            num_processors: num_processors.max(1),
            died_abruptly: AtomicBool::new(false),
            terminator,
        }
    }

    /// Exit because of an internal failure.
    pub fn sys_fail(&self, message: &str) {
        if !self.enter(ExitRoutine::SysFail, Some(message)) {
            return;
        }
        error!(target: "vireo::exit", "sys_fail: {message}");
        self.shutdown(EXIT_STATUS_SYSFAIL);
    }

    /// Orderly shutdown with the given status.
    pub fn shutdown(&self, status: i32) {
        if !self.enter(ExitRoutine::Shutdown, None) {
            return;
        }
        self.sys_exit(status);
    }

    /// Exit the process with the given status.
    pub fn sys_exit(&self, status: i32) {
        if !self.enter(ExitRoutine::SysExit, None) {
            return;
        }
        self.terminator.terminate(status);
    }

    /// Whether `sys_fail` is on some call stack.
    pub fn in_sys_fail(&self) -> bool {
        self.depth(ExitRoutine::SysFail) > 0
    }

    /// Current entry depth of a routine.
    pub fn depth(&self, routine: ExitRoutine) -> u32 {
        self.depths[routine.index()].load(Ordering::Acquire)
    }

    /// Whether the emergency exit has been taken.
    pub fn has_died_abruptly(&self) -> bool {
        self.died_abruptly.load(Ordering::Acquire)
    }

    /// Record entry into `routine`. Returns `false` when the caller must not
    /// continue because the emergency exit was taken instead.
    fn enter(&self, routine: ExitRoutine, message: Option<&str>) -> bool {
        let depth = self.depths[routine.index()].fetch_add(1, Ordering::AcqRel) + 1;
        let processor_adjust = self.num_processors - 1;
        let limit = MAX_SYSTEM_TROUBLE_RECURSION_DEPTH + processor_adjust;

        if depth > 1 && depth <= limit + MAX_RECURSION_DEPTH_BEFORE_QUIET {
            let certainty = if depth > self.num_processors {
                "an (unambiguously)"
            } else {
                "a (likely)"
            };
            match message {
                Some(msg) => warn!(
                    target: "vireo::exit",
                    "{}(): in {certainty} recursive call, {depth} deep; called with: {msg}",
                    routine.name()
                ),
                None => warn!(
                    target: "vireo::exit",
                    "{}(): in {certainty} recursive call, {depth} deep",
                    routine.name()
                ),
            }
        }

        if depth > limit {
            self.die_abruptly();
            return false;
        }
        true
    }

    fn die_abruptly(&self) {
        if !self.died_abruptly.swap(true, Ordering::AcqRel) {
            error!(
                target: "vireo::exit",
                "dying abruptly; stuck in a recursive shutdown/exit"
            );
        }
        self.terminator
            .die_abruptly(EXIT_STATUS_RECURSIVELY_SHUTTING_DOWN);
    }
}

impl std::fmt::Debug for ExitCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitCoordinator")
            .field("sys_fail", &self.depth(ExitRoutine::SysFail))
            .field("sys_exit", &self.depth(ExitRoutine::SysExit))
            .field("shutdown", &self.depth(ExitRoutine::Shutdown))
            .field("num_processors", &self.num_processors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Weak;

    /// Terminator whose orderly exit fails back into `sys_fail`.
    #[derive(Default)]
    struct Recursing {
        coordinator: Mutex<Weak<ExitCoordinator>>,
        terminated: Mutex<Vec<i32>>,
        abrupt: Mutex<Vec<i32>>,
    }

    impl Terminator for Recursing {
        fn terminate(&self, status: i32) {
            self.terminated.lock().push(status);
            let coordinator = self.coordinator.lock().upgrade();
            if let Some(c) = coordinator {
                c.sys_fail("exit hook faulted");
            }
        }

        fn die_abruptly(&self, status: i32) {
            self.abrupt.lock().push(status);
        }
    }

    #[derive(Default)]
    struct Recording {
        terminated: Mutex<Vec<i32>>,
    }

    impl Terminator for Recording {
        fn terminate(&self, status: i32) {
            self.terminated.lock().push(status);
        }

        fn die_abruptly(&self, _status: i32) {
            panic!("unexpected abrupt exit");
        }
    }

    #[test]
    fn test_sys_fail_reaches_terminator_once() {
        let term = Arc::new(Recording::default());
        let coordinator = ExitCoordinator::new(1, term.clone());
        coordinator.sys_fail("boom");
        assert_eq!(*term.terminated.lock(), vec![EXIT_STATUS_SYSFAIL]);
        assert_eq!(coordinator.depth(ExitRoutine::SysFail), 1);
        assert_eq!(coordinator.depth(ExitRoutine::Shutdown), 1);
        assert!(!coordinator.has_died_abruptly());
    }

    #[test]
    fn test_recursive_sys_fail_dies_abruptly() {
        let term = Arc::new(Recursing::default());
        let coordinator = Arc::new(ExitCoordinator::new(1, term.clone()));
        *term.coordinator.lock() = Arc::downgrade(&coordinator);

        coordinator.sys_fail("first failure");

        assert!(coordinator.has_died_abruptly());
        assert_eq!(
            *term.abrupt.lock(),
            vec![EXIT_STATUS_RECURSIVELY_SHUTTING_DOWN]
        );
        // sys_fail is the routine that overflows; the others stop at the bound.
        assert_eq!(
            coordinator.depth(ExitRoutine::SysFail),
            MAX_SYSTEM_TROUBLE_RECURSION_DEPTH + 1
        );
        assert_eq!(
            coordinator.depth(ExitRoutine::SysExit),
            MAX_SYSTEM_TROUBLE_RECURSION_DEPTH
        );
        assert_eq!(
            term.terminated.lock().len() as u32,
            MAX_SYSTEM_TROUBLE_RECURSION_DEPTH
        );
    }

    #[test]
    fn test_processor_adjustment_widens_bound() {
        let term = Arc::new(Recursing::default());
        let coordinator = Arc::new(ExitCoordinator::new(4, term.clone()));
        *term.coordinator.lock() = Arc::downgrade(&coordinator);

        coordinator.sys_fail("first failure");

        let limit = MAX_SYSTEM_TROUBLE_RECURSION_DEPTH + 3;
        assert_eq!(term.terminated.lock().len() as u32, limit);
        assert_eq!(coordinator.depth(ExitRoutine::SysFail), limit + 1);
    }
}
