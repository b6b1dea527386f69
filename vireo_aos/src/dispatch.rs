//! Compilation workers.
//!
//! Dispatch is fire-and-forget: the caller enqueues a [`CompileJob`] and
//! returns immediately. Workers take jobs in priority order and run them on
//! the shared [`Recompiler`]. With zero workers the job runs inline on the
//! dispatching thread, which keeps tests deterministic.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use log::{debug, error};
use parking_lot::Mutex;

use crate::queue::PriorityQueue;
use crate::recompiler::{CompileJob, Recompiler};

/// Pool of compilation threads.
#[derive(Debug)]
pub struct CompilationDispatcher {
    recompiler: Arc<Recompiler>,
    jobs: Arc<PriorityQueue<CompileJob>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    inline: bool,
    dispatched: AtomicU64,
}

impl CompilationDispatcher {
    /// Start `threads` workers. Zero means inline compilation.
    pub fn new(recompiler: Arc<Recompiler>, threads: usize) -> Self {
        let jobs = Arc::new(PriorityQueue::new());
        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let jobs = Arc::clone(&jobs);
            let recompiler = Arc::clone(&recompiler);
            let spawned = thread::Builder::new()
                .name(format!("vireo-compiler-{index}"))
                .spawn(move || {
                    while let Some((_, job)) = jobs.take() {
                        recompiler.run(job);
                    }
                    debug!(target: "vireo::aos", "compilation worker {index} exiting");
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => error!(target: "vireo::aos", "failed to spawn compilation worker {index}: {e}"),
            }
        }

        Self {
            recompiler,
            jobs,
            inline: workers.is_empty(),
            workers: Mutex::new(workers),
            dispatched: AtomicU64::new(0),
        }
    }

    /// Whether jobs run on the dispatching thread.
    pub fn is_inline(&self) -> bool {
        self.inline
    }

    /// Hand `job` to a worker, or run it now when there are none.
    pub fn dispatch(&self, job: CompileJob) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.recompiler.listener().plan_dispatched(job.plan());
        if self.is_inline() {
            self.recompiler.run(job);
            return;
        }
        let priority = job.plan().priority();
        if let Err(job) = self.jobs.try_insert(priority, job) {
            debug!(target: "vireo::aos", "compilation job abandoned after shutdown");
            self.recompiler.abandon(job);
        }
    }

    /// Jobs dispatched so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Jobs waiting for a worker.
    pub fn pending(&self) -> usize {
        self.jobs.len()
    }

    /// Stop the workers. Jobs not yet taken are abandoned: their plans are
    /// aborted and OSR threads released. Jobs in progress run to completion.
    /// Returns how many workers had panicked.
    pub fn shutdown(&self) -> usize {
        let pending = self.jobs.shutdown();
        if !pending.is_empty() {
            debug!(target: "vireo::aos", "abandoning {} queued compilation jobs", pending.len());
        }
        for job in pending {
            self.recompiler.abandon(job);
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        let mut panicked = 0;
        for handle in workers {
            if handle.join().is_err() {
                error!(target: "vireo::aos", "compilation worker panicked");
                panicked += 1;
            }
        }
        panicked
    }
}

impl Drop for CompilationDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Tests
// =============================================================================
