//! Call density.
//!
//! Every method sample is taken at a prologue, an epilogue or a loop
//! backedge. The fraction of samples that were not taken at backedges
//! approximates how call-heavy the program is.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Where a sample was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleSite {
    /// Method entry.
    Prologue,
    /// Method exit.
    Epilogue,
    /// Loop backedge.
    Backedge,
}

/// Running call-density statistics.
#[derive(Debug, Default)]
pub struct CallDensityListener {
    samples: AtomicU64,
    backedge_samples: AtomicU64,
}

impl CallDensityListener {
    /// Listener with no samples.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one sample.
    #[inline]
    pub fn update(&self, site: SampleSite) {
        self.samples.fetch_add(1, Ordering::Relaxed);
        if site == SampleSite::Backedge {
            self.backedge_samples.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Samples seen.
    #[inline]
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    /// `1 - backedge / samples`; zero before any sample.
    pub fn call_density(&self) -> f64 {
        let samples = self.samples();
        if samples == 0 {
            return 0.0;
        }
        1.0 - self.backedge_samples.load(Ordering::Relaxed) as f64 / samples as f64
    }

    /// Forget all samples.
    pub fn reset(&self) {
        self.samples.store(0, Ordering::Relaxed);
        self.backedge_samples.store(0, Ordering::Relaxed);
    }

    /// Printable summary.
    pub fn report(&self) -> CallDensityReport {
        CallDensityReport {
            samples: self.samples(),
            backedge_samples: self.backedge_samples.load(Ordering::Relaxed),
            call_density: self.call_density(),
        }
    }
}

/// Snapshot of a [`CallDensityListener`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallDensityReport {
    /// Samples seen.
    pub samples: u64,
    /// Samples taken at backedges.
    pub backedge_samples: u64,
    /// Call density.
    pub call_density: f64,
}

impl fmt::Display for CallDensityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "The call density of the program is {:.4} ({} samples, {} at backedges)",
            self.call_density, self.samples, self.backedge_samples
        )
    }
}
