//! Run flag shared by every worker and the compositor.
//!
//! A cooperative broadcast signal: one writer (whoever decides the run is over),
//! many readers that check it at the top of each loop iteration. Nothing is
//! interrupted mid-call, so a worker blocked in its driver finishes that wait
//! before it notices the stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable handle to one run's cancellation state.
///
/// Every clone observes the same flag. Separate runs (and separate tests) each
/// create their own.
#[derive(Clone, Debug)]
pub struct RunFlag {
    running: Arc<AtomicBool>,
}

impl RunFlag {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask every holder of this flag to stop. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}
