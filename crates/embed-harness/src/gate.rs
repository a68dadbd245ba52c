//! Counting completion barrier.
//!
//! A `CompletionGate` expects a fixed number of completions per cycle. The
//! completion that brings the count to `total` resets the count and releases
//! the waiter; `wait` re-arms the gate so the next cycle again needs `total`
//! fresh completions. One gate can be shared by several harnesses (see
//! [`InstanceGroup`](crate::group::InstanceGroup)).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{trace, warn};

use crate::event::ManualResetEvent;
use crate::results::{TestFailure, TestResults};

#[derive(Debug)]
pub struct CompletionGate {
    total: usize,
    count: AtomicUsize,
    released: ManualResetEvent,
    results: Option<Arc<TestResults>>,
}

impl CompletionGate {
    /// Creates a gate that releases after `total` completions.
    ///
    /// # Panics
    ///
    /// Panics if `total` is zero; such a gate could never be released.
    #[must_use]
    pub fn new(total: usize) -> Self {
        assert!(total > 0, "a completion gate needs at least one expected completion");
        Self {
            total,
            count: AtomicUsize::new(0),
            released: ManualResetEvent::new(),
            results: None,
        }
    }

    /// Creates a gate that reports over-signaling to `results`.
    #[must_use]
    pub fn with_results(total: usize, results: Arc<TestResults>) -> Self {
        Self {
            results: Some(results),
            ..Self::new(total)
        }
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }

    /// Completions received in the current cycle.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Returns true if the gate was released and no `wait` has consumed it yet.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.is_signaled()
    }

    /// Counts one completion. The `total`-th completion of a cycle resets the
    /// count and releases the waiter.
    ///
    /// Callers may be torn down by whoever is blocked in `wait` as soon as
    /// the gate releases, so this must be the last thing they do.
    pub fn complete(&self) {
        if self.released.is_signaled() {
            warn!(total = self.total, "completion gate over-signaled");
            if let Some(results) = &self.results {
                results.record(TestFailure::GateOverSignaled { total: self.total });
            }
        }

        let mut current = self.count.load(Ordering::Acquire);
        let reached = loop {
            let next = current + 1;
            let stored = if next >= self.total { 0 } else { next };
            match self.count.compare_exchange_weak(
                current,
                stored,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break next,
                Err(actual) => current = actual,
            }
        };

        trace!(count = reached, total = self.total, "completion gate");
        if reached == self.total {
            self.released.signal();
        }
    }

    /// Blocks until the gate is released, then re-arms it.
    ///
    /// Must not be called from an executor that the completions depend on.
    pub fn wait(&self) {
        self.released.wait_and_reset();
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    ///
    /// Returns true if the gate was released (and re-armed).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.released.wait_and_reset_timeout(timeout)
    }
}
