//! Teardown-tolerant task deferral onto one executor.
//!
//! Tasks posted through a [`DeferredExecutor`] carry a validity token
//! instead of a reference to their owner: a shared epoch counter and the
//! generation the helper was created with. [`DeferredExecutor::teardown`]
//! advances the epoch, turning every task still queued (including timers
//! that will fire much later) into a no-op. Teardown therefore never waits
//! on outstanding timers, and nothing posted here extends the lifetime of
//! the harness that owns the helper.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::error::{HarnessError, Result};
use crate::executor::{AffineExecutor, Task};

pub struct DeferredExecutor {
    executor: Arc<dyn AffineExecutor>,
    epoch: Arc<AtomicU64>,
    generation: u64,
}

impl DeferredExecutor {
    /// Creates a helper bound to `executor` that shares `epoch` with earlier
    /// and later helpers of the same owner.
    #[must_use]
    pub fn new(executor: Arc<dyn AffineExecutor>, epoch: Arc<AtomicU64>) -> Self {
        let generation = epoch.load(Ordering::Acquire);
        Self {
            executor,
            epoch,
            generation,
        }
    }

    /// Creates a helper with its own epoch.
    #[must_use]
    pub fn standalone(executor: Arc<dyn AffineExecutor>) -> Self {
        Self::new(executor, Arc::new(AtomicU64::new(0)))
    }

    /// Returns false once this helper (or a later helper sharing its epoch)
    /// has been torn down.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.epoch.load(Ordering::Acquire) == self.generation
    }

    /// Posts `task` to run after everything already queued on the executor.
    ///
    /// # Errors
    ///
    /// `OffExecutor` when called from another thread, `TornDown` after
    /// teardown, `ExecutorShutDown` if the executor is gone.
    pub fn post_task<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.check("post_task")?;
        self.executor.post(self.guard(task))
    }

    /// Posts `task` to run after `delay`.
    ///
    /// # Errors
    ///
    /// Same as [`post_task`](Self::post_task).
    pub fn post_delayed_task<F>(&self, task: F, delay: Duration) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.check("post_delayed_task")?;
        self.executor.post_delayed(self.guard(task), delay)
    }

    /// Invalidates every task posted through this helper that has not run yet.
    pub fn teardown(self) {
        drop(self);
    }

    fn invalidate(&self) {
        // Only the generation that is still current may advance the epoch.
        let _ = self.epoch.compare_exchange(
            self.generation,
            self.generation + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        if !self.executor.is_current() {
            return Err(HarnessError::OffExecutor {
                operation,
                executor: self.executor.name().to_string(),
            });
        }
        if !self.is_valid() {
            return Err(HarnessError::TornDown);
        }
        Ok(())
    }

    fn guard<F>(&self, task: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        let epoch = Arc::clone(&self.epoch);
        let generation = self.generation;
        Box::new(move || {
            if epoch.load(Ordering::Acquire) != generation {
                trace!(generation, "discarding task posted before teardown");
                return;
            }
            task();
        })
    }
}

impl fmt::Debug for DeferredExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredExecutor")
            .field("executor", &self.executor.name())
            .field("generation", &self.generation)
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl Drop for DeferredExecutor {
    fn drop(&mut self) {
        self.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{run_on, ThreadExecutor};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn on_executor<T: Send + 'static>(
        executor: &Arc<ThreadExecutor>,
        f: impl FnOnce(Arc<dyn AffineExecutor>) -> T + Send + 'static,
    ) -> T {
        let target: Arc<dyn AffineExecutor> = executor.clone();
        run_on(executor.as_ref(), move || f(target)).unwrap()
    }

    #[test]
    fn rejects_posting_from_another_thread() {
        let executor = ThreadExecutor::spawn("deferred-off").unwrap();
        let helper = DeferredExecutor::standalone(executor.clone());
        assert!(matches!(
            helper.post_task(|| {}),
            Err(HarnessError::OffExecutor { operation: "post_task", .. })
        ));
        executor.shutdown();
    }

    #[test]
    fn runs_tasks_while_valid() {
        let executor = ThreadExecutor::spawn("deferred-run").unwrap();
        let (tx, rx) = mpsc::channel();

        on_executor(&executor, move |target| {
            let helper = Arc::new(DeferredExecutor::standalone(target));
            // The task keeps the helper alive until it has run.
            let keep = Arc::clone(&helper);
            helper
                .post_task(move || {
                    tx.send("ran").unwrap();
                    drop(keep);
                })
                .unwrap();
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "ran");
        executor.shutdown();
    }

    #[test]
    fn teardown_turns_pending_timers_into_no_ops() {
        let executor = ThreadExecutor::spawn("deferred-teardown").unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        on_executor(&executor, move |target| {
            let helper = DeferredExecutor::standalone(target);
            helper
                .post_delayed_task(
                    move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    },
                    Duration::from_millis(20),
                )
                .unwrap();
            helper.teardown();
        });

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        executor.shutdown();
    }

    #[test]
    fn later_generation_is_unaffected_by_earlier_teardown() {
        let executor = ThreadExecutor::spawn("deferred-generation").unwrap();
        let epoch = Arc::new(AtomicU64::new(0));

        let (valid, posted) = on_executor(&executor, move |target| {
            let first = DeferredExecutor::new(target.clone(), Arc::clone(&epoch));
            first.teardown();
            let second = DeferredExecutor::new(target, epoch);
            let result = second.post_task(|| {});
            (second.is_valid(), result.is_ok())
        });

        assert!(valid);
        assert!(posted);
        executor.shutdown();
    }
}
