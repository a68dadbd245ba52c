//! Designated execution contexts.
//!
//! The embedding engine owns a handful of long-lived threads (a UI thread,
//! an I/O thread, ...) and every harness operation is bound to one of them.
//! [`AffineExecutor`] is the seam the harness uses to ask "am I on that
//! context?" and to post work onto it. Engines implement it for their own
//! threads; [`ThreadExecutor`] is a standalone implementation backed by a
//! dedicated OS thread that drives a current-thread tokio runtime.
//!
//! # Ordering
//!
//! Tasks posted with [`AffineExecutor::post`] run in post order. Delayed
//! tasks run after their delay elapses, interleaved with posted tasks.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::{HarnessError, Result};

/// A unit of work posted to an executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A designated execution context that specific operations must run on.
pub trait AffineExecutor: Send + Sync {
    /// Human-readable name used in logs and errors ("ui", "io", ...).
    fn name(&self) -> &str;

    /// Returns true if the calling thread is this executor.
    fn is_current(&self) -> bool;

    /// Queues `task` to run on this executor.
    ///
    /// # Errors
    ///
    /// Returns `ExecutorShutDown` if the executor no longer accepts work.
    fn post(&self, task: Task) -> Result<()>;

    /// Queues `task` to run on this executor once `delay` has elapsed.
    ///
    /// # Errors
    ///
    /// Returns `ExecutorShutDown` if the executor no longer accepts work.
    fn post_delayed(&self, task: Task, delay: Duration) -> Result<()>;
}

impl fmt::Debug for dyn AffineExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AffineExecutor")
            .field("name", &self.name())
            .finish()
    }
}

/// Runs `f` on `executor` and returns its result to the calling thread.
///
/// Runs inline when already on the executor. Otherwise blocks the caller
/// until the task has run, so it must not be called from a context the task
/// itself waits on.
///
/// # Errors
///
/// Returns `ExecutorShutDown` if the task could not be posted or was dropped
/// before it ran.
pub fn run_on<T, F>(executor: &dyn AffineExecutor, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    if executor.is_current() {
        return Ok(f());
    }

    let (reply, receive) = std_mpsc::sync_channel(1);
    executor.post(Box::new(move || {
        let _ = reply.send(f());
    }))?;
    receive
        .recv()
        .map_err(|_| HarnessError::ExecutorShutDown(executor.name().to_string()))
}

fn run_task(executor: &str, task: Task) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!(executor, "task panicked");
    }
}

/// An [`AffineExecutor`] backed by a dedicated thread.
///
/// The thread drives a current-thread tokio runtime: posted tasks arrive over
/// an unbounded channel and delayed tasks are spawned onto the runtime behind
/// a `tokio::time::sleep`. Shutting down drains the already-posted tasks and
/// then drops the runtime, discarding any delayed task that has not fired.
pub struct ThreadExecutor {
    name: String,
    thread_id: ThreadId,
    runtime: Handle,
    sender: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadExecutor {
    /// Spawns the executor thread.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the runtime or the thread cannot be created.
    pub fn spawn(name: impl Into<String>) -> Result<Arc<Self>> {
        let name = name.into();
        let runtime = Builder::new_current_thread().enable_time().build()?;
        let handle = runtime.handle().clone();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();

        let thread_name = name.clone();
        let thread = std::thread::Builder::new()
            .name(format!("harness-{name}"))
            .spawn(move || {
                runtime.block_on(async {
                    while let Some(task) = receiver.recv().await {
                        run_task(&thread_name, task);
                    }
                });
                debug!(executor = %thread_name, "executor stopped");
            })?;

        debug!(executor = %name, "executor started");
        Ok(Arc::new(Self {
            name,
            thread_id: thread.thread().id(),
            runtime: handle,
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
        }))
    }

    /// Stops accepting work, runs what was already posted and joins the
    /// thread. Pending delayed tasks are discarded.
    ///
    /// Safe to call more than once. When called from the executor's own
    /// thread the thread is detached instead of joined.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());

        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if self.is_current() {
            return;
        }
        if thread.join().is_err() {
            warn!(executor = %self.name, "executor thread panicked during shutdown");
        }
    }

    /// Returns true once `shutdown` has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().is_none()
    }

    fn shut_down_error(&self) -> HarnessError {
        HarnessError::ExecutorShutDown(self.name.clone())
    }
}

impl AffineExecutor for ThreadExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_current(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    fn post(&self, task: Task) -> Result<()> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or_else(|| self.shut_down_error())?;
        sender.send(task).map_err(|_| self.shut_down_error())
    }

    fn post_delayed(&self, task: Task, delay: Duration) -> Result<()> {
        // Hold the lock so shutdown cannot race the spawn.
        let sender = self.sender.lock();
        if sender.is_none() {
            return Err(self.shut_down_error());
        }

        let name = self.name.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            run_task(&name, task);
        });
        Ok(())
    }
}

impl fmt::Debug for ThreadExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadExecutor")
            .field("name", &self.name)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Drop for ThreadExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The UI-affine and I/O-affine contexts used by a run.
#[derive(Debug, Clone)]
pub struct Executors {
    pub ui: Arc<ThreadExecutor>,
    pub io: Arc<ThreadExecutor>,
}

impl Executors {
    /// Spawns a "ui" and an "io" executor thread.
    ///
    /// # Errors
    ///
    /// Returns `Io` if either thread cannot be created.
    pub fn spawn() -> Result<Self> {
        Ok(Self {
            ui: ThreadExecutor::spawn("ui")?,
            io: ThreadExecutor::spawn("io")?,
        })
    }

    #[must_use]
    pub fn ui(&self) -> Arc<dyn AffineExecutor> {
        self.ui.clone()
    }

    #[must_use]
    pub fn io(&self) -> Arc<dyn AffineExecutor> {
        self.io.clone()
    }

    /// Shuts down both executors.
    pub fn shutdown(&self) {
        self.ui.shutdown();
        self.io.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn posted_tasks_run_in_order_on_the_executor() {
        let executor = ThreadExecutor::spawn("order").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let seen = Arc::clone(&seen);
            let probe = Arc::clone(&executor);
            executor
                .post(Box::new(move || {
                    assert!(probe.is_current());
                    seen.lock().push(i);
                }))
                .unwrap();
        }

        run_on(executor.as_ref(), || ()).unwrap();
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
        assert!(!executor.is_current());
        executor.shutdown();
    }

    #[test]
    fn delayed_task_waits_for_delay() {
        let executor = ThreadExecutor::spawn("delay").unwrap();
        let (tx, rx) = std_mpsc::channel();
        let start = Instant::now();

        executor
            .post_delayed(
                Box::new(move || tx.send(Instant::now()).unwrap()),
                Duration::from_millis(50),
            )
            .unwrap();

        let fired = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(fired.duration_since(start) >= Duration::from_millis(50));
        executor.shutdown();
    }

    #[test]
    fn post_after_shutdown_fails() {
        let executor = ThreadExecutor::spawn("closed").unwrap();
        executor.shutdown();
        assert!(executor.is_shut_down());
        assert!(matches!(
            executor.post(Box::new(|| {})),
            Err(HarnessError::ExecutorShutDown(name)) if name == "closed"
        ));
        assert!(executor
            .post_delayed(Box::new(|| {}), Duration::from_millis(1))
            .is_err());
    }

    #[test]
    fn pending_delayed_tasks_are_discarded_on_shutdown() {
        let executor = ThreadExecutor::spawn("discard").unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        executor
            .post_delayed(
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                Duration::from_secs(60),
            )
            .unwrap();

        executor.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_task_does_not_kill_the_executor() {
        let executor = ThreadExecutor::spawn("panic").unwrap();
        executor.post(Box::new(|| panic!("boom"))).unwrap();
        assert_eq!(run_on(executor.as_ref(), || 7).unwrap(), 7);
        executor.shutdown();
    }

    #[test]
    fn run_on_is_inline_when_current() {
        let executor = ThreadExecutor::spawn("inline").unwrap();
        let inner = Arc::clone(&executor);
        let nested = run_on(executor.as_ref(), move || {
            run_on(inner.as_ref(), || 42).unwrap()
        })
        .unwrap();
        assert_eq!(nested, 42);
        executor.shutdown();
    }
}
