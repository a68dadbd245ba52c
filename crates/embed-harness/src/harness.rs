//! The per-test façade.
//!
//! A `Harness` owns the lifecycle tracker, a completion gate (its own, or
//! one shared with an [`InstanceGroup`](crate::group::InstanceGroup)), the
//! resource table, and a lazily created deferral helper for timeouts. The
//! engine talks to it through [`InstanceClient`] and the test body drives it
//! from the test thread.
//!
//! # Thread affinity
//!
//! All lifecycle state is mutated on the UI executor. Operations called
//! from any other thread re-post themselves there and return immediately.
//! The state lock is never held across an engine call or a gate signal, so
//! an engine that reports back synchronously cannot deadlock the harness.
//!
//! # Completion
//!
//! Signaling the gate may cause the test thread to drop its handle to the
//! harness, so the signal is always the last statement of the method that
//! issues it.

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};
use std::time::Duration;

use embed_harness_config::HarnessConfig;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::deferred::DeferredExecutor;
use crate::engine::{Engine, InstanceClient, InstanceId, InstanceRequest};
use crate::error::{HarnessError, Result};
use crate::event::ManualResetEvent;
use crate::executor::{AffineExecutor, Executors};
use crate::gate::CompletionGate;
use crate::resources::{HeaderMap, ResourceContent, ResourceResolver, ResourceResponse};
use crate::results::{TestFailure, TestResults};
use crate::tracker::{InstanceCounter, InstanceHandle, LifecycleTracker};
use crate::windowing::{self, HarnessViewDelegate, WindowDelegate};

/// Identity of one harness, used in logs and for popup delegate selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HarnessId(Uuid);

impl HarnessId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HarnessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HarnessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

/// The environment shared by every harness of a run.
///
/// Configuration is immutable; the counter and results are shared by `Arc`
/// so harnesses that run side by side observe the same totals.
#[derive(Clone)]
pub struct HarnessContext {
    pub config: Arc<HarnessConfig>,
    pub engine: Arc<dyn Engine>,
    pub ui: Arc<dyn AffineExecutor>,
    pub io: Arc<dyn AffineExecutor>,
    pub counter: Arc<InstanceCounter>,
    pub results: Arc<TestResults>,
}

impl HarnessContext {
    #[must_use]
    pub fn new(
        config: HarnessConfig,
        engine: Arc<dyn Engine>,
        ui: Arc<dyn AffineExecutor>,
        io: Arc<dyn AffineExecutor>,
    ) -> Self {
        let results = Arc::new(TestResults::from_config(&config));
        Self {
            config: Arc::new(config),
            engine,
            ui,
            io,
            counter: Arc::new(InstanceCounter::new()),
            results,
        }
    }

    /// Builds a context on top of spawned [`Executors`].
    #[must_use]
    pub fn with_executors(config: HarnessConfig, engine: Arc<dyn Engine>, executors: &Executors) -> Self {
        Self::new(config, engine, executors.ui(), executors.io())
    }

    #[must_use]
    pub fn with_results(mut self, results: Arc<TestResults>) -> Self {
        self.results = results;
        self
    }

    #[must_use]
    pub fn with_counter(mut self, counter: Arc<InstanceCounter>) -> Self {
        self.counter = counter;
        self
    }
}

impl fmt::Debug for HarnessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarnessContext")
            .field("config", &self.config)
            .field("ui", &self.ui.name())
            .field("io", &self.io.name())
            .field("created_instances", &self.counter.get())
            .finish_non_exhaustive()
    }
}

/// The test-specific part of a run.
///
/// `setup` runs first for every member of a group; the default signals
/// setup completion immediately. `run` starts the actual test, typically by
/// creating instances, and returns without waiting.
pub trait TestBody: Send + Sync {
    fn setup(&self, harness: &Arc<Harness>) {
        harness.setup_complete();
    }

    fn run(&self, harness: &Arc<Harness>);
}

impl<F> TestBody for F
where
    F: Fn(&Arc<Harness>) + Send + Sync,
{
    fn run(&self, harness: &Arc<Harness>) {
        self(harness);
    }
}

#[derive(Debug)]
struct HarnessState {
    tracker: LifecycleTracker,
    destroy_expected: bool,
    destroy_called: bool,
    signal_when_all_closed: bool,
    deferred: Option<DeferredExecutor>,
    destroy_event: Option<Arc<ManualResetEvent>>,
}

pub struct Harness {
    id: HarnessId,
    ctx: HarnessContext,
    gate: Arc<CompletionGate>,
    resources: ResourceResolver,
    // Shared by every deferral helper this harness creates.
    epoch: Arc<AtomicU64>,
    state: Mutex<HarnessState>,
    this: Weak<Harness>,
}

impl Harness {
    /// Creates a harness with its own single-completion gate.
    #[must_use]
    pub fn new(ctx: HarnessContext) -> Arc<Self> {
        let gate = Arc::new(CompletionGate::with_results(1, Arc::clone(&ctx.results)));
        Self::with_gate(ctx, gate)
    }

    /// Creates a harness that signals a gate shared with other harnesses.
    #[must_use]
    pub fn with_gate(ctx: HarnessContext, gate: Arc<CompletionGate>) -> Arc<Self> {
        let id = HarnessId::new();
        let tracker = LifecycleTracker::new(
            id,
            ctx.config.use_windowing,
            Arc::clone(&ctx.counter),
            Arc::clone(&ctx.results),
        )
        .verbose(ctx.config.log.verbose_lifecycle);
        let resources = ResourceResolver::new(Arc::clone(&ctx.io));

        debug!(harness = %id, windowing = ctx.config.use_windowing, "harness created");
        Arc::new_cyclic(|this| Self {
            id,
            ctx,
            gate,
            resources,
            epoch: Arc::new(AtomicU64::new(0)),
            state: Mutex::new(HarnessState {
                tracker,
                destroy_expected: true,
                destroy_called: false,
                signal_when_all_closed: true,
                deferred: None,
                destroy_event: None,
            }),
            this: this.clone(),
        })
    }

    #[must_use]
    pub fn id(&self) -> HarnessId {
        self.id
    }

    #[must_use]
    pub fn gate(&self) -> &Arc<CompletionGate> {
        &self.gate
    }

    #[must_use]
    pub fn context(&self) -> &HarnessContext {
        &self.ctx
    }

    #[must_use]
    pub fn results(&self) -> &Arc<TestResults> {
        &self.ctx.results
    }

    #[must_use]
    pub fn resources(&self) -> &ResourceResolver {
        &self.resources
    }

    /// Whether the test is expected to end through [`destroy_test`](Self::destroy_test).
    pub fn set_destroy_test_expected(&self, expected: bool) {
        self.state.lock().destroy_expected = expected;
    }

    /// Whether closing the last instance completes the test automatically.
    pub fn set_signal_completion_when_all_closed(&self, signal: bool) {
        self.state.lock().signal_when_all_closed = signal;
    }

    /// Signals `event` when the harness is dropped.
    pub fn set_destroy_event(&self, event: Arc<ManualResetEvent>) {
        self.state.lock().destroy_event = Some(event);
    }

    // ---- test driver entry points -------------------------------------

    /// Runs a single-harness test: starts `body` and blocks until the gate
    /// releases.
    ///
    /// # Errors
    ///
    /// Returns `SharedGate` when the harness signals a gate that expects
    /// more than one completion.
    pub fn execute(self: &Arc<Self>, body: &dyn TestBody) -> Result<()> {
        self.prepare_execute()?;
        body.run(self);
        self.gate.wait();
        Ok(())
    }

    /// Like [`execute`](Self::execute) but stops waiting after `timeout`.
    ///
    /// Returns whether the gate released in time.
    ///
    /// # Errors
    ///
    /// Returns `SharedGate` like `execute`.
    pub fn execute_timeout(self: &Arc<Self>, body: &dyn TestBody, timeout: Duration) -> Result<bool> {
        self.prepare_execute()?;
        body.run(self);
        Ok(self.gate.wait_timeout(timeout))
    }

    fn prepare_execute(&self) -> Result<()> {
        if self.gate.total() != 1 {
            return Err(HarnessError::SharedGate(self.gate.total()));
        }
        // Clear the latch and retired ids left by a previous run of the same
        // harness.
        let mut state = self.state.lock();
        state.destroy_called = false;
        state.tracker.begin_test();
        Ok(())
    }

    /// Signals that setup finished. Used by the first phase of a group run.
    pub fn setup_complete(&self) {
        self.gate.complete();
    }

    /// Signals that the test finished. Every instance must be closed by now.
    pub fn test_complete(&self) {
        if !self.ctx.ui.is_current() {
            self.post_to_ui("test_complete", |harness| harness.test_complete());
            return;
        }

        let remaining = self.state.lock().tracker.instance_count();
        if remaining > 0 {
            self.ctx.results.record(TestFailure::InstancesRemaining(remaining));
        }
        debug!(harness = %self.id, "test complete");
        self.gate.complete();
    }

    // ---- instance management ------------------------------------------

    /// Asks the engine for a new instance.
    ///
    /// In windowing mode this builds a view and a container around it, which
    /// must happen on the UI executor; calls from elsewhere are redirected
    /// and any engine error is only logged.
    ///
    /// # Errors
    ///
    /// Returns `Engine` when the engine rejects the request inline.
    pub fn create_instance(&self, request: InstanceRequest) -> Result<()> {
        let windowing = self.ctx.config.use_windowing;
        if windowing && !self.ctx.ui.is_current() {
            self.post_to_ui("create_instance", move |harness| {
                if let Err(err) = harness.create_instance(request) {
                    error!(harness = %harness.id, error = %err, "instance creation failed");
                }
            });
            return Ok(());
        }

        let Some(this) = self.this.upgrade() else {
            return Ok(());
        };
        debug!(harness = %self.id, url = %request.url, windowing, "creating instance");

        if windowing {
            let delegate: Arc<dyn WindowDelegate> = HarnessViewDelegate::new(&this);
            let view = self.ctx.engine.create_view(&request, this.clone(), delegate)?;
            windowing::open_container(&this, view, "")?;
        } else {
            let id = self.ctx.engine.create_instance(&request, this)?;
            debug!(harness = %self.id, instance = %id, "instance requested");
        }
        Ok(())
    }

    /// Asks the engine to close one instance.
    pub fn close_instance(&self, id: InstanceId, force: bool) {
        debug!(harness = %self.id, instance = %id, force, "closing instance");
        self.ctx.engine.close_instance(id, force);
    }

    /// Closes every live instance and tears down pending timeouts.
    ///
    /// Only the first call has an effect; later calls return immediately.
    pub fn destroy_test(&self) {
        if !self.ctx.ui.is_current() {
            self.post_to_ui("destroy_test", |harness| harness.destroy_test());
            return;
        }

        let (instances, deferred) = {
            let mut state = self.state.lock();
            if !state.destroy_expected {
                self.ctx.results.record(TestFailure::DestroyNotExpected);
            }
            if state.destroy_called {
                return;
            }
            state.destroy_called = true;
            (state.tracker.snapshot(), state.deferred.take())
        };

        debug!(harness = %self.id, instances = instances.len(), "destroying test");
        // Closing may re-enter the harness, hence the snapshot.
        for handle in instances {
            self.close_instance(handle.id, false);
        }
        if let Some(deferred) = deferred {
            deferred.teardown();
        }
    }

    /// Arms a timeout that ends the test after `timeout`.
    ///
    /// The configured override may disable or rescale the nominal value. A
    /// disabled override suppresses non-error timeouts only; error timeouts
    /// keep their (scaled) nominal duration. Nothing is armed once the test
    /// has been destroyed.
    pub fn set_test_timeout(&self, timeout: Duration, treat_as_error: bool) {
        if !self.ctx.ui.is_current() {
            self.post_to_ui("set_test_timeout", move |harness| {
                harness.set_test_timeout(timeout, treat_as_error);
            });
            return;
        }

        let mut state = self.state.lock();
        if state.destroy_called {
            return;
        }

        let config = &self.ctx.config;
        let timeout = match config.configured_timeout(timeout) {
            Some(timeout) => timeout,
            None if treat_as_error => config.scale(timeout),
            None => {
                debug!(harness = %self.id, "test timeouts disabled by configuration");
                return;
            }
        };

        let this = self.this.clone();
        let task = move || {
            if let Some(harness) = this.upgrade() {
                harness.on_timeout(timeout, treat_as_error);
            }
        };
        let Some(helper) = self.deferred_helper(&mut state) else {
            return;
        };
        if let Err(err) = helper.post_delayed_task(task, timeout) {
            warn!(harness = %self.id, error = %err, "could not arm test timeout");
        }
    }

    /// Handles an expired test timeout. Runs on the UI executor.
    pub fn on_timeout(&self, timeout: Duration, treat_as_error: bool) {
        self.expect_ui("on_timeout");
        if treat_as_error {
            self.ctx.results.record(TestFailure::TimedOut(timeout));
        } else {
            info!(harness = %self.id, timeout_ms = timeout.as_millis(), "test timed out");
        }
        self.destroy_test();
    }

    /// Posts `task` to the UI executor through the harness' deferral helper.
    /// The task is dropped if the test is destroyed first.
    ///
    /// # Errors
    ///
    /// `OffExecutor` when not called on the UI executor, `TornDown` after
    /// `destroy_test`.
    pub fn post_deferred<F>(&self, task: F, delay: Option<Duration>) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.ctx.ui.is_current() {
            return Err(HarnessError::OffExecutor {
                operation: "post_deferred",
                executor: self.ctx.ui.name().to_string(),
            });
        }

        let mut state = self.state.lock();
        let helper = self.deferred_helper(&mut state).ok_or(HarnessError::TornDown)?;
        match delay {
            Some(delay) => helper.post_delayed_task(task, delay),
            None => helper.post_task(task),
        }
    }

    fn deferred_helper<'a>(&self, state: &'a mut HarnessState) -> Option<&'a DeferredExecutor> {
        if state.destroy_called {
            self.ctx.results.record(TestFailure::HelperAfterDestroy);
            return None;
        }
        let ui = Arc::clone(&self.ctx.ui);
        let epoch = Arc::clone(&self.epoch);
        Some(state.deferred.get_or_insert_with(|| DeferredExecutor::new(ui, epoch)))
    }

    // ---- queries --------------------------------------------------------

    /// The instance created first while none was live.
    #[must_use]
    pub fn first_instance_id(&self) -> Option<InstanceId> {
        self.state.lock().tracker.first_instance()
    }

    /// Snapshot of every live instance. Expected on the UI executor.
    #[must_use]
    pub fn all_instances(&self) -> Vec<InstanceHandle> {
        self.expect_ui("all_instances");
        self.state.lock().tracker.snapshot()
    }

    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.state.lock().tracker.instance_count()
    }

    #[must_use]
    pub fn container_count(&self) -> usize {
        self.state.lock().tracker.container_count()
    }

    #[must_use]
    pub fn is_destroy_called(&self) -> bool {
        self.state.lock().destroy_called
    }

    /// Whether a recorded failure fails the current test (or the run, per
    /// the configured scope).
    #[must_use]
    pub fn test_failed(&self) -> bool {
        self.ctx.results.failed()
    }

    // ---- resources ------------------------------------------------------

    /// Serves `body` for `url` (query ignored) to instances of this harness.
    pub fn add_resource(&self, url: &str, body: impl Into<Vec<u8>>, mime_type: &str, headers: HeaderMap) {
        self.resources.add_resource(url, body, mime_type, headers);
    }

    pub fn add_resource_content(&self, url: &str, content: ResourceContent) {
        self.resources.add(url, content);
    }

    pub fn clear_resources(&self) {
        self.resources.clear();
    }

    // ---- engine notifications -------------------------------------------

    /// The renderer hosting `id` went away.
    pub fn on_render_process_terminated(&self, id: InstanceId, status: &str) {
        warn!(harness = %self.id, instance = %id, %status, "render process terminated");
    }

    fn after_close(&self, test_complete: bool) {
        let signal = test_complete && self.state.lock().signal_when_all_closed;
        if signal {
            self.test_complete();
        }
    }

    // ---- helpers --------------------------------------------------------

    fn post_to_ui(&self, operation: &'static str, f: impl FnOnce(Arc<Harness>) + Send + 'static) {
        let Some(this) = self.this.upgrade() else {
            warn!(harness = %self.id, operation, "harness dropped before redirect");
            return;
        };
        if let Err(err) = self.ctx.ui.post(Box::new(move || f(this))) {
            warn!(harness = %self.id, operation, error = %err, "could not redirect to ui executor");
        }
    }

    fn expect_ui(&self, operation: &'static str) {
        if !self.ctx.ui.is_current() {
            self.ctx.results.record(TestFailure::WrongExecutor {
                operation,
                executor: self.ctx.ui.name().to_string(),
            });
        }
    }
}

impl InstanceClient for Harness {
    fn instance_created(&self, id: InstanceId) {
        if !self.ctx.ui.is_current() {
            self.post_to_ui("instance_created", move |harness| harness.instance_created(id));
            return;
        }
        self.state.lock().tracker.instance_created(id);
    }

    fn instance_closing(&self, id: InstanceId) {
        if !self.ctx.ui.is_current() {
            self.post_to_ui("instance_closing", move |harness| harness.instance_closing(id));
            return;
        }
        let outcome = self.state.lock().tracker.instance_closing(id);
        self.after_close(outcome.test_complete);
    }

    fn container_created(&self, id: InstanceId) {
        if !self.ctx.ui.is_current() {
            self.post_to_ui("container_created", move |harness| harness.container_created(id));
            return;
        }
        self.state.lock().tracker.container_created(id);
    }

    fn container_destroyed(&self, id: InstanceId) {
        if !self.ctx.ui.is_current() {
            self.post_to_ui("container_destroyed", move |harness| {
                harness.container_destroyed(id);
            });
            return;
        }
        let outcome = self.state.lock().tracker.container_destroyed(id);
        self.after_close(outcome.test_complete);
    }

    fn as_harness(self: Arc<Self>) -> Option<Arc<Harness>> {
        Some(self)
    }

    fn resolve_resource(&self, url: &str) -> Option<ResourceResponse> {
        if !self.ctx.io.is_current() {
            self.ctx.results.record(TestFailure::WrongExecutor {
                operation: "resolve_resource",
                executor: self.ctx.io.name().to_string(),
            });
        }
        self.resources.resolve(url)
    }
}

impl fmt::Debug for Harness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Harness")
            .field("id", &self.id)
            .field("gate_total", &self.gate.total())
            .finish_non_exhaustive()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let results = &self.ctx.results;

        if state.deferred.take().is_some() {
            results.record(TestFailure::HelperNotTornDown);
        }
        if state.destroy_expected != state.destroy_called {
            results.record(TestFailure::DestroyExpectationMismatch {
                expected: state.destroy_expected,
                called: state.destroy_called,
            });
        }

        let instances = state.tracker.instance_count();
        if instances > 0 {
            results.record(TestFailure::InstancesRemaining(instances));
        }
        let containers = state.tracker.container_count();
        if containers > 0 {
            results.record(TestFailure::ContainersRemaining(containers));
        }
        let records = state.tracker.open_records();
        if records > 0 {
            results.record(TestFailure::RecordsRemaining(records));
        }

        debug!(harness = %self.id, "harness dropped");
        if let Some(event) = state.destroy_event.take() {
            event.signal();
        }
    }
}
