//! Shared fixtures for the integration tests.
//!
//! `ScriptedEngine` behaves like a well-mannered engine: it reports every
//! lifecycle event asynchronously on the UI executor, in the order a real
//! engine would, and drops its reference to a client once the instance is
//! gone.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use embed_harness::{
    AffineExecutor, ContainerDelegate, ContainerId, Engine, EngineError, Executors, Harness,
    HarnessConfig, HarnessContext, InstanceClient, InstanceId, InstanceRequest, InstanceView,
    ManualResetEvent, WindowDelegate,
};
use parking_lot::Mutex;

pub const WAIT: Duration = Duration::from_secs(10);

type Hook = Box<dyn Fn(InstanceId) + Send + Sync>;

struct View {
    id: InstanceId,
    client: Arc<dyn InstanceClient>,
    delegate: Arc<dyn WindowDelegate>,
    container: Option<ContainerId>,
}

struct Container {
    instance: InstanceId,
    delegate: Arc<ContainerDelegate>,
}

#[derive(Default)]
struct EngineState {
    clients: HashMap<InstanceId, Arc<dyn InstanceClient>>,
    views: HashMap<u64, View>,
    containers: HashMap<ContainerId, Container>,
    events: Vec<String>,
    titles: Vec<String>,
}

pub struct ScriptedEngine {
    ui: Arc<dyn AffineExecutor>,
    next_id: AtomicI32,
    next_container: AtomicU64,
    // Report the window-channel creation before the core channel.
    window_first: bool,
    // Instances answer "not now" when asked whether they may close.
    refuse_close: AtomicBool,
    state: Mutex<EngineState>,
    on_created: Mutex<Option<Hook>>,
}

impl ScriptedEngine {
    pub fn new(ui: Arc<dyn AffineExecutor>, first_id: i32) -> Arc<Self> {
        Self::build(ui, first_id, false)
    }

    pub fn window_first(ui: Arc<dyn AffineExecutor>, first_id: i32) -> Arc<Self> {
        Self::build(ui, first_id, true)
    }

    fn build(ui: Arc<dyn AffineExecutor>, first_id: i32, window_first: bool) -> Arc<Self> {
        Arc::new(Self {
            ui,
            next_id: AtomicI32::new(first_id),
            next_container: AtomicU64::new(1),
            window_first,
            refuse_close: AtomicBool::new(false),
            state: Mutex::new(EngineState::default()),
            on_created: Mutex::new(None),
        })
    }

    /// Runs `hook` on the UI executor once an instance reported creation on
    /// every channel.
    pub fn on_created(&self, hook: impl Fn(InstanceId) + Send + Sync + 'static) {
        *self.on_created.lock() = Some(Box::new(hook));
    }

    /// Lifecycle events in the order they were delivered.
    pub fn events(&self) -> Vec<String> {
        self.state.lock().events.clone()
    }

    pub fn titles(&self) -> Vec<String> {
        self.state.lock().titles.clone()
    }

    pub fn live_clients(&self) -> usize {
        self.state.lock().clients.len()
    }

    pub fn refuse_close(&self, refuse: bool) {
        self.refuse_close.store(refuse, Ordering::SeqCst);
    }

    /// The delegate of the container hosting `instance`, while it is open.
    pub fn container_delegate(&self, instance: InstanceId) -> Option<Arc<ContainerDelegate>> {
        self.state
            .lock()
            .containers
            .values()
            .find(|container| container.instance == instance)
            .map(|container| Arc::clone(&container.delegate))
    }

    fn log(&self, event: String) {
        self.state.lock().events.push(event);
    }

    fn post(self: &Arc<Self>, f: impl FnOnce(&Arc<Self>) + Send + 'static) {
        let engine = Arc::clone(self);
        self.ui
            .post(Box::new(move || f(&engine)))
            .expect("ui executor is running");
    }

    fn created(&self, id: InstanceId) {
        if let Some(hook) = self.on_created.lock().as_ref() {
            hook(id);
        }
    }

    fn deliver_core_created(&self, id: InstanceId, client: &Arc<dyn InstanceClient>) {
        self.log(format!("core created {id}"));
        client.instance_created(id);
    }

    fn deliver_window_created(&self, id: InstanceId, delegate: &Arc<ContainerDelegate>) {
        self.log(format!("window created {id}"));
        delegate.on_container_created(id);
    }
}

/// `Engine` is implemented on a thin handle so callbacks can re-post
/// through an owned `Arc`.
pub struct EngineHandle(pub Arc<ScriptedEngine>);

impl EngineHandle {
    fn engine(&self) -> &Arc<ScriptedEngine> {
        &self.0
    }
}

impl Engine for EngineHandle {
    fn create_instance(
        &self,
        request: &InstanceRequest,
        client: Arc<dyn InstanceClient>,
    ) -> Result<InstanceId, EngineError> {
        if request.url.is_empty() {
            return Err(EngineError::CreationFailed {
                url: String::new(),
                reason: "empty url".to_string(),
            });
        }
        let engine = self.engine();
        let id = InstanceId(engine.next_id.fetch_add(1, Ordering::SeqCst));
        engine.state.lock().clients.insert(id, Arc::clone(&client));

        engine.post(move |engine| {
            engine.deliver_core_created(id, &client);
            engine.created(id);
        });
        Ok(id)
    }

    fn close_instance(&self, id: InstanceId, _force: bool) {
        let engine = self.engine();
        engine.post(move |engine| {
            let (client, view) = {
                let mut state = engine.state.lock();
                let client = state.clients.remove(&id);
                let view = state
                    .views
                    .iter()
                    .find(|(_, view)| view.id == id)
                    .map(|(key, _)| *key);
                let view = view.and_then(|key| state.views.remove(&key));
                (client, view)
            };
            let Some(client) = client else {
                return;
            };
            engine.log(format!("core closing {id}"));
            client.instance_closing(id);
            if let Some(view) = view {
                view.delegate.on_instance_destroyed(id, view.container);
            }
        });
    }

    fn try_close_instance(&self, id: InstanceId) -> bool {
        let refused = self.engine().refuse_close.load(Ordering::SeqCst);
        self.engine().log(format!("try close {id} refused={refused}"));
        if refused {
            return false;
        }
        self.close_instance(id, false);
        true
    }

    fn create_view(
        &self,
        _request: &InstanceRequest,
        client: Arc<dyn InstanceClient>,
        delegate: Arc<dyn WindowDelegate>,
    ) -> Result<InstanceView, EngineError> {
        let engine = self.engine();
        let id = InstanceId(engine.next_id.fetch_add(1, Ordering::SeqCst));
        let view = InstanceView { view: id.0 as u64 };
        engine.state.lock().views.insert(
            view.view,
            View {
                id,
                client,
                delegate,
                container: None,
            },
        );
        Ok(view)
    }

    fn build_container(
        &self,
        view: InstanceView,
        title: &str,
        delegate: Arc<ContainerDelegate>,
    ) -> Result<ContainerId, EngineError> {
        let engine = self.engine();
        let container = ContainerId(engine.next_container.fetch_add(1, Ordering::SeqCst));
        let (id, client) = {
            let mut state = engine.state.lock();
            let Some(entry) = state.views.get_mut(&view.view) else {
                return Err(EngineError::Unsupported("unknown view"));
            };
            entry.container = Some(container);
            let (id, client) = (entry.id, Arc::clone(&entry.client));
            state.clients.insert(id, Arc::clone(&client));
            state.containers.insert(
                container,
                Container {
                    instance: id,
                    delegate: Arc::clone(&delegate),
                },
            );
            state.titles.push(title.to_string());
            (id, client)
        };

        engine.post(move |engine| {
            if engine.window_first {
                engine.deliver_window_created(id, &delegate);
                engine.deliver_core_created(id, &client);
            } else {
                engine.deliver_core_created(id, &client);
                engine.deliver_window_created(id, &delegate);
            }
            engine.created(id);
        });
        Ok(container)
    }

    fn close_container(&self, container: ContainerId) {
        let engine = self.engine();
        engine.post(move |engine| {
            let Some(entry) = engine.state.lock().containers.remove(&container) else {
                return;
            };
            engine.log(format!("window destroyed {}", entry.instance));
            entry.delegate.on_container_destroyed();
        });
    }
}

/// Executors, a scripted engine and a context wired together.
pub struct Fixture {
    pub executors: Executors,
    pub engine: Arc<ScriptedEngine>,
    pub ctx: HarnessContext,
}

impl Fixture {
    pub fn new(config: HarnessConfig) -> Self {
        Self::with_first_id(config, 1)
    }

    pub fn with_first_id(config: HarnessConfig, first_id: i32) -> Self {
        let executors = Executors::spawn().expect("spawn executors");
        let engine = ScriptedEngine::new(executors.ui(), first_id);
        Self::assemble(config, executors, engine)
    }

    pub fn window_first(config: HarnessConfig) -> Self {
        let executors = Executors::spawn().expect("spawn executors");
        let engine = ScriptedEngine::window_first(executors.ui(), 1);
        Self::assemble(config, executors, engine)
    }

    fn assemble(config: HarnessConfig, executors: Executors, engine: Arc<ScriptedEngine>) -> Self {
        let handle: Arc<dyn Engine> = Arc::new(EngineHandle(Arc::clone(&engine)));
        let ctx = HarnessContext::with_executors(config, handle, &executors);
        Self {
            executors,
            engine,
            ctx,
        }
    }

    pub fn harness(&self) -> Arc<Harness> {
        Harness::new(self.ctx.clone())
    }

    /// Destroys the test as soon as the first instance is fully created.
    pub fn destroy_when_created(&self, harness: &Arc<Harness>) {
        let weak: Weak<Harness> = Arc::downgrade(harness);
        self.engine.on_created(move |_| {
            if let Some(harness) = weak.upgrade() {
                harness.destroy_test();
            }
        });
    }

    /// Drops `harness` and waits until its destructor checks have run.
    pub fn drop_harness(&self, harness: Arc<Harness>) {
        let destroyed = Arc::new(ManualResetEvent::new());
        harness.set_destroy_event(Arc::clone(&destroyed));
        drop(harness);
        assert!(destroyed.wait_timeout(WAIT), "harness was never dropped");
    }

    /// Blocks until everything already posted to the UI executor ran.
    pub fn flush_ui(&self) {
        embed_harness::run_on(self.executors.ui.as_ref(), || ()).expect("ui executor is running");
    }

    /// Flushes the UI executor until `done` holds. Engine callbacks post
    /// follow-up work, so one flush is not always enough.
    pub fn flush_until(&self, done: impl Fn() -> bool) {
        for _ in 0..100 {
            self.flush_ui();
            if done() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached after flushing the ui executor");
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.executors.shutdown();
    }
}
