//! The seams between the harness and the embedded browser engine.
//!
//! The harness never creates browsers itself. It asks an [`Engine`] to do
//! so (outbound) and the engine reports lifecycle events back through an
//! [`InstanceClient`] (inbound), from whatever thread it happens to be on.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EngineError;
use crate::harness::Harness;
use crate::resources::ResourceResponse;
use crate::windowing::{ContainerDelegate, WindowDelegate};

/// Engine-assigned identifier of a browser instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub i32);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Engine-assigned identifier of a windowing container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub u64);

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "container-{}", self.0)
    }
}

/// Everything the engine needs to create one browser instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceRequest {
    /// Initial URL to load.
    pub url: String,

    /// Named request context (cookie/cache partition); `None` uses the global one.
    #[serde(default)]
    pub context: Option<String>,

    /// Extra values handed to the renderer side of the new instance.
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl InstanceRequest {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// A browser view created in windowing mode and not yet hosted in a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceView {
    /// Engine-side identity of the view.
    pub view: u64,
}

/// Inbound notifications from the engine.
///
/// Implementations must accept calls from any thread.
pub trait InstanceClient: Send + Sync {
    /// Core channel: an instance finished creation.
    fn instance_created(&self, id: InstanceId);

    /// Core channel: an instance is about to be destroyed.
    fn instance_closing(&self, id: InstanceId);

    /// Window channel: the container hosting `id` was created.
    fn container_created(&self, id: InstanceId);

    /// Window channel: the container hosting `id` was destroyed.
    fn container_destroyed(&self, id: InstanceId);

    /// Answers a resource request; `None` lets the engine fall back to the
    /// network. Called on the I/O executor.
    fn resolve_resource(&self, url: &str) -> Option<ResourceResponse>;

    /// The harness behind this client, if any. Used to pick popup delegates.
    fn as_harness(self: Arc<Self>) -> Option<Arc<Harness>> {
        None
    }
}

/// Outbound requests to the engine.
///
/// Only the core-channel operations are required. The windowing
/// operations default to `Unsupported` so engines without a view layer stay
/// small.
pub trait Engine: Send + Sync {
    /// Starts creating an instance whose lifecycle is reported to `client`.
    ///
    /// # Errors
    ///
    /// Returns `CreationFailed` if the engine rejects the request.
    fn create_instance(
        &self,
        request: &InstanceRequest,
        client: Arc<dyn InstanceClient>,
    ) -> Result<InstanceId, EngineError>;

    /// Asks an instance to close. `force` skips unload handlers.
    fn close_instance(&self, id: InstanceId, force: bool);

    /// Asks an instance whether it may close now, starting the close if so.
    fn try_close_instance(&self, id: InstanceId) -> bool {
        self.close_instance(id, false);
        true
    }

    /// Creates a browser view for windowing mode.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` unless the engine has a view layer.
    fn create_view(
        &self,
        request: &InstanceRequest,
        client: Arc<dyn InstanceClient>,
        delegate: Arc<dyn WindowDelegate>,
    ) -> Result<InstanceView, EngineError> {
        let _ = (request, client, delegate);
        Err(EngineError::Unsupported("views"))
    }

    /// Builds a top-level container hosting `view` and shows it.
    ///
    /// The engine reports the container's lifecycle to `delegate`.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` unless the engine has a view layer.
    fn build_container(
        &self,
        view: InstanceView,
        title: &str,
        delegate: Arc<ContainerDelegate>,
    ) -> Result<ContainerId, EngineError> {
        let _ = (view, title, delegate);
        Err(EngineError::Unsupported("containers"))
    }

    /// Closes a container built by [`build_container`](Self::build_container).
    fn close_container(&self, container: ContainerId) {
        let _ = container;
    }
}
