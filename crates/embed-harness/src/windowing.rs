//! Glue for engines with a view layer.
//!
//! In windowing mode every instance lives in a view hosted by a top-level
//! container. The container reports its own lifecycle on the window channel,
//! independently of the instance's core channel, so the harness only sees an
//! instance as created (or closed) once both have reported.
//!
//! Delegates hold the harness weakly: the engine may keep them around after
//! the test is over, and they must not keep a finished harness alive.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::engine::{ContainerId, Engine, InstanceClient, InstanceId, InstanceView};
use crate::error::Result;
use crate::harness::{Harness, HarnessId};

/// Prefix of every container title.
pub const TITLE_PREFIX: &str = "EmbedHarness";

/// Title of a container opened for a popup.
pub const POPUP_TITLE: &str = "Popup";

/// Title of a container opened for developer tools.
pub const DEVTOOLS_TITLE: &str = "DevTools";

/// Builds the full title of a container.
#[must_use]
pub fn container_title(title: &str) -> String {
    if title.is_empty() {
        TITLE_PREFIX.to_string()
    } else {
        format!("{TITLE_PREFIX} {title}")
    }
}

/// View-level callbacks from the engine.
pub trait WindowDelegate: Send + Sync {
    /// The instance shown in a view was destroyed. `container` is the
    /// container hosting the view, if it still exists.
    fn on_instance_destroyed(&self, id: InstanceId, container: Option<ContainerId>);

    /// Picks the delegate for a popup opened from a view of this delegate.
    /// `client` is the client the popup reports to.
    fn delegate_for_popup(
        self: Arc<Self>,
        client: Arc<dyn InstanceClient>,
        devtools: bool,
    ) -> Arc<dyn WindowDelegate>;

    /// A popup view was created. Returns whether the delegate hosted it.
    fn on_popup_created(&self, popup: InstanceView, client: Arc<dyn InstanceClient>, devtools: bool) -> bool;

    /// The harness this delegate reports to, if any.
    fn harness_id(&self) -> Option<HarnessId> {
        None
    }
}

/// The [`WindowDelegate`] of one harness.
pub struct HarnessViewDelegate {
    id: HarnessId,
    harness: Weak<Harness>,
    engine: Arc<dyn Engine>,
}

impl HarnessViewDelegate {
    #[must_use]
    pub fn new(harness: &Arc<Harness>) -> Arc<Self> {
        Arc::new(Self {
            id: harness.id(),
            harness: Arc::downgrade(harness),
            engine: Arc::clone(&harness.context().engine),
        })
    }
}

impl fmt::Debug for HarnessViewDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarnessViewDelegate").field("id", &self.id).finish_non_exhaustive()
    }
}

impl WindowDelegate for HarnessViewDelegate {
    fn on_instance_destroyed(&self, id: InstanceId, container: Option<ContainerId>) {
        // The container always goes away with its instance.
        if let Some(container) = container {
            debug!(harness = %self.id, instance = %id, %container, "closing container");
            self.engine.close_container(container);
        }
    }

    fn delegate_for_popup(
        self: Arc<Self>,
        client: Arc<dyn InstanceClient>,
        _devtools: bool,
    ) -> Arc<dyn WindowDelegate> {
        match client.as_harness() {
            Some(owner) if owner.id() != self.id => HarnessViewDelegate::new(&owner),
            _ => self,
        }
    }

    fn on_popup_created(&self, popup: InstanceView, client: Arc<dyn InstanceClient>, devtools: bool) -> bool {
        // The popup may belong to another harness than the opener.
        let Some(owner) = client.as_harness().or_else(|| self.harness.upgrade()) else {
            return false;
        };
        let title = if devtools { DEVTOOLS_TITLE } else { POPUP_TITLE };
        match open_container(&owner, popup, title) {
            Ok(_) => true,
            Err(err) => {
                warn!(harness = %owner.id(), error = %err, "could not host popup");
                false
            }
        }
    }

    fn harness_id(&self) -> Option<HarnessId> {
        Some(self.id)
    }
}

/// Container-level callbacks from the engine.
///
/// The engine reports the id of the hosted instance once the container
/// exists; later callbacks refer to that instance.
pub struct ContainerDelegate {
    harness: Weak<Harness>,
    engine: Arc<dyn Engine>,
    view: InstanceView,
    title: String,
    instance: Mutex<Option<InstanceId>>,
}

impl ContainerDelegate {
    #[must_use]
    pub fn new(harness: &Arc<Harness>, view: InstanceView, title: impl Into<String>) -> Self {
        Self {
            harness: Arc::downgrade(harness),
            engine: Arc::clone(&harness.context().engine),
            view,
            title: title.into(),
            instance: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn view(&self) -> InstanceView {
        self.view
    }

    #[must_use]
    pub fn instance(&self) -> Option<InstanceId> {
        *self.instance.lock()
    }

    /// The container is shown and hosts `instance`.
    pub fn on_container_created(&self, instance: InstanceId) {
        *self.instance.lock() = Some(instance);
        match self.harness.upgrade() {
            Some(harness) => harness.container_created(instance),
            None => warn!(instance = %instance, "container created after its harness"),
        }
    }

    /// The container is gone. Every notification is forwarded, so a repeat
    /// reaches the tracker as a duplicate close.
    pub fn on_container_destroyed(&self) {
        let Some(instance) = self.instance() else {
            warn!(title = %self.title, "container destroyed before it was created");
            return;
        };
        match self.harness.upgrade() {
            Some(harness) => harness.container_destroyed(instance),
            None => warn!(instance = %instance, "container destroyed after its harness"),
        }
    }

    /// Whether the container may close now. Defers to the hosted instance.
    #[must_use]
    pub fn can_close(&self) -> bool {
        match self.instance() {
            Some(instance) => self.engine.try_close_instance(instance),
            None => true,
        }
    }
}

impl fmt::Debug for ContainerDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerDelegate")
            .field("view", &self.view)
            .field("title", &self.title)
            .field("instance", &self.instance())
            .finish_non_exhaustive()
    }
}

/// Builds and shows a container hosting `view` for `harness`.
pub(crate) fn open_container(harness: &Arc<Harness>, view: InstanceView, title: &str) -> Result<ContainerId> {
    let title = container_title(title);
    let delegate = Arc::new(ContainerDelegate::new(harness, view, title.clone()));
    let container = harness.context().engine.build_container(view, &title, delegate)?;
    debug!(harness = %harness.id(), %container, %title, "container opened");
    Ok(container)
}
