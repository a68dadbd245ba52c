//! In-memory resources served to instances under test.
//!
//! Tests register content for URLs up front; the engine asks for it on its
//! I/O executor while handling requests. The map is only touched on that
//! executor. Calls from elsewhere are redirected there: mutation is
//! fire-and-forget, lookups block the caller until the I/O executor answers.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::executor::{run_on, AffineExecutor};

/// Response headers in insertion order.
pub type HeaderMap = IndexMap<String, String>;

/// Content registered for one normalized URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceContent {
    pub body: Vec<u8>,
    pub mime_type: String,
    pub headers: HeaderMap,
}

impl ResourceContent {
    #[must_use]
    pub fn new(body: impl Into<Vec<u8>>, mime_type: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            mime_type: mime_type.into(),
            headers: HeaderMap::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// What the engine serves for a resolved request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceResponse {
    pub status: u16,
    pub status_text: &'static str,
    pub mime_type: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl From<ResourceContent> for ResourceResponse {
    fn from(content: ResourceContent) -> Self {
        Self {
            status: 200,
            status_text: "OK",
            mime_type: content.mime_type,
            headers: content.headers,
            body: content.body,
        }
    }
}

/// Strips the query component. A `?` in the first position is kept, which
/// leaves such URLs untouched.
#[must_use]
pub fn normalize_url(url: &str) -> &str {
    match url.find('?') {
        Some(index) if index > 0 => &url[..index],
        _ => url,
    }
}

/// URL → content table bound to the I/O executor.
#[derive(Clone)]
pub struct ResourceResolver {
    io: Arc<dyn AffineExecutor>,
    // Only locked on the I/O executor, so never contended.
    map: Arc<Mutex<HashMap<String, ResourceContent>>>,
}

impl ResourceResolver {
    #[must_use]
    pub fn new(io: Arc<dyn AffineExecutor>) -> Self {
        Self {
            io,
            map: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers `content` for `url` (query ignored). Later registrations for
    /// the same normalized URL keep the first entry.
    pub fn add(&self, url: &str, content: ResourceContent) {
        let key = normalize_url(url).to_string();
        let map = Arc::clone(&self.map);
        self.on_io("add_resource", move || {
            trace!(url = %key, "resource registered");
            map.lock().entry(key).or_insert(content);
        });
    }

    /// Convenience for [`add`](Self::add).
    pub fn add_resource(&self, url: &str, body: impl Into<Vec<u8>>, mime_type: &str, headers: HeaderMap) {
        self.add(
            url,
            ResourceContent {
                body: body.into(),
                mime_type: mime_type.to_string(),
                headers,
            },
        );
    }

    /// Removes every registered resource.
    pub fn clear(&self) {
        let map = Arc::clone(&self.map);
        self.on_io("clear_resources", move || map.lock().clear());
    }

    /// Looks up the content registered for `url` (query ignored).
    ///
    /// A miss is not an error; the engine treats it as "no handler".
    #[must_use]
    pub fn lookup(&self, url: &str) -> Option<ResourceContent> {
        let key = normalize_url(url).to_string();
        let map = Arc::clone(&self.map);
        let lookup = move || map.lock().get(&key).cloned();

        match run_on(self.io.as_ref(), lookup) {
            Ok(found) => found,
            Err(err) => {
                warn!(%url, error = %err, "resource lookup could not reach the io executor");
                None
            }
        }
    }

    /// Builds the response the engine serves for `url`, if registered.
    #[must_use]
    pub fn resolve(&self, url: &str) -> Option<ResourceResponse> {
        self.lookup(url).map(ResourceResponse::from)
    }

    fn on_io(&self, operation: &'static str, f: impl FnOnce() + Send + 'static) {
        if self.io.is_current() {
            f();
            return;
        }
        if let Err(err) = self.io.post(Box::new(f)) {
            warn!(operation, error = %err, "dropping resource update");
        }
    }
}
