//! Logging settings shared by every harness in the process.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSettings {
    /// Default filter directive when `RUST_LOG` is unset (e.g. "debug").
    #[serde(default)]
    pub level: Option<String>,

    /// Emit per-acknowledgment lifecycle traces.
    #[serde(default)]
    pub verbose_lifecycle: bool,
}
