//! The process-wide harness configuration.
//!
//! A `HarnessConfig` is read once at startup (see the `loading` module) and is
//! immutable afterwards. Harnesses receive it by `Arc` at construction instead
//! of consulting a global.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::settings::LogSettings;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Host every instance in a windowing container. Enables the second
    /// (window) acknowledgment channel.
    #[serde(default)]
    pub use_windowing: bool,

    /// Overrides the timeout passed by individual tests.
    ///
    /// `None` keeps the caller's value, `Some(0)` disables non-error timeouts.
    #[serde(default)]
    pub test_timeout_ms: Option<u64>,

    /// Scales every effective timeout (slow CI machines, sanitizers).
    #[serde(default = "default_timeout_multiplier")]
    pub timeout_multiplier: f64,

    /// All tests share one process, so "did this test fail" only looks at
    /// the current test instead of the whole run.
    #[serde(default)]
    pub single_process: bool,

    #[serde(default)]
    pub log: LogSettings,
}

fn default_timeout_multiplier() -> f64 {
    1.0
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            use_windowing: false,
            test_timeout_ms: None,
            timeout_multiplier: default_timeout_multiplier(),
            single_process: false,
            log: LogSettings::default(),
        }
    }
}

impl HarnessConfig {
    /// Single-channel configuration with defaults.
    #[must_use]
    pub fn single_channel() -> Self {
        Self::default()
    }

    /// Dual-channel (windowing) configuration with defaults.
    #[must_use]
    pub fn windowing() -> Self {
        Self {
            use_windowing: true,
            ..Self::default()
        }
    }

    /// Returns true when a configured override disables timeouts.
    #[must_use]
    pub fn timeouts_disabled(&self) -> bool {
        self.test_timeout_ms == Some(0)
    }

    /// Resolves the timeout a test asked for against the configured override.
    ///
    /// Returns `None` when timeouts are disabled. Otherwise the override (or
    /// `nominal` when there is none) is scaled by `timeout_multiplier`.
    #[must_use]
    pub fn configured_timeout(&self, nominal: Duration) -> Option<Duration> {
        if self.timeouts_disabled() {
            return None;
        }

        let base = self
            .test_timeout_ms
            .map_or(nominal, Duration::from_millis);
        Some(self.scale(base))
    }

    /// Applies `timeout_multiplier` to a duration, saturating at
    /// `Duration::MAX` when the product does not fit.
    #[must_use]
    pub fn scale(&self, timeout: Duration) -> Duration {
        if (self.timeout_multiplier - 1.0).abs() < f64::EPSILON {
            return timeout;
        }
        Duration::try_from_secs_f64(timeout.as_secs_f64() * self.timeout_multiplier)
            .unwrap_or(Duration::MAX)
    }
}
