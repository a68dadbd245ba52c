//! Sanity checks applied after loading.

use crate::config::HarnessConfig;
use crate::error::{ConfigError, Result};

/// Validate a loaded configuration.
///
/// # Example
///
/// ```
/// use embed_harness_config::{validate, HarnessConfig};
///
/// validate(&HarnessConfig::default()).unwrap();
/// ```
pub fn validate(config: &HarnessConfig) -> Result<()> {
    if !config.timeout_multiplier.is_finite() || config.timeout_multiplier <= 0.0 {
        return Err(ConfigError::InvalidValue {
            field: "timeout_multiplier".to_string(),
            hint: format!(
                "expected a positive finite number, got {}",
                config.timeout_multiplier
            ),
        });
    }

    if let Some(level) = &config.log.level {
        if level.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "log.level".to_string(),
                hint: "remove the key or set a level such as \"info\"".to_string(),
            });
        }
    }

    Ok(())
}
