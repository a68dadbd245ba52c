//! Layered configuration loading.
//!
//! Priority: environment variables > config file > defaults.

use std::path::Path;

use figment::{
    providers::{Env, Format as _, Serialized, Toml},
    Figment,
};
use tracing::debug;

use crate::config::HarnessConfig;
use crate::error::{ConfigError, Result};
use crate::validation::validate;

/// Prefix for environment overrides, e.g. `EMBED_HARNESS_USE_WINDOWING=true`.
pub const ENV_PREFIX: &str = "EMBED_HARNESS_";

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "embed-harness.toml";

impl HarnessConfig {
    /// Load configuration from defaults, an optional TOML file and the
    /// environment, then validate it.
    ///
    /// An explicit `config_path` must exist. Without one, `embed-harness.toml`
    /// in the current directory is used if present.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(HarnessConfig::default()));

        let config_file = match config_path {
            Some(path) if !path.exists() => {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            Some(path) => Some(path.to_path_buf()),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                default_path.exists().then(|| default_path.to_path_buf())
            }
        };

        if let Some(path) = config_file {
            debug!(path = %path.display(), "loading harness config file");
            figment = figment.merge(Toml::file(path));
        }

        // Nested keys use a double underscore: EMBED_HARNESS_LOG__LEVEL=debug
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: HarnessConfig = figment.extract()?;
        validate(&config)?;
        Ok(config)
    }

    /// Load configuration from the environment only.
    pub fn from_env() -> Result<Self> {
        let config: HarnessConfig = Figment::new()
            .merge(Serialized::defaults(HarnessConfig::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        validate(&config)?;
        Ok(config)
    }
}
