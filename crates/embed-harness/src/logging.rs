//! Logging setup for test binaries.
//!
//! The harness only emits `tracing` events. Test binaries that want to see
//! them install a subscriber with one of these helpers; `RUST_LOG` always
//! wins over the level passed in.

use std::sync::Once;

use embed_harness_config::{ConfigError, HarnessConfig};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Default verbosity of harness output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Silent,
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    /// Includes every lifecycle acknowledgment.
    Trace,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Silent => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    fn level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Silent => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }

    /// Level requested by `config`, falling back to the default.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` for an unknown level name.
    pub fn from_config(config: &HarnessConfig) -> Result<Self, ConfigError> {
        match config.log.level.as_deref() {
            None => Ok(Self::default()),
            Some(level) => level.parse().map_err(|hint| ConfigError::InvalidValue {
                field: "log.level".to_string(),
                hint,
            }),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "silent" | "off" => Ok(LogLevel::Silent),
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_filter())
    }
}

/// Installs a compact subscriber at `level`.
///
/// Only the first call in a process has an effect. Output goes through the
/// test writer so `cargo test` captures it per test.
///
/// ```rust,no_run
/// use embed_harness::logging::{init_logging, LogLevel};
///
/// init_logging(LogLevel::Debug);
/// ```
pub fn init_logging(level: LogLevel) {
    INIT.call_once(|| {
        let filter = EnvFilter::builder()
            .with_default_directive(level.level_filter().into())
            .from_env_lossy();

        // Another subscriber may already be installed by the test binary.
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .compact()
                    .with_thread_names(true)
                    .with_test_writer(),
            )
            .try_init();
    });
}

/// Installs a subscriber at the level named in `config.log.level`.
///
/// # Errors
///
/// Returns `InvalidValue` for an unknown level name.
pub fn init_logging_from_config(config: &HarnessConfig) -> Result<(), ConfigError> {
    init_logging(LogLevel::from_config(config)?);
    Ok(())
}

/// Installs a subscriber driven by `RUST_LOG` alone.
pub fn init_logging_from_env() {
    init_logging(LogLevel::default());
}
