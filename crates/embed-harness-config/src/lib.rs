pub mod config;
pub mod error;
pub mod loading;
pub mod settings;
pub mod validation;

// Re-export main types
pub use config::*;
pub use error::*;
pub use settings::*;

pub use loading::{DEFAULT_CONFIG_FILE, ENV_PREFIX};
pub use validation::validate;
