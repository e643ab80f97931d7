//! Configuration for the fsboot startup orchestrator.
//!
//! Settings are read once from a flat TOML file of upper-case keys, overlaid
//! with environment variables of the same name, validated, and then handed
//! around as an immutable [`Settings`] value. A missing file is not an error:
//! every key has a default except the iSCSI target, which `validate` enforces.

pub mod level;
pub mod settings;

pub use level::LogLevel;
pub use settings::{resolve_config_path, setting_keys, Settings, DEFAULT_CONFIG_PATH};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("required setting {0} is not set")]
    MissingSetting(&'static str),
    #[error("invalid value for {key}: '{value}'")]
    InvalidOverride { key: String, value: String },
    #[error("invalid setting: {0}")]
    Invalid(String),
}
