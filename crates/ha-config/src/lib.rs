//! YAML configuration loading for Home Assistant
//!
//! Loads `configuration.yaml` with support for Home Assistant's custom tags:
//!
//! - `!include path` - Include another YAML file (relative to the includer)
//! - `!secret key` - Substitute from secrets.yaml
//! - `!env_var VAR [default]` - Environment variable substitution
//!
//! The loaded document is split into the core `homeassistant:` section, the
//! `logger:` section and one raw section per integration domain.
//!
//! # Example
//!
//! ```ignore
//! use ha_config::HomeAssistantConfig;
//!
//! let config = HomeAssistantConfig::load("/config")?;
//! let section: Option<MySettings> = config.integration("chargecloud")?;
//! ```

mod config;
mod error;
mod loader;
mod secrets;

pub use config::{CoreConfig, HomeAssistantConfig, LoggerConfig, CONFIG_FILE};
pub use error::{ConfigError, ConfigResult, TagError};
pub use loader::{load_yaml, YamlLoader};
pub use secrets::Secrets;

// Re-export serde_yaml::Value for convenience
pub use serde_yaml::Value;
