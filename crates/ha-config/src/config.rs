//! Top-level configuration model
//!
//! Splits `configuration.yaml` into the `homeassistant:` core section, the
//! `logger:` section and raw per-integration sections.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::error::{ConfigError, ConfigResult};
use crate::loader::load_yaml;

/// Main configuration file inside the config directory
pub const CONFIG_FILE: &str = "configuration.yaml";

const CORE_SECTION: &str = "homeassistant";
const LOGGER_SECTION: &str = "logger";

/// Core settings from the `homeassistant:` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub time_zone: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            name: "Home".to_string(),
            latitude: 0.0,
            longitude: 0.0,
            time_zone: "UTC".to_string(),
        }
    }
}

/// The `logger:` section
///
/// ```yaml
/// logger:
///   default: warn
///   logs:
///     ha_components::chargecloud: debug
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub default: Option<String>,
    pub logs: BTreeMap<String, String>,
}

impl LoggerConfig {
    /// Render as `tracing_subscriber::EnvFilter` directives
    pub fn filter_directives(&self) -> String {
        let mut directives = vec![self.default.clone().unwrap_or_else(|| "info".to_string())];
        directives.extend(
            self.logs
                .iter()
                .map(|(target, level)| format!("{}={}", target, level)),
        );
        directives.join(",")
    }
}

/// Fully loaded configuration
#[derive(Debug, Clone, Default)]
pub struct HomeAssistantConfig {
    pub core: CoreConfig,
    pub logger: LoggerConfig,
    /// Remaining top-level sections keyed by integration domain
    pub integrations: HashMap<String, Value>,
}

impl HomeAssistantConfig {
    /// Load `configuration.yaml` from a config directory.
    ///
    /// A missing file yields the defaults so a fresh config dir still boots.
    pub fn load(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref();
        if !config_dir.join(CONFIG_FILE).exists() {
            tracing::info!("No {} in {:?}, using defaults", CONFIG_FILE, config_dir);
            return Ok(Self::default());
        }
        Self::from_yaml(load_yaml(config_dir, CONFIG_FILE)?)
    }

    pub fn from_yaml(yaml: Value) -> ConfigResult<Self> {
        let mapping = match yaml {
            Value::Mapping(mapping) => mapping,
            // An empty file parses as null
            Value::Null => return Ok(Self::default()),
            _ => {
                return Err(ConfigError::section(
                    "root",
                    "configuration must be a mapping",
                ))
            }
        };

        let mut config = Self::default();
        for (key, value) in mapping {
            let Some(key) = key.as_str().map(str::to_string) else {
                return Err(ConfigError::section(
                    format!("{:?}", key),
                    "top-level keys must be strings",
                ));
            };
            match key.as_str() {
                CORE_SECTION => config.core = parse_section(&key, value)?,
                LOGGER_SECTION => config.logger = parse_section(&key, value)?,
                _ => {
                    config.integrations.insert(key, value);
                }
            }
        }
        Ok(config)
    }

    /// Deserialize the section of one integration, `None` if absent
    pub fn integration<T: DeserializeOwned>(&self, domain: &str) -> ConfigResult<Option<T>> {
        self.integrations
            .get(domain)
            .cloned()
            .map(|value| parse_section(domain, value))
            .transpose()
    }
}

fn parse_section<T: DeserializeOwned>(key: &str, value: Value) -> ConfigResult<T> {
    // `section:` with no body is null; treat it like an empty mapping
    let value = match value {
        Value::Null => Value::Mapping(Default::default()),
        other => other,
    };
    serde_yaml::from_value(value).map_err(|e| ConfigError::section(key, e))
}
