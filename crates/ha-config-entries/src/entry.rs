//! Config Entry types
//!
//! A ConfigEntry represents a single instance of an integration's configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::state_machine::InvalidTransition;

/// Config entry lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryState {
    /// Initial state, not yet set up
    #[default]
    NotLoaded,
    SetupInProgress,
    Loaded,
    /// Setup failed for good; needs a reload
    SetupError,
    /// Integration was not ready, a retry is scheduled
    SetupRetry,
    UnloadInProgress,
    /// Unload failed (not recoverable)
    FailedUnload,
}

impl ConfigEntryState {
    /// Whether the entry can be unloaded/reloaded from this state
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConfigEntryState::Loaded
                | ConfigEntryState::SetupError
                | ConfigEntryState::SetupRetry
                | ConfigEntryState::NotLoaded
        )
    }
}

/// Where the config entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntrySource {
    /// Configured interactively
    #[default]
    User,
    /// Imported from configuration.yaml
    Import,
}

impl ConfigEntrySource {
    /// Flow step that handles this source
    pub fn step_id(&self) -> &'static str {
        match self {
            ConfigEntrySource::User => "user",
            ConfigEntrySource::Import => "import",
        }
    }
}

/// One configured instance of an integration, e.g. one tracked EVSE
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// ULID assigned on creation
    pub entry_id: String,
    pub domain: String,
    pub title: String,

    /// Data captured by the config flow
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,

    /// Per-domain identity used for duplicate prevention
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,

    #[serde(default)]
    pub source: ConfigEntrySource,

    /// Set up without scheduled refreshes
    #[serde(default)]
    pub pref_disable_polling: bool,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,

    // Runtime only
    #[serde(skip, default)]
    pub state: ConfigEntryState,
    #[serde(skip, default)]
    pub reason: Option<String>,
    /// Setup attempts since the last stable state
    #[serde(skip, default)]
    pub tries: u32,
}

impl ConfigEntry {
    pub fn new(domain: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            entry_id: ulid::Ulid::new().to_string(),
            domain: domain.into(),
            title: title.into(),
            data: HashMap::new(),
            unique_id: None,
            source: ConfigEntrySource::default(),
            pref_disable_polling: false,
            created_at: now,
            modified_at: now,
            state: ConfigEntryState::NotLoaded,
            reason: None,
            tries: 0,
        }
    }

    pub fn with_data(self, data: HashMap<String, serde_json::Value>) -> Self {
        Self { data, ..self }
    }

    pub fn with_unique_id(self, unique_id: impl Into<String>) -> Self {
        Self {
            unique_id: Some(unique_id.into()),
            ..self
        }
    }

    pub fn with_source(self, source: ConfigEntrySource) -> Self {
        Self { source, ..self }
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(serde_json::Value::as_str)
    }

    pub fn is_loaded(&self) -> bool {
        self.state == ConfigEntryState::Loaded
    }

    /// Move to `new_state` if the lifecycle FSM allows it
    pub fn try_set_state(
        &mut self,
        new_state: ConfigEntryState,
        reason: Option<String>,
    ) -> Result<(), InvalidTransition> {
        self.state = self.state.try_transition(new_state)?;
        self.reason = reason;
        if !new_state.keeps_tries() {
            self.tries = 0;
        }
        Ok(())
    }
}

impl ConfigEntryState {
    /// Retry bookkeeping survives only while setup is being retried
    fn keeps_tries(self) -> bool {
        matches!(self, Self::SetupRetry | Self::SetupInProgress)
    }
}

/// Fields to change on a stored entry; `None` leaves a field as is
#[derive(Debug, Default)]
pub struct ConfigEntryUpdate {
    pub title: Option<String>,
    pub data: Option<HashMap<String, serde_json::Value>>,
    pub pref_disable_polling: Option<bool>,
}

impl ConfigEntryUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(self, title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..self
        }
    }

    pub fn data(self, data: HashMap<String, serde_json::Value>) -> Self {
        Self {
            data: Some(data),
            ..self
        }
    }

    pub fn disable_polling(self, disable: bool) -> Self {
        Self {
            pref_disable_polling: Some(disable),
            ..self
        }
    }

    /// Apply to `entry`, bumping `modified_at`
    pub(crate) fn apply(self, entry: &mut ConfigEntry) {
        if let Some(title) = self.title {
            entry.title = title;
        }
        if let Some(data) = self.data {
            entry.data = data;
        }
        if let Some(pref) = self.pref_disable_polling {
            entry.pref_disable_polling = pref;
        }
        entry.modified_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_entry_builder() {
        let mut data = HashMap::new();
        data.insert("evse_id".to_string(), json!("DE*ABC*E1234"));

        let entry = ConfigEntry::new("chargecloud", "DE*ABC*E1234")
            .with_data(data)
            .with_unique_id("DE*ABC*E1234")
            .with_source(ConfigEntrySource::Import);

        assert_eq!(entry.state, ConfigEntryState::NotLoaded);
        assert_eq!(entry.unique_id.as_deref(), Some("DE*ABC*E1234"));
        assert_eq!(entry.data_str("evse_id"), Some("DE*ABC*E1234"));
        assert_eq!(entry.data_str("base_url"), None);
        assert!(!entry.entry_id.is_empty());
    }

    #[test]
    fn test_runtime_fields_not_persisted() {
        let mut entry = ConfigEntry::new("chargecloud", "Test").with_unique_id("x");
        entry.try_set_state(ConfigEntryState::SetupInProgress, None).unwrap();
        entry.tries = 3;

        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("state").is_none());
        assert!(json.get("tries").is_none());

        let parsed: ConfigEntry = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.state, ConfigEntryState::NotLoaded);
        assert_eq!(parsed.source, ConfigEntrySource::User);
        assert_eq!(parsed.unique_id.as_deref(), Some("x"));
    }

    #[test]
    fn test_try_set_state_rejects_jump() {
        let mut entry = ConfigEntry::new("chargecloud", "Test");
        assert!(entry.try_set_state(ConfigEntryState::Loaded, None).is_err());
        assert_eq!(entry.state, ConfigEntryState::NotLoaded);
    }

    #[test]
    fn test_tries_reset_on_stable_state() {
        let mut entry = ConfigEntry::new("chargecloud", "Test");
        entry.try_set_state(ConfigEntryState::SetupInProgress, None).unwrap();
        entry.tries = 2;
        entry
            .try_set_state(ConfigEntryState::SetupRetry, Some("offline".into()))
            .unwrap();
        assert_eq!(entry.tries, 2);
        entry.try_set_state(ConfigEntryState::SetupInProgress, None).unwrap();
        entry.try_set_state(ConfigEntryState::Loaded, None).unwrap();
        assert_eq!(entry.tries, 0);
        assert!(entry.reason.is_none());
    }
}
