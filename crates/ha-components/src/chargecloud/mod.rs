//! chargecloud integration
//!
//! Realtime availability of public EV charge points served by chargecloud.
//! Each config entry tracks one EVSE: a coordinator polls the API and a
//! sensor entity mirrors the EVSE status into the state store. The EVSE is
//! registered as a device identified by `(chargecloud, evse_id)`.
//!
//! ```yaml
//! chargecloud:
//!   update_mode: smart        # or simple
//!   scan_interval: 30         # seconds
//!   request_timeout: 10       # seconds
//!   base_url: https://app.chargecloud.de/emobility:ocpi
//!   operators: [chargecloud]
//!   evse_ids:                 # imported as config entries at startup
//!     - DE*ABC*E1234
//! ```

pub mod api;
pub mod config_flow;
pub mod coordinator;
pub mod evse_id;
pub mod sensor;

use async_trait::async_trait;
use dashmap::DashMap;
use ha_config::{ConfigError, ConfigResult, HomeAssistantConfig};
use ha_config_entries::{
    ConfigEntry, ConfigEntrySource, FlowManager, FlowResult, FlowResultType, IntegrationHandler,
    SetupError,
};
use ha_core::EntityId;
use ha_registries::{DeviceIdentifier, DeviceRegistry};
use ha_state_store::StateStore;
use ha_update_coordinator::{DataUpdateCoordinator, DEFAULT_REQUEST_TIMEOUT, DEFAULT_UPDATE_INTERVAL};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use api::{
    ApiError, ChargecloudApi, ChargecloudClient, Connector, Coordinates, Evse, Location,
    SmartCallData, Status, DEFAULT_BASE_URL,
};
pub use config_flow::{canonical_evse_id, ChargecloudConfigFlow, ConfigFlowError};
pub use coordinator::{ChargecloudCoordinator, ChargecloudUpdater, UpdateMode};
pub use evse_id::{validate_evse_id, EvseId, EvseIdError};
pub use sensor::{choose_icon, project, ChargecloudRealtimeSensor, EvseProjection, ProjectionError};

pub const DOMAIN: &str = "chargecloud";

pub const CONF_EVSE_ID: &str = "evse_id";
pub const CONF_BASE_URL: &str = "base_url";

/// Builds an API client for a base URL
pub type ApiFactory =
    Arc<dyn Fn(&str) -> Result<Arc<dyn ChargecloudApi>, ApiError> + Send + Sync>;

/// Factory producing [`ChargecloudClient`]s that query `operators`
pub fn client_factory(operators: Vec<String>) -> ApiFactory {
    Arc::new(move |base_url: &str| {
        let client = ChargecloudClient::new(base_url, operators.clone())?;
        Ok(Arc::new(client) as Arc<dyn ChargecloudApi>)
    })
}

/// `chargecloud:` section of configuration.yaml
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChargecloudConfig {
    pub update_mode: UpdateMode,
    /// Seconds between polls
    pub scan_interval: u64,
    /// Seconds before a poll is abandoned
    pub request_timeout: u64,
    pub base_url: Option<String>,
    pub operators: Vec<String>,
    pub evse_ids: Vec<String>,
}

impl Default for ChargecloudConfig {
    fn default() -> Self {
        Self {
            update_mode: UpdateMode::default(),
            scan_interval: DEFAULT_UPDATE_INTERVAL.as_secs(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            base_url: None,
            operators: Vec::new(),
            evse_ids: Vec::new(),
        }
    }
}

impl ChargecloudConfig {
    /// Read and check the section; absent means defaults
    pub fn from_config(config: &HomeAssistantConfig) -> ConfigResult<Self> {
        let section: Self = config.integration(DOMAIN)?.unwrap_or_default();
        section.validate()?;
        Ok(section)
    }

    fn validate(&self) -> ConfigResult<()> {
        for (key, value) in [
            ("scan_interval", self.scan_interval),
            ("request_timeout", self.request_timeout),
        ] {
            if value == 0 {
                return Err(ConfigError::section(
                    format!("{}.{}", DOMAIN, key),
                    "must be at least 1 second",
                ));
            }
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Entry override, then this section, then the public endpoint
    pub fn resolve_base_url(&self, entry_value: Option<&str>) -> String {
        entry_value
            .or(self.base_url.as_deref())
            .unwrap_or(DEFAULT_BASE_URL)
            .to_string()
    }
}

/// Everything running for one loaded entry
struct ChargecloudRuntime {
    coordinator: Arc<ChargecloudCoordinator>,
    entity_id: EntityId,
    sensor_task: JoinHandle<()>,
}

pub struct ChargecloudIntegration {
    config: Arc<ChargecloudConfig>,
    api_factory: ApiFactory,
    states: Arc<StateStore>,
    devices: Arc<DeviceRegistry>,
    /// Loaded entries by entry_id
    runtimes: DashMap<String, ChargecloudRuntime>,
}

impl ChargecloudIntegration {
    pub fn new(
        config: ChargecloudConfig,
        states: Arc<StateStore>,
        devices: Arc<DeviceRegistry>,
    ) -> Self {
        let api_factory = client_factory(config.operators.clone());
        Self::with_api_factory(config, states, devices, api_factory)
    }

    pub fn with_api_factory(
        config: ChargecloudConfig,
        states: Arc<StateStore>,
        devices: Arc<DeviceRegistry>,
        api_factory: ApiFactory,
    ) -> Self {
        Self {
            config: Arc::new(config),
            api_factory,
            states,
            devices,
            runtimes: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ChargecloudConfig {
        &self.config
    }

    /// Config flow sharing this integration's settings and API factory
    pub fn config_flow(&self) -> ChargecloudConfigFlow {
        ChargecloudConfigFlow::new(self.config.clone(), self.api_factory.clone())
    }

    pub fn coordinator(&self, entry_id: &str) -> Option<Arc<ChargecloudCoordinator>> {
        self.runtimes
            .get(entry_id)
            .map(|runtime| runtime.coordinator.clone())
    }

    pub fn entity_id(&self, entry_id: &str) -> Option<EntityId> {
        self.runtimes
            .get(entry_id)
            .map(|runtime| runtime.entity_id.clone())
    }

    pub fn loaded_entries(&self) -> usize {
        self.runtimes.len()
    }

    async fn stop(&self, entry_id: &str) -> bool {
        let Some((_, runtime)) = self.runtimes.remove(entry_id) else {
            return false;
        };
        runtime.coordinator.shutdown().await;
        runtime.sensor_task.abort();
        self.states.remove(&runtime.entity_id);
        true
    }

    /// Register the EVSE as a device of `entry`, named after its location.
    /// Without data a known device keeps its name and a new one is named
    /// after the EVSE.
    async fn register_device(
        &self,
        entry: &ConfigEntry,
        evse_id: &EvseId,
        locations: Option<&[Location]>,
    ) {
        let name = locations
            .and_then(|locations| {
                locations
                    .iter()
                    .find(|location| location.evse(evse_id.as_str()).is_some())
            })
            .and_then(|location| location.name.as_deref());
        let known = self
            .devices
            .get_by_identifier(DOMAIN, evse_id.as_str())
            .is_some();
        let name = name.or((!known).then_some(evse_id.as_str()));

        let device = self.devices.get_or_create(
            &[DeviceIdentifier::new(DOMAIN, evse_id.as_str())],
            Some(&entry.entry_id),
            name,
        );
        debug!("EVSE {} is device {}", evse_id, device.id);
        if let Err(err) = self.devices.save().await {
            warn!("Failed to save device registry: {}", err);
        }
    }
}

#[async_trait]
impl IntegrationHandler for ChargecloudIntegration {
    async fn setup_entry(&self, entry: &ConfigEntry) -> Result<(), SetupError> {
        let raw_id = entry
            .data_str(CONF_EVSE_ID)
            .ok_or_else(|| SetupError::Failed(format!("entry {} has no {}", entry.entry_id, CONF_EVSE_ID)))?;
        let evse_id = EvseId::from_trusted(raw_id);

        // A stale runtime would keep polling and later erase the new state
        self.stop(&entry.entry_id).await;

        let base_url = self.config.resolve_base_url(entry.data_str(CONF_BASE_URL));
        let api = (self.api_factory)(&base_url)
            .map_err(|err| SetupError::Failed(format!("cannot create API client: {}", err)))?;

        let updater = ChargecloudUpdater::new(api, evse_id.clone(), self.config.update_mode);
        let call_state = updater.call_state();
        let coordinator = Arc::new(DataUpdateCoordinator::new(
            format!("{} {}", DOMAIN, evse_id),
            updater,
            self.config.scan_interval(),
            self.config.request_timeout(),
        ));

        coordinator
            .first_refresh()
            .await
            .map_err(|err| SetupError::NotReady(err.to_string()))?;

        let data = coordinator.data();
        self.register_device(entry, &evse_id, data.as_deref()).await;

        let sensor = ChargecloudRealtimeSensor::new(evse_id.clone(), self.states.clone())
            .map_err(|err| SetupError::Failed(err.to_string()))?;
        let entity_id = sensor.entity_id().clone();

        // Subscribe before the first write so no publication is missed
        let snapshots = coordinator.subscribe();
        sensor.write_state(&coordinator.snapshot(), call_state.borrow().as_ref());
        let sensor_task = sensor.spawn(snapshots, call_state);

        if entry.pref_disable_polling {
            debug!("Polling disabled for {}", evse_id);
        } else {
            coordinator.start().await;
        }

        self.runtimes.insert(
            entry.entry_id.clone(),
            ChargecloudRuntime {
                coordinator,
                entity_id,
                sensor_task,
            },
        );
        info!("Tracking EVSE {} ({})", evse_id, base_url);
        Ok(())
    }

    async fn unload_entry(&self, entry: &ConfigEntry) -> bool {
        if !self.stop(&entry.entry_id).await {
            debug!("Entry {} had nothing running", entry.entry_id);
        }
        true
    }

    async fn remove_entry(&self, entry: &ConfigEntry) {
        if self.devices.get_by_config_entry_id(&entry.entry_id).is_empty() {
            return;
        }
        let removed = self.devices.clear_config_entry(&entry.entry_id);
        info!("Removed {} devices of entry {}", removed.len(), entry.entry_id);
        if let Err(err) = self.devices.save().await {
            warn!("Failed to save device registry: {}", err);
        }
    }
}

/// Start an import flow for every `evse_ids` item of the section
pub async fn import_from_config(
    flows: &FlowManager,
    config: &ChargecloudConfig,
) -> Vec<(String, FlowResult)> {
    let mut results = Vec::with_capacity(config.evse_ids.len());
    for evse_id in &config.evse_ids {
        let input = HashMap::from([(CONF_EVSE_ID.to_string(), json!(evse_id))]);
        match flows
            .start_flow(DOMAIN, ConfigEntrySource::Import, Some(input))
            .await
        {
            Ok(result) => {
                match result.result_type {
                    FlowResultType::CreateEntry => info!("Imported EVSE {}", evse_id),
                    _ => debug!("Import of {} ended with {:?}", evse_id, result.reason),
                }
                results.push((evse_id.clone(), result));
            }
            Err(err) => warn!("Import of {} failed: {}", evse_id, err),
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> ConfigResult<ChargecloudConfig> {
        let config = HomeAssistantConfig::from_yaml(serde_yaml::from_str(yaml).unwrap())?;
        ChargecloudConfig::from_config(&config)
    }

    #[test]
    fn test_defaults_without_section() {
        let config = parse("homeassistant:\n  name: Home\n").unwrap();
        assert_eq!(config, ChargecloudConfig::default());
        assert_eq!(config.update_mode, UpdateMode::Smart);
        assert_eq!(config.scan_interval(), Duration::from_secs(30));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_full_section() {
        let config = parse(
            r#"
chargecloud:
  update_mode: simple
  scan_interval: 120
  base_url: http://localhost:8080
  operators: [alpha, beta]
  evse_ids:
    - DE*ABC*E1234
"#,
        )
        .unwrap();
        assert_eq!(config.update_mode, UpdateMode::Simple);
        assert_eq!(config.scan_interval(), Duration::from_secs(120));
        assert_eq!(config.request_timeout, 10);
        assert_eq!(config.operators, vec!["alpha", "beta"]);
        assert_eq!(config.evse_ids, vec!["DE*ABC*E1234"]);
    }

    #[test]
    fn test_invalid_section() {
        assert!(matches!(
            parse("chargecloud:\n  scan_interval: 0\n"),
            Err(ConfigError::Section { ref section, .. }) if section == "chargecloud.scan_interval"
        ));
        assert!(parse("chargecloud:\n  update_mode: turbo\n").is_err());
        assert!(parse("chargecloud:\n  scan_intervall: 5\n").is_err());
    }

    #[test]
    fn test_resolve_base_url() {
        let mut config = ChargecloudConfig::default();
        assert_eq!(config.resolve_base_url(None), DEFAULT_BASE_URL);

        config.base_url = Some("http://global".into());
        assert_eq!(config.resolve_base_url(None), "http://global");
        assert_eq!(config.resolve_base_url(Some("http://entry")), "http://entry");
    }
}
