//! End-to-end tests: config flow → config entry → coordinator → sensor state

use async_trait::async_trait;
use ha_components::chargecloud::{
    import_from_config, ApiError, ApiFactory, ChargecloudApi, ChargecloudConfig,
    ChargecloudIntegration, Connector, Coordinates, Evse, EvseId, Location, SmartCallData, Status,
    UpdateMode, CONF_EVSE_ID, DOMAIN,
};
use ha_config_entries::{
    ConfigEntries, ConfigEntrySource, ConfigEntryState, FlowManager, FlowResultType,
    IntegrationHandler, Storage,
};
use ha_core::{attributes, STATE_UNAVAILABLE};
use ha_registries::DeviceRegistry;
use ha_state_store::StateStore;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const EVSE: &str = "DE*ABC*E1234";
const ENTITY: &str = "sensor.de_abc_e1234";

fn location(status: Status) -> Location {
    Location {
        id: "LOC1".into(),
        name: Some("Rathausplatz".into()),
        address: Some("Rathausplatz 2".into()),
        city: Some("Musterstadt".into()),
        postal_code: Some("12345".into()),
        country: Some("DEU".into()),
        coordinates: Some(Coordinates {
            latitude: "50.0".into(),
            longitude: "8.0".into(),
        }),
        evses: vec![Evse {
            id: EVSE.into(),
            status,
            connectors: vec![Connector {
                id: "1".into(),
                status: None,
                standard: "IEC_62196_T2_COMBO".into(),
                format: Some("CABLE".into()),
                power_type: Some("DC".into()),
                ampere: Some(200),
                voltage: Some(400),
                max_power: Some(50000.0),
            }],
        }],
    }
}

/// Scripted chargecloud backend
struct Backend {
    offline: AtomicBool,
    lookup: Mutex<Vec<Location>>,
    smart: Mutex<VecDeque<Option<Location>>>,
}

impl Backend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            offline: AtomicBool::new(false),
            lookup: Mutex::new(vec![location(Status::Available)]),
            smart: Mutex::new(VecDeque::new()),
        })
    }

    fn check_online(&self) -> Result<(), ApiError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(ApiError::Status {
                status: 503,
                url: "http://fake".into(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChargecloudApi for Backend {
    async fn location_by_evse_id(&self, _evse_id: &EvseId) -> Result<Vec<Location>, ApiError> {
        self.check_online()?;
        Ok(self.lookup.lock().unwrap().clone())
    }

    async fn perform_smart_api_call(
        &self,
        _evse_id: &EvseId,
        _previous: Option<SmartCallData>,
    ) -> Result<(Option<Location>, SmartCallData), ApiError> {
        self.check_online()?;
        let next = self
            .smart
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.lookup.lock().unwrap().first().cloned());
        let state = SmartCallData {
            operator_id: Some("fake-operator".into()),
            ..SmartCallData::default()
        };
        Ok((next, state))
    }
}

struct Instance {
    _dir: TempDir,
    backend: Arc<Backend>,
    states: Arc<StateStore>,
    devices: Arc<DeviceRegistry>,
    entries: Arc<ConfigEntries>,
    flows: FlowManager,
    integration: Arc<ChargecloudIntegration>,
}

fn instance(config: ChargecloudConfig) -> Instance {
    let dir = TempDir::new().unwrap();
    let backend = Backend::new();
    let states = Arc::new(StateStore::new());
    let storage = Arc::new(Storage::new(dir.path()));
    let devices = Arc::new(DeviceRegistry::new(storage.clone()));
    let entries = Arc::new(ConfigEntries::new(storage));
    let flows = FlowManager::new(entries.clone());

    let api = backend.clone();
    let factory: ApiFactory = Arc::new(move |_base_url: &str| Ok(api.clone() as Arc<dyn ChargecloudApi>));
    let integration = Arc::new(ChargecloudIntegration::with_api_factory(
        config,
        states.clone(),
        devices.clone(),
        factory,
    ));
    entries.register_integration(DOMAIN, integration.clone());
    flows.register(DOMAIN, Arc::new(integration.config_flow()));

    Instance {
        _dir: dir,
        backend,
        states,
        devices,
        entries,
        flows,
        integration,
    }
}

async fn add_evse(instance: &Instance, evse_id: &str) -> String {
    let input = HashMap::from([(CONF_EVSE_ID.to_string(), json!(evse_id))]);
    let result = instance
        .flows
        .start_flow(DOMAIN, ConfigEntrySource::User, Some(input))
        .await
        .unwrap();
    assert_eq!(result.result_type, FlowResultType::CreateEntry);
    result.entry_id.unwrap()
}

#[tokio::test]
async fn test_flow_creates_loaded_entry_with_sensor() {
    let instance = instance(ChargecloudConfig::default());
    let entry_id = add_evse(&instance, EVSE).await;

    let entry = instance.entries.get(&entry_id).unwrap();
    assert_eq!(entry.state, ConfigEntryState::Loaded);
    assert_eq!(instance.integration.loaded_entries(), 1);

    let state = instance.states.get(ENTITY).unwrap();
    assert_eq!(state.state, "AVAILABLE");
    assert_eq!(state.attributes[attributes::ICON], json!("mdi:ev-plug-ccs2"));
    assert_eq!(state.attributes[attributes::FRIENDLY_NAME], json!("Rathausplatz"));
    assert_eq!(state.attributes["update_opid"], json!("fake-operator"));
    assert_eq!(state.attributes["connectors"][0]["voltage"], json!(400));
}

#[tokio::test]
async fn test_smart_first_refresh_without_location_marks_unavailable() {
    let instance = instance(ChargecloudConfig::default());
    instance.backend.smart.lock().unwrap().push_back(None);
    let entry_id = add_evse(&instance, EVSE).await;

    let entry = instance.entries.get(&entry_id).unwrap();
    assert_eq!(entry.state, ConfigEntryState::Loaded);
    assert!(instance.integration.coordinator(&entry_id).unwrap().data().is_none());

    let state = instance.states.get(ENTITY).unwrap();
    assert_eq!(state.state, STATE_UNAVAILABLE);
    assert_eq!(state.attributes[attributes::FRIENDLY_NAME], json!(EVSE));

    let device = instance.devices.get_by_identifier(DOMAIN, EVSE).unwrap();
    assert_eq!(device.name.as_deref(), Some(EVSE));
}

#[tokio::test]
async fn test_repeated_setup_keeps_sensor() {
    let instance = instance(ChargecloudConfig::default());
    let entry_id = add_evse(&instance, EVSE).await;
    let entry = instance.entries.get(&entry_id).unwrap();
    let first = instance.integration.coordinator(&entry_id).unwrap();

    instance.integration.setup_entry(&entry).await.unwrap();
    tokio::task::yield_now().await;

    assert!(instance.states.is_state(ENTITY, "AVAILABLE"));
    assert_eq!(instance.integration.loaded_entries(), 1);
    let second = instance.integration.coordinator(&entry_id).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(instance.devices.len(), 1);
}

#[tokio::test]
async fn test_refresh_updates_sensor_and_empty_poll_keeps_it() {
    let instance = instance(ChargecloudConfig::default());
    let entry_id = add_evse(&instance, EVSE).await;
    let coordinator = instance.integration.coordinator(&entry_id).unwrap();
    let mut changes = instance.states.subscribe();

    instance
        .backend
        .smart
        .lock()
        .unwrap()
        .extend([Some(location(Status::Charging)), None]);

    coordinator.refresh().await.unwrap();
    let change = tokio::time::timeout(Duration::from_secs(1), changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.new_state.unwrap().state, "CHARGING");

    // Empty incremental answer: the last known location stays
    coordinator.refresh().await.unwrap();
    let change = tokio::time::timeout(Duration::from_secs(1), changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.new_state.unwrap().state, "CHARGING");
}

#[tokio::test]
async fn test_failed_poll_keeps_sensor_state() {
    let instance = instance(ChargecloudConfig::default());
    let entry_id = add_evse(&instance, EVSE).await;
    let coordinator = instance.integration.coordinator(&entry_id).unwrap();

    instance.backend.offline.store(true, Ordering::SeqCst);
    assert!(coordinator.refresh().await.is_err());
    tokio::task::yield_now().await;

    assert!(instance.states.is_state(ENTITY, "AVAILABLE"));
    assert_eq!(coordinator.data().unwrap()[0].evses[0].status, Status::Available);
}

#[tokio::test]
async fn test_simple_mode_missing_evse_unavailable() {
    let config = ChargecloudConfig {
        update_mode: UpdateMode::Simple,
        ..ChargecloudConfig::default()
    };
    let instance = instance(config);
    let entry_id = add_evse(&instance, EVSE).await;
    let coordinator = instance.integration.coordinator(&entry_id).unwrap();
    let mut changes = instance.states.subscribe();

    let mut moved = location(Status::Available);
    moved.evses[0].id = "DE*ABC*E9999".into();
    *instance.backend.lookup.lock().unwrap() = vec![moved];

    coordinator.refresh().await.unwrap();
    let change = tokio::time::timeout(Duration::from_secs(1), changes.recv())
        .await
        .unwrap()
        .unwrap();
    let state = change.new_state.unwrap();
    assert_eq!(state.state, STATE_UNAVAILABLE);
    assert!(!state.attributes.contains_key("update_opid"));
}

#[tokio::test]
async fn test_unload_and_remove() {
    let instance = instance(ChargecloudConfig::default());
    let entry_id = add_evse(&instance, EVSE).await;

    assert!(instance.entries.unload(&entry_id).await.unwrap());
    assert_eq!(instance.integration.loaded_entries(), 0);
    assert!(instance.states.get(ENTITY).is_none());
    assert_eq!(instance.devices.len(), 1);

    instance.entries.setup(&entry_id).await.unwrap();
    assert!(instance.states.is_state(ENTITY, "AVAILABLE"));

    let device = instance.devices.get_by_identifier(DOMAIN, EVSE).unwrap();
    assert_eq!(device.name.as_deref(), Some("Rathausplatz"));
    assert_eq!(device.config_entries, vec![entry_id.clone()]);

    // Removing the entry drops its device
    instance.entries.remove(&entry_id).await.unwrap();
    assert!(instance.entries.is_empty());
    assert_eq!(instance.integration.loaded_entries(), 0);
    assert!(instance.devices.is_empty());

    // The id can be added again once removed
    add_evse(&instance, EVSE).await;
}

#[tokio::test]
async fn test_offline_api_at_setup_schedules_retry() {
    let instance = instance(ChargecloudConfig::default());
    add_evse(&instance, EVSE).await;

    // Restart with the backend down
    let entry = instance.entries.get_by_unique_id(DOMAIN, EVSE).unwrap();
    instance.entries.unload(&entry.entry_id).await.unwrap();
    instance.backend.offline.store(true, Ordering::SeqCst);

    assert!(instance.entries.setup(&entry.entry_id).await.is_err());
    let entry = instance.entries.get(&entry.entry_id).unwrap();
    assert_eq!(entry.state, ConfigEntryState::SetupRetry);
    assert!(instance.entries.has_pending_retry(&entry.entry_id));
    assert_eq!(instance.integration.loaded_entries(), 0);
}

#[tokio::test]
async fn test_import_from_config() {
    let config = ChargecloudConfig {
        evse_ids: vec![EVSE.into(), "garbage".into()],
        ..ChargecloudConfig::default()
    };
    let instance = instance(config.clone());

    let results = import_from_config(&instance.flows, &config).await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].1.result_type, FlowResultType::CreateEntry);
    assert_eq!(results[1].1.reason.as_deref(), Some("malformed_evse_id"));

    let entry = instance.entries.get_by_unique_id(DOMAIN, EVSE).unwrap();
    assert_eq!(entry.source, ConfigEntrySource::Import);

    // Importing again is a no-op
    let again = import_from_config(&instance.flows, &config).await;
    assert_eq!(again[0].1.reason.as_deref(), Some("already_configured"));
    assert_eq!(instance.entries.len(), 1);
}
