//! Realtime status sensor
//!
//! [`project`] turns the coordinator's locations into the sensor's state
//! and attributes; [`ChargecloudRealtimeSensor`] writes the result to the
//! state store whenever the coordinator publishes.

use ha_core::{attributes, EntityId, EntityIdError, State, STATE_UNAVAILABLE};
use ha_state_store::StateStore;
use ha_update_coordinator::CoordinatorSnapshot;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::api::{Connector, Location, SmartCallData, Status};
use super::evse_id::EvseId;

pub const ATTRIBUTION: &str = "chargecloud.de";

const DEFAULT_ICON: &str = "mdi:ev-station";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProjectionError {
    #[error("EVSE {0} not found in coordinator data")]
    EvseNotFound(String),

    #[error("no locations received yet")]
    NoData,
}

/// Display values for one EVSE
#[derive(Debug, Clone, PartialEq)]
pub struct EvseProjection {
    pub state: String,
    pub icon: &'static str,
    pub location_name: Option<String>,
    pub attributes: HashMap<String, Value>,
}

/// Icon for the plug type; only a single connector gets a specific one
pub fn choose_icon(connectors: &[Connector]) -> &'static str {
    let [connector] = connectors else {
        return DEFAULT_ICON;
    };
    match connector.standard.as_str() {
        "IEC_62196_T2" => "mdi:ev-plug-type2",
        "IEC_62196_T2_COMBO" => "mdi:ev-plug-ccs2",
        "CHADEMO" => "mdi:ev-plug-chademo",
        "TESLA" => "mdi:ev-plug-tesla",
        "DOMESTIC_F" => "mdi:power-socket-eu",
        _ => DEFAULT_ICON,
    }
}

pub fn project(
    locations: &[Location],
    evse_id: &EvseId,
    smart_call_data: Option<&SmartCallData>,
) -> Result<EvseProjection, ProjectionError> {
    let (location, evse) = locations
        .iter()
        .find_map(|location| location.evse(evse_id.as_str()).map(|evse| (location, evse)))
        .ok_or_else(|| ProjectionError::EvseNotFound(evse_id.to_string()))?;

    let connectors: Vec<Value> = evse
        .connectors
        .iter()
        .map(|connector| {
            json!({
                "id": connector.id,
                "status": connector.status.as_ref().map(Status::as_str),
                "power_type": connector.power_type,
                "ampere": connector.ampere,
                "voltage": connector.voltage,
                "max_power": connector.max_power,
                "standard": connector.standard,
                "format": connector.format,
            })
        })
        .collect();

    let coordinates = location.coordinates.as_ref();
    let attributes = HashMap::from([
        ("address".to_string(), json!(location.address)),
        ("city".to_string(), json!(location.city)),
        ("postal_code".to_string(), json!(location.postal_code)),
        ("country".to_string(), json!(location.country)),
        ("lat".to_string(), json!(coordinates.map(|c| &c.latitude))),
        ("lon".to_string(), json!(coordinates.map(|c| &c.longitude))),
        (
            "update_opid".to_string(),
            json!(smart_call_data.and_then(|s| s.operator_id.as_deref())),
        ),
        ("connectors".to_string(), Value::Array(connectors)),
    ]);

    Ok(EvseProjection {
        state: evse.status.to_string(),
        icon: choose_icon(&evse.connectors),
        location_name: location.name.clone(),
        attributes,
    })
}

/// Sensor entity showing the availability of one EVSE
pub struct ChargecloudRealtimeSensor {
    evse_id: EvseId,
    entity_id: EntityId,
    unique_id: String,
    states: Arc<StateStore>,
}

impl ChargecloudRealtimeSensor {
    pub fn new(evse_id: EvseId, states: Arc<StateStore>) -> Result<Self, EntityIdError> {
        let entity_id = EntityId::generate("sensor", evse_id.as_str())?;
        Ok(Self {
            unique_id: format!("{}-realtime", evse_id),
            evse_id,
            entity_id,
            states,
        })
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    fn base_attributes(&self) -> HashMap<String, Value> {
        HashMap::from([
            (attributes::ATTRIBUTION.to_string(), json!(ATTRIBUTION)),
            (attributes::DEVICE_CLASS.to_string(), json!("enum")),
            (attributes::OPTIONS.to_string(), json!(Status::KNOWN)),
        ])
    }

    /// Write the state for `snapshot`. A failed poll leaves the previous
    /// state in place; a successful one without locations yet (a smart
    /// first refresh that found nothing) marks the sensor unavailable.
    pub fn write_state(
        &self,
        snapshot: &CoordinatorSnapshot<Vec<Location>>,
        smart_call_data: Option<&SmartCallData>,
    ) -> Option<State> {
        if !snapshot.last_update_success {
            debug!(
                "Keeping last state of {} after failed update: {:?}",
                self.entity_id, snapshot.last_error
            );
            return None;
        }
        let mut attrs = self.base_attributes();
        let projected = match snapshot.data.as_deref() {
            Some(locations) => project(locations, &self.evse_id, smart_call_data),
            None => Err(ProjectionError::NoData),
        };
        let state = match projected {
            Ok(projection) => {
                attrs.extend(projection.attributes);
                attrs.insert(attributes::ICON.to_string(), json!(projection.icon));
                attrs.insert(
                    attributes::FRIENDLY_NAME.to_string(),
                    json!(projection
                        .location_name
                        .unwrap_or_else(|| self.evse_id.to_string())),
                );
                projection.state
            }
            Err(err) => {
                warn!("{}; marking {} unavailable", err, self.entity_id);
                attrs.insert(
                    attributes::FRIENDLY_NAME.to_string(),
                    json!(self.evse_id.as_str()),
                );
                STATE_UNAVAILABLE.to_string()
            }
        };

        Some(self.states.set(self.entity_id.clone(), state, attrs))
    }

    /// Re-write the state on every coordinator publication until the
    /// coordinator goes away or the task is aborted
    pub fn spawn(
        self,
        mut snapshots: watch::Receiver<CoordinatorSnapshot<Vec<Location>>>,
        call_state: watch::Receiver<Option<SmartCallData>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while snapshots.changed().await.is_ok() {
                let snapshot = snapshots.borrow_and_update().clone();
                let smart_call_data = call_state.borrow().clone();
                self.write_state(&snapshot, smart_call_data.as_ref());
            }
            debug!("Coordinator for {} closed", self.entity_id);
        })
    }
}
