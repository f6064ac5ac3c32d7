//! Polling of one EVSE
//!
//! `Simple` mode asks for the full location list on every poll. `Smart`
//! mode uses the incremental call and keeps the previous data when the API
//! has nothing new.

use async_trait::async_trait;
use ha_update_coordinator::{DataUpdateCoordinator, DataUpdater, UpdateFailed, UpdateOutcome};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use super::api::{ChargecloudApi, Location, SmartCallData};
use super::evse_id::EvseId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    Simple,
    #[default]
    Smart,
}

pub type ChargecloudCoordinator = DataUpdateCoordinator<ChargecloudUpdater>;

pub struct ChargecloudUpdater {
    api: Arc<dyn ChargecloudApi>,
    evse_id: EvseId,
    mode: UpdateMode,
    /// Continuation state of the smart call, replaced after every call
    call_state: watch::Sender<Option<SmartCallData>>,
}

impl ChargecloudUpdater {
    pub fn new(api: Arc<dyn ChargecloudApi>, evse_id: EvseId, mode: UpdateMode) -> Self {
        let (call_state, _) = watch::channel(None);
        Self {
            api,
            evse_id,
            mode,
            call_state,
        }
    }

    pub fn evse_id(&self) -> &EvseId {
        &self.evse_id
    }

    /// Follows the smart call state; always `None` in simple mode
    pub fn call_state(&self) -> watch::Receiver<Option<SmartCallData>> {
        self.call_state.subscribe()
    }
}

#[async_trait]
impl DataUpdater for ChargecloudUpdater {
    type Data = Vec<Location>;

    async fn update(&mut self) -> Result<UpdateOutcome<Vec<Location>>, UpdateFailed> {
        match self.mode {
            UpdateMode::Simple => {
                let locations = self
                    .api
                    .location_by_evse_id(&self.evse_id)
                    .await
                    .map_err(|e| UpdateFailed::new(format!("Error communicating with API: {}", e)))?;
                debug!("Received {} locations for {}", locations.len(), self.evse_id);
                Ok(UpdateOutcome::Updated(locations))
            }
            UpdateMode::Smart => {
                let previous = self.call_state.borrow().clone();
                let (location, state) = self
                    .api
                    .perform_smart_api_call(&self.evse_id, previous)
                    .await
                    .map_err(|e| UpdateFailed::new(format!("Error communicating with API: {}", e)))?;
                self.call_state.send_replace(Some(state));

                match location {
                    Some(location) => Ok(UpdateOutcome::Updated(vec![location])),
                    None => {
                        info!("received empty update");
                        Ok(UpdateOutcome::Unchanged)
                    }
                }
            }
        }
    }
}
