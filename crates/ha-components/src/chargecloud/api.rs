//! chargecloud API client
//!
//! Every charge point operator (tenant) has its own OCPI-style endpoint:
//!
//! ```text
//! GET {base_url}/{operator}/app/2.0/locations?evse={evse_id}
//! → {"data": [Location, ...]}
//! ```
//!
//! A plain lookup asks the configured operators in order. The "smart" call
//! remembers which operator answered for an EVSE and asks only that one
//! until it stops answering.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::evse_id::EvseId;

pub const DEFAULT_BASE_URL: &str = "https://app.chargecloud.de/emobility:ocpi";

/// Operators asked when none are configured
pub const DEFAULT_OPERATORS: &[&str] = &["chargecloud"];

/// Consecutive empty answers after which the remembered operator is dropped
pub const MAX_EMPTY_ANSWERS: u32 = 3;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[source] reqwest::Error),

    #[error("Unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Request timed out")]
    Timeout,
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Http(err)
        }
    }
}

/// OCPI status of an EVSE or connector
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Status {
    Available,
    Blocked,
    Charging,
    Inoperative,
    OutOfOrder,
    Planned,
    Removed,
    Reserved,
    Unknown,
    /// Anything the API reports outside the known set
    Other(String),
}

impl Status {
    /// The known statuses, in the order shown as sensor options
    pub const KNOWN: [&'static str; 9] = [
        "AVAILABLE",
        "BLOCKED",
        "CHARGING",
        "INOPERATIVE",
        "OUTOFORDER",
        "PLANNED",
        "REMOVED",
        "RESERVED",
        "UNKNOWN",
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Status::Available => "AVAILABLE",
            Status::Blocked => "BLOCKED",
            Status::Charging => "CHARGING",
            Status::Inoperative => "INOPERATIVE",
            Status::OutOfOrder => "OUTOFORDER",
            Status::Planned => "PLANNED",
            Status::Removed => "REMOVED",
            Status::Reserved => "RESERVED",
            Status::Unknown => "UNKNOWN",
            Status::Other(s) => s,
        }
    }
}

impl From<String> for Status {
    fn from(s: String) -> Self {
        match s.as_str() {
            "AVAILABLE" => Status::Available,
            "BLOCKED" => Status::Blocked,
            "CHARGING" => Status::Charging,
            "INOPERATIVE" => Status::Inoperative,
            "OUTOFORDER" => Status::OutOfOrder,
            "PLANNED" => Status::Planned,
            "REMOVED" => Status::Removed,
            "RESERVED" => Status::Reserved,
            "UNKNOWN" => Status::Unknown,
            _ => Status::Other(s),
        }
    }
}

impl From<Status> for String {
    fn from(status: Status) -> Self {
        match status {
            Status::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connector {
    pub id: String,
    #[serde(default)]
    pub status: Option<Status>,
    pub standard: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub power_type: Option<String>,
    #[serde(default)]
    pub ampere: Option<u32>,
    #[serde(default)]
    pub voltage: Option<u32>,
    /// Watts
    #[serde(default)]
    pub max_power: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evse {
    pub id: String,
    pub status: Status,
    #[serde(default)]
    pub connectors: Vec<Connector>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: String,
    pub longitude: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
    #[serde(default)]
    pub evses: Vec<Evse>,
}

impl Location {
    pub fn evse(&self, evse_id: &str) -> Option<&Evse> {
        self.evses.iter().find(|evse| evse.id == evse_id)
    }
}

/// State carried from one smart call to the next
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SmartCallData {
    /// Operator that last answered for the EVSE
    pub operator_id: Option<String>,
    /// Empty answers from `operator_id` in a row
    pub empty_answers: u32,
    pub last_success: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct LocationsResponse {
    #[serde(default)]
    data: Vec<Location>,
}

/// Remote chargecloud API
#[async_trait]
pub trait ChargecloudApi: Send + Sync {
    /// All locations the API reports for `evse_id`; empty if unknown
    async fn location_by_evse_id(&self, evse_id: &EvseId) -> Result<Vec<Location>, ApiError>;

    /// Incremental call; `None` location means no news this time
    async fn perform_smart_api_call(
        &self,
        evse_id: &EvseId,
        previous: Option<SmartCallData>,
    ) -> Result<(Option<Location>, SmartCallData), ApiError>;
}

/// The location holding `evse_id`
fn pick_location(locations: Vec<Location>, evse_id: &EvseId) -> Option<Location> {
    locations
        .into_iter()
        .find(|location| location.evse(evse_id.as_str()).is_some())
}

/// reqwest implementation of [`ChargecloudApi`]
#[derive(Clone)]
pub struct ChargecloudClient {
    base_url: String,
    operators: Vec<String>,
    client: Client,
}

impl ChargecloudClient {
    pub fn new(base_url: impl Into<String>, operators: Vec<String>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("homeassistant-chargecloud/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ApiError::Http)?;

        let operators = if operators.is_empty() {
            DEFAULT_OPERATORS.iter().map(|s| s.to_string()).collect()
        } else {
            operators
        };

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            operators,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn operators(&self) -> &[String] {
        &self.operators
    }

    async fn fetch(&self, operator: &str, evse_id: &EvseId) -> Result<Vec<Location>, ApiError> {
        let url = format!("{}/{}/app/2.0/locations", self.base_url, operator);
        debug!("Querying {} for EVSE {}", url, evse_id);

        let response = self
            .client
            .get(&url)
            .query(&[("evse", evse_id.as_str())])
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let body = response.text().await?;
                let parsed: LocationsResponse =
                    serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))?;
                debug!(
                    "Operator {} returned {} locations for {}",
                    operator,
                    parsed.data.len(),
                    evse_id
                );
                Ok(parsed.data)
            }
            status => Err(ApiError::Status {
                status: status.as_u16(),
                url,
            }),
        }
    }

    /// First operator with a non-empty answer. Errors only surface when no
    /// operator answered at all.
    async fn find_operator(
        &self,
        evse_id: &EvseId,
    ) -> Result<Option<(String, Vec<Location>)>, ApiError> {
        let mut last_error = None;
        let mut answered = false;

        for operator in &self.operators {
            match self.fetch(operator, evse_id).await {
                Ok(locations) if !locations.is_empty() => {
                    return Ok(Some((operator.clone(), locations)));
                }
                Ok(_) => answered = true,
                Err(err) => {
                    debug!("Operator {} failed for {}: {}", operator, evse_id, err);
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err) if !answered => Err(err),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl ChargecloudApi for ChargecloudClient {
    async fn location_by_evse_id(&self, evse_id: &EvseId) -> Result<Vec<Location>, ApiError> {
        Ok(self
            .find_operator(evse_id)
            .await?
            .map(|(_, locations)| locations)
            .unwrap_or_default())
    }

    async fn perform_smart_api_call(
        &self,
        evse_id: &EvseId,
        previous: Option<SmartCallData>,
    ) -> Result<(Option<Location>, SmartCallData), ApiError> {
        let mut state = previous.unwrap_or_default();

        if let Some(operator) = state.operator_id.clone() {
            let locations = self.fetch(&operator, evse_id).await?;
            return match pick_location(locations, evse_id) {
                Some(location) => {
                    state.empty_answers = 0;
                    state.last_success = Some(Utc::now());
                    Ok((Some(location), state))
                }
                None => {
                    state.empty_answers += 1;
                    if state.empty_answers >= MAX_EMPTY_ANSWERS {
                        warn!(
                            "Operator {} stopped answering for {}, asking all operators next time",
                            operator, evse_id
                        );
                        state.operator_id = None;
                        state.empty_answers = 0;
                    }
                    Ok((None, state))
                }
            };
        }

        match self.find_operator(evse_id).await? {
            Some((operator, locations)) => {
                let location = pick_location(locations, evse_id);
                // An answer without our EVSE counts as an empty one
                let state = SmartCallData {
                    operator_id: Some(operator),
                    empty_answers: if location.is_some() { 0 } else { 1 },
                    last_success: location.as_ref().map(|_| Utc::now()).or(state.last_success),
                };
                Ok((location, state))
            }
            None => Ok((None, state)),
        }
    }
}
