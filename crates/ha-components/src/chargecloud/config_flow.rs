//! Config flow for chargecloud
//!
//! Asks for an EVSE id, checks its syntax, looks it up once and stores the
//! id the API uses for it. Failures come back as symbolic error keys; the
//! underlying cause is only logged.

use async_trait::async_trait;
use ha_config_entries::{
    ConfigFlow, FlowContext, FlowInput, FlowResult, FormField, ABORT_ALREADY_CONFIGURED,
    BASE_ERROR_KEY,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::api::Location;
use super::evse_id::{validate_evse_id, EvseId};
use super::{ApiFactory, ChargecloudConfig, CONF_BASE_URL, CONF_EVSE_ID};

/// Bound for the validation lookup
pub const FLOW_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigFlowError {
    #[error("malformed EVSE id")]
    MalformedEvseId,

    #[error("cannot connect to chargecloud")]
    CannotConnect,

    #[error("chargecloud knows no location for this EVSE id")]
    EmptyResponse,

    #[error("unexpected response")]
    Unknown,
}

impl ConfigFlowError {
    /// Translation key shown to the user
    pub fn key(&self) -> &'static str {
        match self {
            ConfigFlowError::MalformedEvseId => "malformed_evse_id",
            ConfigFlowError::CannotConnect => "cannot_connect",
            ConfigFlowError::EmptyResponse => "empty_response",
            ConfigFlowError::Unknown => "unknown",
        }
    }

    /// Form field the error belongs to
    pub fn field(&self) -> &'static str {
        match self {
            ConfigFlowError::MalformedEvseId => CONF_EVSE_ID,
            _ => BASE_ERROR_KEY,
        }
    }
}

/// Id to store for `requested`: the requested id if the API reports it
/// verbatim, else an id that differs only in `*` and case, else the first
/// EVSE the API returned.
pub fn canonical_evse_id(locations: &[Location], requested: &EvseId) -> Option<EvseId> {
    let evses = || locations.iter().flat_map(|location| location.evses.iter());

    if evses().any(|evse| evse.id == requested.as_str()) {
        return Some(requested.clone());
    }
    evses()
        .find(|evse| requested.loosely_matches(&evse.id))
        .or_else(|| evses().next())
        .map(|evse| EvseId::from_trusted(evse.id.clone()))
}

pub struct ChargecloudConfigFlow {
    config: Arc<ChargecloudConfig>,
    api_factory: ApiFactory,
}

impl ChargecloudConfigFlow {
    pub fn new(config: Arc<ChargecloudConfig>, api_factory: ApiFactory) -> Self {
        Self {
            config,
            api_factory,
        }
    }

    fn schema() -> Vec<FormField> {
        vec![
            FormField::required(CONF_EVSE_ID, "string"),
            FormField::optional(CONF_BASE_URL, "string"),
        ]
    }

    fn is_configured(ctx: &FlowContext, evse_id: &str) -> bool {
        ctx.current_entries().iter().any(|entry| {
            entry.data_str(CONF_EVSE_ID) == Some(evse_id)
                || entry.unique_id.as_deref() == Some(evse_id)
        })
    }

    /// Look `evse_id` up and resolve the id to store
    async fn validate(&self, evse_id: &EvseId, base_url: &str) -> Result<EvseId, ConfigFlowError> {
        let api = (self.api_factory)(base_url).map_err(|err| {
            error!("Cannot create chargecloud client for {}: {}", base_url, err);
            ConfigFlowError::CannotConnect
        })?;

        let locations =
            match tokio::time::timeout(FLOW_REQUEST_TIMEOUT, api.location_by_evse_id(evse_id))
                .await
            {
                Ok(Ok(locations)) => locations,
                Ok(Err(err)) => {
                    warn!("Lookup of {} failed: {}", evse_id, err);
                    return Err(ConfigFlowError::CannotConnect);
                }
                Err(_) => {
                    warn!("Lookup of {} timed out after {:?}", evse_id, FLOW_REQUEST_TIMEOUT);
                    return Err(ConfigFlowError::CannotConnect);
                }
            };

        if locations.is_empty() {
            debug!("No location for {}", evse_id);
            return Err(ConfigFlowError::EmptyResponse);
        }

        canonical_evse_id(&locations, evse_id).ok_or_else(|| {
            error!(
                "Locations for {} contain no EVSE: {:?}",
                evse_id, locations
            );
            ConfigFlowError::Unknown
        })
    }

    /// Shared by both steps; `Err` is reported as a form error or an abort
    /// depending on the step
    async fn evaluate(
        &self,
        ctx: &FlowContext,
        input: &FlowInput,
    ) -> Result<FlowResult, ConfigFlowError> {
        let raw_id = input
            .get(CONF_EVSE_ID)
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        if Self::is_configured(ctx, raw_id) {
            return Ok(FlowResult::abort(ABORT_ALREADY_CONFIGURED));
        }

        let evse_id = validate_evse_id(raw_id).map_err(|err| {
            debug!("{}", err);
            ConfigFlowError::MalformedEvseId
        })?;

        let base_url_override = input
            .get(CONF_BASE_URL)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty());
        let base_url = self.config.resolve_base_url(base_url_override);

        let canonical = self.validate(&evse_id, &base_url).await?;
        if canonical != evse_id {
            info!("Using canonical EVSE id {} for {}", canonical, evse_id);
            if Self::is_configured(ctx, canonical.as_str()) {
                return Ok(FlowResult::abort(ABORT_ALREADY_CONFIGURED));
            }
        }

        let mut data = HashMap::from([(CONF_EVSE_ID.to_string(), json!(canonical.as_str()))]);
        if let Some(base_url) = base_url_override {
            data.insert(CONF_BASE_URL.to_string(), json!(base_url));
        }

        Ok(FlowResult::create_entry(canonical.as_str(), data).with_unique_id(canonical.as_str()))
    }
}

#[async_trait]
impl ConfigFlow for ChargecloudConfigFlow {
    async fn step_user(&self, ctx: &FlowContext, user_input: Option<FlowInput>) -> FlowResult {
        let Some(input) = user_input else {
            return FlowResult::form("user", Self::schema(), HashMap::new());
        };

        match self.evaluate(ctx, &input).await {
            Ok(result) => result,
            Err(err) => {
                let errors = HashMap::from([(err.field().to_string(), err.key().to_string())]);
                FlowResult::form("user", Self::schema(), errors)
            }
        }
    }

    async fn step_import(&self, ctx: &FlowContext, import_data: FlowInput) -> FlowResult {
        match self.evaluate(ctx, &import_data).await {
            Ok(result) => result,
            Err(err) => {
                warn!(
                    "Import of {:?} from configuration.yaml failed: {}",
                    import_data.get(CONF_EVSE_ID),
                    err
                );
                FlowResult::abort(err.key())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chargecloud::api::testing::{location, FakeApi};
    use crate::chargecloud::api::ChargecloudApi;
    use crate::chargecloud::DOMAIN;
    use ha_config_entries::{
        ConfigEntries, ConfigEntry, ConfigEntrySource, FlowManager, FlowResultType, Storage,
    };
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const EVSE: &str = "DE*ABC*E1234";

    struct Harness {
        _dir: TempDir,
        entries: Arc<ConfigEntries>,
        flows: FlowManager,
        api: Arc<FakeApi>,
        base_urls: Arc<Mutex<Vec<String>>>,
    }

    fn harness(api: FakeApi, config: ChargecloudConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let entries = Arc::new(ConfigEntries::new(Arc::new(Storage::new(dir.path()))));
        let flows = FlowManager::new(entries.clone());
        let api = Arc::new(api);
        let base_urls = Arc::new(Mutex::new(Vec::new()));

        let factory_api = api.clone();
        let seen = base_urls.clone();
        let factory: ApiFactory = Arc::new(move |base_url: &str| {
            seen.lock().unwrap().push(base_url.to_string());
            Ok(factory_api.clone() as Arc<dyn ChargecloudApi>)
        });
        flows.register(
            DOMAIN,
            Arc::new(ChargecloudConfigFlow::new(Arc::new(config), factory)),
        );

        Harness {
            _dir: dir,
            entries,
            flows,
            api,
            base_urls,
        }
    }

    fn input(evse_id: &str) -> FlowInput {
        HashMap::from([(CONF_EVSE_ID.to_string(), json!(evse_id))])
    }

    async fn submit(h: &Harness, evse_id: &str) -> FlowResult {
        h.flows
            .start_flow(DOMAIN, ConfigEntrySource::User, Some(input(evse_id)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_initial_form() {
        let h = harness(FakeApi::default(), ChargecloudConfig::default());
        let form = h
            .flows
            .start_flow(DOMAIN, ConfigEntrySource::User, None)
            .await
            .unwrap();
        assert_eq!(form.result_type, FlowResultType::Form);
        assert_eq!(form.data_schema[0].name, CONF_EVSE_ID);
        assert!(form.data_schema[0].required);
        assert!(!form.data_schema[1].required);
    }

    #[tokio::test]
    async fn test_creates_entry() {
        let h = harness(
            FakeApi::with_lookup(vec![location(EVSE, &["IEC_62196_T2"])]),
            ChargecloudConfig::default(),
        );
        let result = submit(&h, EVSE).await;

        assert_eq!(result.result_type, FlowResultType::CreateEntry);
        assert_eq!(result.title.as_deref(), Some(EVSE));
        let entry = h.entries.get_by_unique_id(DOMAIN, EVSE).unwrap();
        assert_eq!(entry.data_str(CONF_EVSE_ID), Some(EVSE));
        assert_eq!(entry.data_str(CONF_BASE_URL), None);
        assert_eq!(h.api.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_id_no_api_call() {
        let h = harness(FakeApi::default(), ChargecloudConfig::default());
        let result = submit(&h, "DE*AB*E1").await;

        assert_eq!(result.result_type, FlowResultType::Form);
        assert_eq!(result.errors.unwrap()[CONF_EVSE_ID], "malformed_evse_id");
        assert_eq!(h.api.lookups.load(Ordering::SeqCst), 0);
        assert!(h.entries.is_empty());
    }

    #[tokio::test]
    async fn test_missing_id_is_malformed() {
        let h = harness(FakeApi::default(), ChargecloudConfig::default());
        let result = h
            .flows
            .start_flow(DOMAIN, ConfigEntrySource::User, Some(HashMap::new()))
            .await
            .unwrap();
        assert_eq!(result.errors.unwrap()[CONF_EVSE_ID], "malformed_evse_id");
    }

    #[tokio::test]
    async fn test_form_can_be_resubmitted() {
        let h = harness(
            FakeApi::with_lookup(vec![location(EVSE, &[])]),
            ChargecloudConfig::default(),
        );
        let first = submit(&h, "not-an-id").await;
        assert_eq!(first.result_type, FlowResultType::Form);

        let second = h.flows.progress_flow(&first.flow_id, input(EVSE)).await.unwrap();
        assert_eq!(second.result_type, FlowResultType::CreateEntry);
    }

    #[tokio::test]
    async fn test_api_failure_cannot_connect() {
        let h = harness(FakeApi::failing("connection refused"), ChargecloudConfig::default());
        let result = submit(&h, EVSE).await;
        assert_eq!(result.errors.unwrap()[BASE_ERROR_KEY], "cannot_connect");
        assert!(h.entries.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_api_cannot_connect() {
        let api = FakeApi::with_lookup(vec![location(EVSE, &[])]);
        api.set_delay(Duration::from_secs(60));
        let h = harness(api, ChargecloudConfig::default());

        let result = submit(&h, EVSE).await;
        assert_eq!(result.errors.unwrap()[BASE_ERROR_KEY], "cannot_connect");
    }

    #[tokio::test]
    async fn test_empty_response() {
        let h = harness(FakeApi::with_lookup(Vec::new()), ChargecloudConfig::default());
        let result = submit(&h, EVSE).await;
        assert_eq!(result.errors.unwrap()[BASE_ERROR_KEY], "empty_response");
    }

    #[tokio::test]
    async fn test_location_without_evses_unknown() {
        let mut loc = location(EVSE, &[]);
        loc.evses.clear();
        let h = harness(FakeApi::with_lookup(vec![loc]), ChargecloudConfig::default());
        let result = submit(&h, EVSE).await;
        assert_eq!(result.errors.unwrap()[BASE_ERROR_KEY], "unknown");
    }

    #[tokio::test]
    async fn test_canonical_id_stored() {
        let h = harness(
            FakeApi::with_lookup(vec![location(EVSE, &[])]),
            ChargecloudConfig::default(),
        );
        let result = submit(&h, "DEABCE1234").await;

        assert_eq!(result.result_type, FlowResultType::CreateEntry);
        assert_eq!(result.unique_id.as_deref(), Some(EVSE));
        let entry = h.entries.get_by_unique_id(DOMAIN, EVSE).unwrap();
        assert_eq!(entry.title, EVSE);
        assert_eq!(entry.data_str(CONF_EVSE_ID), Some(EVSE));
    }

    #[tokio::test]
    async fn test_duplicate_aborts_before_lookup() {
        let h = harness(
            FakeApi::with_lookup(vec![location(EVSE, &[])]),
            ChargecloudConfig::default(),
        );
        h.entries
            .add(
                ConfigEntry::new(DOMAIN, EVSE)
                    .with_data(input(EVSE))
                    .with_unique_id(EVSE),
            )
            .await
            .unwrap();

        let result = submit(&h, EVSE).await;
        assert_eq!(result.result_type, FlowResultType::Abort);
        assert_eq!(result.reason.as_deref(), Some(ABORT_ALREADY_CONFIGURED));
        assert_eq!(h.api.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_duplicate_after_canonicalization_aborts() {
        let h = harness(
            FakeApi::with_lookup(vec![location(EVSE, &[])]),
            ChargecloudConfig::default(),
        );
        h.entries
            .add(
                ConfigEntry::new(DOMAIN, EVSE)
                    .with_data(input(EVSE))
                    .with_unique_id(EVSE),
            )
            .await
            .unwrap();

        let result = submit(&h, "DEABCE1234").await;
        assert_eq!(result.reason.as_deref(), Some(ABORT_ALREADY_CONFIGURED));
        assert_eq!(h.api.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(h.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_base_url_precedence() {
        let config = ChargecloudConfig {
            base_url: Some("http://global.example".into()),
            ..ChargecloudConfig::default()
        };
        let h = harness(FakeApi::with_lookup(vec![location(EVSE, &[])]), config);

        let mut with_override = input(EVSE);
        with_override.insert(CONF_BASE_URL.into(), json!("http://entry.example"));
        let result = h
            .flows
            .start_flow(DOMAIN, ConfigEntrySource::User, Some(with_override))
            .await
            .unwrap();
        let entry = h.entries.get(result.entry_id.as_deref().unwrap()).unwrap();
        assert_eq!(entry.data_str(CONF_BASE_URL), Some("http://entry.example"));

        submit(&h, "+49*123*4567").await;
        assert_eq!(
            *h.base_urls.lock().unwrap(),
            vec!["http://entry.example".to_string(), "http://global.example".to_string()]
        );
    }

    #[tokio::test]
    async fn test_import_aborts_with_error_key() {
        let h = harness(FakeApi::with_lookup(Vec::new()), ChargecloudConfig::default());
        let result = h
            .flows
            .start_flow(DOMAIN, ConfigEntrySource::Import, Some(input(EVSE)))
            .await
            .unwrap();
        assert_eq!(result.result_type, FlowResultType::Abort);
        assert_eq!(result.reason.as_deref(), Some("empty_response"));
        assert!(h.flows.list_flows().is_empty());
    }

    #[test]
    fn test_canonical_resolution_order() {
        let requested: EvseId = "DEABCE1234".parse().unwrap();
        let mut loc = location("DE*XYZ*E1", &[]);
        let mut second = loc.evses[0].clone();
        second.id = "DE*ABC*E1234".into();
        loc.evses.push(second);

        let canonical = canonical_evse_id(&[loc.clone()], &requested).unwrap();
        assert_eq!(canonical.as_str(), "DE*ABC*E1234");

        let exact: EvseId = "DE*XYZ*E1".parse().unwrap();
        assert_eq!(canonical_evse_id(&[loc.clone()], &exact), Some(exact));

        let unrelated: EvseId = "FR*QQQ*E5".parse().unwrap();
        assert_eq!(
            canonical_evse_id(&[loc], &unrelated).unwrap().as_str(),
            "DE*XYZ*E1"
        );
        assert_eq!(canonical_evse_id(&[], &unrelated), None);
    }
}
