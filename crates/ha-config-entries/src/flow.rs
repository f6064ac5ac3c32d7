//! Config flows
//!
//! A config flow walks the user (or an import from configuration.yaml)
//! through the steps that produce a config entry. Integrations implement
//! [`ConfigFlow`]; the [`FlowManager`] tracks flows in progress and turns a
//! `create_entry` result into a stored, set up [`ConfigEntry`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::entry::{ConfigEntry, ConfigEntrySource};
use crate::manager::{ConfigEntries, ConfigEntriesError};

/// Submitted form values keyed by field name
pub type FlowInput = HashMap<String, serde_json::Value>;

/// Abort reason used when the entry already exists
pub const ABORT_ALREADY_CONFIGURED: &str = "already_configured";

/// Error key for form-wide (not field-specific) errors
pub const BASE_ERROR_KEY: &str = "base";

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("No config flow registered for {0}")]
    UnknownHandler(String),

    #[error("Flow not found: {0}")]
    UnknownFlow(String),

    #[error("Flow {handler} has no step {step_id}")]
    UnknownStep { handler: String, step_id: String },

    #[error("Step {0} requires input")]
    MissingInput(String),

    #[error(transparent)]
    Entries(#[from] ConfigEntriesError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowResultType {
    Form,
    CreateEntry,
    Abort,
}

/// Form field schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl FormField {
    pub fn required(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, field_type)
        }
    }
}

/// Result of a config flow step
#[derive(Debug, Clone, Serialize)]
pub struct FlowResult {
    pub flow_id: String,
    /// Integration domain
    pub handler: String,
    #[serde(rename = "type")]
    pub result_type: FlowResultType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub data_schema: Vec<FormField>,
    /// Field name (or `base`) to translation key
    pub errors: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Entry data for `create_entry`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<FlowInput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,
    /// Set once the manager stored the entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
}

impl FlowResult {
    fn empty(result_type: FlowResultType) -> Self {
        Self {
            flow_id: String::new(),
            handler: String::new(),
            result_type,
            step_id: None,
            data_schema: Vec::new(),
            errors: None,
            title: None,
            reason: None,
            data: None,
            unique_id: None,
            entry_id: None,
        }
    }

    /// Show (or re-show) a form; `errors` empty means a fresh form
    pub fn form(
        step_id: impl Into<String>,
        data_schema: Vec<FormField>,
        errors: HashMap<String, String>,
    ) -> Self {
        Self {
            step_id: Some(step_id.into()),
            data_schema,
            errors: (!errors.is_empty()).then_some(errors),
            ..Self::empty(FlowResultType::Form)
        }
    }

    pub fn create_entry(title: impl Into<String>, data: FlowInput) -> Self {
        Self {
            title: Some(title.into()),
            data: Some(data),
            ..Self::empty(FlowResultType::CreateEntry)
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::empty(FlowResultType::Abort)
        }
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }
}

/// What a flow step can see of the running instance
pub struct FlowContext {
    pub flow_id: String,
    pub handler: String,
    pub source: ConfigEntrySource,
    entries: Arc<ConfigEntries>,
}

impl FlowContext {
    /// Existing entries of this flow's domain
    pub fn current_entries(&self) -> Vec<ConfigEntry> {
        self.entries.get_by_domain(&self.handler)
    }
}

/// Config flow of one integration
#[async_trait]
pub trait ConfigFlow: Send + Sync {
    /// Interactive step; `None` input asks for the initial form
    async fn step_user(&self, ctx: &FlowContext, user_input: Option<FlowInput>) -> FlowResult;

    /// Import from configuration.yaml
    async fn step_import(&self, ctx: &FlowContext, import_data: FlowInput) -> FlowResult {
        self.step_user(ctx, Some(import_data)).await
    }
}

/// A flow waiting for further input
#[derive(Debug, Clone, Serialize)]
pub struct FlowProgress {
    pub flow_id: String,
    pub handler: String,
    pub source: ConfigEntrySource,
    pub step_id: String,
}

/// Runs config flows and stores the entries they create
pub struct FlowManager {
    entries: Arc<ConfigEntries>,
    handlers: DashMap<String, Arc<dyn ConfigFlow>>,
    in_progress: DashMap<String, FlowProgress>,
}

impl FlowManager {
    pub fn new(entries: Arc<ConfigEntries>) -> Self {
        Self {
            entries,
            handlers: DashMap::new(),
            in_progress: DashMap::new(),
        }
    }

    pub fn register(&self, domain: &str, flow: Arc<dyn ConfigFlow>) {
        self.handlers.insert(domain.to_string(), flow);
        debug!("Registered config flow for domain: {}", domain);
    }

    /// Start a flow for `handler` at the step matching `source`
    pub async fn start_flow(
        &self,
        handler: &str,
        source: ConfigEntrySource,
        input: Option<FlowInput>,
    ) -> Result<FlowResult, FlowError> {
        let progress = FlowProgress {
            flow_id: ulid::Ulid::new().to_string(),
            handler: handler.to_string(),
            source,
            step_id: source.step_id().to_string(),
        };
        self.run_step(progress, input).await
    }

    /// Continue a flow that showed a form
    pub async fn progress_flow(
        &self,
        flow_id: &str,
        user_input: FlowInput,
    ) -> Result<FlowResult, FlowError> {
        let progress = self
            .in_progress
            .get(flow_id)
            .map(|p| p.value().clone())
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))?;
        self.run_step(progress, Some(user_input)).await
    }

    pub fn list_flows(&self) -> Vec<FlowProgress> {
        self.in_progress.iter().map(|p| p.value().clone()).collect()
    }

    pub fn abort_flow(&self, flow_id: &str) -> Result<(), FlowError> {
        self.in_progress
            .remove(flow_id)
            .map(|_| ())
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))
    }

    async fn run_step(
        &self,
        mut progress: FlowProgress,
        input: Option<FlowInput>,
    ) -> Result<FlowResult, FlowError> {
        let flow = self
            .handlers
            .get(&progress.handler)
            .map(|f| f.value().clone())
            .ok_or_else(|| FlowError::UnknownHandler(progress.handler.clone()))?;

        let ctx = FlowContext {
            flow_id: progress.flow_id.clone(),
            handler: progress.handler.clone(),
            source: progress.source,
            entries: self.entries.clone(),
        };

        let mut result = match progress.step_id.as_str() {
            "user" => flow.step_user(&ctx, input).await,
            "import" => {
                let data = input.ok_or_else(|| FlowError::MissingInput("import".into()))?;
                flow.step_import(&ctx, data).await
            }
            other => {
                return Err(FlowError::UnknownStep {
                    handler: progress.handler.clone(),
                    step_id: other.to_string(),
                })
            }
        };
        result.flow_id = progress.flow_id.clone();
        result.handler = progress.handler.clone();

        match result.result_type {
            FlowResultType::Form => {
                if let Some(ref step_id) = result.step_id {
                    progress.step_id = step_id.clone();
                }
                self.in_progress.insert(progress.flow_id.clone(), progress);
                Ok(result)
            }
            FlowResultType::Abort => {
                self.in_progress.remove(&progress.flow_id);
                debug!(
                    "Flow {} for {} aborted: {:?}",
                    progress.flow_id, progress.handler, result.reason
                );
                Ok(result)
            }
            FlowResultType::CreateEntry => {
                self.in_progress.remove(&progress.flow_id);
                self.create_entry(result, &progress).await
            }
        }
    }

    async fn create_entry(
        &self,
        mut result: FlowResult,
        progress: &FlowProgress,
    ) -> Result<FlowResult, FlowError> {
        let mut entry = ConfigEntry::new(
            progress.handler.clone(),
            result.title.clone().unwrap_or_default(),
        )
        .with_data(result.data.clone().unwrap_or_default())
        .with_source(progress.source);
        if let Some(ref unique_id) = result.unique_id {
            entry = entry.with_unique_id(unique_id.clone());
        }

        let entry = match self.entries.add(entry).await {
            Ok(entry) => entry,
            // Lost a race against another flow for the same device
            Err(ConfigEntriesError::AlreadyExists { .. }) => {
                let mut abort = FlowResult::abort(ABORT_ALREADY_CONFIGURED);
                abort.flow_id = result.flow_id;
                abort.handler = result.handler;
                return Ok(abort);
            }
            Err(err) => return Err(err.into()),
        };
        info!(
            "Flow {} created entry {} for {}",
            progress.flow_id, entry.entry_id, progress.handler
        );

        // The entry exists now; setup problems are tracked on the entry itself
        if let Err(err) = self.entries.setup(&entry.entry_id).await {
            warn!("Setup of new entry {} failed: {}", entry.entry_id, err);
        }

        result.entry_id = Some(entry.entry_id);
        Ok(result)
    }
}
