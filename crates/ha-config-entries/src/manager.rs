//! Config Entries Manager
//!
//! Owns all config entries, persists them, and drives their lifecycle
//! through the integration registered for each domain.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::entry::{ConfigEntry, ConfigEntryState, ConfigEntryUpdate};
use crate::state_machine::{calculate_retry_delay, InvalidTransition};
use ha_registries::{Storable, Storage, StorageError, StorageResult};

/// Storage key for config entries
pub const STORAGE_KEY: &str = "core.config_entries";
pub const STORAGE_VERSION: u32 = 1;
pub const STORAGE_MINOR_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ConfigEntriesError {
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists for domain {domain} with unique_id {unique_id}")]
    AlreadyExists { domain: String, unique_id: String },

    #[error("Cannot unload entry in state {0:?}")]
    CannotUnload(ConfigEntryState),

    #[error(transparent)]
    InvalidState(#[from] InvalidTransition),

    #[error("No integration registered for domain {0}")]
    IntegrationNotFound(String),

    /// Setup will be retried automatically
    #[error("Integration not ready: {0}")]
    NotReady(String),

    #[error("Setup failed: {0}")]
    SetupFailed(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type ConfigEntriesResult<T> = Result<T, ConfigEntriesError>;

/// Failure reported by an integration's `setup_entry`
#[derive(Debug, Error)]
pub enum SetupError {
    /// Transient problem (device offline, API down); setup is retried
    #[error("{0}")]
    NotReady(String),

    #[error("{0}")]
    Failed(String),
}

/// Per-domain integration entry points
#[async_trait]
pub trait IntegrationHandler: Send + Sync {
    async fn setup_entry(&self, entry: &ConfigEntry) -> Result<(), SetupError>;

    /// Returns false if the integration could not release the entry
    async fn unload_entry(&self, entry: &ConfigEntry) -> bool;

    /// Clean up what the entry left behind once it is deleted
    async fn remove_entry(&self, _entry: &ConfigEntry) {}
}

/// Config entries data for storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigEntriesData {
    pub entries: Vec<ConfigEntry>,
}

impl Storable for ConfigEntriesData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Config Entries Manager
pub struct ConfigEntries {
    storage: Arc<Storage>,

    /// Primary index: entry_id -> ConfigEntry
    entries: DashMap<String, ConfigEntry>,

    /// Index: domain -> set of entry_ids
    by_domain: DashMap<String, HashSet<String>>,

    /// Index: (domain, unique_id) -> entry_id
    by_unique_id: DashMap<(String, String), String>,

    /// Serializes setup/unload across entries
    setup_lock: Mutex<()>,

    integrations: DashMap<String, Arc<dyn IntegrationHandler>>,

    /// Pending setup retries by entry_id
    retries: DashMap<String, JoinHandle<()>>,
}

impl ConfigEntries {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            entries: DashMap::new(),
            by_domain: DashMap::new(),
            by_unique_id: DashMap::new(),
            setup_lock: Mutex::new(()),
            integrations: DashMap::new(),
            retries: DashMap::new(),
        }
    }

    /// Load entries from storage
    pub async fn load(&self) -> StorageResult<()> {
        if let Some(data) = self.storage.load::<ConfigEntriesData>().await? {
            info!("Loading {} config entries from storage", data.entries.len());
            for entry in data.entries {
                self.index_entry(&entry);
            }
        }
        Ok(())
    }

    pub async fn save(&self) -> StorageResult<()> {
        let data = ConfigEntriesData {
            entries: self.entries.iter().map(|r| r.value().clone()).collect(),
        };
        self.storage.save(&data).await?;
        debug!("Saved {} config entries to storage", data.entries.len());
        Ok(())
    }

    fn index_entry(&self, entry: &ConfigEntry) {
        self.entries.insert(entry.entry_id.clone(), entry.clone());
        self.by_domain
            .entry(entry.domain.clone())
            .or_default()
            .insert(entry.entry_id.clone());
        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id.insert(
                (entry.domain.clone(), unique_id.clone()),
                entry.entry_id.clone(),
            );
        }
    }

    fn unindex_entry(&self, entry: &ConfigEntry) {
        if let Some(mut ids) = self.by_domain.get_mut(&entry.domain) {
            ids.remove(&entry.entry_id);
        }
        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .remove(&(entry.domain.clone(), unique_id.clone()));
        }
        self.entries.remove(&entry.entry_id);
    }

    pub fn get(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.entries.get(entry_id).map(|r| r.value().clone())
    }

    pub fn get_by_domain(&self, domain: &str) -> Vec<ConfigEntry> {
        let ids: Vec<String> = self
            .by_domain
            .get(domain)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn get_by_unique_id(&self, domain: &str, unique_id: &str) -> Option<ConfigEntry> {
        let entry_id = self
            .by_unique_id
            .get(&(domain.to_string(), unique_id.to_string()))
            .map(|r| r.value().clone())?;
        self.get(&entry_id)
    }

    /// Add and persist a new entry
    pub async fn add(&self, entry: ConfigEntry) -> ConfigEntriesResult<ConfigEntry> {
        if let Some(ref unique_id) = entry.unique_id {
            if self.get_by_unique_id(&entry.domain, unique_id).is_some() {
                return Err(ConfigEntriesError::AlreadyExists {
                    domain: entry.domain.clone(),
                    unique_id: unique_id.clone(),
                });
            }
        }

        self.index_entry(&entry);
        self.save().await?;

        info!(
            "Added config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry.entry_id
        );
        Ok(entry)
    }

    pub async fn update(
        &self,
        entry_id: &str,
        update: ConfigEntryUpdate,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let updated = {
            let mut entry = self
                .entries
                .get_mut(entry_id)
                .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
            update.apply(&mut entry);
            entry.clone()
        };

        self.save().await?;
        debug!("Updated config entry: {}", entry_id);
        Ok(updated)
    }

    /// Unload (if needed) and delete an entry
    pub async fn remove(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntry> {
        match self.unload(entry_id).await {
            Ok(_) => {}
            Err(ConfigEntriesError::NotFound(id)) => return Err(ConfigEntriesError::NotFound(id)),
            Err(err) => warn!("Removing entry {} despite unload error: {}", entry_id, err),
        }

        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        self.unindex_entry(&entry);
        self.save().await?;

        let handler = self
            .integrations
            .get(&entry.domain)
            .map(|h| h.value().clone());
        if let Some(handler) = handler {
            handler.remove_entry(&entry).await;
        }

        info!(
            "Removed config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry_id
        );
        Ok(entry)
    }

    /// Register the integration that sets up entries of `domain`
    pub fn register_integration(&self, domain: &str, handler: Arc<dyn IntegrationHandler>) {
        self.integrations.insert(domain.to_string(), handler);
        debug!("Registered integration for domain: {}", domain);
    }

    fn transition(
        &self,
        entry_id: &str,
        state: ConfigEntryState,
        reason: Option<String>,
    ) -> ConfigEntriesResult<()> {
        let mut entry = self
            .entries
            .get_mut(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        entry.try_set_state(state, reason)?;
        debug!("Entry {} state changed to {:?}", entry_id, state);
        Ok(())
    }

    /// Set up an entry through its integration.
    ///
    /// A `NotReady` answer moves the entry to `SetupRetry` and schedules
    /// another attempt with exponential backoff.
    pub async fn setup(self: &Arc<Self>, entry_id: &str) -> ConfigEntriesResult<()> {
        let _lock = self.setup_lock.lock().await;
        self.cancel_retry(entry_id);

        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        let handler = self
            .integrations
            .get(&entry.domain)
            .map(|h| h.value().clone())
            .ok_or_else(|| ConfigEntriesError::IntegrationNotFound(entry.domain.clone()))?;

        self.transition(entry_id, ConfigEntryState::SetupInProgress, None)?;

        match handler.setup_entry(&entry).await {
            Ok(()) => {
                self.transition(entry_id, ConfigEntryState::Loaded, None)?;
                info!("Setup completed for entry: {} ({})", entry.title, entry_id);
                Ok(())
            }
            Err(SetupError::NotReady(reason)) => {
                self.transition(
                    entry_id,
                    ConfigEntryState::SetupRetry,
                    Some(reason.clone()),
                )?;
                let delay = calculate_retry_delay(entry.tries);
                if let Some(mut stored) = self.entries.get_mut(entry_id) {
                    stored.tries = entry.tries + 1;
                }
                warn!(
                    "Config entry '{}' for {} not ready yet: {}; retrying in {:?}",
                    entry.title, entry.domain, reason, delay
                );
                self.schedule_retry(entry_id, delay);
                Err(ConfigEntriesError::NotReady(reason))
            }
            Err(SetupError::Failed(reason)) => {
                self.transition(
                    entry_id,
                    ConfigEntryState::SetupError,
                    Some(reason.clone()),
                )?;
                error!("Setup failed for entry {}: {}", entry_id, reason);
                Err(ConfigEntriesError::SetupFailed(reason))
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, entry_id: &str, delay: Duration) {
        let manager = Arc::downgrade(self);
        let id = entry_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            // Drop our own handle first so setup() does not abort this task
            manager.retries.remove(&id);
            if let Err(err) = manager.setup(&id).await {
                debug!("Retried setup of {} did not succeed: {}", id, err);
            }
        });
        if let Some(previous) = self.retries.insert(entry_id.to_string(), handle) {
            previous.abort();
        }
    }

    fn cancel_retry(&self, entry_id: &str) {
        if let Some((_, handle)) = self.retries.remove(entry_id) {
            handle.abort();
            debug!("Cancelled pending setup retry for {}", entry_id);
        }
    }

    pub fn has_pending_retry(&self, entry_id: &str) -> bool {
        self.retries.contains_key(entry_id)
    }

    /// Unload an entry; returns false if the integration failed to unload
    pub async fn unload(&self, entry_id: &str) -> ConfigEntriesResult<bool> {
        let _lock = self.setup_lock.lock().await;
        self.cancel_retry(entry_id);

        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        if !entry.state.is_recoverable() {
            return Err(ConfigEntriesError::CannotUnload(entry.state));
        }
        match entry.state {
            ConfigEntryState::NotLoaded => return Ok(true),
            // Nothing was set up, so there is nothing to release
            ConfigEntryState::SetupError | ConfigEntryState::SetupRetry => {
                self.transition(entry_id, ConfigEntryState::UnloadInProgress, None)?;
                self.transition(entry_id, ConfigEntryState::NotLoaded, None)?;
                return Ok(true);
            }
            _ => {}
        }

        self.transition(entry_id, ConfigEntryState::UnloadInProgress, None)?;

        let handler = self
            .integrations
            .get(&entry.domain)
            .map(|h| h.value().clone());
        let unloaded = match handler {
            Some(handler) => handler.unload_entry(&entry).await,
            None => true,
        };

        if unloaded {
            self.transition(entry_id, ConfigEntryState::NotLoaded, None)?;
            info!("Unloaded entry: {} ({})", entry.title, entry_id);
        } else {
            self.transition(
                entry_id,
                ConfigEntryState::FailedUnload,
                Some("integration refused to unload".to_string()),
            )?;
            error!("Failed to unload entry: {} ({})", entry.title, entry_id);
        }
        Ok(unloaded)
    }

    /// Reload an entry (unload + setup)
    pub async fn reload(self: &Arc<Self>, entry_id: &str) -> ConfigEntriesResult<()> {
        self.unload(entry_id).await?;
        self.setup(entry_id).await
    }

    pub fn entry_ids(&self) -> Vec<String> {
        self.entries.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Set up every entry that is not loaded yet, returning the per-entry outcome
    pub async fn setup_all(self: &Arc<Self>) -> Vec<(String, ConfigEntriesResult<()>)> {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|r| r.state == ConfigEntryState::NotLoaded)
            .map(|r| r.key().clone())
            .collect();
        let results = futures::future::join_all(ids.iter().map(|id| self.setup(id))).await;
        ids.into_iter().zip(results).collect()
    }

    /// Unload every entry, e.g. on shutdown
    pub async fn unload_all(&self) {
        for entry_id in self.entry_ids() {
            if let Err(err) = self.unload(&entry_id).await {
                warn!("Unload of {} failed during shutdown: {}", entry_id, err);
            }
        }
    }
}
