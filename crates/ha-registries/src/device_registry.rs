//! Device Registry
//!
//! Physical things an integration exposes entities for. A device is found
//! again by any of its `(domain, id)` identifiers and belongs to the config
//! entries that registered it.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::storage::{Storable, Storage, StorageResult};

pub const STORAGE_KEY: &str = "core.device_registry";
pub const STORAGE_VERSION: u32 = 1;
pub const STORAGE_MINOR_VERSION: u32 = 1;

/// `(domain, id)` pair, stored as a two-element array
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentifier(pub String, pub String);

impl DeviceIdentifier {
    pub fn new(domain: impl Into<String>, id: impl Into<String>) -> Self {
        Self(domain.into(), id.into())
    }

    pub fn domain(&self) -> &str {
        &self.0
    }

    pub fn id(&self) -> &str {
        &self.1
    }

    fn key(&self) -> String {
        format!("{}:{}", self.0, self.1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: String,

    #[serde(default)]
    pub identifiers: Vec<DeviceIdentifier>,

    /// Config entries that registered this device
    #[serde(default)]
    pub config_entries: Vec<String>,

    pub name: Option<String>,

    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl DeviceEntry {
    pub fn new(name: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: ulid::Ulid::new().to_string(),
            identifiers: Vec::new(),
            config_entries: Vec::new(),
            name: name.map(str::to_string),
            created_at: now,
            modified_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceRegistryData {
    pub devices: Vec<DeviceEntry>,
}

impl Storable for DeviceRegistryData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Device registry indexed by id, identifier and config entry
pub struct DeviceRegistry {
    storage: Arc<Storage>,

    /// Primary index: device_id -> DeviceEntry
    by_id: DashMap<String, Arc<DeviceEntry>>,

    /// identifier key -> device_id
    by_identifier: DashMap<String, String>,

    /// config_entry_id -> device_ids
    by_config_entry_id: DashMap<String, HashSet<String>>,
}

impl DeviceRegistry {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            by_id: DashMap::new(),
            by_identifier: DashMap::new(),
            by_config_entry_id: DashMap::new(),
        }
    }

    pub async fn load(&self) -> StorageResult<()> {
        if let Some(data) = self.storage.load::<DeviceRegistryData>().await? {
            info!("Loading {} devices from storage", data.devices.len());
            for entry in data.devices {
                self.index_entry(Arc::new(entry));
            }
        }
        Ok(())
    }

    pub async fn save(&self) -> StorageResult<()> {
        let mut devices: Vec<DeviceEntry> =
            self.by_id.iter().map(|r| (**r.value()).clone()).collect();
        devices.sort_by_key(|device| device.created_at);
        self.storage.save(&DeviceRegistryData { devices }).await?;
        debug!("Saved {} devices to storage", self.by_id.len());
        Ok(())
    }

    fn index_entry(&self, entry: Arc<DeviceEntry>) {
        let device_id = entry.id.clone();
        for identifier in &entry.identifiers {
            self.by_identifier.insert(identifier.key(), device_id.clone());
        }
        for config_entry_id in &entry.config_entries {
            self.by_config_entry_id
                .entry(config_entry_id.clone())
                .or_default()
                .insert(device_id.clone());
        }
        self.by_id.insert(device_id, entry);
    }

    fn unindex_entry(&self, entry: &DeviceEntry) {
        for identifier in &entry.identifiers {
            self.by_identifier.remove(&identifier.key());
        }
        for config_entry_id in &entry.config_entries {
            let emptied = match self.by_config_entry_id.get_mut(config_entry_id) {
                Some(mut ids) => {
                    ids.remove(&entry.id);
                    ids.is_empty()
                }
                None => false,
            };
            if emptied {
                self.by_config_entry_id.remove(config_entry_id);
            }
        }
        self.by_id.remove(&entry.id);
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        self.by_id.get(device_id).map(|r| Arc::clone(r.value()))
    }

    pub fn get_by_identifier(&self, domain: &str, id: &str) -> Option<Arc<DeviceEntry>> {
        let key = DeviceIdentifier::new(domain, id).key();
        let device_id = self.by_identifier.get(&key)?.clone();
        self.get(&device_id)
    }

    pub fn get_by_config_entry_id(&self, config_entry_id: &str) -> Vec<Arc<DeviceEntry>> {
        let device_ids: Vec<String> = self
            .by_config_entry_id
            .get(config_entry_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        device_ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Find the device owning any of `identifiers`, or register a new one.
    ///
    /// An existing device gains the missing identifiers and the config
    /// entry, and takes `name` when one is given.
    pub fn get_or_create(
        &self,
        identifiers: &[DeviceIdentifier],
        config_entry_id: Option<&str>,
        name: Option<&str>,
    ) -> Arc<DeviceEntry> {
        let existing = identifiers
            .iter()
            .find_map(|identifier| self.get_by_identifier(identifier.domain(), identifier.id()));

        if let Some(existing) = existing {
            debug!("Found existing device by identifier: {}", existing.id);
            let mut entry = (*existing).clone();
            for identifier in identifiers {
                if !entry.identifiers.contains(identifier) {
                    entry.identifiers.push(identifier.clone());
                }
            }
            if let Some(config_entry_id) = config_entry_id {
                if !entry.config_entries.iter().any(|id| id == config_entry_id) {
                    entry.config_entries.push(config_entry_id.to_string());
                }
            }
            if let Some(name) = name {
                entry.name = Some(name.to_string());
            }
            if entry == *existing {
                return existing;
            }
            entry.modified_at = Utc::now();

            self.unindex_entry(&existing);
            let entry = Arc::new(entry);
            self.index_entry(Arc::clone(&entry));
            return entry;
        }

        let mut entry = DeviceEntry::new(name);
        entry.identifiers = identifiers.to_vec();
        if let Some(config_entry_id) = config_entry_id {
            entry.config_entries.push(config_entry_id.to_string());
        }
        let entry = Arc::new(entry);
        self.index_entry(Arc::clone(&entry));

        info!("Registered new device: {:?} ({})", name, entry.id);
        entry
    }

    pub fn remove(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        let entry = self.get(device_id)?;
        self.unindex_entry(&entry);
        info!("Removed device: {}", device_id);
        Some(entry)
    }

    /// Detach a config entry from its devices. Devices left without any
    /// config entry are removed.
    pub fn clear_config_entry(&self, config_entry_id: &str) -> Vec<Arc<DeviceEntry>> {
        let mut removed = Vec::new();
        for device in self.get_by_config_entry_id(config_entry_id) {
            if device.config_entries.iter().all(|id| id == config_entry_id) {
                removed.extend(self.remove(&device.id));
                continue;
            }

            let mut entry = (*device).clone();
            entry.config_entries.retain(|id| id != config_entry_id);
            entry.modified_at = Utc::now();
            self.unindex_entry(&device);
            self.index_entry(Arc::new(entry));
        }
        removed
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.by_id.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
