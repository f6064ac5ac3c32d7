//! Home Assistant Rust Server
//!
//! Loads the configuration, restores config entries, imports charge points
//! listed in `configuration.yaml` and keeps the integrations running until
//! Ctrl-C.

use anyhow::{Context, Result};
use ha_components::chargecloud::{self, ChargecloudConfig, ChargecloudIntegration};
use ha_config::HomeAssistantConfig;
use ha_config_entries::{ConfigEntries, FlowManager};
use ha_registries::{DeviceRegistry, Storage};
use ha_state_store::StateStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_DIR: &str = "config";

/// The central Home Assistant instance
pub struct HomeAssistant {
    pub states: Arc<StateStore>,
    pub devices: Arc<DeviceRegistry>,
    pub config_entries: Arc<ConfigEntries>,
    pub flows: FlowManager,
    chargecloud: ChargecloudConfig,
}

impl HomeAssistant {
    pub fn new(config_dir: &Path, config: &HomeAssistantConfig) -> Result<Self> {
        let states = Arc::new(StateStore::new());
        let storage = Arc::new(Storage::new(config_dir));
        let devices = Arc::new(DeviceRegistry::new(storage.clone()));
        let config_entries = Arc::new(ConfigEntries::new(storage));
        let flows = FlowManager::new(config_entries.clone());

        let chargecloud = ChargecloudConfig::from_config(config)
            .context("invalid chargecloud configuration")?;
        let integration = Arc::new(ChargecloudIntegration::new(
            chargecloud.clone(),
            states.clone(),
            devices.clone(),
        ));
        config_entries.register_integration(chargecloud::DOMAIN, integration.clone());
        flows.register(chargecloud::DOMAIN, Arc::new(integration.config_flow()));

        Ok(Self {
            states,
            devices,
            config_entries,
            flows,
            chargecloud,
        })
    }

    /// Restore stored entries, import YAML ones and set everything up
    pub async fn start(&self) -> Result<()> {
        self.devices
            .load()
            .await
            .context("failed to load device registry")?;
        self.config_entries
            .load()
            .await
            .context("failed to load config entries")?;
        info!("Restored {} config entries", self.config_entries.len());

        for (entry_id, result) in self.config_entries.setup_all().await {
            if let Err(err) = result {
                warn!("Config entry {} not set up: {}", entry_id, err);
            }
        }

        // New imports are set up by the flow as they are created
        let imported = chargecloud::import_from_config(&self.flows, &self.chargecloud).await;
        if !imported.is_empty() {
            info!("Processed {} chargecloud imports", imported.len());
        }
        Ok(())
    }

    pub async fn stop(&self) {
        self.config_entries.unload_all().await;
    }
}

/// `HASS_CONFIG`, then the first argument, then `./config`
fn config_dir(env: Option<String>, arg: Option<String>) -> PathBuf {
    env.or(arg)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR))
}

fn init_logging(config: &HomeAssistantConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logger.filter_directives()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_dir = config_dir(std::env::var("HASS_CONFIG").ok(), std::env::args().nth(1));
    let config = HomeAssistantConfig::load(&config_dir)
        .with_context(|| format!("failed to load configuration from {:?}", config_dir))?;
    init_logging(&config);

    info!(
        "Starting Home Assistant (Rust) '{}' from {:?}",
        config.core.name, config_dir
    );

    let hass = HomeAssistant::new(&config_dir, &config)?;
    hass.start().await?;
    info!("Home Assistant is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    hass.stop().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_dir_precedence() {
        assert_eq!(config_dir(None, None), PathBuf::from("config"));
        assert_eq!(config_dir(None, Some("/a".into())), PathBuf::from("/a"));
        assert_eq!(
            config_dir(Some("/env".into()), Some("/a".into())),
            PathBuf::from("/env")
        );
    }

    #[tokio::test]
    async fn test_start_with_empty_config_dir() {
        let dir = TempDir::new().unwrap();
        let config = HomeAssistantConfig::load(dir.path()).unwrap();
        let hass = HomeAssistant::new(dir.path(), &config).unwrap();

        hass.start().await.unwrap();
        assert!(hass.config_entries.is_empty());
        assert!(hass.devices.is_empty());
        assert_eq!(hass.states.entity_count(), 0);
        hass.stop().await;
    }

    #[test]
    fn test_invalid_chargecloud_section_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("configuration.yaml"),
            "chargecloud:\n  update_mode: turbo\n",
        )
        .unwrap();
        let config = HomeAssistantConfig::load(dir.path()).unwrap();
        assert!(HomeAssistant::new(dir.path(), &config).is_err());
    }
}
