//! Config Entries
//!
//! Config entries represent individual integration instances. This crate
//! persists them, drives their lifecycle (setup, retry, unload, reload) and
//! runs the config flows that create them.
//!
//! # Key Types
//!
//! - [`ConfigEntry`] - A single integration configuration
//! - [`ConfigEntryState`] - Lifecycle state of an entry
//! - [`ConfigEntries`] - Manager for all config entries
//! - [`FlowManager`] - Runs [`ConfigFlow`]s and stores what they create
//!
//! # Storage
//!
//! Config entries are persisted in `.storage/core.config_entries` with
//! version tracking for migrations.

pub mod entry;
pub mod flow;
pub mod manager;
pub mod state_machine;

pub use entry::{ConfigEntry, ConfigEntrySource, ConfigEntryState, ConfigEntryUpdate};
pub use flow::{
    ConfigFlow, FlowContext, FlowError, FlowInput, FlowManager, FlowProgress, FlowResult,
    FlowResultType, FormField, ABORT_ALREADY_CONFIGURED, BASE_ERROR_KEY,
};
pub use manager::{
    ConfigEntries, ConfigEntriesData, ConfigEntriesError, ConfigEntriesResult,
    IntegrationHandler, SetupError, STORAGE_KEY, STORAGE_MINOR_VERSION, STORAGE_VERSION,
};
pub use state_machine::{calculate_retry_delay, InvalidTransition};
pub use ha_registries::{Storable, Storage, StorageError, StorageResult};
