//! Registries
//!
//! Versioned JSON persistence in the `.storage/` directory and the device
//! registry built on it. Config entries persist through the same
//! [`Storage`].

pub mod device_registry;
pub mod storage;

pub use device_registry::{DeviceEntry, DeviceIdentifier, DeviceRegistry, DeviceRegistryData};
pub use storage::{Storable, Storage, StorageError, StorageFile, StorageResult};
