//! Home Assistant Native Components
//!
//! Integrations implemented natively in Rust. Each one plugs into the
//! config entry manager through an `IntegrationHandler` and, where entries
//! are created interactively, a `ConfigFlow`.

pub mod chargecloud;
