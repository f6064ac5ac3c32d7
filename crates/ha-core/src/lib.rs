//! Core types for Home Assistant
//!
//! The fundamental types shared by the rest of the workspace: entity ids,
//! entity states and the slug helper used to derive object ids from
//! free-form names.

mod entity_id;
mod slug;
mod state;

pub use entity_id::{EntityId, EntityIdError};
pub use self::slug::slugify;
pub use state::State;

/// Maximum length for a state value
pub const MAX_STATE_LENGTH: usize = 255;

/// State written when the real value is not known
pub const STATE_UNKNOWN: &str = "unknown";

/// State written when an entity cannot provide a value at all
pub const STATE_UNAVAILABLE: &str = "unavailable";

/// Well-known attribute keys
pub mod attributes {
    pub const ATTRIBUTION: &str = "attribution";
    pub const DEVICE_CLASS: &str = "device_class";
    pub const FRIENDLY_NAME: &str = "friendly_name";
    pub const ICON: &str = "icon";
    pub const OPTIONS: &str = "options";
}
