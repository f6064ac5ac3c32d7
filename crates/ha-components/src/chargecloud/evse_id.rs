//! EVSE id validation
//!
//! Two grammars are accepted, without any normalization:
//!
//! ```text
//! alphanumeric: DE*ABC*E1234      ^[A-Z]{2}\*?[A-Z0-9]{3}\*?E[A-Z0-9*]{1,30}$
//! numeric:      +49*123*4567      ^\+?[0-9]{1,3}\*[0-9]{3}\*[0-9*]{1,32}$
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

const ALPHANUMERIC_GRAMMAR: &str = r"^[A-Z]{2}\*?[A-Z0-9]{3}\*?E[A-Z0-9*]{1,30}$";
const NUMERIC_GRAMMAR: &str = r"^\+?[0-9]{1,3}\*[0-9]{3}\*[0-9*]{1,32}$";

/// Compiled once on first validation
static GRAMMARS: OnceLock<Vec<Regex>> = OnceLock::new();

fn grammars() -> &'static [Regex] {
    GRAMMARS.get_or_init(|| {
        [ALPHANUMERIC_GRAMMAR, NUMERIC_GRAMMAR]
            .iter()
            .filter_map(|pattern| Regex::new(pattern).ok())
            .collect()
    })
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvseIdError {
    #[error("Malformed EVSE id: {0:?}")]
    Malformed(String),
}

/// A charge point identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EvseId(String);

impl EvseId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap an id that was already checked, e.g. one stored in a config
    /// entry or returned by the API
    pub(crate) fn from_trusted(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Same id once `*` separators are dropped and case is ignored
    pub fn loosely_matches(&self, other: &str) -> bool {
        let strip = |s: &str| -> String {
            s.chars()
                .filter(|c| *c != '*')
                .flat_map(char::to_uppercase)
                .collect()
        };
        strip(&self.0) == strip(other)
    }
}

/// Check `input` against the accepted grammars
pub fn validate_evse_id(input: &str) -> Result<EvseId, EvseIdError> {
    if !input.is_empty() && grammars().iter().any(|re| re.is_match(input)) {
        Ok(EvseId(input.to_string()))
    } else {
        Err(EvseIdError::Malformed(input.to_string()))
    }
}

impl FromStr for EvseId {
    type Err = EvseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_evse_id(s)
    }
}

impl TryFrom<String> for EvseId {
    type Error = EvseIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        validate_evse_id(&s)
    }
}

impl From<EvseId> for String {
    fn from(id: EvseId) -> Self {
        id.0
    }
}

impl AsRef<str> for EvseId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EvseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
