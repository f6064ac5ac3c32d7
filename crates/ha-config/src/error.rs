//! Configuration errors

use std::path::PathBuf;
use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

/// What went wrong while resolving a `!secret`, `!env_var` or `!include` tag
#[derive(Debug, Error)]
pub enum TagError {
    #[error("no secret named '{0}' in secrets.yaml")]
    UnknownSecret(String),

    #[error("environment variable '{0}' is unset and has no default")]
    UnsetEnvVar(String),

    #[error("argument must be a non-empty string")]
    BadArgument,

    #[error("{0:?} includes itself")]
    IncludeCycle(PathBuf),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path:?} is not valid YAML")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("cannot resolve {tag}")]
    Tag {
        tag: &'static str,
        #[source]
        source: TagError,
    },

    /// `section` is a top-level key, or `domain.option` for a single option
    #[error("invalid '{section}': {reason}")]
    Section { section: String, reason: String },
}

impl ConfigError {
    pub(crate) fn tag(tag: &'static str, source: TagError) -> Self {
        Self::Tag { tag, source }
    }

    pub fn section(section: impl Into<String>, reason: impl ToString) -> Self {
        Self::Section {
            section: section.into(),
            reason: reason.to_string(),
        }
    }
}
