use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading process configuration or the rules file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {var}: {reason}")]
    Env { var: &'static str, reason: String },

    #[error("Open config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Decode config file (rule #{index}): {source}")]
    Parse {
        index: usize,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Destination kind {0:?} not found")]
    UnknownDestination(String),

    #[error("Build destination {kind} ({index}): {reason}")]
    InvalidDestination {
        kind: String,
        index: usize,
        reason: String,
    },
}

impl ConfigError {
    pub fn invalid_destination(kind: &str, index: usize, reason: impl ToString) -> Self {
        ConfigError::InvalidDestination {
            kind: kind.to_string(),
            index,
            reason: reason.to_string(),
        }
    }
}
