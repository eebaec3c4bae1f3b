//! Rules file loading.
//!
//! The rules file is a multi-document YAML stream; every document describes one
//! independently running watch rule:
//!
//! ```yaml
//! namespace: batch
//! labels:
//!   team: data
//! destinations:
//!   webhook:
//!     - url: "https://hooks.example.com/{{ .Job.Namespace }}"
//!       retries: 3
//!   logger:
//!     - {}
//! ---
//! labels:
//!   team: web
//! destinations:
//!   logger:
//!     - message: "{{ .Job.Name }} failed"
//! ```
//!
//! Destination blocks are kept as raw values here; decoding them is up to the
//! destination registry, which knows each kind's defaults.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::types::{LabelSelector, Scope};

/// One watch rule as written in the rules file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default)]
    pub labels: LabelSelector,

    /// Destination kind name to the list of settings blocks for that kind.
    #[serde(default, alias = "upstreams")]
    pub destinations: BTreeMap<String, Vec<serde_json::Value>>,
}

impl RuleConfig {
    pub fn scope(&self) -> Scope {
        Scope::new(self.namespace.clone(), self.labels.clone())
    }
}

/// Read and decode every rule in the file at `path`.
pub fn load_rules(path: impl AsRef<Path>) -> Result<Vec<RuleConfig>, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let rules = parse_rules(&content)?;
    tracing::debug!(path = %path.display(), rules = rules.len(), "Loaded rules file");
    Ok(rules)
}

/// Decode a multi-document YAML string into rules. Empty documents are skipped.
pub fn parse_rules(content: &str) -> Result<Vec<RuleConfig>, ConfigError> {
    let mut rules = Vec::new();

    for document in serde_yaml::Deserializer::from_str(content) {
        let index = rules.len();
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|source| ConfigError::Parse { index, source })?;
        if value.is_null() {
            continue;
        }
        let rule: RuleConfig =
            serde_yaml::from_value(value).map_err(|source| ConfigError::Parse { index, source })?;
        rules.push(rule);
    }

    Ok(rules)
}
