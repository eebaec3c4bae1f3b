use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use jobwatch_common::error::ConfigError;
use jobwatch_common::rules::RuleConfig;

use crate::dispatcher::{Destination, DispatchSettings, Dispatcher, SETTINGS_KEYS};
use crate::{logger, webhook};

type Builder =
    Box<dyn Fn(&Value, usize) -> Result<Arc<dyn Destination>, ConfigError> + Send + Sync>;

/// Destination kinds known to the process, keyed by the name used in rules.
pub struct Registry {
    kinds: BTreeMap<String, Builder>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            kinds: BTreeMap::new(),
        }
    }

    /// A registry with the built-in `webhook` and `logger` kinds.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            webhook::KIND,
            webhook::WebhookConfig::default,
            webhook::build,
        );
        registry.register(logger::KIND, logger::LoggerConfig::default, logger::build);
        registry
    }

    /// Register a destination kind.
    ///
    /// A block is decoded in two steps: `default()` is serialized, the block's
    /// keys are laid over it, and the result is decoded into `C`. Keys owned by
    /// [`DispatchSettings`] never reach `C`.
    pub fn register<C>(
        &mut self,
        kind: &str,
        default: fn() -> C,
        build: fn(C) -> Result<Arc<dyn Destination>, ConfigError>,
    ) where
        C: Serialize + DeserializeOwned + 'static,
    {
        let name = kind.to_string();
        let builder: Builder = Box::new(move |block: &Value, index: usize| {
            let mut merged = serde_json::to_value(default())
                .map_err(|e| ConfigError::invalid_destination(&name, index, e))?;
            overlay(&mut merged, block).map_err(|reason| {
                ConfigError::invalid_destination(&name, index, reason)
            })?;
            let config: C = serde_json::from_value(merged)
                .map_err(|e| ConfigError::invalid_destination(&name, index, e))?;
            build(config).map_err(|e| match e {
                ConfigError::InvalidDestination { kind, reason, .. } => {
                    ConfigError::InvalidDestination {
                        kind,
                        index,
                        reason,
                    }
                }
                other => other,
            })
        });

        if self.kinds.insert(kind.to_string(), builder).is_some() {
            tracing::warn!(kind, "Destination kind registered twice, keeping the last one");
        }
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }

    /// Build one dispatcher per destination block of `rule`. Kinds are handled
    /// in lexical order, blocks in file order.
    pub fn build(&self, rule: &RuleConfig) -> Result<Vec<Arc<Dispatcher>>, ConfigError> {
        let mut dispatchers = Vec::new();

        for (kind, blocks) in &rule.destinations {
            let builder = self
                .kinds
                .get(kind)
                .ok_or_else(|| ConfigError::UnknownDestination(kind.clone()))?;

            for (index, block) in blocks.iter().enumerate() {
                let settings: DispatchSettings = if block.is_null() {
                    DispatchSettings::default()
                } else {
                    serde_json::from_value(block.clone())
                        .map_err(|e| ConfigError::invalid_destination(kind, index, e))?
                };
                let destination = builder(block, index)?;
                tracing::debug!(kind = %kind, index, "Destination configured");
                dispatchers.push(Arc::new(Dispatcher::new(kind.clone(), settings, destination)));
            }
        }

        Ok(dispatchers)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn overlay(base: &mut Value, block: &Value) -> Result<(), String> {
    let fields = match block {
        Value::Null => return Ok(()),
        Value::Object(fields) => fields,
        other => return Err(format!("expected a mapping, got {other}")),
    };
    let Value::Object(base) = base else {
        return Err("default configuration is not a mapping".to_string());
    };
    for (key, value) in fields {
        if SETTINGS_KEYS.contains(&key.as_str()) {
            continue;
        }
        base.insert(key.clone(), value.clone());
    }
    Ok(())
}
