//! Destination that writes the rendered message to the process log.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use jobwatch_common::error::ConfigError;
use jobwatch_common::types::FailureEvent;
use jobwatch_templates::Template;

use crate::dispatcher::Destination;
use crate::error::DeliveryError;

pub const KIND: &str = "logger";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggerConfig {
    /// Defaults to the failure summary.
    pub message: Option<Template>,
}

pub struct Logger {
    message: Template,
}

pub fn build(config: LoggerConfig) -> Result<Arc<dyn Destination>, ConfigError> {
    let message = match config.message {
        Some(message) => message,
        None => crate::summary_template()
            .map_err(|e| ConfigError::invalid_destination(KIND, 0, e))?,
    };
    Ok(Arc::new(Logger::new(message)))
}

impl Logger {
    pub fn new(message: Template) -> Self {
        Self { message }
    }
}

#[async_trait]
impl Destination for Logger {
    async fn deliver(&self, event: &FailureEvent) -> Result<(), DeliveryError> {
        let text = self.message.render(&event.to_context())?;
        tracing::info!(
            job = %event.job.name,
            namespace = %event.job.namespace,
            "{text}"
        );
        Ok(())
    }
}
