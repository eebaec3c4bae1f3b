//! HTTP webhook destination.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderName};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use jobwatch_common::error::ConfigError;
use jobwatch_common::types::FailureEvent;
use jobwatch_templates::{StructuralTemplate, Template};

use crate::dispatcher::Destination;
use crate::error::DeliveryError;

pub const KIND: &str = "webhook";

/// Bytes of a non-2xx response body kept in the error.
const PEEK_REPLY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookConfig {
    pub url: Option<Template>,
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, Template>,
    /// Request body. Defaults to the plain-text failure summary.
    pub body: Option<StructuralTemplate>,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            method: "POST".to_string(),
            headers: BTreeMap::new(),
            body: None,
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct Webhook {
    client: Client,
    url: Template,
    method: Method,
    headers: Vec<(HeaderName, Template)>,
    body: StructuralTemplate,
    timeout: Duration,
}

pub fn build(config: WebhookConfig) -> Result<Arc<dyn Destination>, ConfigError> {
    Ok(Arc::new(Webhook::new(config)?))
}

impl Webhook {
    pub fn new(config: WebhookConfig) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::invalid_destination(KIND, 0, reason);

        let url = config.url.ok_or_else(|| invalid("url is required".to_string()))?;
        let method = Method::from_bytes(config.method.to_uppercase().as_bytes())
            .map_err(|e| invalid(format!("method {:?}: {e}", config.method)))?;
        let headers = config
            .headers
            .into_iter()
            .map(|(name, value)| {
                HeaderName::from_bytes(name.as_bytes())
                    .map(|name| (name, value))
                    .map_err(|e| invalid(format!("header {name:?}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let body = match config.body {
            Some(body) => body,
            None => StructuralTemplate::text(
                crate::summary_template().map_err(|e| invalid(e.to_string()))?,
            ),
        };

        Ok(Self {
            client: Client::new(),
            url,
            method,
            headers,
            body,
            timeout: config.timeout,
        })
    }
}

#[async_trait]
impl Destination for Webhook {
    async fn deliver(&self, event: &FailureEvent) -> Result<(), DeliveryError> {
        let context = event.to_context();
        let url = self.url.render(&context)?;
        let payload = self.body.render(&context)?;

        let mut request = self
            .client
            .request(self.method.clone(), &url)
            .timeout(self.timeout);

        let mut has_content_type = false;
        for (name, value) in &self.headers {
            has_content_type |= *name == CONTENT_TYPE;
            request = request.header(name.clone(), value.render(&context)?);
        }

        request = match payload {
            Value::String(text) => request.body(text),
            other => {
                let data = serde_json::to_vec(&other)?;
                if !has_content_type {
                    request = request.header(CONTENT_TYPE, "application/json");
                }
                request.body(data)
            }
        };

        let mut response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            tracing::debug!(job = %event.job.name, status = status.as_u16(), "Webhook delivered");
            return Ok(());
        }

        let mut peek = Vec::with_capacity(PEEK_REPLY);
        while peek.len() < PEEK_REPLY {
            match response.chunk().await {
                Ok(Some(chunk)) => peek.extend_from_slice(&chunk),
                _ => break,
            }
        }
        peek.truncate(PEEK_REPLY);

        Err(DeliveryError::Status {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&peek).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: Value) -> Result<WebhookConfig, serde_json::Error> {
        let mut merged = serde_json::to_value(WebhookConfig::default()).unwrap();
        for (k, v) in value.as_object().unwrap() {
            merged[k] = v.clone();
        }
        serde_json::from_value(merged)
    }

    #[test]
    fn test_defaults() {
        let cfg = config(json!({"url": "http://x"})).unwrap();
        assert_eq!(cfg.method, "POST");
        assert_eq!(cfg.timeout, Duration::from_secs(30));
        assert!(cfg.body.is_none());

        let hook = Webhook::new(cfg).unwrap();
        assert_eq!(hook.method, Method::POST);
        assert!(matches!(hook.body, StructuralTemplate::Text(_)));
    }

    #[test]
    fn test_missing_url_is_rejected() {
        let err = Webhook::new(WebhookConfig::default()).err().unwrap();
        assert!(err.to_string().contains("url is required"));
    }

    #[test]
    fn test_bad_header_and_unknown_field() {
        let cfg = config(json!({"url": "http://x", "headers": {"bad header": "v"}})).unwrap();
        assert!(Webhook::new(cfg).is_err());
        assert!(config(json!({"url": "http://x", "verb": "GET"})).is_err());
    }

    #[test]
    fn test_lowercase_method_and_timeout() {
        let cfg = config(json!({"url": "http://x", "method": "put", "timeout": "5s"})).unwrap();
        let hook = Webhook::new(cfg).unwrap();
        assert_eq!(hook.method, Method::PUT);
        assert_eq!(hook.timeout, Duration::from_secs(5));
    }
}
