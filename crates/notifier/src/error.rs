use jobwatch_templates::{RenderError, TemplateError};
use thiserror::Error;

/// Errors returned to callers of a [`crate::Dispatcher`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Dispatcher cancelled")]
    Cancelled,

    #[error("{kind} queue is full")]
    QueueFull { kind: String },

    #[error("{kind} dispatcher is already running")]
    AlreadyRunning { kind: String },
}

/// A single failed delivery attempt.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Render template: {0}")]
    Template(#[from] TemplateError),

    #[error("Render body: {0}")]
    Body(#[from] RenderError),

    #[error("Encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Send request: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Send request: status {status}, body: {body}")]
    Status { status: u16, body: String },
}
