use thiserror::Error;

use jobwatch_notifier::DispatchError;

use crate::source::SourceError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("Watch stream for {scope} closed")]
    StreamClosed { scope: String },

    #[error("Notify about job {job}: {}", join_errors(.errors))]
    Dispatch {
        job: String,
        errors: Vec<DispatchError>,
    },

    #[error(transparent)]
    Dispatcher(#[from] DispatchError),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Cancelled")]
    Cancelled,
}

impl EngineError {
    /// Cancellation is an orderly shutdown, not a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            EngineError::Cancelled | EngineError::Dispatcher(DispatchError::Cancelled)
        )
    }
}

fn join_errors(errors: &[DispatchError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
