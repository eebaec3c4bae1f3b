//! Per-destination delivery worker.
//!
//! Each configured destination block gets its own [`Dispatcher`]: a bounded
//! FIFO queue fed by the reconciler and drained by a single worker that retries
//! failed deliveries a fixed number of times.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use jobwatch_common::types::FailureEvent;

use crate::error::{DeliveryError, DispatchError};

/// A notification target such as a webhook endpoint.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Deliver one failure notification. Called again on error, up to the
    /// dispatcher's retry budget.
    async fn deliver(&self, event: &FailureEvent) -> Result<(), DeliveryError>;
}

/// Queue and retry settings shared by every destination kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Maximum number of pending notifications.
    #[serde(default = "default_queue")]
    pub queue: usize,

    /// Retries after the first failed attempt.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Pause between attempts.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
}

/// Block keys consumed by [`DispatchSettings`] rather than the destination.
pub const SETTINGS_KEYS: [&str; 3] = ["queue", "retries", "interval"];

fn default_queue() -> usize {
    100
}

fn default_retries() -> u32 {
    5
}

fn default_interval() -> Duration {
    Duration::from_secs(1)
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            queue: default_queue(),
            retries: default_retries(),
            interval: default_interval(),
        }
    }
}

pub struct Dispatcher {
    kind: String,
    settings: DispatchSettings,
    destination: Arc<dyn Destination>,
    tx: mpsc::Sender<Arc<FailureEvent>>,
    rx: Mutex<Option<mpsc::Receiver<Arc<FailureEvent>>>>,
}

impl Dispatcher {
    pub fn new(
        kind: impl Into<String>,
        mut settings: DispatchSettings,
        destination: Arc<dyn Destination>,
    ) -> Self {
        let kind = kind.into();
        if settings.queue == 0 {
            tracing::warn!(kind = %kind, "Queue size 0 is not supported, using 1");
            settings.queue = 1;
        }
        let (tx, rx) = mpsc::channel(settings.queue);
        Self {
            kind,
            settings,
            destination,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Enqueue a notification without waiting. Fails with
    /// [`DispatchError::QueueFull`] when the queue has no free slot.
    pub fn send(
        &self,
        cancel: &CancellationToken,
        event: Arc<FailureEvent>,
    ) -> Result<(), DispatchError> {
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => DispatchError::QueueFull {
                kind: self.kind.clone(),
            },
            TrySendError::Closed(_) => DispatchError::Cancelled,
        })
    }

    /// Drain the queue until `cancel` fires. Only one worker may run per
    /// dispatcher.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), DispatchError> {
        let mut rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| DispatchError::AlreadyRunning {
                kind: self.kind.clone(),
            })?;

        tracing::debug!(
            kind = %self.kind,
            queue = self.settings.queue,
            retries = self.settings.retries,
            "Dispatcher started"
        );

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => return Ok(()),
                },
            };
            self.deliver_with_retry(&cancel, &event).await?;
        }
    }

    async fn deliver_with_retry(
        &self,
        cancel: &CancellationToken,
        event: &FailureEvent,
    ) -> Result<(), DispatchError> {
        let attempts = self.settings.retries.saturating_add(1);

        for attempt in 1..=attempts {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                result = self.destination.deliver(event) => result,
            };

            match result {
                Ok(()) => {
                    tracing::debug!(
                        kind = %self.kind,
                        job = %event.job.name,
                        attempt,
                        "Notification delivered"
                    );
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        kind = %self.kind,
                        job = %event.job.name,
                        attempt,
                        error = %e,
                        "Delivery failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                        _ = tokio::time::sleep(self.settings.interval) => {}
                    }
                }
                Err(e) => {
                    tracing::error!(
                        kind = %self.kind,
                        job = %event.job.name,
                        attempts,
                        error = %e,
                        "Delivery failed, notification dropped"
                    );
                }
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("kind", &self.kind)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
