//! Reconciliation loop, one per watch rule.
//!
//! 1. Preload: seed the dedup cache with jobs that already failed
//! 2. Watch jobs in the rule's scope
//! 3. For each newly failed job, collect pods and logs
//! 4. Fan the failure event out to every dispatcher of the rule

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use jobwatch_common::config::EngineConfig;
use jobwatch_common::types::{FailureEvent, JobInfo, LabelSelector, PodEvidence, Scope};
use jobwatch_notifier::{DispatchError, Dispatcher};

use crate::dedup::DedupCache;
use crate::error::EngineError;
use crate::source::{JobSource, WatchEvent};

pub struct Reconciler {
    scope: Scope,
    source: Arc<dyn JobSource>,
    dispatchers: Vec<Arc<Dispatcher>>,
    dedup: DedupCache,
    config: EngineConfig,
}

impl Reconciler {
    pub fn new(
        scope: Scope,
        source: Arc<dyn JobSource>,
        dispatchers: Vec<Arc<Dispatcher>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            dedup: DedupCache::new(config.dedup_cache),
            scope,
            source,
            dispatchers,
            config,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn dedup(&self) -> &DedupCache {
        &self.dedup
    }

    /// Run until the watch stream ends or `cancel` fires.
    ///
    /// Never returns `Ok`: a closed stream is [`EngineError::StreamClosed`]
    /// and cancellation is [`EngineError::Cancelled`].
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), EngineError> {
        if self.config.skip_preload {
            tracing::info!(scope = %self.scope, "Preload skipped");
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                result = self.preload() => { result?; }
            }
        }

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            stream = self.source.watch_jobs(&self.scope) => stream?,
        };
        tracing::info!(scope = %self.scope, destinations = self.dispatchers.len(), "Watching jobs");

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                event = stream.next() => event,
            };

            let job = match event {
                Some(WatchEvent::Added(job)) | Some(WatchEvent::Modified(job)) => job,
                Some(WatchEvent::Error(reason)) => {
                    tracing::warn!(
                        scope = %self.scope,
                        reason = %reason,
                        "Watch reported an error"
                    );
                    continue;
                }
                Some(WatchEvent::Deleted(_)) | Some(WatchEvent::Bookmark) => continue,
                None => {
                    return Err(EngineError::StreamClosed {
                        scope: self.scope.to_string(),
                    });
                }
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                result = self.inspect_job(&cancel, job) => result,
            };
            match result {
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => tracing::warn!(scope = %self.scope, error = %e, "Failed to notify"),
                Ok(_) => {}
            }
        }
    }

    /// Seed the dedup cache with jobs that failed before startup, so they are
    /// not reported again. Returns how many were seeded.
    pub async fn preload(&self) -> Result<usize, EngineError> {
        let jobs = self.source.list_jobs(&self.scope).await?;
        let mut failed = 0;
        for job in &jobs {
            if job.is_failed() && self.scope.selector.matches(&job.labels) {
                self.dedup.add(&dedup_key(job));
                failed += 1;
            }
        }
        tracing::info!(scope = %self.scope, jobs = jobs.len(), failed, "Preloaded jobs");
        Ok(failed)
    }

    /// Notify about `job` if it has failed and was not reported before.
    /// Returns whether a notification was enqueued.
    pub async fn inspect_job(
        &self,
        cancel: &CancellationToken,
        job: JobInfo,
    ) -> Result<bool, EngineError> {
        if !self.scope.selector.matches(&job.labels) {
            tracing::debug!(job = %job.name, "Job does not match selector");
            return Ok(false);
        }
        if !job.is_failed() {
            return Ok(false);
        }
        if !self.dedup.claim(&dedup_key(&job)) {
            tracing::info!(job = %job.name, namespace = %job.namespace, "Job already notified");
            return Ok(false);
        }

        tracing::info!(
            job = %job.name,
            namespace = %job.namespace,
            failed = job.status.failed,
            "Job failed"
        );

        let pods = self.collect_evidence(&job).await;
        let job_name = job.name.clone();
        let event = Arc::new(FailureEvent::new(job, pods));

        let mut errors = Vec::new();
        for dispatcher in &self.dispatchers {
            match dispatcher.send(cancel, event.clone()) {
                Ok(()) => {}
                Err(DispatchError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => errors.push(e),
            }
        }

        if errors.is_empty() {
            Ok(true)
        } else {
            Err(EngineError::Dispatch {
                job: job_name,
                errors,
            })
        }
    }

    async fn collect_evidence(&self, job: &JobInfo) -> Vec<PodEvidence> {
        let selector = LabelSelector::for_job(&job.name);
        let pods = match self.source.list_pods(&job.namespace, &selector).await {
            Ok(pods) => pods,
            Err(e) => {
                tracing::warn!(job = %job.name, error = %e, "Failed to list pods");
                Vec::new()
            }
        };

        let mut evidence = Vec::with_capacity(pods.len());
        for pod in pods {
            let logs = match self
                .source
                .pod_logs(&pod, self.config.tail_lines, self.config.logs_bytes)
                .await
            {
                Ok(logs) => truncate_utf8(logs, self.config.logs_bytes),
                Err(e) => {
                    tracing::warn!(
                        job = %job.name,
                        pod = %pod.name,
                        error = %e,
                        "Failed to fetch logs"
                    );
                    String::new()
                }
            };
            evidence.push(PodEvidence::new(pod, logs));
        }
        evidence
    }
}

/// UID when the server provided one, otherwise `namespace/name`.
fn dedup_key(job: &JobInfo) -> String {
    if job.uid.is_empty() {
        format!("{}/{}", job.namespace, job.name)
    } else {
        job.uid.clone()
    }
}

/// Cut `text` to at most `limit` bytes on a char boundary. A non-positive
/// limit keeps everything.
fn truncate_utf8(mut text: String, limit: i64) -> String {
    let Ok(limit) = usize::try_from(limit) else {
        return text;
    };
    if limit == 0 || text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text
}
