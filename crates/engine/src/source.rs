//! Collaborator seam between the reconciler and the cluster API.

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use jobwatch_common::types::{JobInfo, LabelSelector, PodInfo, Scope};

/// One notification from a job watch.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(JobInfo),
    Modified(JobInfo),
    Deleted(JobInfo),
    Bookmark,
    /// The server reported an error on the watch; there is no job attached.
    Error(String),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("List jobs in {scope}: {reason}")]
    ListJobs { scope: String, reason: String },

    #[error("Watch jobs in {scope}: {reason}")]
    Watch { scope: String, reason: String },

    #[error("List pods in {namespace} ({selector}): {reason}")]
    ListPods {
        namespace: String,
        selector: String,
        reason: String,
    },

    #[error("Fetch logs of {namespace}/{pod}: {reason}")]
    Logs {
        namespace: String,
        pod: String,
        reason: String,
    },
}

/// Read access to batch jobs, their pods and pod logs.
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn list_jobs(&self, scope: &Scope) -> Result<Vec<JobInfo>, SourceError>;

    /// Open a watch on jobs in `scope`. The stream ends when the server closes
    /// the watch.
    async fn watch_jobs(
        &self,
        scope: &Scope,
    ) -> Result<BoxStream<'static, WatchEvent>, SourceError>;

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<PodInfo>, SourceError>;

    /// Tail of a pod's logs: at most `tail_lines` lines and `limit_bytes`
    /// bytes.
    async fn pod_logs(
        &self,
        pod: &PodInfo,
        tail_lines: i64,
        limit_bytes: i64,
    ) -> Result<String, SourceError>;
}
