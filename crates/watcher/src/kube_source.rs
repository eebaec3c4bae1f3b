//! [`JobSource`] backed by the Kubernetes API server.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::Resource;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ContainerState, Pod};
use kube::api::{ListParams, LogParams};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use serde::Serialize;

use jobwatch_common::types::{
    ContainerInfo, JobCondition, JobInfo, JobStatus, LabelSelector, PodInfo, Scope,
};
use jobwatch_engine::source::{JobSource, SourceError, WatchEvent};

pub struct KubeSource {
    client: Client,
}

impl KubeSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn jobs_api(&self, scope: &Scope) -> Api<Job> {
        match &scope.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl JobSource for KubeSource {
    async fn list_jobs(&self, scope: &Scope) -> Result<Vec<JobInfo>, SourceError> {
        let mut params = ListParams::default();
        if !scope.selector.is_empty() {
            params = params.labels(&scope.selector.to_string());
        }
        let jobs = self
            .jobs_api(scope)
            .list(&params)
            .await
            .map_err(|e| SourceError::ListJobs {
                scope: scope.to_string(),
                reason: e.to_string(),
            })?;
        Ok(jobs.items.iter().map(job_info).collect())
    }

    async fn watch_jobs(
        &self,
        scope: &Scope,
    ) -> Result<BoxStream<'static, WatchEvent>, SourceError> {
        let mut config = watcher::Config::default();
        if !scope.selector.is_empty() {
            config = config.labels(&scope.selector.to_string());
        }

        let stream = watcher::watcher(self.jobs_api(scope), config)
            .default_backoff()
            .map(|event| match event {
                Ok(Event::InitApply(job)) => WatchEvent::Added(job_info(&job)),
                Ok(Event::Apply(job)) => WatchEvent::Modified(job_info(&job)),
                Ok(Event::Delete(job)) => WatchEvent::Deleted(job_info(&job)),
                Ok(Event::Init) | Ok(Event::InitDone) => WatchEvent::Bookmark,
                Err(e) => WatchEvent::Error(e.to_string()),
            })
            .boxed();
        Ok(stream)
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<PodInfo>, SourceError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(&selector.to_string()))
            .await
            .map_err(|e| SourceError::ListPods {
                namespace: namespace.to_string(),
                selector: selector.to_string(),
                reason: e.to_string(),
            })?;
        Ok(pods.items.iter().map(pod_info).collect())
    }

    async fn pod_logs(
        &self,
        pod: &PodInfo,
        tail_lines: i64,
        limit_bytes: i64,
    ) -> Result<String, SourceError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let params = LogParams {
            tail_lines: (tail_lines > 0).then_some(tail_lines),
            limit_bytes: (limit_bytes > 0).then_some(limit_bytes),
            ..Default::default()
        };
        api.logs(&pod.name, &params)
            .await
            .map_err(|e| SourceError::Logs {
                namespace: pod.namespace.clone(),
                pod: pod.name.clone(),
                reason: e.to_string(),
            })
    }
}

/// API timestamps go through their RFC 3339 form, which keeps this
/// independent of the time library k8s-openapi is built with.
fn timestamp<T: Serialize>(time: Option<&T>) -> Option<DateTime<Utc>> {
    let value = serde_json::to_value(time?).ok()?;
    serde_json::from_value(value).ok()
}

pub fn job_info(job: &Job) -> JobInfo {
    let meta = &job.metadata;
    let status = job.status.clone().unwrap_or_default();

    JobInfo {
        api_version: Job::API_VERSION.to_string(),
        kind: Job::KIND.to_string(),
        name: meta.name.clone().unwrap_or_default(),
        namespace: meta.namespace.clone().unwrap_or_default(),
        uid: meta.uid.clone().unwrap_or_default(),
        labels: meta.labels.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        creation_timestamp: timestamp(meta.creation_timestamp.as_ref()),
        status: JobStatus {
            active: status.active.unwrap_or_default(),
            succeeded: status.succeeded.unwrap_or_default(),
            failed: status.failed.unwrap_or_default(),
            start_time: timestamp(status.start_time.as_ref()),
            completion_time: timestamp(status.completion_time.as_ref()),
            conditions: status
                .conditions
                .unwrap_or_default()
                .into_iter()
                .map(|c| JobCondition {
                    last_transition_time: timestamp(c.last_transition_time.as_ref()),
                    type_: c.type_,
                    status: c.status,
                    reason: c.reason,
                    message: c.message,
                })
                .collect(),
        },
        raw: serde_json::to_value(job).unwrap_or_default(),
    }
}

pub fn pod_info(pod: &Pod) -> PodInfo {
    let meta = &pod.metadata;
    let status = pod.status.as_ref();

    let containers = status
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .map(|c| {
                    // A restarted container reports its last failure in last_state.
                    let (exit_code, reason) = termination(c.state.as_ref())
                        .or_else(|| termination(c.last_state.as_ref()))
                        .unwrap_or_else(|| (None, waiting_reason(c.state.as_ref())));
                    ContainerInfo {
                        name: c.name.clone(),
                        image: Some(c.image.clone()).filter(|i| !i.is_empty()),
                        restart_count: c.restart_count,
                        exit_code,
                        reason,
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    PodInfo {
        name: meta.name.clone().unwrap_or_default(),
        namespace: meta.namespace.clone().unwrap_or_default(),
        uid: meta.uid.clone().unwrap_or_default(),
        labels: meta.labels.clone().unwrap_or_default(),
        phase: status.and_then(|s| s.phase.clone()),
        node_name: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
        containers,
        raw: serde_json::to_value(pod).unwrap_or_default(),
    }
}

fn termination(state: Option<&ContainerState>) -> Option<(Option<i32>, Option<String>)> {
    let terminated = state?.terminated.as_ref()?;
    Some((Some(terminated.exit_code), terminated.reason.clone()))
}

fn waiting_reason(state: Option<&ContainerState>) -> Option<String> {
    state?.waiting.as_ref()?.reason.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn failed_job() -> Job {
        serde_json::from_value(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": "nightly-etl",
                "namespace": "batch",
                "uid": "6f1c2f6e-0000-4000-8000-000000000001",
                "labels": {"team": "data"},
                "creationTimestamp": "2024-03-05T07:08:09Z"
            },
            "status": {
                "failed": 2,
                "startTime": "2024-03-05T07:08:10Z",
                "conditions": [{
                    "type": "Failed",
                    "status": "True",
                    "reason": "BackoffLimitExceeded",
                    "lastTransitionTime": "2024-03-05T07:10:00Z"
                }]
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_job_conversion() {
        let info = job_info(&failed_job());
        assert_eq!(info.api_version, "batch/v1");
        assert_eq!(info.kind, "Job");
        assert_eq!(info.name, "nightly-etl");
        assert_eq!(info.namespace, "batch");
        assert_eq!(info.labels["team"], "data");
        assert!(info.is_failed());
        assert_eq!(info.status.failed, 2);
        assert_eq!(
            info.creation_timestamp.unwrap().to_rfc3339(),
            "2024-03-05T07:08:09+00:00"
        );
        assert_eq!(info.status.conditions[0].reason.as_deref(), Some("BackoffLimitExceeded"));
        assert!(info.status.conditions[0].last_transition_time.is_some());
        assert_eq!(info.raw["metadata"]["name"], "nightly-etl");
    }

    #[test]
    fn test_job_without_status() {
        let job: Job = serde_json::from_value(json!({"metadata": {"name": "fresh"}})).unwrap();
        let info = job_info(&job);
        assert!(!info.is_failed());
        assert!(info.creation_timestamp.is_none());
        assert!(info.status.conditions.is_empty());
    }

    #[test]
    fn test_pod_conversion() {
        let pod: Pod = serde_json::from_value(json!({
            "metadata": {
                "name": "nightly-etl-x1",
                "namespace": "batch",
                "labels": {"job-name": "nightly-etl"}
            },
            "spec": {"nodeName": "node-a", "containers": [{"name": "main"}]},
            "status": {
                "phase": "Failed",
                "containerStatuses": [{
                    "name": "main",
                    "image": "etl:1.2",
                    "imageID": "",
                    "ready": false,
                    "restartCount": 1,
                    "state": {"terminated": {"exitCode": 3, "reason": "Error"}}
                }, {
                    "name": "sidecar",
                    "image": "proxy:1",
                    "imageID": "",
                    "ready": false,
                    "restartCount": 0,
                    "state": {"waiting": {"reason": "CrashLoopBackOff"}}
                }]
            }
        }))
        .unwrap();

        let info = pod_info(&pod);
        assert_eq!(info.name, "nightly-etl-x1");
        assert_eq!(info.phase.as_deref(), Some("Failed"));
        assert_eq!(info.node_name.as_deref(), Some("node-a"));
        assert_eq!(info.containers.len(), 2);
        assert_eq!(info.containers[0].exit_code, Some(3));
        assert_eq!(info.containers[0].reason.as_deref(), Some("Error"));
        assert_eq!(info.containers[0].image.as_deref(), Some("etl:1.2"));
        assert_eq!(info.containers[1].exit_code, None);
        assert_eq!(info.containers[1].reason.as_deref(), Some("CrashLoopBackOff"));
        assert_eq!(info.raw["status"]["phase"], "Failed");
    }
}
