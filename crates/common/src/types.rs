use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Equality-based label selector: every key must be present with the given value.
///
/// An empty selector matches every object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selector used to find the pods created by a job controller.
    pub fn for_job(job_name: &str) -> Self {
        Self::from_iter([("job-name", job_name)])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelSelector {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Renders in the API server's `key=value,key=value` form (keys sorted).
impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{key}={value}")?;
            first = false;
        }
        Ok(())
    }
}

/// Where a rule looks for jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    /// `None` watches every namespace.
    pub namespace: Option<String>,
    pub selector: LabelSelector,
}

impl Scope {
    pub fn new(namespace: Option<String>, selector: LabelSelector) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()),
            selector,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ns = self.namespace.as_deref().unwrap_or("*");
        if self.selector.is_empty() {
            write!(f, "{ns}")
        } else {
            write!(f, "{ns}[{}]", self.selector)
        }
    }
}

// The serialized shapes below are what templates see, so field names follow
// the `{{ .Job.Name }}` / `{{ range .Pods }}` convention.

/// A batch job as observed from the event source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobInfo {
    #[serde(rename = "APIVersion")]
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    #[serde(rename = "UID")]
    pub uid: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub creation_timestamp: Option<DateTime<Utc>>,
    pub status: JobStatus,
    /// Full object as returned by the API server.
    pub raw: serde_json::Value,
}

impl JobInfo {
    /// A job is considered failed as soon as one of its pods has failed.
    pub fn is_failed(&self) -> bool {
        self.status.failed > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobStatus {
    pub active: i32,
    pub succeeded: i32,
    pub failed: i32,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub conditions: Vec<JobCondition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobCondition {
    #[serde(rename = "Type")]
    pub type_: String,
    pub status: String,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// A pod belonging to a job.
///
/// Templates see the flattened fields below (`{{ .Phase }}`, `{{ .NodeName }}`,
/// `{{ range .Containers }}`) and, when the full object is known, its `Spec`
/// and `Status` as returned by the API server (`{{ .Status.Phase }}`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    #[serde(rename = "UID")]
    pub uid: String,
    pub labels: BTreeMap<String, String>,
    pub phase: Option<String>,
    pub node_name: Option<String>,
    pub containers: Vec<ContainerInfo>,
    /// Full object as returned by the API server.
    #[serde(default)]
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInfo {
    pub name: String,
    pub image: Option<String>,
    pub restart_count: i32,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
}

/// A pod paired with the tail of its logs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PodEvidence {
    #[serde(flatten)]
    pub pod: PodInfo,
    pub logs: String,
}

impl PodEvidence {
    pub fn new(pod: PodInfo, logs: String) -> Self {
        Self { pod, logs }
    }
}

// `{{ .Log }}` is accepted as an alias of `{{ .Logs }}`.
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct PodEvidenceView<'a> {
    #[serde(flatten)]
    pod: &'a PodInfo,
    logs: &'a str,
    log: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    spec: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<&'a serde_json::Value>,
}

/// One detected failure, fanned out to every destination of a rule.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureEvent {
    pub job: JobInfo,
    pub pods: Vec<PodEvidence>,
}

impl FailureEvent {
    pub fn new(job: JobInfo, pods: Vec<PodEvidence>) -> Self {
        Self { job, pods }
    }

    /// Value tree that templates are evaluated against.
    pub fn to_context(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl Serialize for FailureEvent {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let pods: Vec<PodEvidenceView<'_>> = self
            .pods
            .iter()
            .map(|p| PodEvidenceView {
                pod: &p.pod,
                logs: &p.logs,
                log: &p.logs,
                spec: p.pod.raw.get("spec"),
                status: p.pod.raw.get("status"),
            })
            .collect();

        let mut state = serializer.serialize_struct("FailureEvent", 2)?;
        state.serialize_field("Job", &self.job)?;
        state.serialize_field("Pods", &pods)?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_selector_matches_all_pairs() {
        let selector = LabelSelector::from_iter([("team", "data"), ("tier", "batch")]);
        assert!(selector.matches(&labels(&[("team", "data"), ("tier", "batch"), ("x", "y")])));
        assert!(!selector.matches(&labels(&[("team", "data")])));
        assert!(!selector.matches(&labels(&[("team", "web"), ("tier", "batch")])));
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        assert!(LabelSelector::new().matches(&labels(&[])));
        assert!(LabelSelector::new().matches(&labels(&[("a", "b")])));
    }

    #[test]
    fn test_selector_display_is_sorted() {
        let selector = LabelSelector::from_iter([("tier", "batch"), ("app", "etl")]);
        assert_eq!(selector.to_string(), "app=etl,tier=batch");
        assert_eq!(LabelSelector::for_job("nightly").to_string(), "job-name=nightly");
    }

    #[test]
    fn test_scope_drops_empty_namespace() {
        let scope = Scope::new(Some(String::new()), LabelSelector::new());
        assert_eq!(scope.namespace, None);
        assert_eq!(scope.to_string(), "*");
    }

    #[test]
    fn test_failure_event_context_shape() {
        let job = JobInfo {
            name: "nightly".to_string(),
            uid: "abc".to_string(),
            status: JobStatus {
                failed: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        let pod = PodInfo {
            name: "nightly-x1".to_string(),
            ..Default::default()
        };
        let event = FailureEvent::new(job, vec![PodEvidence::new(pod, "boom".to_string())]);
        let ctx = event.to_context();

        assert_eq!(ctx["Job"]["Name"], "nightly");
        assert_eq!(ctx["Job"]["UID"], "abc");
        assert_eq!(ctx["Job"]["Status"]["Failed"], 2);
        assert_eq!(ctx["Pods"][0]["Name"], "nightly-x1");
        assert_eq!(ctx["Pods"][0]["Logs"], "boom");
        assert_eq!(ctx["Pods"][0]["Log"], "boom");
        assert!(ctx["Pods"][0].get("Status").is_none());
    }

    #[test]
    fn test_pod_context_exposes_api_object() {
        let pod = PodInfo {
            name: "nightly-x1".to_string(),
            phase: Some("Failed".to_string()),
            raw: serde_json::json!({
                "metadata": {"name": "nightly-x1"},
                "spec": {"containers": [{"name": "main"}]},
                "status": {"phase": "Failed"}
            }),
            ..Default::default()
        };
        let pods = vec![PodEvidence::new(pod, String::new())];
        let event = FailureEvent::new(JobInfo::default(), pods);
        let ctx = event.to_context();

        assert_eq!(ctx["Pods"][0]["Phase"], "Failed");
        assert_eq!(ctx["Pods"][0]["Status"]["phase"], "Failed");
        assert_eq!(ctx["Pods"][0]["Spec"]["containers"][0]["name"], "main");
    }
}
