//! Startup wiring: rules file -> destinations -> template context.

use std::io::Write;

use jobwatch_common::config::AppConfig;
use jobwatch_common::rules::load_rules;
use jobwatch_common::types::FailureEvent;
use jobwatch_notifier::Registry;
use jobwatch_common::types::PodEvidence;
use jobwatch_templates::Template;
use jobwatch_watcher::kube_source::{job_info, pod_info};

const RULES: &str = r#"
namespace: batch
labels:
  team: data
destinations:
  webhook:
    - url: "http://hooks.internal/{{ .Job.Namespace }}/{{ .Job.Name }}"
      retries: 2
      body:
        text: "{{ .Job.Name }} failed {{ .Job.Status.Failed }} times"
  logger:
    - message: "{{ .Job.Name }} ({{ index .Job.Labels \"team\" }})"
---
destinations:
  logger:
    - {}
"#;

#[test]
fn test_rules_file_builds_every_rule() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(RULES.as_bytes()).unwrap();

    let path = file.path().to_string_lossy().into_owned();
    let config = AppConfig::from_lookup(|name| (name == "CONFIG").then(|| path.clone())).unwrap();
    let rules = load_rules(&config.config_path).unwrap();
    assert_eq!(rules.len(), 2);

    let registry = Registry::with_defaults();
    let first = registry.build(&rules[0]).unwrap();
    let kinds: Vec<_> = first.iter().map(|d| d.kind()).collect();
    assert_eq!(kinds, ["logger", "webhook"]);
    assert_eq!(first[1].settings().retries, 2);
    assert_eq!(rules[0].scope().to_string(), "batch[team=data]");

    let second = registry.build(&rules[1]).unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(rules[1].scope().namespace, None);
}

#[test]
fn test_unknown_destination_fails_startup() {
    let rules = jobwatch_common::rules::parse_rules("destinations:\n  pager:\n    - {}\n").unwrap();
    let err = Registry::with_defaults().build(&rules[0]).unwrap_err();
    assert!(err.to_string().contains("pager"));
}

#[test]
fn test_api_job_reaches_templates() {
    let job = serde_json::from_value(serde_json::json!({
        "metadata": {"name": "etl", "namespace": "batch", "uid": "u-1"},
        "status": {"failed": 1}
    }))
    .unwrap();
    let event = FailureEvent::new(job_info(&job), Vec::new());
    let context = event.to_context();
    assert_eq!(context["Job"]["Name"], "etl");
    assert_eq!(context["Job"]["Status"]["Failed"], 1);
    assert_eq!(context["Job"]["Kind"], "Job");
    assert_eq!(context["Job"]["Raw"]["metadata"]["uid"], "u-1");
}

#[test]
fn test_api_pod_fields_reach_templates() {
    let job = serde_json::from_value(serde_json::json!({
        "metadata": {"name": "etl", "namespace": "batch"},
        "status": {"failed": 1}
    }))
    .unwrap();
    let pod = serde_json::from_value(serde_json::json!({
        "metadata": {"name": "etl-x1", "namespace": "batch"},
        "spec": {"nodeName": "node-a", "containers": [{"name": "main"}, {"name": "proxy"}]},
        "status": {"phase": "Failed"}
    }))
    .unwrap();
    let event = FailureEvent::new(
        job_info(&job),
        vec![PodEvidence::new(pod_info(&pod), "boom".to_string())],
    );

    let template = Template::parse(concat!(
        "{{ range .Pods }}{{ .Name }} {{ .Status.Phase }} on {{ .NodeName }}:",
        "{{ range .Spec.Containers }} {{ .Name }}{{ end }}{{ end }}",
    ))
    .unwrap();
    assert_eq!(
        template.render_context(&event).unwrap(),
        "etl-x1 Failed on node-a: main proxy"
    );
}
