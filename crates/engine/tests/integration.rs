//! Reconciler tests against an in-memory job source.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use jobwatch_common::config::EngineConfig;
use jobwatch_common::rules::parse_rules;
use jobwatch_common::types::{JobInfo, JobStatus, LabelSelector, PodInfo, Scope};
use jobwatch_engine::{EngineError, JobSource, Reconciler, SourceError, TaskGroup, WatchEvent};
use jobwatch_notifier::logger::Logger;
use jobwatch_notifier::{DEFAULT_SUMMARY, DispatchSettings, Dispatcher, Registry};
use jobwatch_templates::Template;

// ============================================================
// Shared helpers
// ============================================================

#[derive(Default)]
struct FakeSource {
    jobs: Vec<JobInfo>,
    /// job name -> pods
    pods: HashMap<String, Vec<PodInfo>>,
    /// pod name -> logs
    logs: HashMap<String, String>,
    fail_pod_listing: bool,
    watch: Mutex<Option<mpsc::UnboundedReceiver<WatchEvent>>>,
    pod_listings: AtomicUsize,
    listed_namespaces: Mutex<Vec<String>>,
}

impl FakeSource {
    fn with_watch(mut self) -> (Self, mpsc::UnboundedSender<WatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watch = Mutex::new(Some(rx));
        (self, tx)
    }
}

#[async_trait]
impl JobSource for FakeSource {
    async fn list_jobs(&self, _scope: &Scope) -> Result<Vec<JobInfo>, SourceError> {
        Ok(self.jobs.clone())
    }

    async fn watch_jobs(
        &self,
        scope: &Scope,
    ) -> Result<BoxStream<'static, WatchEvent>, SourceError> {
        let rx = self.watch.lock().take().ok_or_else(|| SourceError::Watch {
            scope: scope.to_string(),
            reason: "already watching".into(),
        })?;
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<PodInfo>, SourceError> {
        self.pod_listings.fetch_add(1, Ordering::SeqCst);
        self.listed_namespaces.lock().push(namespace.to_string());
        if self.fail_pod_listing {
            return Err(SourceError::ListPods {
                namespace: namespace.into(),
                selector: selector.to_string(),
                reason: "forbidden".into(),
            });
        }
        let job_name = selector
            .iter()
            .find(|(k, _)| k.as_str() == "job-name")
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        Ok(self.pods.get(&job_name).cloned().unwrap_or_default())
    }

    async fn pod_logs(
        &self,
        pod: &PodInfo,
        _tail_lines: i64,
        _limit_bytes: i64,
    ) -> Result<String, SourceError> {
        self.logs
            .get(&pod.name)
            .cloned()
            .ok_or_else(|| SourceError::Logs {
                namespace: pod.namespace.clone(),
                pod: pod.name.clone(),
                reason: "not found".into(),
            })
    }
}

fn job(name: &str, failed: i32, labels: &[(&str, &str)]) -> JobInfo {
    JobInfo {
        api_version: "batch/v1".into(),
        kind: "Job".into(),
        name: name.into(),
        namespace: "batch".into(),
        uid: uuid::Uuid::new_v4().to_string(),
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
        status: JobStatus {
            failed,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn pod(name: &str) -> PodInfo {
    PodInfo {
        name: name.into(),
        namespace: "batch".into(),
        phase: Some("Failed".into()),
        ..Default::default()
    }
}

/// A logger dispatcher whose worker is never started, so its queue only fills.
fn idle_dispatcher(queue: usize) -> Arc<Dispatcher> {
    let settings = DispatchSettings {
        queue,
        ..Default::default()
    };
    let message = Template::parse(DEFAULT_SUMMARY).unwrap();
    Arc::new(Dispatcher::new("logger", settings, Arc::new(Logger::new(message))))
}

fn config() -> EngineConfig {
    EngineConfig::default()
}

fn reconciler(
    source: FakeSource,
    dispatchers: Vec<Arc<Dispatcher>>,
    scope: Scope,
) -> Reconciler {
    Reconciler::new(scope, Arc::new(source), dispatchers, config())
}

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl io::Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Capture {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

// ============================================================
// inspect_job
// ============================================================

#[tokio::test]
async fn test_idempotent_per_job() {
    let dispatcher = idle_dispatcher(10);
    let rec = reconciler(FakeSource::default(), vec![dispatcher], Scope::default());
    let cancel = CancellationToken::new();
    let failed = job("etl", 1, &[]);

    assert!(rec.inspect_job(&cancel, failed.clone()).await.unwrap());
    assert!(!rec.inspect_job(&cancel, failed.clone()).await.unwrap());
    let mut again = failed.clone();
    again.status.failed = 3;
    assert!(!rec.inspect_job(&cancel, again).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_claim_under_concurrency() {
    let source = FakeSource::default();
    let rec = Arc::new(reconciler(source, vec![idle_dispatcher(100)], Scope::default()));
    let cancel = CancellationToken::new();
    let failed = job("etl", 1, &[]);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let rec = rec.clone();
        let cancel = cancel.clone();
        let job = failed.clone();
        handles.push(tokio::spawn(async move {
            rec.inspect_job(&cancel, job).await.unwrap()
        }));
    }
    let mut notified = 0;
    for handle in handles {
        if handle.await.unwrap() {
            notified += 1;
        }
    }
    assert_eq!(notified, 1);
}

#[tokio::test]
async fn test_healthy_and_unselected_jobs_are_ignored() {
    let scope = Scope::new(None, LabelSelector::from_iter([("team", "data")]));
    let source = FakeSource::default();
    let rec = reconciler(source, vec![idle_dispatcher(10)], scope);
    let cancel = CancellationToken::new();

    assert!(!rec.inspect_job(&cancel, job("ok", 0, &[("team", "data")])).await.unwrap());
    assert!(!rec.inspect_job(&cancel, job("other", 2, &[("team", "web")])).await.unwrap());
    assert!(rec.dedup().is_empty());
    let mine = job("mine", 2, &[("team", "data"), ("x", "y")]);
    assert!(rec.inspect_job(&cancel, mine).await.unwrap());
}

#[tokio::test]
async fn test_pods_listed_in_job_namespace() {
    let source = Arc::new(FakeSource::default());
    let rec = Reconciler::new(
        Scope::default(),
        source.clone(),
        vec![idle_dispatcher(10)],
        config(),
    );
    let mut failed = job("etl", 1, &[]);
    failed.namespace = "analytics".into();
    rec.inspect_job(&CancellationToken::new(), failed).await.unwrap();

    assert_eq!(source.pod_listings.load(Ordering::SeqCst), 1);
    assert_eq!(*source.listed_namespaces.lock(), vec!["analytics".to_string()]);
}

#[tokio::test]
async fn test_pod_listing_failure_still_notifies() {
    let source = FakeSource {
        fail_pod_listing: true,
        ..Default::default()
    };
    let rec = reconciler(source, vec![idle_dispatcher(10)], Scope::default());
    assert!(rec
        .inspect_job(&CancellationToken::new(), job("etl", 1, &[]))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_full_queue_is_reported_and_job_stays_claimed() {
    let rec = reconciler(FakeSource::default(), vec![idle_dispatcher(1)], Scope::default());
    let cancel = CancellationToken::new();

    assert!(rec.inspect_job(&cancel, job("a", 1, &[])).await.unwrap());
    let second = job("b", 1, &[]);
    let uid = second.uid.clone();
    match rec.inspect_job(&cancel, second).await {
        Err(EngineError::Dispatch { job, errors }) => {
            assert_eq!(job, "b");
            assert_eq!(errors.len(), 1);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(rec.dedup().contains(&uid));
}

#[tokio::test]
async fn test_cancelled_token_stops_inspection() {
    let rec = reconciler(FakeSource::default(), vec![idle_dispatcher(10)], Scope::default());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = rec.inspect_job(&cancel, job("a", 1, &[])).await.unwrap_err();
    assert!(err.is_cancelled());
}

// ============================================================
// run
// ============================================================

#[tokio::test]
async fn test_preload_suppresses_existing_failures() {
    let old_failure = job("old", 1, &[]);
    let (source, events) = FakeSource {
        jobs: vec![old_failure.clone(), job("running", 0, &[])],
        ..Default::default()
    }
    .with_watch();
    let source = Arc::new(source);
    let rec = Arc::new(Reconciler::new(
        Scope::default(),
        source.clone(),
        vec![idle_dispatcher(10)],
        config(),
    ));

    let cancel = CancellationToken::new();
    let task = {
        let rec = rec.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { rec.run(cancel).await })
    };

    events.send(WatchEvent::Modified(old_failure.clone())).unwrap();
    events.send(WatchEvent::Error("too old resource version".into())).unwrap();
    events.send(WatchEvent::Bookmark).unwrap();
    let fresh = job("fresh", 1, &[]);
    events.send(WatchEvent::Added(fresh.clone())).unwrap();

    // Wait until the fresh failure has been claimed.
    for _ in 0..100 {
        if rec.dedup().contains(&fresh.uid) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(rec.dedup().contains(&fresh.uid));
    assert!(rec.dedup().contains(&old_failure.uid));
    // Only the fresh failure needed pods.
    assert_eq!(source.pod_listings.load(Ordering::SeqCst), 1);

    cancel.cancel();
    let err = task.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn test_skip_preload_notifies_existing_failures() {
    let old_failure = job("old", 1, &[]);
    let (source, events) = FakeSource {
        jobs: vec![old_failure.clone()],
        ..Default::default()
    }
    .with_watch();
    let config = EngineConfig {
        skip_preload: true,
        ..Default::default()
    };
    let rec = Arc::new(Reconciler::new(
        Scope::default(),
        Arc::new(source),
        vec![idle_dispatcher(10)],
        config,
    ));
    assert!(rec.dedup().is_empty());

    let cancel = CancellationToken::new();
    let task = {
        let rec = rec.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { rec.run(cancel).await })
    };
    events.send(WatchEvent::Modified(old_failure.clone())).unwrap();
    drop(events);

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::StreamClosed { .. }));
    assert!(rec.dedup().contains(&old_failure.uid));
}

#[test]
fn test_end_to_end_logger_scenario() {
    let capture = Capture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .without_time()
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let (source, events) = FakeSource {
            pods: HashMap::from([("nightly".to_string(), vec![pod("nightly-p1")])]),
            logs: HashMap::from([("nightly-p1".to_string(), "boom".to_string())]),
            ..Default::default()
        }
        .with_watch();

        let rules =
            parse_rules("labels: {team: data}\ndestinations:\n  logger:\n    - {}\n").unwrap();
        let dispatchers = Registry::with_defaults().build(&rules[0]).unwrap();
        let rec = Reconciler::new(
            rules[0].scope(),
            Arc::new(source),
            dispatchers.clone(),
            config(),
        );

        let cancel = CancellationToken::new();
        let mut group = TaskGroup::new(cancel.clone());
        for dispatcher in dispatchers {
            let token = group.token();
            group.spawn("logger", async move {
                dispatcher.run(token).await.map_err(EngineError::from)
            });
        }
        let token = group.token();
        group.spawn("reconciler", async move { rec.run(token).await });

        events
            .send(WatchEvent::Added(job("nightly", 1, &[("team", "data")])))
            .unwrap();
        events
            .send(WatchEvent::Added(job("other-team", 1, &[("team", "web")])))
            .unwrap();

        for _ in 0..100 {
            if capture.text().contains("boom") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        group.wait().await.unwrap();
    });

    let output = capture.text();
    assert!(output.contains("Job nightly"), "output was: {output}");
    assert!(output.contains("nightly-p1"));
    assert!(output.contains("boom"));
    assert!(!output.contains("Job other-team"));
}

#[test]
fn test_logger_renders_each_failure_once() {
    let capture = Capture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .without_time()
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        // The second pod has no logs, so fetching them fails.
        let (source, events) = FakeSource {
            pods: HashMap::from([(
                "nightly".to_string(),
                vec![pod("nightly-ok"), pod("nightly-gone")],
            )]),
            logs: HashMap::from([("nightly-ok".to_string(), "ok".to_string())]),
            ..Default::default()
        }
        .with_watch();

        let rules = parse_rules(
            r#"
destinations:
  logger:
    - retries: 0
      message: "{{.Job.Name}}:{{range .Pods}}{{.Logs}}{{end}}"
"#,
        )
        .unwrap();
        let dispatchers = Registry::with_defaults().build(&rules[0]).unwrap();
        assert_eq!(dispatchers[0].settings().retries, 0);
        let rec = Reconciler::new(
            rules[0].scope(),
            Arc::new(source),
            dispatchers.clone(),
            config(),
        );

        let cancel = CancellationToken::new();
        let mut group = TaskGroup::new(cancel.clone());
        for dispatcher in dispatchers {
            let token = group.token();
            group.spawn("logger", async move {
                dispatcher.run(token).await.map_err(EngineError::from)
            });
        }
        let token = group.token();
        group.spawn("reconciler", async move { rec.run(token).await });

        let nightly = job("nightly", 1, &[]);
        events.send(WatchEvent::Added(nightly.clone())).unwrap();
        let mut seen_again = nightly.clone();
        seen_again.status.failed = 2;
        events.send(WatchEvent::Modified(seen_again)).unwrap();
        // Events are handled in order, so once this one is logged the repeat
        // observation has been handled too.
        events.send(WatchEvent::Added(job("sentinel", 1, &[]))).unwrap();

        for _ in 0..100 {
            if capture.text().contains("sentinel:") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        group.wait().await.unwrap();
    });

    let output = capture.text();
    assert!(output.contains("sentinel:"), "output was: {output}");
    assert_eq!(output.matches("nightly:ok").count(), 1, "output was: {output}");
    assert!(!output.contains("nightly:okok"));
}
