use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use jobwatch_common::config::{AppConfig, LogFormat};
use jobwatch_common::rules::load_rules;
use jobwatch_engine::{EngineError, JobSource, Reconciler, TaskGroup};
use jobwatch_notifier::Registry;
use jobwatch_watcher::KubeSource;

const DEFAULT_LOG_FILTER: &str =
    "jobwatch=info,jobwatch_engine=info,jobwatch_notifier=info,jobwatch_watcher=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = AppConfig::from_env()?;

    init_tracing(config.log_format);
    tracing::info!("jobwatch starting...");

    let rules = load_rules(&config.config_path)
        .with_context(|| format!("load rules from {}", config.config_path.display()))?;
    if rules.is_empty() {
        tracing::warn!(
            path = %config.config_path.display(),
            "No rules configured, nothing to watch"
        );
    }

    let client = connect(config.master_url.as_deref())
        .await
        .context("connect to Kubernetes API")?;
    let source: Arc<dyn JobSource> = Arc::new(KubeSource::new(client));
    let registry = Registry::with_defaults();

    let cancel = CancellationToken::new();
    let mut group = TaskGroup::new(cancel.clone());

    for (index, rule) in rules.iter().enumerate() {
        let dispatchers = registry
            .build(rule)
            .with_context(|| format!("configure destinations of rule #{index}"))?;

        for dispatcher in &dispatchers {
            let dispatcher = dispatcher.clone();
            let token = group.token();
            group.spawn(format!("rule-{index}/{}", dispatcher.kind()), async move {
                dispatcher.run(token).await.map_err(EngineError::from)
            });
        }

        let reconciler = Reconciler::new(
            rule.scope(),
            source.clone(),
            dispatchers,
            config.engine.clone(),
        );
        tracing::info!(rule = index, scope = %reconciler.scope(), "Rule configured");
        let token = group.token();
        group.spawn(format!("rule-{index}"), async move {
            reconciler.run(token).await
        });
    }

    // Run until a task fails or a shutdown signal arrives
    tokio::spawn(shutdown_signal(cancel.clone()));
    let result = group.wait().await;
    cancel.cancel();

    match result {
        Ok(()) => {
            tracing::info!("jobwatch stopped.");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "jobwatch exited with error");
            Err(e.into())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// In-cluster or kubeconfig credentials, optionally pointed at another API
/// server.
async fn connect(master_url: Option<&str>) -> anyhow::Result<kube::Client> {
    let mut config = kube::Config::infer()
        .await
        .context("infer Kubernetes client config")?;
    if let Some(url) = master_url {
        config.cluster_url = url
            .parse()
            .with_context(|| format!("parse MASTER_URL {url:?}"))?;
    }
    tracing::info!(cluster = %config.cluster_url, "Using Kubernetes API server");
    kube::Client::try_from(config).context("build Kubernetes client")
}

async fn shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
        _ = cancel.cancelled() => return,
    }

    tracing::info!("Received shutdown signal, stopping gracefully...");
    cancel.cancel();
}
