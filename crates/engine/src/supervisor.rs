//! Fail-fast supervision of long-running tasks.

use std::future::Future;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;

/// A set of tasks sharing one cancellation token.
///
/// The first task to fail with anything other than cancellation cancels the
/// token, which stops every other task. [`TaskGroup::wait`] reports that
/// first failure.
pub struct TaskGroup {
    tasks: JoinSet<Result<(), EngineError>>,
    cancel: CancellationToken,
}

impl TaskGroup {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            cancel,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn spawn<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        let name = name.into();
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            let result = task.await;
            if let Err(e) = &result {
                if !e.is_cancelled() {
                    tracing::error!(task = %name, error = %e, "Task failed, stopping");
                    cancel.cancel();
                }
            }
            result
        });
    }

    /// Join every task. Returns the first non-cancellation error, if any.
    pub async fn wait(mut self) -> Result<(), EngineError> {
        let mut first: Option<EngineError> = None;

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => {
                    first.get_or_insert(e);
                }
                Err(join_error) => {
                    self.cancel.cancel();
                    if join_error.is_panic() {
                        tracing::error!(error = %join_error, "Task panicked, stopping");
                        first.get_or_insert(EngineError::Panicked(join_error.to_string()));
                    }
                }
            }
        }

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
