//! Worker contract and the task helper concrete workers are built on.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info};
use ulid::Ulid;

use super::handle::LifecycleHandle;
use crate::error::{AgentError, Result};

/// Opaque identity of one running worker task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(Ulid);

impl WorkerId {
    pub const PREFIX: &'static str = "wrk";

    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", Self::PREFIX, self.0)
    }
}

/// A long-running task that takes part in a supervised group.
///
/// Workers report failure only through their own termination result; they
/// never write to the group's shared lifecycle.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Worker name for logging.
    fn name(&self) -> &str;

    /// Identity of the running task.
    fn id(&self) -> WorkerId;

    /// Resolves once the task has terminated, with its terminal result.
    async fn wait(&self) -> Result<()>;

    /// Ask the task to stop and wait for it to terminate.
    ///
    /// Safe to call any number of times, including after the task has
    /// already stopped on its own. Returns the terminal result.
    async fn stop(&self) -> Result<()>;
}

/// A worker body running on its own tokio task.
///
/// The body receives the task's own lifecycle and should return once that
/// lifecycle starts dying. The task lifecycle is linked to a parent, so a
/// dying parent stops the task as well.
///
/// The terminal result is whatever the body returned, independent of why
/// the lifecycle was killed.
#[derive(Debug)]
pub struct Task {
    name: String,
    id: WorkerId,
    lifecycle: LifecycleHandle,
    result: Arc<watch::Sender<Option<Result<()>>>>,
}

impl Task {
    /// Spawn `body` as a new task bound to `parent`.
    pub fn spawn<F, Fut>(name: impl Into<String>, parent: &LifecycleHandle, body: F) -> Self
    where
        F: FnOnce(LifecycleHandle) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let id = WorkerId::new();
        let lifecycle = LifecycleHandle::new();
        lifecycle.link(parent);

        let body = tokio::spawn(body(lifecycle.clone()));

        let (result_tx, _) = watch::channel(None);
        let result_tx = Arc::new(result_tx);

        let task_name = name.clone();
        let task_lifecycle = lifecycle.clone();
        let task_result = Arc::clone(&result_tx);
        tokio::spawn(async move {
            let result = match body.await {
                Ok(result) => result,
                Err(e) => {
                    error!(worker = %task_name, worker_id = %id, error = %e, "Worker task panicked");
                    Err(AgentError::worker(&task_name, format!("task failed: {e}")))
                }
            };

            match &result {
                Ok(()) => debug!(worker = %task_name, worker_id = %id, "Worker stopped"),
                Err(e) => debug!(worker = %task_name, worker_id = %id, error = %e, "Worker stopped with error"),
            }

            task_lifecycle.kill(result.as_ref().err().cloned());
            task_result.send_replace(Some(result));
            task_lifecycle.done();
        });

        info!(worker = %name, worker_id = %id, "Started worker");

        Self {
            name,
            id,
            lifecycle,
            result: result_tx,
        }
    }

    /// The task's own lifecycle.
    pub fn lifecycle(&self) -> &LifecycleHandle {
        &self.lifecycle
    }
}

#[async_trait]
impl Worker for Task {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> WorkerId {
        self.id
    }

    async fn wait(&self) -> Result<()> {
        let mut rx = self.result.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(result) => result.clone().unwrap_or(Ok(())),
            Err(_) => Err(AgentError::worker(&self.name, "task result lost")),
        };
        outcome
    }

    async fn stop(&self) -> Result<()> {
        self.lifecycle.kill(None);
        self.wait().await
    }
}
