//! Runs a fixed set of started workers as one unit.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info};

use super::worker::Worker;
use crate::error::{AgentError, Result};

/// What ended the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// The cancel signal fired.
    Cancelled,
    /// The worker at this index terminated.
    Exited(usize),
    /// A waiter failed, so which worker terminated is not known.
    Unknown,
}

/// Run `workers` until the first of them terminates or `cancel` fires, then
/// stop them all and return a single result for the group.
///
/// Stop requests go out to every worker at once and all of them are awaited.
/// The result is the first error among the workers' terminal results, in the
/// order the workers were supplied, or `Ok` if none failed. A cancelled group
/// whose workers all stopped cleanly therefore returns `Ok`, while an error a
/// worker returns while stopping is still reported.
///
/// A worker that never terminates after being stopped blocks this call.
pub async fn run_group<C>(cancel: C, workers: &[Arc<dyn Worker>]) -> Result<()>
where
    C: Future<Output = ()> + Send,
{
    if workers.is_empty() {
        return Err(anyhow::anyhow!("cannot run an empty worker group").into());
    }

    let mut exits = JoinSet::new();
    for (index, worker) in workers.iter().enumerate() {
        let worker = Arc::clone(worker);
        exits.spawn(async move {
            let _ = worker.wait().await;
            index
        });
    }

    let trigger = tokio::select! {
        _ = cancel => Trigger::Cancelled,
        Some(exited) = exits.join_next() => match exited {
            Ok(index) => Trigger::Exited(index),
            // A waiter only fails if its worker panicked inside wait.
            Err(_) => Trigger::Unknown,
        },
    };
    exits.abort_all();

    match trigger {
        Trigger::Cancelled => info!(workers = workers.len(), "Worker group cancelled, stopping workers"),
        Trigger::Exited(index) => info!(
            worker = %workers[index].name(),
            worker_id = %workers[index].id(),
            "Worker exited, stopping group"
        ),
        Trigger::Unknown => info!(worker = "unknown", "Worker exited, stopping group"),
    }

    let results = stop_all(workers).await;

    let result = results.into_iter().find_map(|r| r.err());
    match &result {
        Some(e) => debug!(error = %e, "Worker group stopped with error"),
        None => debug!("Worker group stopped cleanly"),
    }
    result.map_or(Ok(()), Err)
}

/// Stop every worker concurrently and collect terminal results in supply
/// order.
async fn stop_all(workers: &[Arc<dyn Worker>]) -> Vec<Result<()>> {
    let mut stops = JoinSet::new();
    for (index, worker) in workers.iter().enumerate() {
        let worker = Arc::clone(worker);
        stops.spawn(async move { (index, worker.stop().await) });
    }

    let mut results: Vec<Option<Result<()>>> = vec![None; workers.len()];
    while let Some(joined) = stops.join_next().await {
        match joined {
            Ok((index, result)) => results[index] = Some(result),
            Err(e) => debug!(error = %e, "Worker stop task failed"),
        }
    }

    results
        .into_iter()
        .zip(workers)
        .map(|(result, worker)| {
            result.unwrap_or_else(|| {
                Err(AgentError::worker(worker.name(), "stop did not complete"))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{LifecycleHandle, Task};
    use std::time::Duration;

    fn idle(parent: &LifecycleHandle, name: &str) -> Arc<dyn Worker> {
        Arc::new(Task::spawn(name, parent, |lifecycle| async move {
            lifecycle.dying().await;
            Ok(())
        }))
    }

    fn exits_after(
        parent: &LifecycleHandle,
        name: &str,
        delay: Duration,
        result: Result<()>,
    ) -> Arc<dyn Worker> {
        Arc::new(Task::spawn(name, parent, move |lifecycle| async move {
            tokio::select! {
                _ = lifecycle.dying() => Ok(()),
                _ = tokio::time::sleep(delay) => result,
            }
        }))
    }

    #[tokio::test]
    async fn test_empty_group_is_rejected() {
        assert!(run_group(std::future::pending(), &[]).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_clean_returns_ok() {
        let parent = LifecycleHandle::new();
        let workers = vec![
            exits_after(&parent, "a", Duration::from_secs(1), Ok(())),
            idle(&parent, "b"),
        ];

        assert!(run_group(std::future::pending(), &workers).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_returns_ok() {
        let parent = LifecycleHandle::new();
        let workers = vec![idle(&parent, "a"), idle(&parent, "b"), idle(&parent, "c")];

        let cancel = tokio::time::sleep(Duration::from_secs(1));
        assert!(run_group(cancel, &workers).await.is_ok());
        for worker in &workers {
            assert!(worker.wait().await.is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_after_stop_request_is_reported() {
        let parent = LifecycleHandle::new();
        let failing: Arc<dyn Worker> = Arc::new(Task::spawn("a", &parent, |lifecycle| async move {
            lifecycle.dying().await;
            Err(AgentError::worker("a", "failed while stopping"))
        }));
        let workers = vec![idle(&parent, "b"), failing];

        let cancel = tokio::time::sleep(Duration::from_secs(1));
        let err = run_group(cancel, &workers).await.unwrap_err();
        assert_eq!(err.to_string(), "a: failed while stopping");
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_exit_then_error_while_stopping() {
        let parent = LifecycleHandle::new();
        let failing: Arc<dyn Worker> = Arc::new(Task::spawn("b", &parent, |lifecycle| async move {
            lifecycle.dying().await;
            Err(AgentError::worker("b", "failed while stopping"))
        }));
        let workers = vec![
            exits_after(&parent, "a", Duration::from_secs(1), Ok(())),
            failing,
        ];

        let err = run_group(std::future::pending(), &workers).await.unwrap_err();
        assert_eq!(err.to_string(), "b: failed while stopping");
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_in_supply_order() {
        let parent = LifecycleHandle::new();
        let workers = vec![
            exits_after(&parent, "a", Duration::from_secs(1), Ok(())),
            exits_after(&parent, "b", Duration::from_secs(3), Err(AgentError::worker("b", "late"))),
            idle(&parent, "c"),
        ];

        // "a" exits first and cleanly; "b" is stopped before it can fail.
        assert!(run_group(std::future::pending(), &workers).await.is_ok());

        let parent = LifecycleHandle::new();
        let workers = vec![
            exits_after(&parent, "a", Duration::from_secs(2), Err(AgentError::worker("a", "second"))),
            exits_after(&parent, "b", Duration::from_secs(1), Err(AgentError::worker("b", "first"))),
        ];

        // "b" fails first, "a" is stopped cleanly.
        let err = run_group(std::future::pending(), &workers).await.unwrap_err();
        assert_eq!(err.to_string(), "b: first");
    }

    #[tokio::test(start_paused = true)]
    async fn test_tie_break_uses_supply_order() {
        let parent = LifecycleHandle::new();
        let workers = vec![
            exits_after(&parent, "a", Duration::from_secs(1), Err(AgentError::worker("a", "x"))),
            exits_after(&parent, "b", Duration::from_secs(1), Err(AgentError::worker("b", "y"))),
        ];

        // Let both fail before the group looks at them.
        tokio::time::sleep(Duration::from_secs(2)).await;
        let err = run_group(std::future::pending(), &workers).await.unwrap_err();
        assert_eq!(err.to_string(), "a: x");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_called_on_every_worker() {
        let parent = LifecycleHandle::new();
        let workers = vec![
            idle(&parent, "a"),
            exits_after(&parent, "b", Duration::from_secs(1), Err(AgentError::worker("b", "down"))),
            idle(&parent, "c"),
        ];

        let err = run_group(std::future::pending(), &workers).await.unwrap_err();
        assert_eq!(err.to_string(), "b: down");
        assert!(parent.is_alive());
        for worker in &workers {
            // Every task has terminated; waiting returns immediately.
            let _ = tokio::time::timeout(Duration::from_millis(1), worker.wait())
                .await
                .unwrap();
        }
    }
}
