//! Integration tests for the worker group runner.

use std::sync::Arc;
use std::time::Duration;

use fleet_machine_agent::lifecycle::{run_group, LifecycleHandle, Task, Worker};
use fleet_machine_agent::AgentError;
use rstest::rstest;

/// A worker that finishes on its own after `delay`, failing if `fail` is set.
fn timed(parent: &LifecycleHandle, name: &'static str, delay_secs: u64, fail: bool) -> Arc<dyn Worker> {
    Arc::new(Task::spawn(name, parent, move |lifecycle| async move {
        tokio::select! {
            _ = lifecycle.dying() => Ok(()),
            _ = tokio::time::sleep(Duration::from_secs(delay_secs)) => {
                if fail {
                    Err(AgentError::worker(name, "failed"))
                } else {
                    Ok(())
                }
            }
        }
    }))
}

#[rstest]
#[case::first_worker_fails_first(0, [1, 2, 3])]
#[case::middle_worker_fails_first(1, [2, 1, 3])]
#[case::last_worker_fails_first(2, [3, 2, 1])]
#[tokio::test(start_paused = true)]
async fn test_single_failure_is_reported(#[case] failing: usize, #[case] delays: [u64; 3]) {
    let names = ["a", "b", "c"];
    let parent = LifecycleHandle::new();
    let workers: Vec<Arc<dyn Worker>> = (0..3)
        .map(|i| timed(&parent, names[i], delays[i], i == failing))
        .collect();

    let err = run_group(std::future::pending(), &workers).await.unwrap_err();
    assert_eq!(err.to_string(), format!("{}: failed", names[failing]));
}

/// A worker that fails only once it has been asked to stop.
fn fails_on_stop(parent: &LifecycleHandle, name: &'static str) -> Arc<dyn Worker> {
    Arc::new(Task::spawn(name, parent, move |lifecycle| async move {
        lifecycle.dying().await;
        Err(AgentError::worker(name, "could not flush on shutdown"))
    }))
}

#[rstest]
#[case::cancelled(true)]
#[case::sibling_exited(false)]
#[tokio::test(start_paused = true)]
async fn test_error_while_stopping_is_reported(#[case] cancelled: bool) {
    let parent = LifecycleHandle::new();
    let first = if cancelled {
        timed(&parent, "a", 100, false)
    } else {
        timed(&parent, "a", 1, false)
    };
    let workers: Vec<Arc<dyn Worker>> = vec![first, fails_on_stop(&parent, "flush")];

    let cancel = async move {
        if cancelled {
            tokio::time::sleep(Duration::from_secs(1)).await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    let err = run_group(cancel, &workers).await.unwrap_err();
    assert_eq!(err.to_string(), "flush: could not flush on shutdown");
}

#[rstest]
#[case::one_worker(1)]
#[case::three_workers(3)]
#[tokio::test(start_paused = true)]
async fn test_clean_workers_return_ok(#[case] count: usize) {
    let parent = LifecycleHandle::new();
    let workers: Vec<Arc<dyn Worker>> = (0..count)
        .map(|i| timed(&parent, "clean", i as u64 + 1, false))
        .collect();

    assert!(run_group(std::future::pending(), &workers).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_any_exit_returns_ok() {
    let parent = LifecycleHandle::new();
    let workers: Vec<Arc<dyn Worker>> = vec![
        timed(&parent, "a", 10, true),
        timed(&parent, "b", 20, true),
    ];

    let cancel = tokio::time::sleep(Duration::from_secs(1));
    assert!(run_group(cancel, &workers).await.is_ok());

    // Both were stopped before their failures could happen.
    for worker in &workers {
        assert!(worker.wait().await.is_ok());
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_from_lifecycle() {
    let owner = LifecycleHandle::new();
    let cycle = owner.child();
    let workers: Vec<Arc<dyn Worker>> = vec![timed(&cycle, "a", 100, false)];

    let group = tokio::spawn({
        let cycle = cycle.clone();
        async move { run_group(cycle.dying(), &workers).await }
    });

    owner.kill(None);
    assert!(group.await.unwrap().is_ok());
    cycle.kill(None);
    cycle.done();
    assert!(cycle.wait().await.is_ok());
}
