//! Shared kill/dying/dead latch for a group of cooperating tasks.
//!
//! A [`LifecycleHandle`] moves through `Alive -> Dying -> Dead`:
//! - `kill` moves an alive handle to `Dying` and records the reason. The first
//!   kill wins; later kills leave the recorded reason untouched.
//! - `dying` resolves as soon as the handle has left `Alive`.
//! - `done` is called once by the owner, after every dependent task has
//!   stopped, and moves the handle to `Dead`.
//! - `wait` resolves once the handle is `Dead` and yields the recorded reason.
//!
//! The state lives in a `watch` channel so transitions are atomic and every
//! subscriber observes them.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::trace;

use crate::error::{AgentError, Result};

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Running; no kill has been requested.
    Alive,
    /// Kill requested; dependents are winding down.
    Dying,
    /// Every dependent has stopped.
    Dead,
}

#[derive(Debug)]
struct Inner {
    state: LifecycleState,
    /// Set at most once, by the kill that moved the handle out of `Alive`.
    /// `None` after that kill means a clean stop.
    reason: Option<AgentError>,
}

/// Cloneable handle to a shared lifecycle.
#[derive(Debug, Clone)]
pub struct LifecycleHandle {
    tx: Arc<watch::Sender<Inner>>,
}

impl LifecycleHandle {
    /// Create a new alive handle.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Inner {
            state: LifecycleState::Alive,
            reason: None,
        });
        Self { tx: Arc::new(tx) }
    }

    /// Request termination, recording `reason` if this is the first request.
    pub fn kill(&self, reason: Option<AgentError>) {
        let killed = self.tx.send_if_modified(|inner| {
            if inner.state != LifecycleState::Alive {
                return false;
            }
            inner.state = LifecycleState::Dying;
            inner.reason = reason;
            true
        });

        if killed {
            trace!("Lifecycle dying");
        }
    }

    /// Resolves once the handle has left `Alive`.
    ///
    /// The returned future owns its subscription, so it can be moved into
    /// another task.
    pub fn dying(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.tx.subscribe();
        async move {
            let _ = rx
                .wait_for(|inner| inner.state != LifecycleState::Alive)
                .await;
        }
    }

    /// Mark every dependent as stopped.
    ///
    /// # Panics
    ///
    /// Panics if the handle was never killed or is already dead. Either case
    /// means the owner has lost track of its tasks.
    pub fn done(&self) {
        let mut prior = LifecycleState::Alive;
        self.tx.send_if_modified(|inner| {
            prior = inner.state;
            if prior != LifecycleState::Dying {
                return false;
            }
            inner.state = LifecycleState::Dead;
            true
        });

        match prior {
            LifecycleState::Dying => trace!("Lifecycle dead"),
            LifecycleState::Alive => panic!("lifecycle: done called while still alive"),
            LifecycleState::Dead => panic!("lifecycle: done called twice"),
        }
    }

    /// Wait until the handle is `Dead` and return the recorded reason.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.tx.subscribe();
        let dead = rx
            .wait_for(|inner| inner.state == LifecycleState::Dead)
            .await;
        match dead.ok().and_then(|inner| inner.reason.clone()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The recorded reason without blocking.
    ///
    /// Returns [`AgentError::StillAlive`] if the handle has not been killed,
    /// which keeps "never killed" apart from "killed cleanly".
    pub fn err(&self) -> Result<()> {
        let inner = self.tx.borrow();
        match (&inner.state, &inner.reason) {
            (LifecycleState::Alive, _) => Err(AgentError::StillAlive),
            (_, Some(err)) => Err(err.clone()),
            (_, None) => Ok(()),
        }
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        self.tx.borrow().state
    }

    /// Whether no kill has been requested yet.
    pub fn is_alive(&self) -> bool {
        self.state() == LifecycleState::Alive
    }

    /// Create a fresh handle that is killed cleanly when this one starts
    /// dying. Killing the child does not affect this handle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn child(&self) -> LifecycleHandle {
        let child = LifecycleHandle::new();
        child.link(self);
        child
    }

    /// Kill this handle cleanly once `parent` starts dying.
    pub(crate) fn link(&self, parent: &LifecycleHandle) {
        let parent_dying = parent.dying();
        let own_dying = self.dying();
        let handle = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent_dying => handle.kill(None),
                _ = own_dying => {}
            }
        });
    }
}

impl Default for LifecycleHandle {
    fn default() -> Self {
        Self::new()
    }
}
