//! Error types for the machine agent.

use std::sync::Arc;

use thiserror::Error;

use crate::store::MachineId;
use crate::tools::Binary;

/// Result alias used throughout the agent.
pub type Result<T, E = AgentError> = std::result::Result<T, E>;

/// Errors produced by workers, the store, and the supervisor loop.
///
/// Cloneable so that one recorded terminal error can be handed to every
/// waiter of a [`LifecycleHandle`](crate::lifecycle::LifecycleHandle).
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    /// Returned by `LifecycleHandle::err` before the handle has been killed.
    #[error("still alive")]
    StillAlive,

    /// The running agent binary is stale and must be replaced.
    #[error("must restart: an agent upgrade is available")]
    Upgraded(Binary),

    /// The store could not be reached or refused a request.
    #[error("store error: {0}")]
    Store(String),

    /// The configured machine does not exist in the store.
    #[error("machine {0} not found")]
    MachineNotFound(MachineId),

    /// The machine has been marked dead.
    #[error("machine {0} is dead")]
    MachineDead(MachineId),

    /// New agent tools could not be materialized locally.
    #[error("cannot change agent tools: {0}")]
    Tools(String),

    /// A worker hit a recoverable fault.
    #[error("{worker}: {message}")]
    Worker { worker: String, message: String },

    /// The agent configuration is invalid.
    #[error("{0}")]
    Config(String),

    /// Anything else.
    #[error(transparent)]
    Internal(Arc<anyhow::Error>),
}

impl AgentError {
    /// Create a worker fault.
    pub fn worker(worker: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Worker {
            worker: worker.into(),
            message: message.into(),
        }
    }

    /// Returns the target binary if this is the upgrade signal.
    pub fn upgrade_target(&self) -> Option<&Binary> {
        match self {
            AgentError::Upgraded(binary) => Some(binary),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Internal(Arc::new(err))
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::Internal(Arc::new(err.into()))
    }
}
