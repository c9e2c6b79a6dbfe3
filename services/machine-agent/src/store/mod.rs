//! Interface to the controller's state store.
//!
//! The agent only needs a narrow slice of the store: open a connection,
//! look up its own machine, read what that machine should be running, and
//! close the connection again. Each supervisor cycle owns exactly one
//! connection.
//!
//! Two implementations are provided:
//! - `MemoryStore`: in-process store with fault injection, for tests and dev
//! - `FileStore`: reads machine records from a JSON state file

mod file;
mod memory;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::tools::Binary;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Identifier of a machine in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(u64);

impl MachineId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MachineId {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim().parse::<u64>().map(Self).map_err(|_| {
            AgentError::Config(
                "--machine-id option must be set, and expects a non-negative integer".to_string(),
            )
        })
    }
}

/// Machine life as recorded by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Life {
    #[default]
    Alive,
    Dying,
    Dead,
}

/// Parameters for reaching the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreInfo {
    /// Location of the store's state.
    pub path: PathBuf,
}

/// A machine as held by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub id: MachineId,

    #[serde(default)]
    pub life: Life,

    /// Units assigned to the machine.
    #[serde(default)]
    pub units: Vec<String>,

    /// Agent binary the controller wants the machine to run.
    #[serde(default)]
    pub proposed_tools: Option<Binary>,
}

impl MachineRecord {
    pub fn new(id: MachineId) -> Self {
        Self {
            id,
            life: Life::Alive,
            units: Vec::new(),
            proposed_tools: None,
        }
    }
}

/// Opens connections to the store.
#[async_trait]
pub trait Store: Send + Sync {
    async fn open(&self, info: &StoreInfo) -> Result<Box<dyn Connection>>;
}

/// One open connection to the store.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Look up a machine by id.
    async fn machine(&self, id: MachineId) -> Result<Arc<dyn Machine>>;

    /// Close the connection. Machines obtained from it stop working.
    async fn close(&self) -> Result<()>;
}

/// A machine obtained from a connection.
#[async_trait]
pub trait Machine: Send + Sync {
    fn id(&self) -> MachineId;

    async fn life(&self) -> Result<Life>;

    async fn units(&self) -> Result<Vec<String>>;

    async fn proposed_tools(&self) -> Result<Option<Binary>>;
}
