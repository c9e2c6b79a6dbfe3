//! Store backed by a JSON state file.
//!
//! The file holds the machine records the controller publishes:
//!
//! ```json
//! {"machines": [{"id": 0, "life": "alive", "units": ["web/0"], "proposed_tools": "2.0.0-linux-x86_64"}]}
//! ```
//!
//! Every read goes back to the file so changes made by the controller are
//! picked up without reconnecting.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Connection, Life, Machine, MachineId, MachineRecord, Store, StoreInfo};
use crate::error::{AgentError, Result};
use crate::tools::Binary;

/// Contents of the state file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default)]
    pub machines: Vec<MachineRecord>,
}

impl StateFile {
    async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| AgentError::Store(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| AgentError::Store(format!("cannot parse {}: {e}", path.display())))
    }

    fn machine(&self, id: MachineId) -> Option<&MachineRecord> {
        self.machines.iter().find(|m| m.id == id)
    }
}

/// Opens connections to a JSON state file.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileStore;

impl FileStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Store for FileStore {
    async fn open(&self, info: &StoreInfo) -> Result<Box<dyn Connection>> {
        // Fail the open if the file is unreadable rather than on first lookup.
        let state = StateFile::load(&info.path).await?;
        debug!(
            path = %info.path.display(),
            machines = state.machines.len(),
            "Opened state file"
        );

        Ok(Box::new(FileConnection {
            path: Arc::new(info.path.clone()),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct FileConnection {
    path: Arc<PathBuf>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for FileConnection {
    async fn machine(&self, id: MachineId) -> Result<Arc<dyn Machine>> {
        check_open(&self.closed)?;
        let state = StateFile::load(&self.path).await?;
        if state.machine(id).is_none() {
            return Err(AgentError::MachineNotFound(id));
        }
        Ok(Arc::new(FileMachine {
            id,
            path: Arc::clone(&self.path),
            closed: Arc::clone(&self.closed),
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(AgentError::Store("connection already closed".to_string()));
        }
        Ok(())
    }
}

struct FileMachine {
    id: MachineId,
    path: Arc<PathBuf>,
    closed: Arc<AtomicBool>,
}

impl FileMachine {
    async fn record(&self) -> Result<MachineRecord> {
        check_open(&self.closed)?;
        StateFile::load(&self.path)
            .await?
            .machine(self.id)
            .cloned()
            .ok_or(AgentError::MachineNotFound(self.id))
    }
}

#[async_trait]
impl Machine for FileMachine {
    fn id(&self) -> MachineId {
        self.id
    }

    async fn life(&self) -> Result<Life> {
        Ok(self.record().await?.life)
    }

    async fn units(&self) -> Result<Vec<String>> {
        Ok(self.record().await?.units)
    }

    async fn proposed_tools(&self) -> Result<Option<Binary>> {
        Ok(self.record().await?.proposed_tools)
    }
}

fn check_open(closed: &AtomicBool) -> Result<()> {
    if closed.load(Ordering::SeqCst) {
        return Err(AgentError::Store("connection is closed".to_string()));
    }
    Ok(())
}
