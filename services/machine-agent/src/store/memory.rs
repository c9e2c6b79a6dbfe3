//! In-memory store for tests and development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{Connection, Life, Machine, MachineId, MachineRecord, Store, StoreInfo};
use crate::error::{AgentError, Result};
use crate::tools::Binary;

/// In-memory store shared between clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    machines: RwLock<HashMap<MachineId, MachineRecord>>,

    /// Number of upcoming opens that should fail.
    failing_opens: AtomicU32,

    opens: AtomicU64,
    closes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a machine.
    pub async fn add_machine(&self, record: MachineRecord) {
        self.shared.machines.write().await.insert(record.id, record);
    }

    pub async fn set_life(&self, id: MachineId, life: Life) -> Result<()> {
        self.update(id, |record| record.life = life).await
    }

    pub async fn set_units(&self, id: MachineId, units: Vec<String>) -> Result<()> {
        self.update(id, |record| record.units = units).await
    }

    pub async fn propose_tools(&self, id: MachineId, binary: Option<Binary>) -> Result<()> {
        self.update(id, |record| record.proposed_tools = binary).await
    }

    /// Make the next `count` opens fail as if the store were unreachable.
    pub fn fail_opens(&self, count: u32) {
        self.shared.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Number of successful opens so far.
    pub fn opens(&self) -> u64 {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// Number of connections closed so far.
    pub fn closes(&self) -> u64 {
        self.shared.closes.load(Ordering::SeqCst)
    }

    /// Connections opened but not yet closed.
    pub fn open_connections(&self) -> u64 {
        self.opens() - self.closes()
    }

    async fn update(&self, id: MachineId, f: impl FnOnce(&mut MachineRecord)) -> Result<()> {
        let mut machines = self.shared.machines.write().await;
        let record = machines
            .get_mut(&id)
            .ok_or(AgentError::MachineNotFound(id))?;
        f(record);
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn open(&self, _info: &StoreInfo) -> Result<Box<dyn Connection>> {
        let failed = self
            .shared
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(AgentError::Store("store unreachable".to_string()));
        }

        let serial = self.shared.opens.fetch_add(1, Ordering::SeqCst);
        debug!(connection = serial, "Opened memory store connection");

        Ok(Box::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn machine(&self, id: MachineId) -> Result<Arc<dyn Machine>> {
        check_open(&self.closed)?;
        if !self.shared.machines.read().await.contains_key(&id) {
            return Err(AgentError::MachineNotFound(id));
        }
        Ok(Arc::new(MemoryMachine {
            id,
            shared: Arc::clone(&self.shared),
            closed: Arc::clone(&self.closed),
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(AgentError::Store("connection already closed".to_string()));
        }
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryMachine {
    id: MachineId,
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
}

impl MemoryMachine {
    async fn record(&self) -> Result<MachineRecord> {
        check_open(&self.closed)?;
        self.shared
            .machines
            .read()
            .await
            .get(&self.id)
            .cloned()
            .ok_or(AgentError::MachineNotFound(self.id))
    }
}

#[async_trait]
impl Machine for MemoryMachine {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn info() -> StoreInfo {
        StoreInfo {
            path: PathBuf::from("memory"),
        }
    }

    #[tokio::test]
    async fn test_machine_lookup() {
        let store = MemoryStore::new();
        store.add_machine(MachineRecord::new(MachineId::new(0))).await;
        store
            .set_units(MachineId::new(0), vec!["web/0".to_string()])
            .await
            .unwrap();

        let conn = store.open(&info()).await.unwrap();
        let machine = conn.machine(MachineId::new(0)).await.unwrap();
        assert_eq!(machine.id(), MachineId::new(0));
        assert_eq!(machine.life().await.unwrap(), Life::Alive);
        assert_eq!(machine.units().await.unwrap(), vec!["web/0".to_string()]);
        assert_eq!(machine.proposed_tools().await.unwrap(), None);

        let missing = conn.machine(MachineId::new(9)).await;
        assert!(matches!(missing, Err(AgentError::MachineNotFound(_))));
    }

    #[tokio::test]
    async fn test_close_invalidates_machines() {
        let store = MemoryStore::new();
        store.add_machine(MachineRecord::new(MachineId::new(0))).await;

        let conn = store.open(&info()).await.unwrap();
        let machine = conn.machine(MachineId::new(0)).await.unwrap();
        assert_eq!(store.open_connections(), 1);

        conn.close().await.unwrap();
        assert_eq!(store.closes(), 1);
        assert_eq!(store.open_connections(), 0);
        assert!(matches!(machine.life().await, Err(AgentError::Store(_))));
        assert!(conn.close().await.is_err());
        assert_eq!(store.closes(), 1);
    }

    #[tokio::test]
    async fn test_fail_opens() {
        let store = MemoryStore::new();
        store.fail_opens(2);

        assert!(matches!(store.open(&info()).await, Err(AgentError::Store(_))));
        assert!(store.open(&info()).await.is_err());
        assert!(store.open(&info()).await.is_ok());
        assert_eq!(store.opens(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_machine() {
        let store = MemoryStore::new();
        let result = store.set_life(MachineId::new(4), Life::Dead).await;
        assert!(matches!(result, Err(AgentError::MachineNotFound(_))));
    }
}
