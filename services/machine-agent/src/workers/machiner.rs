//! Machine-state reconciler.
//!
//! Polls the machine's life and assigned units. Newly assigned units are
//! deployed, units that are no longer assigned are recalled. A dead machine
//! ends the worker.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{AgentError, Result};
use crate::lifecycle::{LifecycleHandle, Task, Worker, WorkerId};
use crate::store::{Life, Machine};

/// Reconciles deployed units for one machine.
pub struct Machiner {
    task: Task,
    deployed: Arc<RwLock<BTreeSet<String>>>,
}

impl Machiner {
    pub const NAME: &'static str = "machiner";

    /// Start the reconciler for `machine`.
    pub fn new(machine: Arc<dyn Machine>, parent: &LifecycleHandle, poll_interval: Duration) -> Self {
        let deployed = Arc::new(RwLock::new(BTreeSet::new()));
        let task = Task::spawn(Self::NAME, parent, {
            let deployed = Arc::clone(&deployed);
            move |lifecycle| run(machine, lifecycle, poll_interval, deployed)
        });

        Self { task, deployed }
    }

    /// Units currently deployed, sorted.
    pub async fn deployed(&self) -> Vec<String> {
        self.deployed.read().await.iter().cloned().collect()
    }
}

#[async_trait]
impl Worker for Machiner {
    fn name(&self) -> &str {
        self.task.name()
    }

    fn id(&self) -> WorkerId {
        self.task.id()
    }

    async fn wait(&self) -> Result<()> {
        self.task.wait().await
    }

    async fn stop(&self) -> Result<()> {
        self.task.stop().await
    }
}

async fn run(
    machine: Arc<dyn Machine>,
    lifecycle: LifecycleHandle,
    poll_interval: Duration,
    deployed: Arc<RwLock<BTreeSet<String>>>,
) -> Result<()> {
    info!(machine_id = %machine.id(), "Starting machiner");

    let dying = lifecycle.dying();
    tokio::pin!(dying);
    let mut ticker = tokio::time::interval(poll_interval);

    loop {
        tokio::select! {
            _ = &mut dying => {
                debug!(machine_id = %machine.id(), "Machiner shutting down");
                return Ok(());
            }
            _ = ticker.tick() => reconcile(machine.as_ref(), &deployed).await?,
        }
    }
}

async fn reconcile(machine: &dyn Machine, deployed: &RwLock<BTreeSet<String>>) -> Result<()> {
    if machine.life().await? == Life::Dead {
        return Err(AgentError::MachineDead(machine.id()));
    }

    let assigned: BTreeSet<String> = machine.units().await?.into_iter().collect();
    let mut deployed = deployed.write().await;

    for unit in deployed.difference(&assigned) {
        info!(machine_id = %machine.id(), unit = %unit, "Recalling unit");
    }
    for unit in assigned.difference(&deployed) {
        info!(machine_id = %machine.id(), unit = %unit, "Deploying unit");
    }

    *deployed = assigned;
    Ok(())
}
