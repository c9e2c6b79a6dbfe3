//! Upgrade checker.
//!
//! Watches the agent binary the controller proposes for the machine. When
//! it differs from the running binary the worker ends with
//! [`AgentError::Upgraded`], which the supervisor turns into a tools change
//! and a clean exit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{AgentError, Result};
use crate::lifecycle::{LifecycleHandle, Task, Worker, WorkerId};
use crate::store::Machine;
use crate::tools::Binary;

/// Checks for proposed agent upgrades.
pub struct Upgrader {
    task: Task,
}

impl Upgrader {
    pub const NAME: &'static str = "upgrader";

    /// Start checking `machine` for upgrades away from `current`.
    pub fn new(
        agent: &str,
        machine: Arc<dyn Machine>,
        current: Binary,
        parent: &LifecycleHandle,
        poll_interval: Duration,
    ) -> Self {
        let agent = agent.to_string();
        let task = Task::spawn(Self::NAME, parent, move |lifecycle| {
            run(agent, machine, current, lifecycle, poll_interval)
        });
        Self { task }
    }
}

#[async_trait]
impl Worker for Upgrader {
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
    agent: String,
    machine: Arc<dyn Machine>,
    current: Binary,
    lifecycle: LifecycleHandle,
    poll_interval: Duration,
) -> Result<()> {
    debug!(agent = %agent, current = %current, "Starting upgrader");

    let dying = lifecycle.dying();
    tokio::pin!(dying);
    let mut ticker = tokio::time::interval(poll_interval);

    loop {
        tokio::select! {
            _ = &mut dying => return Ok(()),
            _ = ticker.tick() => {
                let Some(proposed) = machine.proposed_tools().await? else {
                    continue;
                };
                if proposed != current {
                    info!(
                        agent = %agent,
                        machine_id = %machine.id(),
                        current = %current,
                        proposed = %proposed,
                        "Agent upgrade proposed"
                    );
                    return Err(AgentError::Upgraded(proposed));
                }
            }
        }
    }
}
