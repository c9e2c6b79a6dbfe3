//! Machine agent supervisor loop.
//!
//! The agent runs its worker set in cycles:
//!
//! ```text
//! open store -> resolve machine -> start workers -> run_group -> classify
//!      ^                                                            |
//!      +---------------- retry delay (unless stopping) -------------+
//! ```
//!
//! Each cycle owns its store connection and a child of the agent lifecycle.
//! Both are torn down before the next cycle starts. A finished cycle is
//! classified as:
//! - `UpgradeNeeded`: switch tools and exit cleanly so the process
//!   supervisor restarts us on the new binary. If the switch fails the
//!   cycle is retried like any other failure.
//! - `Stop`: the agent was killed; exit with the recorded reason.
//! - `Transient`: wait the fixed retry delay, then start a new cycle. A stop
//!   request during the wait ends the agent instead.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::lifecycle::{run_group, LifecycleHandle, Worker};
use crate::store::{Connection, Machine, Store};
use crate::tools::{Binary, Tools, ToolsManager};
use crate::workers::{Machiner, Upgrader};

/// Agent name used for the tools link.
pub const AGENT_NAME: &str = "machine";

/// How the agent finished without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentExit {
    /// Stopped on request.
    Stopped,
    /// New tools are in place; the process should be restarted on them.
    Upgraded(Tools),
}

impl AgentExit {
    /// Process exit code. Both outcomes are clean.
    pub fn exit_code(&self) -> i32 {
        0
    }
}

/// Classification of a finished cycle.
#[derive(Debug)]
pub enum CycleOutcome {
    /// Retry after the retry delay.
    Transient(AgentError),
    /// The running binary is stale.
    UpgradeNeeded(Binary),
    /// The agent is stopping with this result.
    Stop(Result<()>),
}

/// Decide what a cycle's result means for the agent.
///
/// The upgrade signal takes precedence over a stop request; a stop request
/// takes precedence over any other error.
pub fn classify(result: Result<()>, lifecycle: &LifecycleHandle) -> CycleOutcome {
    if let Err(AgentError::Upgraded(binary)) = &result {
        return CycleOutcome::UpgradeNeeded(binary.clone());
    }
    if !lifecycle.is_alive() {
        return CycleOutcome::Stop(lifecycle.err());
    }
    match result {
        Ok(()) => CycleOutcome::Transient(AgentError::worker(
            AGENT_NAME,
            "workers stopped without error",
        )),
        Err(err) => CycleOutcome::Transient(err),
    }
}

/// Builds the worker set for one cycle.
pub trait WorkerFactory: Send + Sync {
    fn workers(
        &self,
        machine: Arc<dyn Machine>,
        cycle: &LifecycleHandle,
        config: &AgentConfig,
    ) -> Vec<Arc<dyn Worker>>;
}

/// The standard machine agent workers: machiner and upgrader.
#[derive(Debug, Clone, Copy, Default)]
pub struct MachineWorkers;

impl WorkerFactory for MachineWorkers {
    fn workers(
        &self,
        machine: Arc<dyn Machine>,
        cycle: &LifecycleHandle,
        config: &AgentConfig,
    ) -> Vec<Arc<dyn Worker>> {
        vec![
            Arc::new(Machiner::new(
                Arc::clone(&machine),
                cycle,
                config.poll_interval,
            )),
            Arc::new(Upgrader::new(
                AGENT_NAME,
                machine,
                config.current.clone(),
                cycle,
                config.poll_interval,
            )),
        ]
    }
}

/// Supervises the worker set for one machine.
pub struct MachineAgent {
    config: AgentConfig,
    store: Arc<dyn Store>,
    tools: Arc<dyn ToolsManager>,
    workers: Arc<dyn WorkerFactory>,
    lifecycle: LifecycleHandle,
}

impl MachineAgent {
    /// Create an agent running the standard workers.
    pub fn new(config: AgentConfig, store: Arc<dyn Store>, tools: Arc<dyn ToolsManager>) -> Self {
        Self {
            config,
            store,
            tools,
            workers: Arc::new(MachineWorkers),
            lifecycle: LifecycleHandle::new(),
        }
    }

    /// Replace the worker set built for each cycle.
    pub fn with_workers(mut self, workers: Arc<dyn WorkerFactory>) -> Self {
        self.workers = workers;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// The agent-wide lifecycle.
    pub fn lifecycle(&self) -> &LifecycleHandle {
        &self.lifecycle
    }

    /// Request the agent to stop, recording `reason` if it is the first
    /// request.
    pub fn kill(&self, reason: Option<AgentError>) {
        self.lifecycle.kill(reason);
    }

    /// Stop the agent and wait for `run` to return.
    pub async fn stop(&self) -> Result<()> {
        self.lifecycle.kill(None);
        self.lifecycle.wait().await
    }

    /// Run cycles until the agent is stopped or exits for an upgrade.
    ///
    /// Must be called at most once per agent.
    pub async fn run(&self) -> Result<AgentExit> {
        let exit = self.run_cycles().await;
        self.lifecycle.kill(exit.as_ref().err().cloned());
        self.lifecycle.done();
        exit
    }

    async fn run_cycles(&self) -> Result<AgentExit> {
        let mut cycle = 0u64;

        while self.lifecycle.is_alive() {
            cycle += 1;
            info!(machine_id = %self.config.machine_id, cycle, "Machine agent starting");

            let result = self.run_once().await;
            let err = match classify(result, &self.lifecycle) {
                CycleOutcome::Stop(reason) => {
                    info!(machine_id = %self.config.machine_id, "Machine agent stopping");
                    return reason.map(|()| AgentExit::Stopped);
                }
                CycleOutcome::UpgradeNeeded(binary) => {
                    match self.tools.change_agent_tools(AGENT_NAME, &binary).await {
                        Ok(tools) => {
                            info!(
                                binary = %tools.binary,
                                dir = %tools.dir.display(),
                                "Exiting to upgrade"
                            );
                            return Ok(AgentExit::Upgraded(tools));
                        }
                        Err(e) => {
                            warn!(binary = %binary, error = %e, "Cannot upgrade agent tools");
                            e
                        }
                    }
                }
                CycleOutcome::Transient(err) => err,
            };

            warn!(
                machine_id = %self.config.machine_id,
                cycle,
                error = %err,
                delay_ms = u64::try_from(self.config.retry_delay.as_millis()).unwrap_or(u64::MAX),
                "Machine agent cycle failed, restarting after delay"
            );

            tokio::select! {
                biased;

                _ = self.lifecycle.dying() => break,
                _ = tokio::time::sleep(self.config.retry_delay) => {}
            }
        }

        self.lifecycle.err().map(|()| AgentExit::Stopped)
    }

    /// One cycle: acquire the connection, run the workers, release the
    /// connection on every path.
    async fn run_once(&self) -> Result<()> {
        let conn = self.store.open(&self.config.store).await?;
        let result = self.run_workers(conn.as_ref()).await;
        if let Err(e) = conn.close().await {
            warn!(error = %e, "Failed to close store connection");
        }
        result
    }

    async fn run_workers(&self, conn: &dyn Connection) -> Result<()> {
        let machine = conn.machine(self.config.machine_id).await?;

        let cycle = self.lifecycle.child();
        let workers = self.workers.workers(machine, &cycle, &self.config);
        let result = run_group(cycle.dying(), &workers).await;

        cycle.kill(None);
        cycle.done();
        result
    }
}
