//! Configuration for the machine agent.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::{AgentError, Result};
use crate::store::{MachineId, StoreInfo};
use crate::tools::Binary;

/// Fixed delay between a failed cycle and the next one.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// How often workers poll the store.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Machine agent configuration. Read-only once built.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Machine this agent runs for.
    pub machine_id: MachineId,

    /// Data directory for tools and local state.
    pub data_dir: PathBuf,

    /// How to reach the store.
    pub store: StoreInfo,

    /// Delay before restarting after a failed cycle.
    pub retry_delay: Duration,

    /// Worker poll interval.
    pub poll_interval: Duration,

    /// Binary of the running agent.
    pub current: Binary,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Append logs here instead of stderr.
    pub log_file: Option<PathBuf>,
}

impl AgentConfig {
    /// Configuration with defaults for everything but the machine and data
    /// directory.
    pub fn new(machine_id: MachineId, data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            machine_id,
            store: StoreInfo {
                path: data_dir.join("state.json"),
            },
            data_dir,
            retry_delay: DEFAULT_RETRY_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            current: Binary::current(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

/// Command-line arguments for the machine agent.
#[derive(Debug, Clone, Parser)]
#[command(name = "machine-agent")]
#[command(author, version, about = "Run a fleet machine agent", long_about = None)]
pub struct AgentArgs {
    /// Id of the machine to run.
    #[arg(long, env = "MACHINE_AGENT_MACHINE_ID", allow_hyphen_values = true)]
    pub machine_id: Option<String>,

    /// Directory for agent tools and local state.
    #[arg(long, env = "MACHINE_AGENT_DATA_DIR", default_value = "/var/lib/fleet")]
    pub data_dir: PathBuf,

    /// Store state file. Defaults to `<data-dir>/state.json`.
    #[arg(long, env = "MACHINE_AGENT_STATE_FILE")]
    pub state_file: Option<PathBuf>,

    /// Seconds to wait before restarting after an error.
    #[arg(long, env = "MACHINE_AGENT_RETRY_DELAY", default_value_t = DEFAULT_RETRY_DELAY.as_secs())]
    pub retry_delay_secs: u64,

    /// Seconds between worker polls of the store.
    #[arg(long, env = "MACHINE_AGENT_POLL_INTERVAL", default_value_t = DEFAULT_POLL_INTERVAL.as_secs())]
    pub poll_interval_secs: u64,

    /// Override the running binary version (`<version>-<series>-<arch>`).
    #[arg(long, env = "MACHINE_AGENT_TOOLS")]
    pub tools: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "MACHINE_AGENT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Append logs to this file instead of stderr.
    #[arg(long, env = "MACHINE_AGENT_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

impl AgentArgs {
    /// Validate the arguments and build the agent configuration.
    pub fn into_config(self) -> Result<AgentConfig> {
        let machine_id: MachineId = self
            .machine_id
            .as_deref()
            .unwrap_or_default()
            .parse()?;

        if self.retry_delay_secs == 0 {
            return Err(AgentError::Config(
                "--retry-delay-secs must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(AgentError::Config(
                "--poll-interval-secs must be greater than zero".to_string(),
            ));
        }

        let mut config = AgentConfig::new(machine_id, self.data_dir);
        if let Some(path) = self.state_file {
            config.store = StoreInfo { path };
        }
        if let Some(tools) = self.tools {
            config.current = tools.parse()?;
        }
        config.retry_delay = Duration::from_secs(self.retry_delay_secs);
        config.poll_interval = Duration::from_secs(self.poll_interval_secs);
        config.log_level = self.log_level;
        config.log_file = self.log_file;

        Ok(config)
    }
}
