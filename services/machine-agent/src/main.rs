//! Fleet Machine Agent
//!
//! Runs the machine agent for one machine until it is stopped (SIGINT or
//! SIGTERM) or exits for an upgrade. Exit codes:
//! - 0: stopped, or new tools are in place and the process should be restarted
//! - 1: the agent failed
//! - 2: invalid arguments

use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleet_machine_agent::store::FileStore;
use fleet_machine_agent::tools::LocalTools;
use fleet_machine_agent::{AgentArgs, AgentConfig, AgentExit, MachineAgent};

#[tokio::main]
async fn main() -> Result<()> {
    let config = match AgentArgs::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };

    init_tracing(&config)?;

    info!(
        machine_id = %config.machine_id,
        data_dir = %config.data_dir.display(),
        state_file = %config.store.path.display(),
        binary = %config.current,
        "Configuration loaded"
    );

    let agent = Arc::new(MachineAgent::new(
        config.clone(),
        Arc::new(FileStore::new()),
        Arc::new(LocalTools::new(&config.data_dir)),
    ));

    let signals = tokio::spawn({
        let agent = Arc::clone(&agent);
        async move {
            shutdown_signal().await;
            info!("Received shutdown signal");
            agent.kill(None);
        }
    });

    let result = agent.run().await;
    signals.abort();

    match result {
        Ok(exit) => {
            match &exit {
                AgentExit::Stopped => info!("Machine agent stopped"),
                AgentExit::Upgraded(tools) => info!(
                    binary = %tools.binary,
                    dir = %tools.dir.display(),
                    "Machine agent exiting for restart on new tools"
                ),
            }
            std::process::exit(exit.exit_code());
        }
        Err(e) => {
            error!(error = %e, "Machine agent failed");
            std::process::exit(1);
        }
    }
}

fn init_tracing(config: &AgentConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let (stderr_layer, file_layer) = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file));
            (None, Some(layer))
        }
        None => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr);
            (Some(layer), None)
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
