//! Obtaining runner channels.
//!
//! The Master does not care how a runner is reached. The local runner is this
//! executable started again as `nitra runner`; a slave runner is the same
//! command on another host, reached through `ssh`. Both speak the protocol
//! over stdin/stdout.

use async_trait::async_trait;
use tracing::debug;

use super::MasterResult;
use crate::config::SlaveConfig;
use crate::process::{Command, Spawned, spawn_command};

/// Default remote command when a slave does not configure one.
pub const DEFAULT_SLAVE_COMMAND: &str = "nitra runner";

/// Starts runners and returns a channel to each.
#[async_trait]
pub trait RunnerLauncher: Send + Sync {
    /// Starts the runner for this host.
    async fn launch_local(&self, runner_id: &str) -> MasterResult<Spawned>;

    /// Connects to a runner on `slave`.
    async fn connect_slave(&self, runner_id: &str, slave: &SlaveConfig) -> MasterResult<Spawned>;
}

/// Launches runners as child processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    local: Command,
}

impl ProcessLauncher {
    /// Uses `runner_command` for the local runner, or this executable's
    /// `runner` subcommand.
    pub fn current_exe(runner_command: Option<&str>) -> MasterResult<Self> {
        let local = match runner_command {
            Some(line) => Command::parse(&shellexpand::tilde(line))?,
            None => {
                let exe = std::env::current_exe()?;
                Command::new(exe.to_string_lossy()).arg("runner")
            }
        };
        Ok(Self { local })
    }

    /// Command used to reach the runner on `slave`.
    pub fn slave_command(slave: &SlaveConfig) -> Command {
        Command::new("ssh")
            .arg(&slave.host)
            .arg(slave.command.as_deref().unwrap_or(DEFAULT_SLAVE_COMMAND))
    }
}

#[async_trait]
impl RunnerLauncher for ProcessLauncher {
    async fn launch_local(&self, runner_id: &str) -> MasterResult<Spawned> {
        Ok(spawn_command(format!("runner {}", runner_id), &self.local)?)
    }

    async fn connect_slave(&self, runner_id: &str, slave: &SlaveConfig) -> MasterResult<Spawned> {
        let command = Self::slave_command(slave);
        debug!("Connecting to slave {} as runner {}", slave.host, runner_id);
        Ok(spawn_command(format!("runner {}@{}", runner_id, slave.host), &command)?)
    }
}
