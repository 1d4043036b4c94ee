//! The dual execution backend
//!
//! The orchestrator never cares where a process runs; it asks the backend
//! for a [`ProcessHandle`] and works the narrow process contract from
//! there. [`HubBackend`] dispatches on the target worker's kind: local
//! sessions fork a PTY on this machine, remote sessions bridge an SSH
//! channel on the worker's tunnel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use berth_core::config::HubConfig;
use berth_core::error::HubError;
use berth_core::model::{Session, Worker};
use berth_core::types::WorkerKind;
use berth_pty::{LocalSpawner, ProcessHandle, SpawnSpec};
use berth_ssh::{RemoteBridge, TunnelManager};

use crate::workspace;

/// Terminal size agent processes start at
const AGENT_COLS: u16 = 120;
const AGENT_ROWS: u16 = 40;

/// First-run vs. continue spawn
#[derive(Debug, Clone)]
pub enum SpawnMode {
    /// Start a fresh conversation
    Fresh,
    /// Continue a prior conversation (by token when one is known)
    Continue {
        /// Resume token from the prior clean exit, if any
        resume_token: Option<String>,
    },
}

impl SpawnMode {
    /// Derive the mode a queued session should be promoted with: a session
    /// that carries a resume token was continued, everything else starts
    /// fresh.
    pub fn for_session(session: &Session) -> Self {
        match &session.resume_token {
            Some(token) => SpawnMode::Continue {
                resume_token: Some(token.clone()),
            },
            None => SpawnMode::Fresh,
        }
    }
}

/// Spawns session processes on whichever backend the worker requires
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Spawn the agent CLI for the session
    async fn spawn_agent(
        &self,
        worker: &Worker,
        session: &Session,
        mode: SpawnMode,
    ) -> Result<ProcessHandle, HubError>;

    /// Spawn the session's secondary interactive shell
    async fn spawn_shell(
        &self,
        worker: &Worker,
        session: &Session,
        cols: u16,
        rows: u16,
    ) -> Result<ProcessHandle, HubError>;
}

/// Production backend: local PTY + SSH tunnels
pub struct HubBackend {
    config: HubConfig,
    local: LocalSpawner,
    remote: RemoteBridge,
    tunnels: Arc<TunnelManager>,
}

impl HubBackend {
    /// Create the backend
    pub fn new(config: HubConfig, tunnels: Arc<TunnelManager>) -> Self {
        let kill_grace: Duration = config.kill_grace;
        Self {
            local: LocalSpawner::new(kill_grace),
            remote: RemoteBridge::new(kill_grace),
            tunnels,
            config,
        }
    }

    fn agent_args(&self, mode: &SpawnMode) -> Vec<String> {
        match mode {
            SpawnMode::Fresh => self.config.agent.fresh_args(),
            SpawnMode::Continue { resume_token } => {
                self.config.agent.continue_args(resume_token.as_deref())
            }
        }
    }

    fn agent_env(&self, session: &Session) -> Vec<(String, String)> {
        vec![
            ("BERTH_SESSION_ID".to_string(), session.id.to_string()),
            (
                "BERTH_HUB_URL".to_string(),
                self.config.callback_address.clone(),
            ),
        ]
    }
}

#[async_trait]
impl SessionBackend for HubBackend {
    async fn spawn_agent(
        &self,
        worker: &Worker,
        session: &Session,
        mode: SpawnMode,
    ) -> Result<ProcessHandle, HubError> {
        match worker.kind {
            WorkerKind::Local => {
                workspace::prepare_local(&session.working_directory, session.worktree).await?;

                let spec = SpawnSpec {
                    command: self.config.agent.command.clone(),
                    args: self.agent_args(&mode),
                    working_directory: session.working_directory.clone(),
                    env: self.agent_env(session),
                    cols: AGENT_COLS,
                    rows: AGENT_ROWS,
                };
                Ok(self.local.spawn(spec)?)
            }
            WorkerKind::Remote => {
                let tunnel = self.tunnels.get(&worker.id)?;
                let dir = workspace::prepare_remote(
                    &tunnel,
                    &session.working_directory,
                    session.worktree,
                )
                .await?;

                let handle = self
                    .remote
                    .spawn(
                        &tunnel,
                        &dir,
                        &self.config.agent.command,
                        &self.agent_args(&mode),
                        &self.agent_env(session),
                    )
                    .await?;
                Ok(handle)
            }
        }
    }

    async fn spawn_shell(
        &self,
        worker: &Worker,
        session: &Session,
        cols: u16,
        rows: u16,
    ) -> Result<ProcessHandle, HubError> {
        match worker.kind {
            WorkerKind::Local => {
                workspace::prepare_local(&session.working_directory, false).await?;
                let spec = SpawnSpec::shell(session.working_directory.clone(), cols, rows);
                Ok(self.local.spawn_raw(spec)?)
            }
            WorkerKind::Remote => {
                let tunnel = self.tunnels.get(&worker.id)?;
                let handle = self
                    .remote
                    .spawn_shell(&tunnel, &session.working_directory, cols, rows)
                    .await?;
                Ok(handle)
            }
        }
    }
}
