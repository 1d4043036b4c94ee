//! Worker registry
//!
//! CRUD over worker records, with SSH credentials validated before any
//! network I/O and tunnel lifecycle delegated to the tunnel manager.
//! Exactly one local worker exists; it is provisioned at startup and can
//! never be deleted. A worker carrying active sessions rejects deletion
//! and SSH edits so a running process is never orphaned.

use std::sync::Arc;

use berth_core::config::LocalWorkerConfig;
use berth_core::error::{HubError, WorkerError};
use berth_core::model::{SshTarget, Worker};
use berth_core::repo::Repository;
use berth_core::types::{WorkerId, WorkerKind, WorkerStatus};
use berth_ssh::{validate_private_key, TunnelManager};

use crate::session::SessionOrchestrator;

/// Field changes for an update call; `None` leaves the field alone
#[derive(Debug, Default, Clone)]
pub struct WorkerUpdate {
    pub name: Option<String>,
    pub max_concurrent_sessions: Option<u32>,
    pub ssh: Option<SshTarget>,
}

/// The worker registry
pub struct WorkerRegistry {
    repo: Arc<dyn Repository>,
    tunnels: Arc<TunnelManager>,
    orchestrator: Arc<SessionOrchestrator>,
}

impl WorkerRegistry {
    /// Create the registry
    pub fn new(
        repo: Arc<dyn Repository>,
        tunnels: Arc<TunnelManager>,
        orchestrator: Arc<SessionOrchestrator>,
    ) -> Self {
        Self {
            repo,
            tunnels,
            orchestrator,
        }
    }

    /// Provision the singleton local worker if this deployment does not
    /// have one yet
    pub async fn ensure_local_worker(
        &self,
        config: &LocalWorkerConfig,
    ) -> Result<Worker, HubError> {
        if let Some(worker) = self.repo.get_local_worker().await? {
            return Ok(worker);
        }

        let worker = Worker::local(config.name.clone(), config.max_concurrent_sessions);
        self.repo.insert_worker(worker.clone()).await?;
        tracing::info!(
            "Provisioned local worker '{}' (limit {})",
            worker.name,
            worker.max_concurrent_sessions
        );
        Ok(worker)
    }

    /// Get a worker, failing with `NotFound`
    pub async fn get_worker(&self, id: &WorkerId) -> Result<Worker, HubError> {
        self.repo
            .get_worker(id)
            .await?
            .ok_or_else(|| WorkerError::NotFound(id.clone()).into())
    }

    /// List all workers
    pub async fn list_workers(&self) -> Result<Vec<Worker>, HubError> {
        Ok(self.repo.list_workers().await?)
    }

    /// Create a remote worker and connect its tunnel.
    ///
    /// The key is validated first; a connect failure leaves the record in
    /// place (disconnected) and surfaces the error to the caller.
    pub async fn create_remote_worker(
        &self,
        name: String,
        max_concurrent_sessions: u32,
        ssh: SshTarget,
    ) -> Result<Worker, HubError> {
        validate_private_key(&ssh.key_path)?;

        let worker = Worker::remote(name, max_concurrent_sessions, ssh);
        self.repo.insert_worker(worker.clone()).await?;
        tracing::info!("Created remote worker '{}' ({})", worker.name, worker.id);

        self.connect_worker(&worker.id).await
    }

    /// Update a worker. SSH edits are rejected while sessions are active
    /// on it, and trigger a reconnect when accepted.
    pub async fn update_worker(
        &self,
        id: &WorkerId,
        update: WorkerUpdate,
    ) -> Result<Worker, HubError> {
        let mut worker = self.get_worker(id).await?;

        if let Some(ssh) = update.ssh.as_ref() {
            if worker.kind == WorkerKind::Local {
                return Err(WorkerError::LocalImmutable.into());
            }
            if self.repo.active_session_count(id).await? > 0 {
                return Err(WorkerError::HasActiveSessions(id.clone()).into());
            }
            validate_private_key(&ssh.key_path)?;
        }

        if let Some(name) = update.name {
            worker.name = name;
        }
        let limit_raised = match update.max_concurrent_sessions {
            Some(limit) => {
                let raised = limit > worker.max_concurrent_sessions;
                worker.max_concurrent_sessions = limit;
                raised
            }
            None => false,
        };
        let reconnect = update.ssh.is_some();
        if let Some(ssh) = update.ssh {
            worker.ssh = Some(ssh);
            worker.status = WorkerStatus::Disconnected;
        }

        self.repo.update_worker(&worker).await?;

        if reconnect {
            return self.connect_worker(id).await;
        }

        if limit_raised {
            // Queued sessions may fit now.
            self.orchestrator.promote_worker(id).await;
        }

        Ok(worker)
    }

    /// Delete a worker. The local worker and workers with active sessions
    /// are protected.
    pub async fn delete_worker(&self, id: &WorkerId) -> Result<(), HubError> {
        let worker = self.get_worker(id).await?;
        if worker.kind == WorkerKind::Local {
            return Err(WorkerError::LocalImmutable.into());
        }
        if self.repo.active_session_count(id).await? > 0 {
            return Err(WorkerError::HasActiveSessions(id.clone()).into());
        }

        self.tunnels.disconnect_worker(id).await;
        self.repo.delete_worker(id).await?;
        tracing::info!("Deleted worker '{}' ({})", worker.name, id);
        Ok(())
    }

    /// Connect a remote worker's tunnel and record the outcome
    pub async fn connect_worker(&self, id: &WorkerId) -> Result<Worker, HubError> {
        let mut worker = self.get_worker(id).await?;
        if worker.kind == WorkerKind::Local {
            return Ok(worker);
        }

        match self.tunnels.connect_worker(&worker).await {
            Ok(()) => {
                worker.status = WorkerStatus::Connected;
                self.repo.update_worker(&worker).await?;
                // Sessions may have queued against it while disconnected.
                self.orchestrator.promote_worker(id).await;
                Ok(worker)
            }
            Err(e) => {
                tracing::warn!("Connect to worker '{}' failed: {}", worker.name, e);
                worker.status = WorkerStatus::Disconnected;
                self.repo.update_worker(&worker).await?;
                Err(e.into())
            }
        }
    }

    /// Disconnect a remote worker's tunnel
    pub async fn disconnect_worker(&self, id: &WorkerId) -> Result<Worker, HubError> {
        let mut worker = self.get_worker(id).await?;
        if worker.kind == WorkerKind::Local {
            return Ok(worker);
        }

        self.tunnels.disconnect_worker(id).await;
        worker.status = WorkerStatus::Disconnected;
        self.repo.update_worker(&worker).await?;
        Ok(worker)
    }

    /// Best-effort reconnect of persisted remote workers at startup;
    /// failures mark the worker disconnected and move on.
    pub async fn reconnect_persisted_workers(&self) {
        let workers = match self.repo.list_workers().await {
            Ok(workers) => workers,
            Err(e) => {
                tracing::error!("Worker listing failed at startup: {}", e);
                return;
            }
        };

        for worker in workers {
            if worker.kind != WorkerKind::Remote {
                continue;
            }
            if let Err(e) = self.connect_worker(&worker.id).await {
                tracing::warn!(
                    "Startup reconnect of worker '{}' failed: {}",
                    worker.name,
                    e
                );
            }
        }
    }
}
