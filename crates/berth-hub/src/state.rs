//! Global hub state

use std::sync::Arc;

use berth_core::config::HubConfig;
use berth_core::repo::{MemoryRepository, Repository};
use berth_ssh::TunnelManager;

use crate::backend::{HubBackend, SessionBackend};
use crate::realtime::Gateway;
use crate::runtime::RuntimeRegistry;
use crate::session::{SessionOrchestrator, ShellManager};
use crate::worker::WorkerRegistry;

/// Everything the hub daemon holds together
pub struct HubState {
    /// Configuration
    pub config: HubConfig,
    /// Persistence boundary
    pub repo: Arc<dyn Repository>,
    /// SSH tunnels, one per connected remote worker
    pub tunnels: Arc<TunnelManager>,
    /// Realtime gateway
    pub gateway: Arc<Gateway>,
    /// Session orchestrator
    pub orchestrator: Arc<SessionOrchestrator>,
    /// Secondary shells
    pub shells: Arc<ShellManager>,
    /// Worker registry
    pub workers: Arc<WorkerRegistry>,
}

impl HubState {
    /// Create hub state with the in-memory repository and the production
    /// backend
    pub fn new(config: HubConfig) -> Arc<Self> {
        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        let tunnels = Arc::new(TunnelManager::new(
            config.connect_timeout,
            config.exec_timeout,
        ));
        let backend: Arc<dyn SessionBackend> =
            Arc::new(HubBackend::new(config.clone(), Arc::clone(&tunnels)));
        Self::with_parts(config, repo, backend, tunnels)
    }

    /// Create hub state around explicit collaborators (tests inject a
    /// scripted backend and a prepared repository here)
    pub fn with_parts(
        config: HubConfig,
        repo: Arc<dyn Repository>,
        backend: Arc<dyn SessionBackend>,
        tunnels: Arc<TunnelManager>,
    ) -> Arc<Self> {
        let gateway = Arc::new(Gateway::new());
        let runtime = Arc::new(RuntimeRegistry::new());

        let orchestrator = SessionOrchestrator::new(
            Arc::clone(&repo),
            Arc::clone(&backend),
            Arc::clone(&runtime),
            Arc::clone(&gateway),
            config.clone(),
        );
        let shells = ShellManager::new(
            Arc::clone(&repo),
            Arc::clone(&backend),
            Arc::clone(&runtime),
            Arc::clone(&gateway),
            &config,
        );
        let workers = Arc::new(WorkerRegistry::new(
            Arc::clone(&repo),
            Arc::clone(&tunnels),
            Arc::clone(&orchestrator),
        ));

        Arc::new(Self {
            config,
            repo,
            tunnels,
            gateway,
            orchestrator,
            shells,
            workers,
        })
    }

    /// Startup sequence: provision the local worker, reconcile sessions a
    /// previous run left active, reconnect persisted remote workers.
    pub async fn startup(&self) -> anyhow::Result<()> {
        self.workers
            .ensure_local_worker(&self.config.local_worker)
            .await?;
        self.orchestrator.reconcile_startup().await?;
        self.workers.reconnect_persisted_workers().await;
        Ok(())
    }
}
