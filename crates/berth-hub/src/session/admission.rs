//! Per-worker admission accounting
//!
//! A worker admits a session when its active count is below its limit.
//! The count is computed from the repository on demand; what this
//! controller adds is the per-worker lock that makes check-then-activate
//! atomic, so concurrent admissions can never overshoot the limit.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use berth_core::error::HubError;
use berth_core::model::Worker;
use berth_core::repo::Repository;
use berth_core::types::WorkerId;

/// Admission bookkeeping for all workers
pub struct AdmissionController {
    repo: Arc<dyn Repository>,
    /// Per-worker admission locks (created lazily)
    worker_locks: DashMap<WorkerId, Arc<Mutex<()>>>,
}

impl AdmissionController {
    /// Create a controller
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            repo,
            worker_locks: DashMap::new(),
        }
    }

    /// The admission lock for a worker. Hold it across the whole
    /// count-check + spawn + activate sequence.
    pub fn lock_for(&self, worker_id: &WorkerId) -> Arc<Mutex<()>> {
        self.worker_locks
            .entry(worker_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Whether the worker has a free slot. Only meaningful while the
    /// worker's admission lock is held.
    pub async fn has_capacity(&self, worker: &Worker) -> Result<bool, HubError> {
        let active = self.repo.active_session_count(&worker.id).await?;
        Ok(active < worker.max_concurrent_sessions as usize)
    }
}
