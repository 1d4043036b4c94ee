//! Runtime registry for live processes
//!
//! Holds the process handles that exist only while a session (or its
//! secondary shell) is active. Nothing in here is persisted; the
//! repository owns the durable fields.
//!
//! Every mutation of one session's state must be serialized against the
//! others for that session; the per-session async mutexes here are that
//! lock domain. Exit handling, kill, input and the watchdog all take the
//! session's lock before touching the record.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use berth_core::types::SessionId;
use berth_pty::Process;

/// Live per-session runtime state
pub struct RuntimeRegistry {
    /// Agent processes for active sessions
    processes: DashMap<SessionId, Arc<dyn Process>>,
    /// Secondary shell processes
    shells: DashMap<SessionId, Arc<dyn Process>>,
    /// Per-session mutation locks
    locks: DashMap<SessionId, Arc<Mutex<()>>>,
}

impl RuntimeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            processes: DashMap::new(),
            shells: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// The mutation lock for a session (created lazily)
    pub fn lock_for(&self, id: &SessionId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Record the live agent process for a session.
    ///
    /// At most one live process per session id: inserting over an existing
    /// entry is a bug upstream, so it is logged loudly.
    pub fn insert_process(&self, id: SessionId, process: Arc<dyn Process>) {
        if self.processes.insert(id.clone(), process).is_some() {
            tracing::error!("Session {} already had a live process; replaced", id);
        }
    }

    /// Get the live agent process
    pub fn process(&self, id: &SessionId) -> Option<Arc<dyn Process>> {
        self.processes.get(id).map(|p| Arc::clone(&p))
    }

    /// Remove the live agent process (on exit)
    pub fn remove_process(&self, id: &SessionId) -> Option<Arc<dyn Process>> {
        self.processes.remove(id).map(|(_, p)| p)
    }

    /// Record the live shell process for a session
    pub fn insert_shell(&self, id: SessionId, process: Arc<dyn Process>) {
        self.shells.insert(id, process);
    }

    /// Get the live shell process
    pub fn shell(&self, id: &SessionId) -> Option<Arc<dyn Process>> {
        self.shells.get(id).map(|p| Arc::clone(&p))
    }

    /// Remove the live shell process
    pub fn remove_shell(&self, id: &SessionId) -> Option<Arc<dyn Process>> {
        self.shells.remove(id).map(|(_, p)| p)
    }

    /// Drop all state for a deleted session
    pub fn forget(&self, id: &SessionId) {
        self.processes.remove(id);
        self.shells.remove(id);
        self.locks.remove(id);
    }

    /// Number of live agent processes
    pub fn live_count(&self) -> usize {
        self.processes.len()
    }
}

impl Default for RuntimeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
