//! Session orchestrator
//!
//! Owns session records and their state machine. Mutations of one
//! session are serialized: activation and re-queueing happen under the
//! target worker's admission lock, everything after activation happens
//! under the session's own lock, and exit events are the only writer of
//! terminal state (kill merely requests termination).
//!
//! Stale events are fenced by process identity: the pump and the kill
//! watchdog both verify that the process they speak for is still the one
//! registered for the session before touching its record.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use berth_core::config::HubConfig;
use berth_core::error::{HubError, SessionError, WorkerError};
use berth_core::model::{Session, Worker};
use berth_core::repo::Repository;
use berth_core::types::{SessionId, SessionStatus, WorkerId};
use berth_pty::{Process, ProcessEvent, ProcessHandle};

use crate::backend::{SessionBackend, SpawnMode};
use crate::realtime::{Gateway, HubEvent};
use crate::runtime::RuntimeRegistry;
use crate::session::AdmissionController;

/// A create request, as the route layer hands it over
#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    /// Absolute working directory for the agent
    pub working_directory: PathBuf,
    /// Title (defaults to the directory basename when empty)
    pub title: String,
    /// Target worker; `None` means the local worker
    pub worker_id: Option<WorkerId>,
    /// Whether the directory should be a fresh git worktree
    pub worktree: bool,
    /// Skip the auto-continue lookup
    pub start_fresh: bool,
}

/// Result of a create call
#[derive(Debug, Clone)]
pub struct CreatedSession {
    /// The session, in whichever status admission produced
    pub session: Session,
    /// Whether an existing resumable session was reopened instead of a
    /// new one created
    pub continued: bool,
}

/// The session orchestrator
pub struct SessionOrchestrator {
    repo: Arc<dyn Repository>,
    backend: Arc<dyn SessionBackend>,
    runtime: Arc<RuntimeRegistry>,
    gateway: Arc<Gateway>,
    admission: AdmissionController,
    config: HubConfig,
}

impl SessionOrchestrator {
    /// Create the orchestrator
    pub fn new(
        repo: Arc<dyn Repository>,
        backend: Arc<dyn SessionBackend>,
        runtime: Arc<RuntimeRegistry>,
        gateway: Arc<Gateway>,
        config: HubConfig,
    ) -> Arc<Self> {
        let admission = AdmissionController::new(Arc::clone(&repo));
        Arc::new(Self {
            repo,
            backend,
            runtime,
            gateway,
            admission,
            config,
        })
    }

    /// Create a session (or reopen a resumable one on the same worker and
    /// directory, unless `start_fresh`).
    pub async fn create_session(
        self: &Arc<Self>,
        request: CreateSessionRequest,
    ) -> Result<CreatedSession, HubError> {
        let worker = self.resolve_worker(request.worker_id.as_ref()).await?;

        if !request.start_fresh {
            if let Some(prior) = self
                .repo
                .latest_resumable_session(&worker.id, &request.working_directory)
                .await?
            {
                tracing::info!(
                    "Reopening session {} for {:?} on worker {}",
                    prior.id,
                    request.working_directory,
                    worker.name
                );
                if prior.is_active() {
                    // Already running; reopening is a no-op.
                    return Ok(CreatedSession {
                        session: prior,
                        continued: true,
                    });
                }
                let session = self.continue_session(&prior.id).await?;
                return Ok(CreatedSession {
                    session,
                    continued: true,
                });
            }
        }

        if !worker.accepts_sessions() {
            return Err(WorkerError::NotConnected(worker.id).into());
        }

        let position = self.repo.next_position().await?;
        let session = Session::new(
            request.working_directory,
            request.title,
            worker.id.clone(),
            request.worktree,
            position,
        );
        self.repo.insert_session(session.clone()).await?;
        tracing::info!(
            "Created session {} ({}) on worker {}",
            session.id,
            session.title,
            worker.name
        );
        self.gateway.broadcast(HubEvent::QueueChanged {
            worker_id: worker.id.clone(),
        });

        let session = self
            .try_admit(&session.id, SpawnMode::Fresh, false)
            .await?;
        Ok(CreatedSession {
            session,
            continued: false,
        })
    }

    /// Re-admit a finished (or still queued) session, resuming the prior
    /// conversation.
    pub async fn continue_session(
        self: &Arc<Self>,
        id: &SessionId,
    ) -> Result<Session, HubError> {
        let session = self.get_session(id).await?;
        if session.is_active() {
            return Err(SessionError::AlreadyActive(id.clone()).into());
        }

        let worker = self
            .repo
            .get_worker(&session.worker_id)
            .await?
            .ok_or_else(|| WorkerError::NotFound(session.worker_id.clone()))?;
        if !worker.accepts_sessions() {
            return Err(WorkerError::NotConnected(worker.id).into());
        }

        let mode = SpawnMode::Continue {
            resume_token: session.resume_token.clone(),
        };
        self.try_admit(id, mode, true).await
    }

    /// Request termination of an active session's process. The state
    /// transition is performed by the resulting exit event; if none
    /// arrives within twice the kill grace period, the watchdog forces
    /// the transition and logs the inconsistency.
    pub async fn kill_session(self: &Arc<Self>, id: &SessionId) -> Result<(), HubError> {
        let session = self.get_session(id).await?;
        if !session.is_active() {
            return Err(SessionError::NotActive(id.clone()).into());
        }
        let process = self
            .runtime
            .process(id)
            .ok_or_else(|| SessionError::NotActive(id.clone()))?;

        tracing::info!("Killing session {} (pid {})", id, process.pid());
        process.kill().await?;

        // Watchdog: force the terminal transition if the exit never lands.
        let orchestrator = Arc::clone(self);
        let session_id = id.clone();
        let watched = Arc::clone(&process);
        let grace = self.config.kill_grace * 2;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            orchestrator.force_failed_if_stuck(&session_id, &watched).await;
        });

        Ok(())
    }

    /// Write input to an active session's process (newline-normalized)
    pub async fn send_input(self: &Arc<Self>, id: &SessionId, text: &str) -> Result<(), HubError> {
        let session = self.get_session(id).await?;
        if !session.is_active() {
            return Err(SessionError::NotActive(id.clone()).into());
        }
        let process = self
            .runtime
            .process(id)
            .ok_or_else(|| SessionError::NotActive(id.clone()))?;

        let text = normalize_newlines(text);
        process.write(text.as_bytes()).await?;

        if session.needs_input {
            let lock = self.runtime.lock_for(id);
            let _guard = lock.lock().await;
            self.repo.set_needs_input(id, false).await?;
            self.gateway.broadcast(HubEvent::NeedsInputChanged {
                session_id: id.clone(),
                needs_input: false,
                pattern: None,
                idle_seconds: None,
            });
        }
        Ok(())
    }

    /// Resize an active session's terminal; a no-op when inactive
    pub async fn resize_session(
        &self,
        id: &SessionId,
        cols: u16,
        rows: u16,
    ) -> Result<(), HubError> {
        let Some(process) = self.runtime.process(id) else {
            return Ok(());
        };
        process.resize(cols, rows).await?;
        Ok(())
    }

    /// Delete a session. Never valid while it is active.
    pub async fn delete_session(&self, id: &SessionId) -> Result<(), HubError> {
        let lock = self.runtime.lock_for(id);
        let _guard = lock.lock().await;

        let session = self.get_session(id).await?;
        if session.is_active() {
            return Err(SessionError::DeleteActive(id.clone()).into());
        }

        self.repo.delete_session(id).await?;
        self.runtime.forget(id);
        self.gateway.broadcast(HubEvent::QueueChanged {
            worker_id: session.worker_id,
        });
        tracing::info!("Deleted session {}", id);
        Ok(())
    }

    /// Fetch a session, failing with `NotFound`
    pub async fn get_session(&self, id: &SessionId) -> Result<Session, HubError> {
        self.repo
            .get_session(id)
            .await?
            .ok_or_else(|| SessionError::NotFound(id.clone()).into())
    }

    /// List sessions, optionally filtered by status
    pub async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
    ) -> Result<Vec<Session>, HubError> {
        Ok(self.repo.list_sessions(status).await?)
    }

    /// Promote queued sessions on a worker until it is saturated or the
    /// queue is empty (FIFO by position). Called after every exit, and
    /// whenever a worker's limit is raised.
    pub async fn promote_worker(self: &Arc<Self>, worker_id: &WorkerId) {
        loop {
            let worker = match self.repo.get_worker(worker_id).await {
                Ok(Some(worker)) => worker,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Promotion lookup failed on {}: {}", worker_id, e);
                    break;
                }
            };
            if !worker.accepts_sessions() {
                break;
            }

            let next = match self.repo.queued_sessions(worker_id).await {
                Ok(queue) => queue.into_iter().next(),
                Err(e) => {
                    tracing::error!("Queue read failed on {}: {}", worker_id, e);
                    break;
                }
            };
            let Some(next) = next else { break };

            let mode = SpawnMode::for_session(&next);
            match self.try_admit(&next.id, mode, false).await {
                Ok(session) if session.is_active() => {
                    tracing::info!(
                        "Promoted session {} on worker {}",
                        session.id,
                        worker.name
                    );
                    self.gateway.broadcast(HubEvent::QueueChanged {
                        worker_id: worker_id.clone(),
                    });
                }
                Ok(_) => break, // saturated again
                Err(e) => {
                    // The failed candidate has left the queue; keep going.
                    tracing::warn!("Promotion of {} failed: {}", next.id, e);
                }
            }
        }
    }

    /// Reconcile sessions left `active` by a previous hub run: their
    /// processes died with the hub, so they are failed now.
    pub async fn reconcile_startup(&self) -> Result<(), HubError> {
        let stale = self.repo.list_sessions(Some(SessionStatus::Active)).await?;
        for mut session in stale {
            tracing::warn!(
                "Session {} was active at shutdown; marking failed",
                session.id
            );
            session.status = SessionStatus::Failed;
            session.pid = None;
            session.needs_input = false;
            self.repo.update_session(&session).await?;
        }
        Ok(())
    }

    async fn resolve_worker(&self, worker_id: Option<&WorkerId>) -> Result<Worker, HubError> {
        match worker_id {
            Some(id) => self
                .repo
                .get_worker(id)
                .await?
                .ok_or_else(|| WorkerError::NotFound(id.clone()).into()),
            None => self
                .repo
                .get_local_worker()
                .await?
                .ok_or_else(|| WorkerError::NotFound(WorkerId::from("local")).into()),
        }
    }

    /// Admit the session if its worker has a free slot.
    ///
    /// Holds the worker's admission lock across count-check, spawn and
    /// activation so the concurrency limit can never overshoot. With
    /// `allow_requeue`, a terminal session is put back at the end of the
    /// queue first (the continue path).
    async fn try_admit(
        self: &Arc<Self>,
        id: &SessionId,
        mode: SpawnMode,
        allow_requeue: bool,
    ) -> Result<Session, HubError> {
        let worker_id = self.get_session(id).await?.worker_id;
        let worker_lock = self.admission.lock_for(&worker_id);
        let _admission = worker_lock.lock().await;

        // Re-read under the lock; a concurrent admit may have won.
        let mut session = self.get_session(id).await?;
        if session.is_active() {
            return Err(SessionError::AlreadyActive(id.clone()).into());
        }
        if session.status.is_terminal() {
            if !allow_requeue {
                return Ok(session);
            }
            session.status = SessionStatus::Queued;
            session.position = self.repo.next_position().await?;
            session.needs_input = false;
            self.repo.update_session(&session).await?;
            self.gateway.broadcast(HubEvent::QueueChanged {
                worker_id: session.worker_id.clone(),
            });
        }

        let worker = self
            .repo
            .get_worker(&session.worker_id)
            .await?
            .ok_or_else(|| WorkerError::NotFound(session.worker_id.clone()))?;

        if !worker.accepts_sessions() || !self.admission.has_capacity(&worker).await? {
            return Ok(session);
        }

        let handle = match self.backend.spawn_agent(&worker, &session, mode).await {
            Ok(handle) => handle,
            Err(e) => {
                // Spawn failure completes the state machine; the caller
                // still sees the original error.
                tracing::error!("Spawn for session {} failed: {}", session.id, e);
                session.status = SessionStatus::Failed;
                session.pid = None;
                self.repo.update_session(&session).await?;
                self.gateway.broadcast(HubEvent::SessionFailed {
                    session_id: session.id.clone(),
                });
                return Err(e);
            }
        };

        let pid = handle.process.pid();
        session.status = SessionStatus::Active;
        session.pid = Some(pid);
        session.needs_input = false;
        self.repo.update_session(&session).await?;

        self.runtime
            .insert_process(session.id.clone(), Arc::clone(&handle.process));
        self.start_pump(&session, handle);

        tracing::info!("Session {} active (pid {})", session.id, pid);
        self.gateway.broadcast(HubEvent::SessionActivated {
            session_id: session.id.clone(),
            pid,
        });

        Ok(session)
    }

    /// Spawn the event pump for a fresh activation
    fn start_pump(self: &Arc<Self>, session: &Session, handle: ProcessHandle) {
        let orchestrator = Arc::clone(self);
        let session_id = session.id.clone();
        let worker_id = session.worker_id.clone();
        let process = Arc::clone(&handle.process);
        let mut events = handle.events;

        tokio::spawn(async move {
            orchestrator
                .pump_events(&session_id, &worker_id, process, &mut events)
                .await;
        });
    }

    async fn pump_events(
        self: &Arc<Self>,
        session_id: &SessionId,
        worker_id: &WorkerId,
        process: Arc<dyn Process>,
        events: &mut mpsc::Receiver<ProcessEvent>,
    ) {
        let mut last_output = Instant::now();

        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Data(data) => {
                    last_output = Instant::now();
                    self.gateway.agent_data(session_id, &data);
                }
                ProcessEvent::Idle { pattern } => {
                    let idle_seconds = last_output.elapsed().as_secs();
                    self.mark_needs_input(session_id, &process, pattern, idle_seconds)
                        .await;
                }
                ProcessEvent::Exit { code, resume_token } => {
                    self.handle_exit(session_id, worker_id, &process, code, resume_token)
                        .await;
                    break;
                }
            }
        }
    }

    async fn mark_needs_input(
        &self,
        session_id: &SessionId,
        process: &Arc<dyn Process>,
        pattern: String,
        idle_seconds: u64,
    ) {
        let lock = self.runtime.lock_for(session_id);
        let _guard = lock.lock().await;

        if !self.owns_session(session_id, process) {
            return;
        }
        let Ok(Some(session)) = self.repo.get_session(session_id).await else {
            return;
        };
        if !session.is_active() || session.needs_input {
            return;
        }

        if let Err(e) = self.repo.set_needs_input(session_id, true).await {
            tracing::error!("Failed to persist needs_input for {}: {}", session_id, e);
            return;
        }
        tracing::debug!("Session {} is idle awaiting input", session_id);
        self.gateway.broadcast(HubEvent::NeedsInputChanged {
            session_id: session_id.clone(),
            needs_input: true,
            pattern: Some(pattern),
            idle_seconds: Some(idle_seconds),
        });
    }

    /// The single terminal-state writer: consumes the one exit event of a
    /// process and completes the state machine.
    async fn handle_exit(
        self: &Arc<Self>,
        session_id: &SessionId,
        worker_id: &WorkerId,
        process: &Arc<dyn Process>,
        code: i32,
        resume_token: Option<String>,
    ) {
        {
            let lock = self.runtime.lock_for(session_id);
            let _guard = lock.lock().await;

            if !self.owns_session(session_id, process) {
                tracing::debug!("Stale exit for session {} ignored", session_id);
                return;
            }
            self.runtime.remove_process(session_id);

            let Ok(Some(mut session)) = self.repo.get_session(session_id).await else {
                tracing::warn!("Exit for unknown session {}", session_id);
                return;
            };
            if !session.is_active() {
                tracing::warn!(
                    "Exit for session {} in status {}; ignoring",
                    session_id,
                    session.status
                );
                return;
            }

            session.status = if code == 0 {
                SessionStatus::Completed
            } else {
                SessionStatus::Failed
            };
            session.pid = None;
            session.needs_input = false;
            if let Some(token) = resume_token {
                session.resume_token = Some(token);
            }

            if let Err(e) = self.repo.update_session(&session).await {
                tracing::error!("Failed to persist exit of {}: {}", session_id, e);
            }

            tracing::info!(
                "Session {} exited with code {} ({})",
                session_id,
                code,
                session.status
            );
            let event = match session.status {
                SessionStatus::Completed => HubEvent::SessionCompleted {
                    session_id: session_id.clone(),
                    resume_token: session.resume_token.clone(),
                },
                _ => HubEvent::SessionFailed {
                    session_id: session_id.clone(),
                },
            };
            self.gateway.broadcast(event);
        }

        // The worker has a free slot now.
        self.promote_worker(worker_id).await;
    }

    /// Watchdog body: if the killed process never produced an exit event,
    /// force the failed transition rather than leaving the session stuck.
    async fn force_failed_if_stuck(
        self: &Arc<Self>,
        session_id: &SessionId,
        process: &Arc<dyn Process>,
    ) {
        let worker_id = {
            let lock = self.runtime.lock_for(session_id);
            let _guard = lock.lock().await;

            if !self.owns_session(session_id, process) {
                return; // exit landed normally
            }
            let Ok(Some(mut session)) = self.repo.get_session(session_id).await else {
                return;
            };
            if !session.is_active() {
                return;
            }

            tracing::error!(
                "Session {} did not exit after kill; forcing failed state",
                session_id
            );
            self.runtime.remove_process(session_id);
            let _ = process.force_kill().await;

            session.status = SessionStatus::Failed;
            session.pid = None;
            session.needs_input = false;
            if let Err(e) = self.repo.update_session(&session).await {
                tracing::error!("Failed to persist forced exit of {}: {}", session_id, e);
            }
            self.gateway.broadcast(HubEvent::SessionFailed {
                session_id: session_id.clone(),
            });
            session.worker_id
        };

        self.promote_worker(&worker_id).await;
    }

    /// Whether `process` is still the registered live process for the
    /// session (fences stale pumps and watchdogs)
    fn owns_session(&self, session_id: &SessionId, process: &Arc<dyn Process>) -> bool {
        match self.runtime.process(session_id) {
            Some(current) => Arc::ptr_eq(&current, process),
            None => false,
        }
    }
}

/// Normalize client-supplied line endings to `\n`
fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_newlines() {
        assert_eq!(normalize_newlines("a\r\nb\rc\n"), "a\nb\nc\n");
    }
}
