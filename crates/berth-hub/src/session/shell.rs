//! Per-session secondary shells
//!
//! A session may host one interactive shell alongside its agent process,
//! for ad hoc commands in the same working directory. The shell has its
//! own lifecycle (independent of the agent) and its scrollback is
//! persisted to disk so a reconnecting client can replay recent output
//! without re-running anything.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use berth_core::config::HubConfig;
use berth_core::error::{HubError, SessionError, WorkerError};
use berth_core::repo::Repository;
use berth_core::types::SessionId;
use berth_pty::{Process, ProcessEvent};

use crate::backend::SessionBackend;
use crate::realtime::{ChannelKind, Gateway, ServerFrame};
use crate::runtime::RuntimeRegistry;

/// Default shell terminal size
const SHELL_COLS: u16 = 120;
const SHELL_ROWS: u16 = 30;

/// Reported shell state
#[derive(Debug, Clone, serde::Serialize)]
pub struct ShellStatus {
    /// Whether a shell process is running
    pub running: bool,
    /// Its pid when running (0 for remote shells)
    pub pid: Option<u32>,
}

/// Manages the secondary shell processes and their scrollback
pub struct ShellManager {
    repo: Arc<dyn Repository>,
    backend: Arc<dyn SessionBackend>,
    runtime: Arc<RuntimeRegistry>,
    gateway: Arc<Gateway>,
    scrollback_dir: PathBuf,
    scrollback_limit: u64,
}

impl ShellManager {
    /// Create a shell manager
    pub fn new(
        repo: Arc<dyn Repository>,
        backend: Arc<dyn SessionBackend>,
        runtime: Arc<RuntimeRegistry>,
        gateway: Arc<Gateway>,
        config: &HubConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo,
            backend,
            runtime,
            gateway,
            scrollback_dir: config.data_dir.join("scrollback"),
            scrollback_limit: config.scrollback_limit_bytes,
        })
    }

    /// Open the session's shell. Idempotent while one is already running.
    pub async fn open_shell(self: &Arc<Self>, id: &SessionId) -> Result<ShellStatus, HubError> {
        // Serialized against concurrent opens on the same session.
        let lock = self.runtime.lock_for(id);
        let _guard = lock.lock().await;

        if let Some(shell) = self.runtime.shell(id) {
            return Ok(ShellStatus {
                running: true,
                pid: Some(shell.pid()),
            });
        }

        let session = self
            .repo
            .get_session(id)
            .await?
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        let worker = self
            .repo
            .get_worker(&session.worker_id)
            .await?
            .ok_or_else(|| WorkerError::NotFound(session.worker_id.clone()))?;
        if !worker.accepts_sessions() {
            return Err(WorkerError::NotConnected(worker.id).into());
        }

        let handle = self
            .backend
            .spawn_shell(&worker, &session, SHELL_COLS, SHELL_ROWS)
            .await?;
        let pid = handle.process.pid();

        self.runtime
            .insert_shell(id.clone(), Arc::clone(&handle.process));

        let manager = Arc::clone(self);
        let session_id = id.clone();
        let process = Arc::clone(&handle.process);
        let mut events = handle.events;
        tokio::spawn(async move {
            manager.pump_shell(&session_id, process, &mut events).await;
        });

        tracing::info!("Opened shell for session {} (pid {})", id, pid);
        Ok(ShellStatus {
            running: true,
            pid: Some(pid),
        })
    }

    /// Close the session's shell; a no-op when none is running
    pub async fn close_shell(&self, id: &SessionId) -> Result<(), HubError> {
        if let Some(shell) = self.runtime.shell(id) {
            tracing::info!("Closing shell for session {}", id);
            shell.kill().await?;
        }
        Ok(())
    }

    /// Current shell state for the session
    pub fn shell_status(&self, id: &SessionId) -> ShellStatus {
        match self.runtime.shell(id) {
            Some(shell) => ShellStatus {
                running: true,
                pid: Some(shell.pid()),
            },
            None => ShellStatus {
                running: false,
                pid: None,
            },
        }
    }

    /// Write client input to the shell
    pub async fn shell_input(&self, id: &SessionId, data: &str) -> Result<(), HubError> {
        let shell = self
            .runtime
            .shell(id)
            .ok_or_else(|| SessionError::NotActive(id.clone()))?;
        shell.write(data.as_bytes()).await?;
        Ok(())
    }

    /// Resize the shell terminal; a no-op when none is running
    pub async fn shell_resize(&self, id: &SessionId, cols: u16, rows: u16) -> Result<(), HubError> {
        if let Some(shell) = self.runtime.shell(id) {
            shell.resize(cols, rows).await?;
        }
        Ok(())
    }

    /// Read the persisted scrollback for replay on reconnect
    pub async fn read_scrollback(&self, id: &SessionId) -> Vec<u8> {
        match tokio::fs::read(self.scrollback_path(id)).await {
            Ok(data) => data,
            Err(_) => Vec::new(),
        }
    }

    async fn pump_shell(
        self: &Arc<Self>,
        session_id: &SessionId,
        process: Arc<dyn Process>,
        events: &mut mpsc::Receiver<ProcessEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Data(data) => {
                    self.append_scrollback(session_id, &data).await;
                    self.gateway.shell_data(session_id, &data);
                }
                ProcessEvent::Idle { .. } => {}
                ProcessEvent::Exit { code, .. } => {
                    // Only clear the registry entry if it is still ours.
                    let stale = match self.runtime.shell(session_id) {
                        Some(current) => !Arc::ptr_eq(&current, &process),
                        None => true,
                    };
                    if !stale {
                        self.runtime.remove_shell(session_id);
                    }
                    tracing::info!("Shell for session {} exited ({})", session_id, code);
                    self.gateway.send_to_channel(
                        session_id,
                        ChannelKind::ShellTerminal,
                        ServerFrame::ShellExited { code },
                    );
                    break;
                }
            }
        }
    }

    async fn append_scrollback(&self, id: &SessionId, data: &[u8]) {
        let path = self.scrollback_path(id);
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(data).await?;

            // Trim once the file has grown well past the cap
            let len = file.metadata().await?.len();
            if len > self.scrollback_limit * 2 {
                drop(file);
                let content = tokio::fs::read(&path).await?;
                let keep_from = content.len().saturating_sub(self.scrollback_limit as usize);
                tokio::fs::write(&path, &content[keep_from..]).await?;
            }
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(e) = result {
            tracing::warn!("Scrollback write for {} failed: {}", id, e);
        }
    }

    fn scrollback_path(&self, id: &SessionId) -> PathBuf {
        self.scrollback_dir.join(format!("{}.log", id))
    }
}
