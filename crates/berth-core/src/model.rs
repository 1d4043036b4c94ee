//! Session and worker records
//!
//! These are the durable records the hub persists through the
//! [`Repository`](crate::repo::Repository) boundary. Runtime-only state
//! (live process handles, client registries) never appears here.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::{SessionId, SessionStatus, WorkerId, WorkerKind, WorkerStatus};

/// A coding-agent session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier
    pub id: SessionId,
    /// Absolute working directory the agent runs in
    pub working_directory: PathBuf,
    /// Human-readable title
    pub title: String,
    /// Lifecycle status
    pub status: SessionStatus,
    /// Worker this session runs (or is queued) on
    pub worker_id: WorkerId,
    /// OS process id while active; `None` otherwise. Remote processes
    /// report 0 (no local OS pid).
    pub pid: Option<u32>,
    /// Opaque identifier the agent CLI emitted on clean exit, enabling a
    /// later continue. Never fabricated.
    pub resume_token: Option<String>,
    /// Set when the agent signalled it is idle awaiting user input
    pub needs_input: bool,
    /// Prevents deletion and UI reordering, not scheduling
    pub locked: bool,
    /// Whether the working directory should be a fresh git worktree
    pub worktree: bool,
    /// Ordering key for UI display and FIFO promotion tie-breaks
    pub position: i64,
}

impl Session {
    /// Create a new queued session at the given queue position.
    ///
    /// The title defaults to the working directory's basename when empty.
    pub fn new(
        working_directory: PathBuf,
        title: String,
        worker_id: WorkerId,
        worktree: bool,
        position: i64,
    ) -> Self {
        let title = if title.trim().is_empty() {
            default_title(&working_directory)
        } else {
            title
        };

        Self {
            id: SessionId::generate(),
            working_directory,
            title,
            status: SessionStatus::Queued,
            worker_id,
            pid: None,
            resume_token: None,
            needs_input: false,
            locked: false,
            worktree,
            position,
        }
    }

    /// Whether this session currently has a live process
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

fn default_title(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string())
}

/// SSH connection details for a remote worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshTarget {
    /// Hostname or address
    pub host: String,
    /// Login user
    pub user: String,
    /// Path to the (unencrypted) private key
    pub key_path: PathBuf,
    /// SSH port
    pub port: u16,
}

impl SshTarget {
    /// `host:port` address string
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// An execution target for sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    /// Unique identifier
    pub id: WorkerId,
    /// Target kind
    pub kind: WorkerKind,
    /// Display name
    pub name: String,
    /// Admission limit for simultaneously active sessions
    pub max_concurrent_sessions: u32,
    /// SSH details; `None` for the local worker
    pub ssh: Option<SshTarget>,
    /// Connection status; the local worker is always connected
    pub status: WorkerStatus,
}

impl Worker {
    /// Create the local worker record
    pub fn local(name: String, max_concurrent_sessions: u32) -> Self {
        Self {
            id: WorkerId::generate(),
            kind: WorkerKind::Local,
            name,
            max_concurrent_sessions,
            ssh: None,
            status: WorkerStatus::Connected,
        }
    }

    /// Create a remote worker record (starts disconnected)
    pub fn remote(name: String, max_concurrent_sessions: u32, ssh: SshTarget) -> Self {
        Self {
            id: WorkerId::generate(),
            kind: WorkerKind::Remote,
            name,
            max_concurrent_sessions,
            ssh: Some(ssh),
            status: WorkerStatus::Disconnected,
        }
    }

    /// Whether this worker may accept a new session right now
    /// (connectivity only; admission counts are the controller's job)
    pub fn accepts_sessions(&self) -> bool {
        match self.kind {
            WorkerKind::Local => true,
            WorkerKind::Remote => self.status == WorkerStatus::Connected,
        }
    }
}
