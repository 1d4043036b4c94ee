//! The process contract
//!
//! A [`Process`] is "a running interactive process", local or remote. The
//! hub only ever depends on this interface plus the [`ProcessEvent`] stream
//! attached to it at spawn time.
//!
//! # Event Contract
//!
//! Every handle emits exactly one terminal [`ProcessEvent::Exit`] over its
//! lifetime, and no `Data`/`Idle` events after it. Backends guarantee this
//! by making the exit emission the last send before closing the channel.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use berth_core::error::SpawnError;

/// Which backend a process runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Forked under a local PTY
    Local,
    /// Bridged over an SSH channel
    Remote,
}

/// Events emitted by a running process
#[derive(Debug)]
pub enum ProcessEvent {
    /// Output bytes read from the process
    Data(Bytes),
    /// The agent signalled it is idle awaiting user input
    Idle {
        /// The marker text that triggered detection
        pattern: String,
    },
    /// The process terminated. Emitted exactly once.
    Exit {
        /// Exit code (0 = clean; SSH-level errors surface as 1)
        code: i32,
        /// Resume token scraped from output before exit, if any
        resume_token: Option<String>,
    },
}

/// A running interactive process
#[async_trait]
pub trait Process: Send + Sync {
    /// OS process id (0 for remote processes, which have no local pid)
    fn pid(&self) -> u32;

    /// Which backend this process runs on
    fn kind(&self) -> BackendKind;

    /// Write bytes to the process's input
    async fn write(&self, data: &[u8]) -> Result<(), SpawnError>;

    /// Resize the terminal
    async fn resize(&self, cols: u16, rows: u16) -> Result<(), SpawnError>;

    /// Request termination. Soft first (interrupt/SIGTERM), escalating to a
    /// hard kill after the grace period. Never reports the exit itself;
    /// the `Exit` event does.
    async fn kill(&self) -> Result<(), SpawnError>;

    /// Terminate immediately, skipping the grace period
    async fn force_kill(&self) -> Result<(), SpawnError>;
}

/// A spawned process plus its event stream
pub struct ProcessHandle {
    /// The process interface
    pub process: Arc<dyn Process>,
    /// Event stream; consumed by exactly one pump task
    pub events: mpsc::Receiver<ProcessEvent>,
}

/// Channel capacity for process events.
///
/// Holds output chunks between the backend reader and the hub's event
/// pump. 256 gives headroom for output bursts without letting a stalled
/// pump accumulate unbounded memory.
pub const PROCESS_EVENT_CHANNEL_CAPACITY: usize = 256;
