//! Per-worker SSH tunnels
//!
//! One persistent SSH client connection per remote worker. Everything the
//! hub does on that worker multiplexes over the single connection using
//! SSH's native channel multiplexing: one-shot `exec` commands and
//! long-lived interactive `shell` channels.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use russh::client::{self, Config, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use tokio::sync::{mpsc, Mutex};

use berth_core::error::WorkerError;
use berth_core::model::Worker;
use berth_core::types::WorkerId;

use crate::keys::validate_private_key;

/// Channel capacity for interactive channel commands and events.
/// Sized like the process event channel: enough headroom for output
/// bursts without unbounded buffering against a stalled consumer.
const CHANNEL_QUEUE_CAPACITY: usize = 256;

/// A live SSH connection to one remote worker
pub struct SshTunnel {
    /// Worker this tunnel belongs to
    worker_id: WorkerId,
    /// SSH session handle (channel-multiplexed)
    handle: Handle<ClientHandler>,
    /// Timeout for one-shot exec commands
    exec_timeout: Duration,
}

impl std::fmt::Debug for SshTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTunnel")
            .field("worker_id", &self.worker_id)
            .field("exec_timeout", &self.exec_timeout)
            .finish_non_exhaustive()
    }
}

impl SshTunnel {
    /// Establish a tunnel to the worker's SSH target.
    ///
    /// The private key is validated (and its problems precisely
    /// diagnosed) before any network I/O happens.
    pub async fn connect(
        worker: &Worker,
        connect_timeout: Duration,
        exec_timeout: Duration,
    ) -> Result<Self, WorkerError> {
        let ssh = worker.ssh.as_ref().ok_or_else(|| WorkerError::Tunnel {
            worker: worker.id.clone(),
            reason: "worker has no SSH target".to_string(),
        })?;

        let key = validate_private_key(&ssh.key_path).map_err(|e| WorkerError::Tunnel {
            worker: worker.id.clone(),
            reason: e.to_string(),
        })?;

        let config = Arc::new(Config::default());
        let handler = ClientHandler {
            worker_id: worker.id.clone(),
        };

        let address = ssh.address();
        tracing::debug!("Connecting to worker {} at {}", worker.id, address);

        let mut handle = tokio::time::timeout(
            connect_timeout,
            client::connect(config, &address, handler),
        )
        .await
        .map_err(|_| WorkerError::Tunnel {
            worker: worker.id.clone(),
            reason: format!("connection to {} timed out", address),
        })?
        .map_err(|e| WorkerError::Tunnel {
            worker: worker.id.clone(),
            reason: format!("failed to connect to {}: {}", address, e),
        })?;

        let authenticated = handle
            .authenticate_publickey(&ssh.user, Arc::new(key))
            .await
            .map_err(|e| WorkerError::Tunnel {
                worker: worker.id.clone(),
                reason: format!("authentication error: {}", e),
            })?;

        if !authenticated {
            return Err(WorkerError::Tunnel {
                worker: worker.id.clone(),
                reason: format!("authentication as '{}' rejected", ssh.user),
            });
        }

        tracing::info!("Connected to worker {} at {}", worker.id, address);

        Ok(Self {
            worker_id: worker.id.clone(),
            handle,
            exec_timeout,
        })
    }

    /// Worker this tunnel serves
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Whether the underlying connection is still open
    pub fn is_open(&self) -> bool {
        !self.handle.is_closed()
    }

    /// Run a one-shot command and collect its stdout.
    ///
    /// Bounded by the exec timeout so a hung remote shell cannot block
    /// session creation indefinitely. Non-zero exit is an error.
    pub async fn exec(&self, command: &str) -> Result<String, WorkerError> {
        let tunnel_err = |reason: String| WorkerError::Tunnel {
            worker: self.worker_id.clone(),
            reason,
        };

        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| tunnel_err(format!("channel open: {}", e)))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| tunnel_err(format!("exec request: {}", e)))?;

        let collect = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut exit_code: Option<u32> = None;

            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                    ChannelMsg::ExtendedData { data, ext: 1 } => {
                        stderr.extend_from_slice(&data)
                    }
                    ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }

            (stdout, stderr, exit_code)
        };

        let (stdout, stderr, exit_code) = tokio::time::timeout(self.exec_timeout, collect)
            .await
            .map_err(|_| tunnel_err(format!("exec timed out: {}", command)))?;

        match exit_code {
            Some(0) | None => Ok(String::from_utf8_lossy(&stdout).into_owned()),
            Some(code) => Err(tunnel_err(format!(
                "command exited {}: {} ({})",
                code,
                command,
                String::from_utf8_lossy(&stderr).trim()
            ))),
        }
    }

    /// Open a long-lived interactive shell channel at the given size.
    pub async fn shell(&self, cols: u16, rows: u16) -> Result<RemoteChannel, WorkerError> {
        let tunnel_err = |reason: String| WorkerError::Tunnel {
            worker: self.worker_id.clone(),
            reason,
        };

        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| tunnel_err(format!("channel open: {}", e)))?;

        channel
            .request_pty(
                false,
                "xterm-256color",
                cols as u32,
                rows as u32,
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| tunnel_err(format!("pty request: {}", e)))?;

        channel
            .request_shell(true)
            .await
            .map_err(|e| tunnel_err(format!("shell request: {}", e)))?;

        Ok(RemoteChannel::start(self.worker_id.clone(), channel))
    }

    /// Disconnect the tunnel
    pub async fn disconnect(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "closing", "en")
            .await;
        tracing::info!("Disconnected tunnel to worker {}", self.worker_id);
    }
}

/// Commands accepted by a [`RemoteChannel`]'s owning task
#[derive(Debug)]
pub(crate) enum ChannelCommand {
    /// Write bytes to the channel
    Write(Bytes),
    /// Change the remote window size
    Resize { cols: u16, rows: u16 },
    /// Close the channel
    Close,
}

/// Events surfaced by a [`RemoteChannel`]
#[derive(Debug)]
pub enum RemoteChannelEvent {
    /// Channel stdout data
    Data(Bytes),
    /// Channel stderr data
    Stderr(Bytes),
    /// Remote process exit status (may precede `Closed`)
    Exit(u32),
    /// Channel closed cleanly
    Closed,
    /// Channel failed (SSH-level error; indistinguishable from a crash)
    Error(String),
}

/// An interactive channel, driven by a dedicated task.
///
/// The russh channel object is owned by one task; writers interact with
/// it through the command queue, readers through the event queue. This
/// keeps a slow consumer from ever blocking the SSH connection itself.
pub struct RemoteChannel {
    worker_id: WorkerId,
    command_tx: mpsc::Sender<ChannelCommand>,
    /// Event stream; take it with [`RemoteChannel::take_events`]
    events: Option<mpsc::Receiver<RemoteChannelEvent>>,
}

impl RemoteChannel {
    fn start(worker_id: WorkerId, mut channel: Channel<Msg>) -> Self {
        let owner_id = worker_id.clone();
        let (command_tx, mut command_rx) = mpsc::channel(CHANNEL_QUEUE_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_QUEUE_CAPACITY);

        tokio::spawn(async move {
            let mut exit_status: Option<u32> = None;

            loop {
                tokio::select! {
                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { data }) => {
                            if event_tx
                                .send(RemoteChannelEvent::Data(Bytes::copy_from_slice(&data)))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                            if event_tx
                                .send(RemoteChannelEvent::Stderr(Bytes::copy_from_slice(&data)))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status: code }) => {
                            exit_status = Some(code);
                            let _ = event_tx.send(RemoteChannelEvent::Exit(code)).await;
                        }
                        Some(ChannelMsg::Eof) => {}
                        Some(ChannelMsg::Close) | None => {
                            tracing::debug!(
                                "Channel to worker {} closed (exit {:?})",
                                worker_id,
                                exit_status
                            );
                            let _ = event_tx.send(RemoteChannelEvent::Closed).await;
                            break;
                        }
                        Some(_) => {}
                    },

                    cmd = command_rx.recv() => match cmd {
                        Some(ChannelCommand::Write(data)) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                let _ = event_tx
                                    .send(RemoteChannelEvent::Error(format!("write: {}", e)))
                                    .await;
                                break;
                            }
                        }
                        Some(ChannelCommand::Resize { cols, rows }) => {
                            if let Err(e) = channel
                                .window_change(cols as u32, rows as u32, 0, 0)
                                .await
                            {
                                tracing::warn!(
                                    "Window change on worker {} failed: {}",
                                    worker_id,
                                    e
                                );
                            }
                        }
                        Some(ChannelCommand::Close) | None => {
                            let _ = channel.close().await;
                            let _ = event_tx.send(RemoteChannelEvent::Closed).await;
                            break;
                        }
                    },
                }
            }
        });

        Self {
            worker_id: owner_id,
            command_tx,
            events: Some(event_rx),
        }
    }

    /// Take the event receiver (once)
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<RemoteChannelEvent>> {
        self.events.take()
    }

    /// Build a channel around raw queues, with no SSH underneath.
    /// The returned receiver observes every command the channel is sent.
    #[cfg(test)]
    pub(crate) fn mock(
        worker_id: WorkerId,
    ) -> (
        Self,
        mpsc::Receiver<ChannelCommand>,
        mpsc::Sender<RemoteChannelEvent>,
    ) {
        let (command_tx, command_rx) = mpsc::channel(CHANNEL_QUEUE_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_QUEUE_CAPACITY);
        (
            Self {
                worker_id,
                command_tx,
                events: Some(event_rx),
            },
            command_rx,
            event_tx,
        )
    }

    /// Write bytes to the channel
    pub async fn write(&self, data: Bytes) -> Result<(), WorkerError> {
        self.command_tx
            .send(ChannelCommand::Write(data))
            .await
            .map_err(|_| WorkerError::Tunnel {
                worker: self.worker_id.clone(),
                reason: "channel task gone".to_string(),
            })
    }

    /// Resize the remote window
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), WorkerError> {
        self.command_tx
            .send(ChannelCommand::Resize { cols, rows })
            .await
            .map_err(|_| WorkerError::Tunnel {
                worker: self.worker_id.clone(),
                reason: "channel task gone".to_string(),
            })
    }

    /// Close the channel
    pub async fn close(&self) {
        let _ = self.command_tx.send(ChannelCommand::Close).await;
    }
}

/// Pool of live tunnels, one per connected remote worker
pub struct TunnelManager {
    /// Tunnels indexed by worker ID
    tunnels: DashMap<WorkerId, Arc<SshTunnel>>,
    /// Serializes connect/disconnect transitions
    transition: Mutex<()>,
    /// Connect timeout applied to every tunnel
    connect_timeout: Duration,
    /// Exec timeout applied to every tunnel
    exec_timeout: Duration,
}

impl TunnelManager {
    /// Create an empty manager
    pub fn new(connect_timeout: Duration, exec_timeout: Duration) -> Self {
        Self {
            tunnels: DashMap::new(),
            transition: Mutex::new(()),
            connect_timeout,
            exec_timeout,
        }
    }

    /// Connect a worker, replacing any existing tunnel
    pub async fn connect_worker(&self, worker: &Worker) -> Result<(), WorkerError> {
        let _lock = self.transition.lock().await;

        if let Some((_, old)) = self.tunnels.remove(&worker.id) {
            old.disconnect().await;
        }

        let tunnel =
            SshTunnel::connect(worker, self.connect_timeout, self.exec_timeout).await?;
        self.tunnels.insert(worker.id.clone(), Arc::new(tunnel));
        Ok(())
    }

    /// Disconnect a worker's tunnel if present
    pub async fn disconnect_worker(&self, worker_id: &WorkerId) {
        let _lock = self.transition.lock().await;

        if let Some((_, tunnel)) = self.tunnels.remove(worker_id) {
            tunnel.disconnect().await;
        }
    }

    /// Whether the worker currently has a live tunnel
    pub fn is_connected(&self, worker_id: &WorkerId) -> bool {
        self.tunnels
            .get(worker_id)
            .map(|t| t.is_open())
            .unwrap_or(false)
    }

    /// Get the worker's tunnel, failing with `WorkerNotConnected`
    pub fn get(&self, worker_id: &WorkerId) -> Result<Arc<SshTunnel>, WorkerError> {
        self.tunnels
            .get(worker_id)
            .filter(|t| t.is_open())
            .map(|t| Arc::clone(&t))
            .ok_or_else(|| WorkerError::NotConnected(worker_id.clone()))
    }
}

/// SSH client handler for worker tunnels
struct ClientHandler {
    worker_id: WorkerId,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    /// Accept and log the host key. Workers are operator-managed records;
    /// the fingerprint lands in the log for auditing.
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::info!(
            "Worker {} host key: {}",
            self.worker_id,
            server_public_key.fingerprint()
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::model::SshTarget;
    use std::path::PathBuf;

    #[test]
    fn test_manager_starts_empty() {
        let manager = TunnelManager::new(Duration::from_secs(1), Duration::from_secs(1));
        let id = WorkerId::from("w1");
        assert!(!manager.is_connected(&id));
        assert!(matches!(
            manager.get(&id),
            Err(WorkerError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_requires_ssh_target() {
        let worker = Worker::local("local".into(), 1);
        let err = SshTunnel::connect(&worker, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Tunnel { .. }));
    }

    #[tokio::test]
    async fn test_connect_surfaces_key_validation() {
        let worker = Worker::remote(
            "builder".into(),
            1,
            SshTarget {
                host: "127.0.0.1".into(),
                user: "dev".into(),
                key_path: PathBuf::from("/nonexistent/id_ed25519"),
                port: 2222,
            },
        );
        let err = SshTunnel::connect(&worker, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("not found"), "unexpected error: {}", msg);
    }
}
