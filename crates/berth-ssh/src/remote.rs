//! Remote process bridge
//!
//! Wraps an interactive SSH channel as a [`Process`]. The agent CLI is
//! launched by writing one composed command line into a fresh remote
//! shell; from then on the channel is the process: channel close is a
//! clean exit, channel error is an abnormal one (an SSH-level disconnect
//! is indistinguishable from a crash and must not be swallowed).

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use berth_core::error::SpawnError;
use berth_core::types::WorkerId;
use berth_pty::classify::{AgentOutputClassifier, OutputClassifier};
use berth_pty::process::{
    BackendKind, Process, ProcessEvent, ProcessHandle, PROCESS_EVENT_CHANNEL_CAPACITY,
};

use crate::tunnel::{RemoteChannel, RemoteChannelEvent, SshTunnel};

/// Fixed terminal size remote agent channels open at
const REMOTE_COLS: u16 = 120;
const REMOTE_ROWS: u16 = 40;

/// Spawns agent processes on remote workers over their tunnels
pub struct RemoteBridge {
    /// Grace period between the Ctrl-C and the forced channel close
    kill_grace: Duration,
}

impl RemoteBridge {
    /// Create a bridge
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }

    /// Spawn the agent CLI on the worker, in the given directory.
    ///
    /// `command` and `args` are composed by the caller (first-run or
    /// continue argument set); env pairs are exported before the exec.
    pub async fn spawn(
        &self,
        tunnel: &SshTunnel,
        working_directory: &Path,
        command: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<ProcessHandle, SpawnError> {
        let mut channel = tunnel
            .shell(REMOTE_COLS, REMOTE_ROWS)
            .await
            .map_err(|e| SpawnError::ChannelOpenFailed(e.to_string()))?;

        let command_line = compose_command_line(working_directory, command, args, env);
        channel
            .write(Bytes::from(command_line.into_bytes()))
            .await
            .map_err(|e| SpawnError::ChannelOpenFailed(e.to_string()))?;

        Ok(wrap_channel(
            tunnel.worker_id().clone(),
            channel,
            self.kill_grace,
            true,
        ))
    }

    /// Open a plain interactive shell on the worker (the per-session
    /// secondary shell). No agent invocation, no classification.
    pub async fn spawn_shell(
        &self,
        tunnel: &SshTunnel,
        working_directory: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<ProcessHandle, SpawnError> {
        let mut channel = tunnel
            .shell(cols, rows)
            .await
            .map_err(|e| SpawnError::ChannelOpenFailed(e.to_string()))?;

        let command_line = format!("cd {}\n", shell_quote(&working_directory.to_string_lossy()));
        channel
            .write(Bytes::from(command_line.into_bytes()))
            .await
            .map_err(|e| SpawnError::ChannelOpenFailed(e.to_string()))?;

        Ok(wrap_channel(
            tunnel.worker_id().clone(),
            channel,
            self.kill_grace,
            false,
        ))
    }
}

/// Compose the single line that changes directory and execs the agent.
fn compose_command_line(
    working_directory: &Path,
    command: &str,
    args: &[String],
    env: &[(String, String)],
) -> String {
    let mut line = String::new();
    for (key, value) in env {
        line.push_str(&format!("export {}={} && ", key, shell_quote(value)));
    }
    line.push_str(&format!(
        "cd {} && exec {}",
        shell_quote(&working_directory.to_string_lossy()),
        command
    ));
    for arg in args {
        line.push(' ');
        line.push_str(&shell_quote(arg));
    }
    line.push('\n');
    line
}

/// Quote a string for POSIX sh
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Turn a remote channel into a `ProcessHandle`
fn wrap_channel(
    worker_id: WorkerId,
    mut channel: RemoteChannel,
    kill_grace: Duration,
    classify: bool,
) -> ProcessHandle {
    let mut channel_events = channel
        .take_events()
        .expect("fresh channel already consumed");

    let (event_tx, event_rx) = mpsc::channel(PROCESS_EVENT_CHANNEL_CAPACITY);
    let exited = Arc::new(AtomicBool::new(false));

    let task_exited = Arc::clone(&exited);
    tokio::spawn(async move {
        let mut classifier = classify.then(AgentOutputClassifier::new);
        let mut exit_status: Option<u32> = None;

        while let Some(event) = channel_events.recv().await {
            match event {
                RemoteChannelEvent::Data(data) | RemoteChannelEvent::Stderr(data) => {
                    if let Some(classifier) = classifier.as_mut() {
                        // Idle detection only; resume tokens are never
                        // inferred from a remote stream.
                        if let Some(idle) = classifier.classify(&data).idle {
                            if event_tx
                                .send(ProcessEvent::Idle {
                                    pattern: idle.pattern,
                                })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                    if event_tx.send(ProcessEvent::Data(data)).await.is_err() {
                        break;
                    }
                }
                RemoteChannelEvent::Exit(code) => exit_status = Some(code),
                RemoteChannelEvent::Closed => {
                    task_exited.store(true, Ordering::SeqCst);
                    let code = exit_status.map(|c| c as i32).unwrap_or(0);
                    tracing::debug!("Remote process on {} closed (code {})", worker_id, code);
                    let _ = event_tx
                        .send(ProcessEvent::Exit {
                            code,
                            resume_token: None,
                        })
                        .await;
                    break;
                }
                RemoteChannelEvent::Error(reason) => {
                    task_exited.store(true, Ordering::SeqCst);
                    tracing::warn!("Remote process on {} failed: {}", worker_id, reason);
                    let _ = event_tx
                        .send(ProcessEvent::Exit {
                            code: 1,
                            resume_token: None,
                        })
                        .await;
                    break;
                }
            }
        }
    });

    ProcessHandle {
        process: Arc::new(RemoteProcess {
            channel: Arc::new(channel),
            exited,
            kill_grace,
        }),
        events: event_rx,
    }
}

/// A remote process backed by an SSH channel
struct RemoteProcess {
    channel: Arc<RemoteChannel>,
    exited: Arc<AtomicBool>,
    kill_grace: Duration,
}

#[async_trait]
impl Process for RemoteProcess {
    /// Remote processes have no local OS pid
    fn pid(&self) -> u32 {
        0
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn write(&self, data: &[u8]) -> Result<(), SpawnError> {
        // The channel task only goes away with the channel itself; a
        // write after that is a write to a crashed/disconnected process.
        self.channel
            .write(Bytes::copy_from_slice(data))
            .await
            .map_err(|_| SpawnError::AbnormalExit(1))
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), SpawnError> {
        self.channel
            .resize(cols, rows)
            .await
            .map_err(|_| SpawnError::AbnormalExit(1))
    }

    async fn kill(&self) -> Result<(), SpawnError> {
        // Interrupt first; force the channel closed if it lingers.
        let _ = self.channel.write(Bytes::from_static(b"\x03")).await;

        let channel = Arc::clone(&self.channel);
        let exited = Arc::clone(&self.exited);
        let grace = self.kill_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !exited.load(Ordering::SeqCst) {
                channel.close().await;
            }
        });

        Ok(())
    }

    async fn force_kill(&self) -> Result<(), SpawnError> {
        self.channel.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("with space"), "'with space'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_compose_command_line() {
        let line = compose_command_line(
            &PathBuf::from("/home/dev/my project"),
            "claude",
            &["--continue".to_string()],
            &[("BERTH_SESSION_ID".to_string(), "abc".to_string())],
        );
        assert_eq!(
            line,
            "export BERTH_SESSION_ID='abc' && cd '/home/dev/my project' && exec claude '--continue'\n"
        );
    }

    #[test]
    fn test_compose_command_line_no_env() {
        let line = compose_command_line(&PathBuf::from("/srv/repo"), "claude", &[], &[]);
        assert_eq!(line, "cd '/srv/repo' && exec claude\n");
    }

    mod mocked_channel {
        use super::super::*;
        use crate::tunnel::{ChannelCommand, RemoteChannel};
        use tokio::time::timeout;

        fn wrapped(
            grace: Duration,
        ) -> (
            ProcessHandle,
            tokio::sync::mpsc::Receiver<ChannelCommand>,
            tokio::sync::mpsc::Sender<RemoteChannelEvent>,
        ) {
            let (channel, commands, events) = RemoteChannel::mock(WorkerId::from("w1"));
            let handle = wrap_channel(WorkerId::from("w1"), channel, grace, false);
            (handle, commands, events)
        }

        async fn next_exit(handle: &mut ProcessHandle) -> (i32, Option<String>) {
            loop {
                let event = timeout(Duration::from_secs(5), handle.events.recv())
                    .await
                    .expect("timed out waiting for exit")
                    .expect("event stream ended without exit");
                if let ProcessEvent::Exit { code, resume_token } = event {
                    return (code, resume_token);
                }
            }
        }

        #[tokio::test]
        async fn test_close_is_clean_exit() {
            let (mut handle, _commands, events) = wrapped(Duration::from_secs(1));

            events.send(RemoteChannelEvent::Closed).await.unwrap();

            let (code, token) = next_exit(&mut handle).await;
            assert_eq!(code, 0);
            assert!(token.is_none());
        }

        #[tokio::test]
        async fn test_error_is_abnormal_exit() {
            let (mut handle, _commands, events) = wrapped(Duration::from_secs(1));

            events
                .send(RemoteChannelEvent::Error("connection reset".into()))
                .await
                .unwrap();

            let (code, token) = next_exit(&mut handle).await;
            assert_eq!(code, 1);
            assert!(token.is_none());
        }

        #[tokio::test]
        async fn test_reported_exit_status_carries_through() {
            let (mut handle, _commands, events) = wrapped(Duration::from_secs(1));

            events.send(RemoteChannelEvent::Exit(7)).await.unwrap();
            events.send(RemoteChannelEvent::Closed).await.unwrap();

            let (code, _) = next_exit(&mut handle).await;
            assert_eq!(code, 7);
        }

        #[tokio::test]
        async fn test_resize_issues_one_window_change_per_call() {
            let (handle, mut commands, _events) = wrapped(Duration::from_secs(1));

            handle.process.resize(100, 30).await.unwrap();

            match commands.recv().await {
                Some(ChannelCommand::Resize { cols, rows }) => {
                    assert_eq!((cols, rows), (100, 30));
                }
                other => panic!("expected resize, got {:?}", other),
            }
            assert!(commands.try_recv().is_err());
        }

        #[tokio::test]
        async fn test_kill_writes_interrupt_then_closes() {
            let (handle, mut commands, _events) = wrapped(Duration::from_millis(50));

            handle.process.kill().await.unwrap();

            match commands.recv().await {
                Some(ChannelCommand::Write(data)) => assert_eq!(&data[..], b"\x03"),
                other => panic!("expected interrupt write, got {:?}", other),
            }

            // Escalation closes the channel after the grace period.
            match timeout(Duration::from_secs(2), commands.recv()).await {
                Ok(Some(ChannelCommand::Close)) => {}
                other => panic!("expected close, got {:?}", other),
            }
        }
    }
}
