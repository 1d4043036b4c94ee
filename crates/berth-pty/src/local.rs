//! Local PTY backend
//!
//! Spawns the agent CLI (or a plain shell) under a pseudo-terminal on the
//! hub machine and wraps it as a [`Process`]. Reads happen on a dedicated
//! thread (portable-pty readers are blocking) feeding the async event
//! channel; the exit watcher joins the reader before emitting the single
//! `Exit` event so no data can trail it.

use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

use berth_core::error::SpawnError;

use crate::classify::{AgentOutputClassifier, OutputClassifier};
use crate::process::{
    BackendKind, Process, ProcessEvent, ProcessHandle, PROCESS_EVENT_CHANNEL_CAPACITY,
};

/// What to spawn and where
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Executable name or path
    pub command: String,
    /// Arguments
    pub args: Vec<String>,
    /// Working directory (must already exist)
    pub working_directory: PathBuf,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Initial terminal width
    pub cols: u16,
    /// Initial terminal height
    pub rows: u16,
}

impl SpawnSpec {
    /// Spec for an interactive shell in the given directory
    pub fn shell(working_directory: PathBuf, cols: u16, rows: u16) -> Self {
        let command = std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string());
        Self {
            command,
            args: vec![],
            working_directory,
            env: vec![],
            cols,
            rows,
        }
    }
}

type ClassifierFactory = dyn Fn() -> Box<dyn OutputClassifier> + Send + Sync;

/// Spawns local PTY-backed processes
pub struct LocalSpawner {
    /// Grace period between soft and hard kill
    kill_grace: Duration,
    /// Builds one classifier per spawned agent process
    classifier_factory: Arc<ClassifierFactory>,
}

impl LocalSpawner {
    /// Create a spawner with the default output classifier
    pub fn new(kill_grace: Duration) -> Self {
        Self {
            kill_grace,
            classifier_factory: Arc::new(|| Box::new(AgentOutputClassifier::new())),
        }
    }

    /// Create a spawner with a custom classifier factory
    pub fn with_classifier_factory(
        kill_grace: Duration,
        factory: Arc<ClassifierFactory>,
    ) -> Self {
        Self {
            kill_grace,
            classifier_factory: factory,
        }
    }

    /// Spawn the agent CLI. Output is classified for resume tokens and
    /// idle markers.
    pub fn spawn(&self, spec: SpawnSpec) -> Result<ProcessHandle, SpawnError> {
        self.spawn_inner(spec, Some((self.classifier_factory)()))
    }

    /// Spawn a plain process (the per-session shell). No classification.
    pub fn spawn_raw(&self, spec: SpawnSpec) -> Result<ProcessHandle, SpawnError> {
        self.spawn_inner(spec, None)
    }

    fn spawn_inner(
        &self,
        spec: SpawnSpec,
        mut classifier: Option<Box<dyn OutputClassifier>>,
    ) -> Result<ProcessHandle, SpawnError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SpawnError::ProcessSpawnFailed(format!("openpty: {}", e)))?;

        let mut cmd = CommandBuilder::new(&spec.command);
        cmd.args(&spec.args);
        cmd.cwd(&spec.working_directory);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SpawnError::ProcessSpawnFailed(format!("spawn {}: {}", spec.command, e)))?;

        let pid = child.process_id().unwrap_or(0);
        tracing::info!(
            "Spawned local process {} (pid {}) in {:?}",
            spec.command,
            pid,
            spec.working_directory
        );

        let killer = child.clone_killer();

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SpawnError::ProcessSpawnFailed(format!("clone reader: {}", e)))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SpawnError::ProcessSpawnFailed(format!("take writer: {}", e)))?;

        let (event_tx, event_rx) = mpsc::channel(PROCESS_EVENT_CHANNEL_CAPACITY);
        let exited = Arc::new(AtomicBool::new(false));
        let resume_token = Arc::new(Mutex::new(None::<String>));

        // Reader thread: blocking PTY reads -> event channel.
        let reader_tx = event_tx.clone();
        let reader_token = Arc::clone(&resume_token);
        let reader_handle = std::thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = &buf[..n];

                        if let Some(classifier) = classifier.as_mut() {
                            let classification = classifier.classify(chunk);
                            if let Some(token) = classification.resume_token {
                                *reader_token.lock().expect("resume token lock") = Some(token);
                            }
                            if let Some(idle) = classification.idle {
                                if reader_tx
                                    .blocking_send(ProcessEvent::Idle {
                                        pattern: idle.pattern,
                                    })
                                    .is_err()
                                {
                                    break;
                                }
                            }
                        }

                        if reader_tx
                            .blocking_send(ProcessEvent::Data(Bytes::copy_from_slice(chunk)))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        // Wait thread: reaps the child, joins the reader, then emits the
        // single Exit event.
        let wait_exited = Arc::clone(&exited);
        let wait_token = Arc::clone(&resume_token);
        std::thread::spawn(move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code() as i32,
                Err(e) => {
                    tracing::warn!("Failed to reap pid {}: {}", pid, e);
                    1
                }
            };

            wait_exited.store(true, Ordering::SeqCst);
            let _ = reader_handle.join();

            let token = wait_token.lock().expect("resume token lock").take();
            tracing::info!("Local process {} exited with code {}", pid, code);
            let _ = event_tx.blocking_send(ProcessEvent::Exit {
                code,
                resume_token: token,
            });
        });

        let process = LocalProcess {
            pid,
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            exited,
            kill_grace: self.kill_grace,
        };

        Ok(ProcessHandle {
            process: Arc::new(process),
            events: event_rx,
        })
    }
}

/// A local PTY-backed process
struct LocalProcess {
    pid: u32,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn std::io::Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    exited: Arc<AtomicBool>,
    kill_grace: Duration,
}

impl LocalProcess {
    fn write_bytes(&self, data: &[u8]) -> Result<(), SpawnError> {
        let mut writer = self.writer.lock().expect("pty writer lock");
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|e| SpawnError::ProcessSpawnFailed(format!("pty write: {}", e)))
    }

    fn hard_kill(&self) {
        let mut killer = self.killer.lock().expect("pty killer lock");
        if let Err(e) = killer.kill() {
            tracing::debug!("Hard kill of pid {} failed (already gone?): {}", self.pid, e);
        }
    }
}

#[async_trait]
impl Process for LocalProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn write(&self, data: &[u8]) -> Result<(), SpawnError> {
        self.write_bytes(data)
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), SpawnError> {
        let master = self.master.lock().expect("pty master lock");
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SpawnError::ProcessSpawnFailed(format!("pty resize: {}", e)))
    }

    async fn kill(&self) -> Result<(), SpawnError> {
        // Interrupt the foreground process, then SIGTERM the child.
        let _ = self.write_bytes(b"\x03");

        #[cfg(unix)]
        if self.pid != 0 {
            unsafe {
                libc::kill(self.pid as libc::pid_t, libc::SIGTERM);
            }
        }

        tracing::debug!(
            "Requested termination of pid {}, escalating in {:?}",
            self.pid,
            self.kill_grace
        );

        let exited = Arc::clone(&self.exited);
        let pid = self.pid;
        let grace = self.kill_grace;
        let killer = self.killer.lock().expect("pty killer lock").clone_killer();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !exited.load(Ordering::SeqCst) {
                tracing::warn!("Pid {} ignored termination request, killing", pid);
                let mut killer = killer;
                let _ = killer.kill();
            }
        });

        Ok(())
    }

    async fn force_kill(&self) -> Result<(), SpawnError> {
        self.hard_kill();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn spec(cmd: &str, args: &[&str]) -> SpawnSpec {
        SpawnSpec {
            command: cmd.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            working_directory: std::env::temp_dir(),
            env: vec![],
            cols: 80,
            rows: 24,
        }
    }

    async fn drain_until_exit(handle: &mut ProcessHandle) -> (i32, Option<String>, Vec<u8>) {
        let mut output = Vec::new();
        loop {
            let event = timeout(Duration::from_secs(10), handle.events.recv())
                .await
                .expect("timed out waiting for process events")
                .expect("event channel closed before exit");
            match event {
                ProcessEvent::Data(chunk) => output.extend_from_slice(&chunk),
                ProcessEvent::Idle { .. } => {}
                ProcessEvent::Exit { code, resume_token } => {
                    return (code, resume_token, output)
                }
            }
        }
    }

    #[tokio::test]
    async fn test_spawn_echo_exits_cleanly() {
        let spawner = LocalSpawner::new(Duration::from_secs(1));
        let mut handle = spawner
            .spawn_raw(spec("echo", &["hello-berth"]))
            .expect("spawn failed");

        let (code, token, output) = drain_until_exit(&mut handle).await;
        assert_eq!(code, 0);
        assert!(token.is_none());
        assert!(String::from_utf8_lossy(&output).contains("hello-berth"));
    }

    #[tokio::test]
    async fn test_resume_token_scraped_before_exit() {
        let spawner = LocalSpawner::new(Duration::from_secs(1));
        let mut handle = spawner
            .spawn(spec(
                "sh",
                &[
                    "-c",
                    "echo 'session 123e4567-e89b-12d3-a456-426614174000'",
                ],
            ))
            .expect("spawn failed");

        let (code, token, _) = drain_until_exit(&mut handle).await;
        assert_eq!(code, 0);
        assert_eq!(
            token.as_deref(),
            Some("123e4567-e89b-12d3-a456-426614174000")
        );
    }

    #[tokio::test]
    async fn test_kill_yields_single_exit() {
        let spawner = LocalSpawner::new(Duration::from_millis(200));
        let mut handle = spawner
            .spawn_raw(spec("sleep", &["30"]))
            .expect("spawn failed");
        assert!(handle.process.pid() > 0);

        handle.process.kill().await.unwrap();

        let (code, _, _) = drain_until_exit(&mut handle).await;
        assert_ne!(code, 0);

        // Channel closes after the single Exit; nothing trails it.
        assert!(handle.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_write_reaches_process() {
        let spawner = LocalSpawner::new(Duration::from_secs(1));
        let mut handle = spawner.spawn_raw(spec("cat", &[])).expect("spawn failed");

        handle.process.write(b"roundtrip\n").await.unwrap();

        let mut echoed = Vec::new();
        let saw = loop {
            match timeout(Duration::from_secs(10), handle.events.recv()).await {
                Ok(Some(ProcessEvent::Data(chunk))) => {
                    echoed.extend_from_slice(&chunk);
                    if String::from_utf8_lossy(&echoed).contains("roundtrip") {
                        break true;
                    }
                }
                Ok(Some(_)) | Ok(None) | Err(_) => break false,
            }
        };
        assert!(saw, "echoed input never observed");

        handle.process.force_kill().await.unwrap();
        drain_until_exit(&mut handle).await;
    }
}
