//! Shared test fixtures: a scripted backend and a prepared hub
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use berth_core::config::{HubConfig, LocalWorkerConfig};
use berth_core::error::{HubError, SpawnError};
use berth_core::model::{Session, Worker};
use berth_core::repo::{MemoryRepository, Repository};
use berth_core::types::{SessionId, WorkerId};
use berth_hub::realtime::HubEvent;
use berth_hub::{HubState, SessionBackend, SpawnMode};
use berth_pty::{BackendKind, Process, ProcessEvent, ProcessHandle};
use berth_ssh::TunnelManager;

/// How a spawn call was parameterized, as the tests want to assert it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedMode {
    Fresh,
    Continue { resume_token: Option<String> },
}

impl From<&SpawnMode> for RecordedMode {
    fn from(mode: &SpawnMode) -> Self {
        match mode {
            SpawnMode::Fresh => RecordedMode::Fresh,
            SpawnMode::Continue { resume_token } => RecordedMode::Continue {
                resume_token: resume_token.clone(),
            },
        }
    }
}

/// Scripted backend: every spawn hands the test a controllable process
pub struct MockBackend {
    /// Event senders per session, for driving output/exit from tests
    senders: DashMap<SessionId, mpsc::Sender<ProcessEvent>>,
    /// Spawn log: (session, mode)
    spawns: Mutex<Vec<(SessionId, RecordedMode)>>,
    /// Bytes written to each session's process
    writes: Arc<DashMap<SessionId, Vec<Vec<u8>>>>,
    /// Whether kill() emits an exit event (a process that dies on signal)
    kill_exits: bool,
    /// Fail the next spawn_agent call
    fail_next: AtomicBool,
    next_pid: AtomicU32,
}

impl MockBackend {
    pub fn new(kill_exits: bool) -> Arc<Self> {
        Arc::new(Self {
            senders: DashMap::new(),
            spawns: Mutex::new(Vec::new()),
            writes: Arc::new(DashMap::new()),
            kill_exits,
            fail_next: AtomicBool::new(false),
            next_pid: AtomicU32::new(1000),
        })
    }

    /// Drive the session's process to exit
    pub async fn exit(&self, id: &SessionId, code: i32, resume_token: Option<&str>) {
        let sender = self
            .senders
            .get(id)
            .expect("no live process for session")
            .clone();
        sender
            .send(ProcessEvent::Exit {
                code,
                resume_token: resume_token.map(str::to_string),
            })
            .await
            .expect("pump gone");
    }

    /// Emit output from the session's process
    pub async fn emit_data(&self, id: &SessionId, data: &[u8]) {
        let sender = self
            .senders
            .get(id)
            .expect("no live process for session")
            .clone();
        sender
            .send(ProcessEvent::Data(bytes::Bytes::copy_from_slice(data)))
            .await
            .expect("pump gone");
    }

    /// Emit an idle signal from the session's process
    pub async fn emit_idle(&self, id: &SessionId, pattern: &str) {
        let sender = self
            .senders
            .get(id)
            .expect("no live process for session")
            .clone();
        sender
            .send(ProcessEvent::Idle {
                pattern: pattern.to_string(),
            })
            .await
            .expect("pump gone");
    }

    pub fn fail_next_spawn(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.lock().unwrap().len()
    }

    pub fn spawn_modes(&self, id: &SessionId) -> Vec<RecordedMode> {
        self.spawns
            .lock()
            .unwrap()
            .iter()
            .filter(|(sid, _)| sid == id)
            .map(|(_, mode)| mode.clone())
            .collect()
    }

    pub fn written(&self, id: &SessionId) -> Vec<Vec<u8>> {
        self.writes.get(id).map(|w| w.clone()).unwrap_or_default()
    }

    fn make_handle(&self, id: &SessionId) -> ProcessHandle {
        let (tx, rx) = mpsc::channel(64);
        self.senders.insert(id.clone(), tx.clone());

        let process = MockProcess {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            session_id: id.clone(),
            events: tx,
            writes: Arc::clone(&self.writes),
            kill_exits: self.kill_exits,
        };
        ProcessHandle {
            process: Arc::new(process),
            events: rx,
        }
    }
}

#[async_trait]
impl SessionBackend for MockBackend {
    async fn spawn_agent(
        &self,
        _worker: &Worker,
        session: &Session,
        mode: SpawnMode,
    ) -> Result<ProcessHandle, HubError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(SpawnError::ProcessSpawnFailed("scripted failure".into()).into());
        }
        self.spawns
            .lock()
            .unwrap()
            .push((session.id.clone(), RecordedMode::from(&mode)));
        Ok(self.make_handle(&session.id))
    }

    async fn spawn_shell(
        &self,
        _worker: &Worker,
        session: &Session,
        _cols: u16,
        _rows: u16,
    ) -> Result<ProcessHandle, HubError> {
        Ok(self.make_handle(&session.id))
    }
}

struct MockProcess {
    pid: u32,
    session_id: SessionId,
    events: mpsc::Sender<ProcessEvent>,
    writes: Arc<DashMap<SessionId, Vec<Vec<u8>>>>,
    kill_exits: bool,
}

#[async_trait]
impl Process for MockProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn write(&self, data: &[u8]) -> Result<(), SpawnError> {
        self.writes
            .entry(self.session_id.clone())
            .or_default()
            .push(data.to_vec());
        Ok(())
    }

    async fn resize(&self, _cols: u16, _rows: u16) -> Result<(), SpawnError> {
        Ok(())
    }

    async fn kill(&self) -> Result<(), SpawnError> {
        if self.kill_exits {
            let _ = self
                .events
                .send(ProcessEvent::Exit {
                    code: 137,
                    resume_token: None,
                })
                .await;
        }
        Ok(())
    }

    async fn force_kill(&self) -> Result<(), SpawnError> {
        Ok(())
    }
}

/// A hub wired to the scripted backend, plus the fixture handles tests use
pub struct TestHub {
    pub state: Arc<HubState>,
    pub backend: Arc<MockBackend>,
    pub local_worker: WorkerId,
    pub repo: Arc<MemoryRepository>,
    _data_dir: tempfile::TempDir,
}

/// Build a hub with one local worker at the given admission limit
pub async fn test_hub(max_concurrent: u32, kill_exits: bool) -> TestHub {
    let data_dir = tempfile::tempdir().expect("tempdir");
    let config = HubConfig {
        data_dir: data_dir.path().to_path_buf(),
        kill_grace: Duration::from_millis(50),
        local_worker: LocalWorkerConfig {
            name: "local".to_string(),
            max_concurrent_sessions: max_concurrent,
        },
        ..HubConfig::default()
    };

    let repo = Arc::new(MemoryRepository::new());
    let backend = MockBackend::new(kill_exits);
    let tunnels = Arc::new(TunnelManager::new(
        config.connect_timeout,
        config.exec_timeout,
    ));

    let state = HubState::with_parts(
        config,
        repo.clone() as Arc<dyn Repository>,
        backend.clone() as Arc<dyn SessionBackend>,
        tunnels,
    );
    state.startup().await.expect("startup");

    let local_worker = state
        .repo
        .get_local_worker()
        .await
        .unwrap()
        .expect("local worker provisioned")
        .id;

    TestHub {
        state,
        backend,
        local_worker,
        repo,
        _data_dir: data_dir,
    }
}

/// Await the first broadcast event matching the predicate
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<HubEvent>,
    mut predicate: F,
) -> HubEvent
where
    F: FnMut(&HubEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
