//! Persistence boundary
//!
//! The hub treats the repository as the single source of truth for durable
//! session/worker fields. Runtime-only state (live process handles, client
//! registries) never passes through here. The relational store backing a
//! deployment implements [`Repository`]; [`MemoryRepository`] is the
//! in-process implementation used by the binary default and by tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;

use crate::error::RepoError;
use crate::model::{Session, Worker};
use crate::types::{SessionId, SessionStatus, WorkerId, WorkerKind};

/// Result alias for repository operations
pub type RepoResult<T> = Result<T, RepoError>;

/// Durable storage for sessions and workers
#[async_trait]
pub trait Repository: Send + Sync {
    // Sessions
    async fn get_session(&self, id: &SessionId) -> RepoResult<Option<Session>>;
    async fn list_sessions(&self, status: Option<SessionStatus>) -> RepoResult<Vec<Session>>;
    async fn insert_session(&self, session: Session) -> RepoResult<()>;
    async fn update_session(&self, session: &Session) -> RepoResult<()>;
    async fn delete_session(&self, id: &SessionId) -> RepoResult<()>;
    async fn set_resume_token(&self, id: &SessionId, token: Option<String>) -> RepoResult<()>;
    async fn set_needs_input(&self, id: &SessionId, needs_input: bool) -> RepoResult<()>;

    /// Count of sessions currently `active` on the worker
    async fn active_session_count(&self, worker_id: &WorkerId) -> RepoResult<usize>;

    /// Queued sessions targeting the worker, ordered by ascending position
    async fn queued_sessions(&self, worker_id: &WorkerId) -> RepoResult<Vec<Session>>;

    /// Most recent session on the worker with a matching working directory
    /// and a non-null resume token (auto-continue lookup). "Most recent"
    /// is highest queue position.
    async fn latest_resumable_session(
        &self,
        worker_id: &WorkerId,
        working_directory: &Path,
    ) -> RepoResult<Option<Session>>;

    /// Next queue position (end of queue)
    async fn next_position(&self) -> RepoResult<i64>;

    // Workers
    async fn get_worker(&self, id: &WorkerId) -> RepoResult<Option<Worker>>;
    async fn list_workers(&self) -> RepoResult<Vec<Worker>>;
    async fn insert_worker(&self, worker: Worker) -> RepoResult<()>;
    async fn update_worker(&self, worker: &Worker) -> RepoResult<()>;
    async fn delete_worker(&self, id: &WorkerId) -> RepoResult<()>;
    async fn get_local_worker(&self) -> RepoResult<Option<Worker>>;
}

/// In-memory repository
#[derive(Default)]
pub struct MemoryRepository {
    sessions: RwLock<HashMap<SessionId, Session>>,
    workers: RwLock<HashMap<WorkerId, Worker>>,
}

impl MemoryRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn get_session(&self, id: &SessionId) -> RepoResult<Option<Session>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn list_sessions(&self, status: Option<SessionStatus>) -> RepoResult<Vec<Session>> {
        let sessions = self.sessions.read().await;
        let mut out: Vec<Session> = sessions
            .values()
            .filter(|s| status.map_or(true, |wanted| s.status == wanted))
            .cloned()
            .collect();
        out.sort_by_key(|s| s.position);
        Ok(out)
    }

    async fn insert_session(&self, session: Session) -> RepoResult<()> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
        Ok(())
    }

    async fn update_session(&self, session: &Session) -> RepoResult<()> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&session.id) {
            Some(slot) => {
                *slot = session.clone();
                Ok(())
            }
            None => Err(RepoError::Store(format!(
                "update of unknown session {}",
                session.id
            ))),
        }
    }

    async fn delete_session(&self, id: &SessionId) -> RepoResult<()> {
        self.sessions.write().await.remove(id);
        Ok(())
    }

    async fn set_resume_token(&self, id: &SessionId, token: Option<String>) -> RepoResult<()> {
        let mut sessions = self.sessions.write().await;
        if let Some(s) = sessions.get_mut(id) {
            s.resume_token = token;
        }
        Ok(())
    }

    async fn set_needs_input(&self, id: &SessionId, needs_input: bool) -> RepoResult<()> {
        let mut sessions = self.sessions.write().await;
        if let Some(s) = sessions.get_mut(id) {
            s.needs_input = needs_input;
        }
        Ok(())
    }

    async fn active_session_count(&self, worker_id: &WorkerId) -> RepoResult<usize> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|s| s.worker_id == *worker_id && s.status == SessionStatus::Active)
            .count())
    }

    async fn queued_sessions(&self, worker_id: &WorkerId) -> RepoResult<Vec<Session>> {
        let sessions = self.sessions.read().await;
        let mut out: Vec<Session> = sessions
            .values()
            .filter(|s| s.worker_id == *worker_id && s.status == SessionStatus::Queued)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.position);
        Ok(out)
    }

    async fn latest_resumable_session(
        &self,
        worker_id: &WorkerId,
        working_directory: &Path,
    ) -> RepoResult<Option<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|s| {
                s.worker_id == *worker_id
                    && s.working_directory == working_directory
                    && s.resume_token.is_some()
            })
            .max_by_key(|s| s.position)
            .cloned())
    }

    async fn next_position(&self) -> RepoResult<i64> {
        let sessions = self.sessions.read().await;
        Ok(sessions.values().map(|s| s.position).max().unwrap_or(0) + 1)
    }

    async fn get_worker(&self, id: &WorkerId) -> RepoResult<Option<Worker>> {
        Ok(self.workers.read().await.get(id).cloned())
    }

    async fn list_workers(&self) -> RepoResult<Vec<Worker>> {
        let workers = self.workers.read().await;
        let mut out: Vec<Worker> = workers.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn insert_worker(&self, worker: Worker) -> RepoResult<()> {
        self.workers.write().await.insert(worker.id.clone(), worker);
        Ok(())
    }

    async fn update_worker(&self, worker: &Worker) -> RepoResult<()> {
        let mut workers = self.workers.write().await;
        match workers.get_mut(&worker.id) {
            Some(slot) => {
                *slot = worker.clone();
                Ok(())
            }
            None => Err(RepoError::Store(format!(
                "update of unknown worker {}",
                worker.id
            ))),
        }
    }

    async fn delete_worker(&self, id: &WorkerId) -> RepoResult<()> {
        self.workers.write().await.remove(id);
        Ok(())
    }

    async fn get_local_worker(&self) -> RepoResult<Option<Worker>> {
        let workers = self.workers.read().await;
        Ok(workers
            .values()
            .find(|w| w.kind == WorkerKind::Local)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn session_at(position: i64, worker: &WorkerId, dir: &str) -> Session {
        Session::new(
            PathBuf::from(dir),
            String::new(),
            worker.clone(),
            false,
            position,
        )
    }

    #[tokio::test]
    async fn test_queued_sessions_ordered_by_position() {
        let repo = MemoryRepository::new();
        let worker = WorkerId::from("w1");

        for pos in [3, 1, 2] {
            repo.insert_session(session_at(pos, &worker, "/tmp/a"))
                .await
                .unwrap();
        }

        let queued = repo.queued_sessions(&worker).await.unwrap();
        let positions: Vec<i64> = queued.iter().map(|s| s.position).collect();
        assert_eq!(positions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_active_count_ignores_other_workers() {
        let repo = MemoryRepository::new();
        let w1 = WorkerId::from("w1");
        let w2 = WorkerId::from("w2");

        let mut a = session_at(1, &w1, "/tmp/a");
        a.status = SessionStatus::Active;
        repo.insert_session(a).await.unwrap();

        let mut b = session_at(2, &w2, "/tmp/b");
        b.status = SessionStatus::Active;
        repo.insert_session(b).await.unwrap();

        repo.insert_session(session_at(3, &w1, "/tmp/c"))
            .await
            .unwrap();

        assert_eq!(repo.active_session_count(&w1).await.unwrap(), 1);
        assert_eq!(repo.active_session_count(&w2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_latest_resumable_picks_highest_position() {
        let repo = MemoryRepository::new();
        let worker = WorkerId::from("w1");

        let mut old = session_at(1, &worker, "/tmp/a");
        old.status = SessionStatus::Completed;
        old.resume_token = Some("token-old".into());
        repo.insert_session(old).await.unwrap();

        let mut newer = session_at(5, &worker, "/tmp/a");
        newer.status = SessionStatus::Completed;
        newer.resume_token = Some("token-new".into());
        repo.insert_session(newer).await.unwrap();

        // Same dir but no token: never returned
        let mut bare = session_at(9, &worker, "/tmp/a");
        bare.status = SessionStatus::Completed;
        repo.insert_session(bare).await.unwrap();

        let found = repo
            .latest_resumable_session(&worker, Path::new("/tmp/a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.resume_token.as_deref(), Some("token-new"));
    }

    #[tokio::test]
    async fn test_next_position_monotonic() {
        let repo = MemoryRepository::new();
        let worker = WorkerId::from("w1");
        assert_eq!(repo.next_position().await.unwrap(), 1);
        repo.insert_session(session_at(4, &worker, "/tmp/a"))
            .await
            .unwrap();
        assert_eq!(repo.next_position().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_get_local_worker() {
        let repo = MemoryRepository::new();
        assert!(repo.get_local_worker().await.unwrap().is_none());

        repo.insert_worker(Worker::local("local".into(), 3))
            .await
            .unwrap();
        let local = repo.get_local_worker().await.unwrap().unwrap();
        assert_eq!(local.kind, WorkerKind::Local);
    }
}
