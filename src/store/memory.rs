//! In-memory store used by the test suites and as a scratch backend.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::model::{LogEntry, Session};

use super::{PageArtifact, Store, StoreError};

/// Map-backed store with the same last-write-wins semantics as [`super::JsonStore`].
#[derive(Default)]
pub struct MemoryStore {
    sessions: DashMap<String, Session>,
    artifacts: DashMap<(String, usize, u32), PageArtifact>,
    logs: Mutex<Vec<LogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.get(id).map(|s| s.clone()))
    }

    async fn put_session(&self, session: &Session) -> Result<(), StoreError> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let mut sessions: Vec<Session> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        self.sessions.remove(id);
        self.artifacts.retain(|(sid, _, _), _| sid != id);
        self.logs.lock().retain(|e| e.session_id != id);
        Ok(())
    }

    async fn put_page_artifact(
        &self,
        session_id: &str,
        task_index: usize,
        page_number: u32,
        artifact: &PageArtifact,
    ) -> Result<(), StoreError> {
        self.artifacts
            .insert((session_id.to_string(), task_index, page_number), artifact.clone());
        Ok(())
    }

    async fn get_page_artifact(
        &self,
        session_id: &str,
        task_index: usize,
        page_number: u32,
    ) -> Result<Option<PageArtifact>, StoreError> {
        Ok(self
            .artifacts
            .get(&(session_id.to_string(), task_index, page_number))
            .map(|a| a.clone()))
    }

    async fn append_log(&self, entry: &LogEntry) -> Result<(), StoreError> {
        self.logs.lock().push(entry.clone());
        Ok(())
    }

    async fn list_logs(&self, session_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        Ok(self
            .logs
            .lock()
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect())
    }
}
