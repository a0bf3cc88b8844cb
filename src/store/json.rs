//! JSON-file store.
//!
//! Layout under the data directory:
//! - `sessions/<id>.json` — one session record per file
//! - `artifacts/<id>/<task>-<page>.json` — page artifacts
//! - `logs/<id>.jsonl` — append-only log lines

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::warn;

use crate::model::{LogEntry, Session};

use super::{PageArtifact, Store, StoreError};

/// File-backed store rooted at a data directory.
pub struct JsonStore {
    root: PathBuf,
}

impl JsonStore {
    /// Create a store rooted at `root`, creating the directory tree if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(root.join("sessions"))?;
        std::fs::create_dir_all(root.join("artifacts"))?;
        std::fs::create_dir_all(root.join("logs"))?;
        Ok(Self { root })
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.root.join("sessions").join(format!("{}.json", id))
    }

    fn artifact_path(&self, id: &str, task_index: usize, page_number: u32) -> PathBuf {
        self.root
            .join("artifacts")
            .join(id)
            .join(format!("{}-{}.json", task_index, page_number))
    }

    fn log_path(&self, id: &str) -> PathBuf {
        self.root.join("logs").join(format!("{}.jsonl", id))
    }
}

async fn write_atomic(path: &Path, content: String) -> Result<(), StoreError> {
    // Write-then-rename so a crash mid-write never truncates the old record.
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl Store for JsonStore {
    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let path = self.session_path(id);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_session(&self, session: &Session) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(session)?;
        write_atomic(&self.session_path(&session.id), content).await
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let mut sessions = Vec::new();
        let mut dir = tokio::fs::read_dir(self.root.join("sessions")).await?;
        while let Some(entry) = dir.next_entry().await? {
            if entry.path().extension().map(|e| e == "json").unwrap_or(false) {
                let content = tokio::fs::read_to_string(entry.path()).await?;
                match serde_json::from_str(&content) {
                    Ok(session) => sessions.push(session),
                    Err(e) => warn!("Skipping unreadable session file {:?}: {}", entry.path(), e),
                }
            }
        }
        sessions.sort_by(|a: &Session, b: &Session| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.session_path(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let artifacts = self.root.join("artifacts").join(id);
        if artifacts.exists() {
            tokio::fs::remove_dir_all(artifacts).await?;
        }
        match tokio::fs::remove_file(self.log_path(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn put_page_artifact(
        &self,
        session_id: &str,
        task_index: usize,
        page_number: u32,
        artifact: &PageArtifact,
    ) -> Result<(), StoreError> {
        let path = self.artifact_path(session_id, task_index, page_number);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_atomic(&path, serde_json::to_string(artifact)?).await
    }

    async fn get_page_artifact(
        &self,
        session_id: &str,
        task_index: usize,
        page_number: u32,
    ) -> Result<Option<PageArtifact>, StoreError> {
        let path = self.artifact_path(session_id, task_index, page_number);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn append_log(&self, entry: &LogEntry) -> Result<(), StoreError> {
        use tokio::io::AsyncWriteExt;

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(&entry.session_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn list_logs(&self, session_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        let path = self.log_path(session_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping unreadable log line for {}: {}", session_id, e),
            }
        }
        Ok(entries)
    }
}
