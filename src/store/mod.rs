//! Persistent store boundary.
//!
//! Session records, per-page artifacts, and session logs are keyed blobs
//! with last-write-wins semantics. The bundled [`JsonStore`] keeps one JSON
//! file per session plus artifact and log files under a data directory;
//! [`MemoryStore`] backs the test suites.

mod json;
mod memory;

pub use json::JsonStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{LogEntry, Session};

/// Store-level errors. Store failures abort the current operation and leave
/// the session in its last durable state.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Out-of-band page artifact (HTML snapshot and/or screenshot), keyed by
/// (session, task index, page number).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageArtifact {
    #[serde(default)]
    pub html: Option<String>,
    /// Base64-encoded screenshot bytes
    #[serde(default)]
    pub screenshot: Option<String>,
}

impl PageArtifact {
    /// Whether there is anything worth persisting.
    pub fn is_empty(&self) -> bool {
        self.html.is_none() && self.screenshot.is_none()
    }
}

/// Durable key/value storage for sessions, artifacts, and logs.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError>;
    async fn put_session(&self, session: &Session) -> Result<(), StoreError>;
    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError>;
    /// Delete a session record along with its artifacts and logs.
    async fn delete_session(&self, id: &str) -> Result<(), StoreError>;

    async fn put_page_artifact(
        &self,
        session_id: &str,
        task_index: usize,
        page_number: u32,
        artifact: &PageArtifact,
    ) -> Result<(), StoreError>;
    async fn get_page_artifact(
        &self,
        session_id: &str,
        task_index: usize,
        page_number: u32,
    ) -> Result<Option<PageArtifact>, StoreError>;

    async fn append_log(&self, entry: &LogEntry) -> Result<(), StoreError>;
    async fn list_logs(&self, session_id: &str) -> Result<Vec<LogEntry>, StoreError>;
}
