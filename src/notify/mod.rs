//! Best-effort status broadcast to observers.
//!
//! Events are fire-and-forget: a send with no subscribers (or a lagging
//! subscriber) is not an error anywhere in the orchestrator.

use tokio::sync::broadcast;

use crate::model::{LogEntry, SessionStatus, TaskStatus};

/// Observer-facing event stream.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Event {
    SessionStatus {
        session_id: String,
        status: SessionStatus,
    },
    TaskStatus {
        session_id: String,
        task_index: usize,
        status: TaskStatus,
    },
    PageCollected {
        session_id: String,
        task_index: usize,
        page_number: u32,
        collected: u32,
        quota: u32,
    },
    Log(LogEntry),
}

/// Broadcast fan-out for orchestrator events.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Event>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Publish an event; failures (no subscribers) are swallowed.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
