//! Durable wake-up timer boundary.
//!
//! CAPTCHA recovery schedules one-shot wake timers keyed by session id.
//! Wakes are delivered as keys on a channel so the dispatcher owns the
//! resume logic; scheduling the same key again replaces the pending timer.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// One-shot wake timer keyed by an opaque string.
#[async_trait]
pub trait WakeTimer: Send + Sync {
    async fn schedule_once(&self, key: &str, delay: Duration);
    async fn cancel(&self, key: &str);
}

/// tokio-backed timer. Pending timers are plain sleep tasks; durability
/// across process restarts comes from the recovery state persisted in the
/// session record (a PAUSED_CAPTCHA session is re-armed on boot
/// reconciliation).
pub struct TokioWakeTimer {
    pending: DashMap<String, tokio::task::JoinHandle<()>>,
    tx: mpsc::UnboundedSender<String>,
}

impl TokioWakeTimer {
    /// Create a timer delivering wake keys on the returned receiver.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { pending: DashMap::new(), tx }, rx)
    }
}

#[async_trait]
impl WakeTimer for TokioWakeTimer {
    async fn schedule_once(&self, key: &str, delay: Duration) {
        // Re-scheduling replaces any timer already pending for the key.
        if let Some((_, old)) = self.pending.remove(key) {
            old.abort();
        }

        debug!("Scheduling wake for {} in {:?}", key, delay);
        let tx = self.tx.clone();
        let owned_key = key.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(owned_key);
        });
        self.pending.insert(key.to_string(), handle);
    }

    async fn cancel(&self, key: &str) {
        if let Some((_, handle)) = self.pending.remove(key) {
            handle.abort();
            debug!("Cancelled wake for {}", key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_wake_delivered_after_delay() {
        let (timer, mut rx) = TokioWakeTimer::new();
        timer.schedule_once("s1", Duration::from_secs(60)).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(rx.recv().await.as_deref(), Some("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_suppresses_wake() {
        let (timer, mut rx) = TokioWakeTimer::new();
        timer.schedule_once("s1", Duration::from_secs(60)).await;
        timer.cancel("s1").await;

        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
    }
}
