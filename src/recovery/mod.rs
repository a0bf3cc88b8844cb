//! CAPTCHA recovery state machine.
//!
//! On detection the session is parked in PAUSED_CAPTCHA and one of three
//! remedies runs: rotate to a random proxy (fast path, up to 3 consecutive
//! attempts), fall back to a direct connection (once per escalation), or
//! wait. The wait path races a durable wake timer against an observer on
//! the held tab; a one-shot guard ensures exactly one of them performs the
//! resume-and-reset, so the session can never be double-resumed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::model::{LogLevel, SessionStatus};
use crate::scheduler::log_session;
use crate::store::StoreError;
use crate::surface::{looks_like_captcha_url, SurfaceHandle};
use crate::{AppState, PendingRecovery};

/// Escalating wait tiers; the last tier repeats indefinitely.
pub const RETRY_DELAYS: [Duration; 4] = [
    Duration::from_secs(5 * 60),
    Duration::from_secs(15 * 60),
    Duration::from_secs(30 * 60),
    Duration::from_secs(60 * 60),
];

/// Consecutive CAPTCHA-driven proxy rotations before the direct fallback.
pub const MAX_PROXY_ATTEMPTS: u32 = 3;

/// How often the held-tab observer re-checks for manual resolution.
const OBSERVER_POLL: Duration = Duration::from_secs(10);

/// Backoff delay for the given wait-attempt count.
pub fn wait_delay(wait_attempts: u32) -> Duration {
    RETRY_DELAYS[(wait_attempts as usize).min(RETRY_DELAYS.len() - 1)]
}

/// Handle a CAPTCHA detection for a session. The surface handle is either
/// closed here (proxy rotation, stale) or held open for the wait path.
pub async fn on_captcha(
    state: &Arc<AppState>,
    session_id: &str,
    handle: SurfaceHandle,
) -> Result<(), StoreError> {
    warn!("CAPTCHA detected for session {}", session_id);
    log_session(state, session_id, LogLevel::Warn, "CAPTCHA detected, starting recovery").await;

    state.flags.set_paused(session_id, true);
    let Some(mut session) = state.store.get_session(session_id).await? else {
        let _ = state.surface.close(&handle).await;
        return Ok(());
    };
    session.status = SessionStatus::PausedCaptcha;
    state.store.put_session(&session).await?;
    state.notifier.publish(crate::notify::Event::SessionStatus {
        session_id: session_id.to_string(),
        status: SessionStatus::PausedCaptcha,
    });

    let settings = session.settings.clone();
    let counters = state.recovery.counters_for(session_id);

    // Fast path: rotate to a fresh proxy and resume immediately, no timer.
    if settings.use_proxies
        && !settings.proxy_list.is_empty()
        && counters.proxy_attempts < MAX_PROXY_ATTEMPTS
    {
        if state.proxy.activate_random(&settings.proxy_list).is_some() {
            let _ = state.surface.close(&handle).await;
            let attempts = {
                let mut entry = state
                    .recovery
                    .counters
                    .entry(session_id.to_string())
                    .or_default();
                entry.proxy_attempts += 1;
                entry.proxy_attempts
            };
            log_session(
                state,
                session_id,
                LogLevel::Info,
                format!("Rotated proxy (attempt {}/{}), resuming", attempts, MAX_PROXY_ATTEMPTS),
            )
            .await;
            resume_session(state, session_id).await?;
            return Ok(());
        }
        // Nothing in the list parsed; fall through to the wait path.
    }

    if counters.proxy_attempts >= MAX_PROXY_ATTEMPTS {
        // Direct fallback: best-effort, attempted once per escalation. It is
        // not checked for success; the wait path below engages regardless.
        state.proxy.deactivate();
        if let Some(mut entry) = state.recovery.counters.get_mut(session_id) {
            entry.proxy_attempts = 0;
        }
        log_session(
            state,
            session_id,
            LogLevel::Info,
            "Proxy rotations exhausted, falling back to direct connection",
        )
        .await;
    }

    // Wait path: durable timer vs. held-tab observer, first winner resumes.
    let delay = wait_delay(counters.wait_attempts);
    state.timer.schedule_once(session_id, delay).await;

    let resolved = Arc::new(AtomicBool::new(false));
    let observer = spawn_observer(state.clone(), session_id.to_string(), handle.clone(), resolved.clone());

    // A previous pending entry for this session would be a bug upstream; the
    // scheduler cannot detect a second CAPTCHA while the session is parked.
    if let Some((_, old)) = state.recovery.pending.remove(session_id) {
        old.observer.abort();
        let _ = state.surface.close(&old.handle).await;
    }
    state
        .recovery
        .pending
        .insert(session_id.to_string(), PendingRecovery { resolved, observer, handle });

    log_session(
        state,
        session_id,
        LogLevel::Warn,
        format!("Waiting up to {} min for CAPTCHA resolution", delay.as_secs() / 60),
    )
    .await;
    Ok(())
}

/// Observer on the held tab: polls for navigation away from the CAPTCHA
/// interstitial (manual resolution) and races the wake timer.
fn spawn_observer(
    state: Arc<AppState>,
    session_id: String,
    handle: SurfaceHandle,
    resolved: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(OBSERVER_POLL).await;

            if resolved.load(Ordering::Acquire) {
                return;
            }

            let url = match state.surface.current_url(&handle).await {
                Ok(url) => url,
                Err(e) => {
                    debug!("Observer for {} lost the tab: {}", session_id, e);
                    return;
                }
            };
            if looks_like_captcha_url(&url) {
                continue;
            }

            // URL moved off the challenge; confirm with a fresh CAPTCHA check.
            match state.extractor.check_captcha(&handle).await {
                Ok(false) => {}
                Ok(true) => continue,
                Err(e) => {
                    debug!("Observer re-check failed for {}: {}", session_id, e);
                    continue;
                }
            }

            if resolved
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            info!("CAPTCHA manually resolved for session {}", session_id);
            state.timer.cancel(&session_id).await;
            state.recovery.reset_counters(&session_id);
            if let Some((_, pending)) = state.recovery.pending.remove(&session_id) {
                let _ = state.surface.close(&pending.handle).await;
            }
            log_session(&state, &session_id, LogLevel::Success, "CAPTCHA resolved, resuming").await;
            if let Err(e) = resume_session(&state, &session_id).await {
                warn!("Failed to resume {} after manual resolution: {}", session_id, e);
            }
            return;
        }
    })
}

/// Handle a wake-timer delivery for a session key.
///
/// If the observer already won, this is a no-op. Otherwise the stale tab is
/// discarded and the session resumes optimistically; the next pre-check
/// re-detects the challenge if it persists.
pub async fn on_timer_wake(state: &Arc<AppState>, session_id: &str) {
    let won = match state.recovery.pending.remove(session_id) {
        Some((_, pending)) => {
            if pending
                .resolved
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                pending.observer.abort();
                let _ = state.surface.close(&pending.handle).await;
                true
            } else {
                false
            }
        }
        // A timer re-armed after a restart has no live observer; wake only if
        // the session is still parked.
        None => matches!(
            state.store.get_session(session_id).await,
            Ok(Some(s)) if s.status == SessionStatus::PausedCaptcha
        ),
    };

    if !won {
        return;
    }

    {
        let mut entry = state
            .recovery
            .counters
            .entry(session_id.to_string())
            .or_default();
        entry.wait_attempts += 1;
    }

    log_session(
        state,
        session_id,
        LogLevel::Info,
        "CAPTCHA wait elapsed, resuming optimistically",
    )
    .await;
    if let Err(e) = resume_session(state, session_id).await {
        warn!("Failed to resume {} after wait: {}", session_id, e);
    }
}

/// Cancel any in-flight recovery for a session (manual resume or deletion).
pub async fn clear_pending(state: &Arc<AppState>, session_id: &str) {
    state.timer.cancel(session_id).await;
    if let Some((_, pending)) = state.recovery.pending.remove(session_id) {
        pending.resolved.store(true, Ordering::Release);
        pending.observer.abort();
        let _ = state.surface.close(&pending.handle).await;
    }
}

/// Flip the session back to RUNNING and hand it to the dispatcher.
async fn resume_session(state: &Arc<AppState>, session_id: &str) -> Result<(), StoreError> {
    let Some(mut session) = state.store.get_session(session_id).await? else {
        return Ok(());
    };
    session.status = SessionStatus::Running;
    state.store.put_session(&session).await?;
    state.flags.set_paused(session_id, false);
    state.notifier.publish(crate::notify::Event::SessionStatus {
        session_id: session_id.to_string(),
        status: SessionStatus::Running,
    });
    state.kick(session_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_delay_escalates_and_caps() {
        assert_eq!(wait_delay(0), Duration::from_secs(5 * 60));
        assert_eq!(wait_delay(1), Duration::from_secs(15 * 60));
        assert_eq!(wait_delay(2), Duration::from_secs(30 * 60));
        assert_eq!(wait_delay(3), Duration::from_secs(60 * 60));
        // The last tier repeats rather than growing further.
        assert_eq!(wait_delay(17), Duration::from_secs(60 * 60));
    }
}
