//! Session lifecycle operations.
//!
//! All session mutation funnels through these functions on a single logical
//! thread of control; every mutation persists the record and publishes a
//! status broadcast so observers stay current. Both the REST routes and the
//! recovery machinery call into this module.

use std::sync::Arc;

use tracing::{info, warn};

use crate::model::{
    DelayRange, EngineConfig, LogLevel, Session, SessionSettings, SessionStatus, TaskStatus,
};
use crate::notify::Event;
use crate::recovery;
use crate::scheduler::log_session;
use crate::AppState;

/// Request payload for session creation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub queries: Vec<String>,
    pub configs: Vec<EngineConfig>,
    pub quota: u32,
    #[serde(default)]
    pub delay: DelayRange,
    #[serde(default)]
    pub settings: SessionSettings,
}

/// Why a session is being paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PauseReason {
    User,
}

/// Create a new OPEN session from the query × config cross product.
pub async fn create_session_logic(
    state: &Arc<AppState>,
    req: CreateSessionRequest,
) -> Result<Session, String> {
    if req.queries.is_empty() {
        return Err("No queries provided".into());
    }
    if req.configs.is_empty() {
        return Err("No engine configs provided".into());
    }
    if req.quota == 0 {
        return Err("Quota must be positive".into());
    }
    if req.delay.min_ms > req.delay.max_ms {
        return Err("Delay range minimum exceeds maximum".into());
    }

    let session = Session::new(req.queries, req.configs, req.quota, req.delay, req.settings);
    state.store.put_session(&session).await.map_err(|e| e.to_string())?;

    info!("Session {} created with {} tasks", session.id, session.tasks.len());
    log_session(
        state,
        &session.id,
        LogLevel::Info,
        format!("Session created ({} tasks, quota {})", session.tasks.len(), session.quota),
    )
    .await;
    broadcast_status(state, &session);
    Ok(session)
}

/// Start an OPEN (or previously paused) session.
pub async fn start_session_logic(state: &Arc<AppState>, session_id: &str) -> Result<(), String> {
    let Some(mut session) = get(state, session_id).await? else {
        return Err(format!("Session not found: {}", session_id));
    };

    match session.status {
        SessionStatus::Running => return Err("Session is already running".into()),
        SessionStatus::Done => return Err("Session is already complete".into()),
        _ => {}
    }

    // Starting a session parked in PAUSED_CAPTCHA supersedes its wait; the
    // stale timer and observer must not fire into the restarted run.
    recovery::clear_pending(state, session_id).await;

    // CAPTCHA counters reset on every session start.
    state.recovery.reset_counters(session_id);
    state.flags.set_paused(session_id, false);

    session.status = SessionStatus::Running;
    put(state, &session).await?;
    broadcast_status(state, &session);
    log_session(state, session_id, LogLevel::Info, "Session started").await;
    state.kick(session_id);
    Ok(())
}

/// Pause a session. A user pause always takes effect, including over an
/// in-flight CAPTCHA wait (whose timer and observer are torn down).
pub async fn pause_session_logic(
    state: &Arc<AppState>,
    session_id: &str,
    reason: PauseReason,
) -> Result<(), String> {
    let Some(mut session) = get(state, session_id).await? else {
        return Err(format!("Session not found: {}", session_id));
    };

    state.flags.set_paused(session_id, true);
    if session.status == SessionStatus::PausedCaptcha {
        recovery::clear_pending(state, session_id).await;
    }

    session.status = SessionStatus::Paused;
    put(state, &session).await?;
    broadcast_status(state, &session);
    log_session(state, session_id, LogLevel::Info, format!("Session paused ({:?})", reason)).await;
    Ok(())
}

/// Resume a paused session (user-initiated or after manual CAPTCHA solving).
pub async fn resume_session_logic(state: &Arc<AppState>, session_id: &str) -> Result<(), String> {
    let Some(mut session) = get(state, session_id).await? else {
        return Err(format!("Session not found: {}", session_id));
    };

    match session.status {
        SessionStatus::Paused | SessionStatus::PausedCaptcha => {}
        other => return Err(format!("Session is not paused (status {:?})", other)),
    }

    recovery::clear_pending(state, session_id).await;
    state.flags.set_paused(session_id, false);

    session.status = SessionStatus::Running;
    put(state, &session).await?;
    broadcast_status(state, &session);
    log_session(state, session_id, LogLevel::Info, "Session resumed").await;
    state.kick(session_id);
    Ok(())
}

/// Delete a session and all of its pages, artifacts, and logs.
pub async fn delete_session_logic(state: &Arc<AppState>, session_id: &str) -> Result<(), String> {
    // Raise the pause flag first so a running driver loop stops promptly.
    state.flags.set_paused(session_id, true);
    recovery::clear_pending(state, session_id).await;

    state.store.delete_session(session_id).await.map_err(|e| e.to_string())?;
    state.flags.clear(session_id);
    state.recovery.counters.remove(session_id);

    info!("Session {} deleted", session_id);
    Ok(())
}

/// Append queries and/or engine configs, generating only the new
/// cross-product tasks. Appended tasks queue behind already-open ones.
pub async fn add_items_logic(
    state: &Arc<AppState>,
    session_id: &str,
    queries: Vec<String>,
    configs: Vec<EngineConfig>,
) -> Result<Session, String> {
    if queries.is_empty() && configs.is_empty() {
        return Err("Nothing to add".into());
    }

    let Some(mut session) = get(state, session_id).await? else {
        return Err(format!("Session not found: {}", session_id));
    };
    if session.status == SessionStatus::Done {
        // New items revive a completed session.
        session.status = SessionStatus::Open;
    }

    let before = session.tasks.len();
    session.add_items(queries, configs);
    put(state, &session).await?;
    broadcast_status(state, &session);
    log_session(
        state,
        session_id,
        LogLevel::Info,
        format!("Added {} tasks", session.tasks.len() - before),
    )
    .await;
    Ok(session)
}

/// Cancel all OPEN/FAILED tasks matching an engine config and drop the
/// config from the session's axis. DONE tasks and their data are untouched.
pub async fn remove_config_logic(
    state: &Arc<AppState>,
    session_id: &str,
    config: EngineConfig,
) -> Result<Session, String> {
    let Some(mut session) = get(state, session_id).await? else {
        return Err(format!("Session not found: {}", session_id));
    };

    let mut cancelled = 0;
    for task in session.tasks.iter_mut().filter(|t| t.config == config) {
        if matches!(task.status, TaskStatus::Open | TaskStatus::Failed) {
            task.status = TaskStatus::Cancelled;
            cancelled += 1;
        }
    }
    session.configs.retain(|c| *c != config);

    put(state, &session).await?;
    broadcast_status(state, &session);
    log_session(
        state,
        session_id,
        LogLevel::Info,
        format!("Removed config {:?}/{} ({} tasks cancelled)", config.engine, config.country, cancelled),
    )
    .await;
    Ok(session)
}

/// Cancel one task by index. Refused if the task is already DONE.
pub async fn remove_task_logic(
    state: &Arc<AppState>,
    session_id: &str,
    task_index: usize,
) -> Result<Session, String> {
    let Some(mut session) = get(state, session_id).await? else {
        return Err(format!("Session not found: {}", session_id));
    };
    let Some(task) = session.tasks.get_mut(task_index) else {
        return Err(format!("No task at index {}", task_index));
    };
    if task.status == TaskStatus::Done {
        return Err("Cannot remove a completed task".into());
    }

    task.status = TaskStatus::Cancelled;
    let term = task.term.clone();
    put(state, &session).await?;
    state.notifier.publish(Event::TaskStatus {
        session_id: session_id.to_string(),
        task_index,
        status: TaskStatus::Cancelled,
    });
    broadcast_status(state, &session);
    log_session(state, session_id, LogLevel::Info, format!("Task '{}' cancelled", term)).await;
    Ok(session)
}

/// Update the per-task organic quota.
pub async fn update_quota_logic(
    state: &Arc<AppState>,
    session_id: &str,
    quota: u32,
) -> Result<Session, String> {
    if quota == 0 {
        return Err("Quota must be positive".into());
    }
    mutate(state, session_id, |session| {
        session.quota = quota;
        Ok(())
    })
    .await
}

/// Update the inter-page delay range.
pub async fn update_delay_logic(
    state: &Arc<AppState>,
    session_id: &str,
    delay: DelayRange,
) -> Result<Session, String> {
    if delay.min_ms > delay.max_ms {
        return Err("Delay range minimum exceeds maximum".into());
    }
    mutate(state, session_id, |session| {
        session.delay = delay;
        Ok(())
    })
    .await
}

/// Update proxy usage and the proxy list.
pub async fn update_proxies_logic(
    state: &Arc<AppState>,
    session_id: &str,
    use_proxies: bool,
    proxy_list: Vec<String>,
) -> Result<Session, String> {
    mutate(state, session_id, |session| {
        session.settings.use_proxies = use_proxies;
        session.settings.proxy_list = proxy_list;
        Ok(())
    })
    .await
}

async fn get(state: &Arc<AppState>, session_id: &str) -> Result<Option<Session>, String> {
    state.store.get_session(session_id).await.map_err(|e| e.to_string())
}

async fn put(state: &Arc<AppState>, session: &Session) -> Result<(), String> {
    state.store.put_session(session).await.map_err(|e| e.to_string())
}

async fn mutate(
    state: &Arc<AppState>,
    session_id: &str,
    f: impl FnOnce(&mut Session) -> Result<(), String>,
) -> Result<Session, String> {
    let Some(mut session) = get(state, session_id).await? else {
        return Err(format!("Session not found: {}", session_id));
    };
    f(&mut session)?;
    put(state, &session).await?;
    broadcast_status(state, &session);
    Ok(session)
}

fn broadcast_status(state: &Arc<AppState>, session: &Session) {
    state.notifier.publish(Event::SessionStatus {
        session_id: session.id.clone(),
        status: session.status,
    });
}

/// Best-effort warning when a session references proxies that cannot parse.
pub fn warn_on_malformed_proxies(session: &Session) {
    if session.settings.use_proxies {
        for entry in &session.settings.proxy_list {
            if crate::proxy::ProxyEndpoint::parse(entry).is_none() {
                warn!("Session {} has malformed proxy entry: {}", session.id, entry);
            }
        }
    }
}
