//! Session driver and pagination loop.
//!
//! `advance` selects the first OPEN task in declaration order and drives its
//! pagination loop until quota, exhaustion, pause, or CAPTCHA hand-off.
//! Progress is persisted after every page so a crash between pages loses
//! nothing; a resumed task continues from its last persisted page.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::model::{
    DelayRange, LogEntry, LogLevel, Page, SearchResults, SessionStatus, TaskStatus,
};
use crate::notify::Event;
use crate::recovery;
use crate::store::StoreError;
use crate::surface::{Extraction, PaginateOutcome, SurfaceError, SurfaceHandle};
use crate::{engine, idle_with_pause_poll, AppConfig, AppState};

/// Result of one `advance` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// A task reached a terminal status (or was re-opened for retry);
    /// the driver should cool down and advance again.
    TaskConcluded,
    /// No OPEN task remained; the session is DONE.
    SessionDone,
    /// The session paused (externally or for CAPTCHA recovery); the driver
    /// loop ends and a later resume re-enters it.
    Suspended,
}

/// How one task attempt ended.
enum TaskExit {
    Done,
    Paused,
    CaptchaHandoff,
}

#[derive(Error, Debug)]
enum TaskError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Transient(String),
}

impl From<SurfaceError> for TaskError {
    fn from(e: SurfaceError) -> Self {
        TaskError::Transient(e.to_string())
    }
}

/// Spawn the driver loop for a session, panic-safe.
///
/// A no-op if a driver is already running for this session, so repeated
/// resume signals cannot double-drive a session.
pub fn spawn_session_driver(state: Arc<AppState>, session_id: String) {
    if !state.flags.try_acquire_run(&session_id) {
        debug!("Driver already running for session {}", session_id);
        return;
    }

    let state_cleanup = state.clone();
    let sid_cleanup = session_id.clone();

    tokio::spawn(async move {
        use futures::FutureExt;

        let result = std::panic::AssertUnwindSafe(run_session(state, session_id));
        let clean_exit = match result.catch_unwind().await {
            Ok(clean) => clean,
            Err(panic_info) => {
                let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                error!("Driver for session {} panicked: {}", sid_cleanup, panic_msg);
                false
            }
        };

        state_cleanup.flags.release_run(&sid_cleanup);

        // A resume kick sent while this driver still held the run guard hit
        // the no-op path above and was lost. Re-check now that the guard is
        // released: a session that is RUNNING and unpaused must always have
        // a driver or a pending kick.
        if clean_exit && !state_cleanup.flags.is_paused(&sid_cleanup) {
            if let Ok(Some(session)) = state_cleanup.store.get_session(&sid_cleanup).await {
                if session.status == SessionStatus::Running {
                    debug!("Re-kicking session {} after driver exit", sid_cleanup);
                    state_cleanup.kick(&sid_cleanup);
                }
            }
        }
    });
}

/// Drive a session task by task until it is done, paused, or suspended.
/// Returns false on a store-error abort so the caller does not re-kick into
/// the same failure.
async fn run_session(state: Arc<AppState>, session_id: String) -> bool {
    info!("Driver loop starting for session {}", session_id);

    let clean = loop {
        match advance(&state, &session_id).await {
            Ok(AdvanceOutcome::TaskConcluded) => {
                // Randomized cooldown between tasks, pause-aware. An inverted
                // range from a hand-edited config file collapses to its lower
                // bound instead of aborting the loop.
                let cfg = state.config.read().await.clone();
                let cooldown = Duration::from_millis(rand::thread_rng().gen_range(
                    cfg.cooldown_min_ms..=cfg.cooldown_max_ms.max(cfg.cooldown_min_ms),
                ));
                let flag = state.flags.pause_flag(&session_id);
                if idle_with_pause_poll(&flag, cooldown, Duration::from_millis(cfg.pause_poll_ms))
                    .await
                {
                    info!("Session {} paused during cooldown", session_id);
                    break true;
                }
            }
            Ok(AdvanceOutcome::SessionDone) | Ok(AdvanceOutcome::Suspended) => break true,
            Err(e) => {
                // Store unavailable: abort, leaving the last durable state.
                error!("Session {} driver aborting on store error: {}", session_id, e);
                break false;
            }
        }
    };

    info!("Driver loop ended for session {}", session_id);
    clean
}

/// Select the first OPEN task and run its pagination loop.
pub async fn advance(state: &Arc<AppState>, session_id: &str) -> Result<AdvanceOutcome, StoreError> {
    let Some(session) = state.store.get_session(session_id).await? else {
        warn!("Session {} no longer exists, stopping driver", session_id);
        return Ok(AdvanceOutcome::SessionDone);
    };

    if session.status != SessionStatus::Running {
        debug!("Session {} not RUNNING ({:?}), suspending", session_id, session.status);
        return Ok(AdvanceOutcome::Suspended);
    }

    let Some(task_index) = session.next_open_task() else {
        let mut session = session;
        session.status = SessionStatus::Done;
        state.store.put_session(&session).await?;
        state.notifier.publish(Event::SessionStatus {
            session_id: session_id.to_string(),
            status: SessionStatus::Done,
        });
        log_session(state, session_id, LogLevel::Success, "All tasks settled, session complete")
            .await;
        info!("Session {} complete", session_id);
        return Ok(AdvanceOutcome::SessionDone);
    };

    if session.current_index != task_index {
        let mut session = session.clone();
        session.current_index = task_index;
        state.store.put_session(&session).await?;
    }

    let task = &session.tasks[task_index];
    info!(
        "Session {} task {}: '{}' on {:?}/{} (collected {}/{})",
        session_id, task_index, task.term, task.config.engine, task.config.country,
        task.total_organic, session.quota,
    );

    match run_task(state, session_id, task_index).await {
        Ok(TaskExit::Done) => Ok(AdvanceOutcome::TaskConcluded),
        Ok(TaskExit::Paused) | Ok(TaskExit::CaptchaHandoff) => Ok(AdvanceOutcome::Suspended),
        Err(TaskError::Store(e)) => Err(e),
        Err(TaskError::Transient(msg)) => handle_transient(state, session_id, task_index, msg).await,
    }
}

/// Transient-error retry policy: up to `max_transient_retries` re-opens,
/// then the task is FAILED permanently.
async fn handle_transient(
    state: &Arc<AppState>,
    session_id: &str,
    task_index: usize,
    msg: String,
) -> Result<AdvanceOutcome, StoreError> {
    warn!("Session {} task {} transient error: {}", session_id, task_index, msg);

    if state.flags.is_paused(session_id) {
        // Let the pause stand.
        return Ok(AdvanceOutcome::Suspended);
    }

    let cfg = state.config.read().await.clone();
    let Some(mut session) = state.store.get_session(session_id).await? else {
        return Ok(AdvanceOutcome::SessionDone);
    };
    let Some(task) = session.tasks.get_mut(task_index) else {
        return Ok(AdvanceOutcome::TaskConcluded);
    };

    task.retry_count += 1;
    if task.retry_count > cfg.max_transient_retries {
        task.status = TaskStatus::Failed;
        let term = task.term.clone();
        state.store.put_session(&session).await?;
        state.notifier.publish(Event::TaskStatus {
            session_id: session_id.to_string(),
            task_index,
            status: TaskStatus::Failed,
        });
        log_session(
            state,
            session_id,
            LogLevel::Error,
            format!("Task '{}' failed after {} retries: {}", term, cfg.max_transient_retries, msg),
        )
        .await;
    } else {
        let attempt = task.retry_count;
        let term = task.term.clone();
        // Task stays OPEN; first-by-index selection retries it next.
        state.store.put_session(&session).await?;
        log_session(
            state,
            session_id,
            LogLevel::Warn,
            format!(
                "Task '{}' retry {}/{}: {}",
                term, attempt, cfg.max_transient_retries, msg
            ),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(cfg.retry_delay_ms)).await;
    }

    Ok(AdvanceOutcome::TaskConcluded)
}

/// Run the pagination loop for one task, resuming from persisted state.
async fn run_task(
    state: &Arc<AppState>,
    session_id: &str,
    task_index: usize,
) -> Result<TaskExit, TaskError> {
    let cfg = state.config.read().await.clone();
    let Some(session) = state.store.get_session(session_id).await.map_err(TaskError::Store)? else {
        return Ok(TaskExit::Paused);
    };
    let Some(task) = session.tasks.get(task_index).cloned() else {
        return Ok(TaskExit::Paused);
    };

    let quota = session.quota;
    let delay = session.delay;
    let mut collected = task.total_organic;
    let mut page = task.pages.len() as u32 + 1;
    let mut seen = task.recorded_urls();
    let mut next_rank = task.next_rank();
    let flag = state.flags.pause_flag(session_id);

    if collected >= quota {
        // Quota already met at resume time; nothing left to fetch.
        mark_task_done(state, session_id, task_index).await?;
        return Ok(TaskExit::Done);
    }

    let url = engine::search_url(&task.term, &task.config, page);
    let handle = state.surface.open(&url).await?;

    let exit = drive_pages(
        state, &cfg, session_id, task_index, quota, delay,
        &mut collected, &mut page, &mut seen, &mut next_rank, &flag, &handle,
    )
    .await;

    // Release the surface unless recovery holds it for the CAPTCHA wait.
    if !matches!(exit, Ok(TaskExit::CaptchaHandoff)) {
        let _ = state.surface.close(&handle).await;
    }

    let exit = exit?;
    if matches!(exit, TaskExit::Done) {
        mark_task_done(state, session_id, task_index).await?;
    }
    Ok(exit)
}

/// The inner page loop: load, pre-check, humanize, extract, dedup, trim,
/// persist, paginate, idle. Every blocking step re-checks the pause flag.
#[allow(clippy::too_many_arguments)]
async fn drive_pages(
    state: &Arc<AppState>,
    cfg: &AppConfig,
    session_id: &str,
    task_index: usize,
    quota: u32,
    delay: DelayRange,
    collected: &mut u32,
    page: &mut u32,
    seen: &mut HashSet<String>,
    next_rank: &mut u32,
    flag: &Arc<AtomicBool>,
    handle: &SurfaceHandle,
) -> Result<TaskExit, TaskError> {
    while *collected < quota && *page <= cfg.max_pages {
        state.surface.wait_loaded(handle).await?;

        if state.flags.is_paused(session_id) {
            info!("Session {} paused before page {}, leaving task open", session_id, page);
            return Ok(TaskExit::Paused);
        }

        // CAPTCHA pre-check before touching the page.
        if state.extractor.check_captcha(handle).await? {
            recovery::on_captcha(state, session_id, handle.clone())
                .await
                .map_err(TaskError::Store)?;
            return Ok(TaskExit::CaptchaHandoff);
        }

        // Detection avoidance, not correctness; a failure here is only noise.
        if let Err(e) = state.extractor.humanize(handle).await {
            debug!("Humanize failed on page {}: {}", page, e);
        }

        let results = match state.extractor.extract(handle, *next_rank).await? {
            Extraction::Captcha => {
                recovery::on_captcha(state, session_id, handle.clone())
                    .await
                    .map_err(TaskError::Store)?;
                return Ok(TaskExit::CaptchaHandoff);
            }
            Extraction::Results(r) => r,
        };

        // Per-task dedup by URL, then trim so the quota is never exceeded.
        let mut organic: Vec<_> = results
            .organic
            .into_iter()
            .filter(|o| seen.insert(o.url.clone()))
            .collect();
        let room = (quota - *collected) as usize;
        if organic.len() > room {
            debug!("Trimming page {} from {} to {} organic entries", page, organic.len(), room);
            organic.truncate(room);
        }
        let new_count = organic.len() as u32;

        let record = Page {
            page_number: *page,
            results: SearchResults {
                organic,
                ads: results.ads,
                ai_overview: results.ai_overview,
            },
        };

        persist_page(state, session_id, task_index, handle, record, new_count, quota).await?;
        *collected += new_count;
        if let Some(max_rank) = max_rank_of(state, session_id, task_index).await? {
            *next_rank = max_rank + 1;
        }

        if *collected >= quota {
            info!("Session {} task {} reached quota ({})", session_id, task_index, quota);
            break;
        }

        match state.extractor.paginate(handle).await? {
            PaginateOutcome::Advanced => *page += 1,
            PaginateOutcome::Captcha => {
                recovery::on_captcha(state, session_id, handle.clone())
                    .await
                    .map_err(TaskError::Store)?;
                return Ok(TaskExit::CaptchaHandoff);
            }
            PaginateOutcome::Exhausted => {
                info!(
                    "Session {} task {} exhausted after page {} ({} organic)",
                    session_id, task_index, page, collected
                );
                // No further page is a success exit, not a failure.
                return Ok(TaskExit::Done);
            }
        }

        let idle = Duration::from_millis(
            rand::thread_rng().gen_range(delay.min_ms..=delay.max_ms.max(delay.min_ms)),
        );
        if idle_with_pause_poll(flag, idle, Duration::from_millis(cfg.pause_poll_ms)).await {
            info!("Session {} paused during idle wait", session_id);
            return Ok(TaskExit::Paused);
        }
    }

    Ok(TaskExit::Done)
}

/// Persist one fetched page: artifact first, then the session record with
/// the page appended and `total_organic` bumped in the same write. Progress
/// survives a crash between pages.
async fn persist_page(
    state: &Arc<AppState>,
    session_id: &str,
    task_index: usize,
    handle: &SurfaceHandle,
    record: Page,
    new_count: u32,
    quota: u32,
) -> Result<(), TaskError> {
    let Some(mut session) = state.store.get_session(session_id).await.map_err(TaskError::Store)?
    else {
        return Ok(());
    };

    let capture_html = session.settings.capture_html;
    let capture_screenshots = session.settings.capture_screenshots;
    if capture_html || capture_screenshots {
        match state.surface.capture(handle, capture_html, capture_screenshots).await {
            Ok(artifact) if !artifact.is_empty() => {
                state
                    .store
                    .put_page_artifact(session_id, task_index, record.page_number, &artifact)
                    .await
                    .map_err(TaskError::Store)?;
            }
            Ok(_) => {}
            Err(e) => warn!("Artifact capture failed for page {}: {}", record.page_number, e),
        }
    }

    let page_number = record.page_number;
    let Some(task) = session.tasks.get_mut(task_index) else {
        return Ok(());
    };
    task.pages.push(record);
    task.total_organic += new_count;
    let collected = task.total_organic;
    state.store.put_session(&session).await.map_err(TaskError::Store)?;

    state.notifier.publish(Event::PageCollected {
        session_id: session_id.to_string(),
        task_index,
        page_number,
        collected,
        quota,
    });
    log_session(
        state,
        session_id,
        LogLevel::Info,
        format!("Page {} recorded ({} new organic, {}/{})", page_number, new_count, collected, quota),
    )
    .await;
    Ok(())
}

async fn max_rank_of(
    state: &Arc<AppState>,
    session_id: &str,
    task_index: usize,
) -> Result<Option<u32>, TaskError> {
    let session = state.store.get_session(session_id).await.map_err(TaskError::Store)?;
    Ok(session
        .and_then(|s| s.tasks.get(task_index).map(|t| t.next_rank()))
        .map(|r| r.saturating_sub(1))
        .filter(|r| *r > 0))
}

async fn mark_task_done(
    state: &Arc<AppState>,
    session_id: &str,
    task_index: usize,
) -> Result<(), StoreError> {
    let Some(mut session) = state.store.get_session(session_id).await? else {
        return Ok(());
    };
    let Some(task) = session.tasks.get_mut(task_index) else {
        return Ok(());
    };
    task.status = TaskStatus::Done;
    let term = task.term.clone();
    let collected = task.total_organic;
    let quota = session.quota;
    state.store.put_session(&session).await?;

    state.notifier.publish(Event::TaskStatus {
        session_id: session_id.to_string(),
        task_index,
        status: TaskStatus::Done,
    });
    log_session(
        state,
        session_id,
        LogLevel::Success,
        format!("Task '{}' complete ({}/{} organic)", term, collected, quota),
    )
    .await;
    Ok(())
}

/// Append to the session log and mirror it to observers. Log-store failures
/// are swallowed; the log is best-effort.
pub(crate) async fn log_session(
    state: &Arc<AppState>,
    session_id: &str,
    level: LogLevel,
    message: impl Into<String>,
) {
    let entry = LogEntry::new(session_id, level, message);
    if let Err(e) = state.store.append_log(&entry).await {
        warn!("Failed to append session log: {}", e);
    }
    state.notifier.publish(Event::Log(entry));
}
