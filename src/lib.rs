//! SERP Collector
//!
//! Orchestrates multi-page collection of search-engine result pages across
//! query/country/language combinations, with proxy rotation and CAPTCHA
//! recovery for long unattended runs.

pub mod engine;
pub mod model;
pub mod notify;
pub mod proxy;
pub mod recovery;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod surface;
pub mod timer;
pub mod web;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

use notify::Notifier;
use proxy::ProxyPolicy;
use store::Store;
use surface::{Extractor, PageSurface, SurfaceHandle};
use timer::WakeTimer;

/// Orchestrator tunables, persisted as a JSON config file.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Hard ceiling on pages fetched per task
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    /// Sub-interval for pause-flag polling during idle waits
    #[serde(default = "default_pause_poll_ms")]
    pub pause_poll_ms: u64,
    /// Randomized cooldown between tasks
    #[serde(default = "default_cooldown_min_ms")]
    pub cooldown_min_ms: u64,
    #[serde(default = "default_cooldown_max_ms")]
    pub cooldown_max_ms: u64,
    /// Fixed delay before a transient-error retry hands back to the scheduler
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Transient retries per task before it is marked FAILED
    #[serde(default = "default_max_retries")]
    pub max_transient_retries: u32,
    /// Web server port
    #[serde(default = "default_web_port")]
    pub web_port: u16,
}

fn default_max_pages() -> u32 { 15 }
fn default_pause_poll_ms() -> u64 { 500 }
fn default_cooldown_min_ms() -> u64 { 2000 }
fn default_cooldown_max_ms() -> u64 { 6000 }
fn default_retry_delay_ms() -> u64 { 5000 }
fn default_max_retries() -> u32 { 3 }
fn default_web_port() -> u16 { 8080 }

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            pause_poll_ms: default_pause_poll_ms(),
            cooldown_min_ms: default_cooldown_min_ms(),
            cooldown_max_ms: default_cooldown_max_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            max_transient_retries: default_max_retries(),
            web_port: default_web_port(),
        }
    }
}

/// Get log directory path (shared across modules)
pub fn log_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("serp-collector").join("logs"))
}

/// Get data directory path for the JSON store
pub fn data_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("serp-collector").join("data"))
}

impl AppConfig {
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("serp-collector").join("config.json"))
    }

    /// Load config from file, falling back to defaults.
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if path.exists() {
                match std::fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str(&content) {
                        Ok(config) => {
                            info!("Loaded config from {:?}", path);
                            return config;
                        }
                        Err(e) => warn!("Failed to parse config file: {}", e),
                    },
                    Err(e) => warn!("Failed to read config file: {}", e),
                }
            }
        }
        Self::default()
    }

    /// Save config to file.
    pub fn save(&self) {
        if let Some(path) = Self::config_path() {
            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    error!("Failed to create config directory: {}", e);
                    return;
                }
            }
            match serde_json::to_string_pretty(self) {
                Ok(content) => {
                    if let Err(e) = std::fs::write(&path, content) {
                        error!("Failed to save config: {}", e);
                    }
                }
                Err(e) => error!("Failed to serialize config: {}", e),
            }
        }
    }
}

/// Per-session cooperative flags.
///
/// The pause flag is the in-memory mirror of the persisted PAUSED status,
/// polled by the pagination loop at every blocking point. The run guard
/// ensures at most one driver loop per session.
#[derive(Default)]
pub struct SessionFlags {
    paused: DashMap<String, Arc<AtomicBool>>,
    running: DashMap<String, ()>,
}

impl SessionFlags {
    /// Shared pause flag for a session (created on first use).
    pub fn pause_flag(&self, session_id: &str) -> Arc<AtomicBool> {
        self.paused
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    pub fn set_paused(&self, session_id: &str, paused: bool) {
        self.pause_flag(session_id).store(paused, Ordering::Relaxed);
    }

    pub fn is_paused(&self, session_id: &str) -> bool {
        self.pause_flag(session_id).load(Ordering::Relaxed)
    }

    /// Try to become the session's driver loop. Returns false if one is
    /// already running.
    pub fn try_acquire_run(&self, session_id: &str) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.running.entry(session_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(());
                true
            }
        }
    }

    pub fn release_run(&self, session_id: &str) {
        self.running.remove(session_id);
    }

    /// Drop all flags for a deleted session.
    pub fn clear(&self, session_id: &str) {
        self.paused.remove(session_id);
        self.running.remove(session_id);
    }
}

/// Per-session CAPTCHA recovery counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryCounters {
    /// Consecutive CAPTCHA-driven proxy rotations since the last recovery
    pub proxy_attempts: u32,
    /// Wait escalations, used only to pick the backoff tier
    pub wait_attempts: u32,
}

/// A recovery wait in flight: the one-shot resolution guard, the observer
/// task on the held tab, and the tab itself.
pub struct PendingRecovery {
    pub resolved: Arc<AtomicBool>,
    pub observer: tokio::task::JoinHandle<()>,
    pub handle: SurfaceHandle,
}

/// Recovery registries, owned by the orchestrator rather than living as
/// ambient globals.
#[derive(Default)]
pub struct RecoveryState {
    pub counters: DashMap<String, RecoveryCounters>,
    pub pending: DashMap<String, PendingRecovery>,
}

impl RecoveryState {
    pub fn counters_for(&self, session_id: &str) -> RecoveryCounters {
        self.counters
            .get(session_id)
            .map(|c| *c)
            .unwrap_or_default()
    }

    pub fn reset_counters(&self, session_id: &str) {
        self.counters.insert(session_id.to_string(), RecoveryCounters::default());
    }
}

/// Application state shared across the orchestrator.
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub store: Arc<dyn Store>,
    pub surface: Arc<dyn PageSurface>,
    pub extractor: Arc<dyn Extractor>,
    pub timer: Arc<dyn WakeTimer>,
    pub proxy: Arc<ProxyPolicy>,
    pub notifier: Notifier,
    pub flags: SessionFlags,
    pub recovery: RecoveryState,
    advance_tx: mpsc::UnboundedSender<String>,
}

impl AppState {
    /// Wire up application state around the injected collaborators.
    ///
    /// Returns the state plus the advance-request receiver that must be fed
    /// to [`spawn_dispatcher`].
    pub fn new(
        config: AppConfig,
        store: Arc<dyn Store>,
        surface: Arc<dyn PageSurface>,
        extractor: Arc<dyn Extractor>,
        timer: Arc<dyn WakeTimer>,
        proxy: Arc<ProxyPolicy>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (advance_tx, advance_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Self {
            config: Arc::new(RwLock::new(config)),
            store,
            surface,
            extractor,
            timer,
            proxy,
            notifier: Notifier::new(),
            flags: SessionFlags::default(),
            recovery: RecoveryState::default(),
            advance_tx,
        });
        (state, advance_rx)
    }

    /// Request that a session's driver loop be (re)started.
    pub fn kick(&self, session_id: &str) {
        let _ = self.advance_tx.send(session_id.to_string());
    }
}

/// Run the dispatcher: the single logical thread of control that turns
/// advance requests and timer wakes into session driver loops. All session
/// resumption funnels through here.
pub fn spawn_dispatcher(
    state: Arc<AppState>,
    mut advance_rx: mpsc::UnboundedReceiver<String>,
    mut wake_rx: mpsc::UnboundedReceiver<String>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("Dispatcher started");
        loop {
            tokio::select! {
                Some(session_id) = advance_rx.recv() => {
                    scheduler::spawn_session_driver(state.clone(), session_id);
                }
                Some(key) = wake_rx.recv() => {
                    recovery::on_timer_wake(&state, &key).await;
                }
                else => break,
            }
        }
        info!("Dispatcher stopped");
    })
}

/// Startup reconciliation: resume sessions an unclean restart left RUNNING
/// and re-arm wait timers for sessions parked in PAUSED_CAPTCHA.
pub async fn reconcile_on_boot(state: &Arc<AppState>) {
    let sessions = match state.store.list_sessions().await {
        Ok(s) => s,
        Err(e) => {
            error!("Boot reconciliation failed to list sessions: {}", e);
            return;
        }
    };

    for session in sessions {
        match session.status {
            model::SessionStatus::Running => {
                info!("Reconciling session {} left RUNNING by restart", session.id);
                state.flags.set_paused(&session.id, false);
                state.kick(&session.id);
            }
            model::SessionStatus::PausedCaptcha => {
                let counters = state.recovery.counters_for(&session.id);
                let delay = recovery::wait_delay(counters.wait_attempts);
                info!(
                    "Re-arming CAPTCHA wait timer for session {} ({:?})",
                    session.id, delay
                );
                state.timer.schedule_once(&session.id, delay).await;
            }
            _ => {}
        }
    }
}

/// Initialize logging (console + daily-rolling file layer).
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    if let Some(log_dir) = log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "serp-collector.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        None
    }
}

/// Idle for `total`, polling the pause flag every `poll` sub-interval so a
/// pause takes effect promptly. Returns true if the pause flag was raised.
pub(crate) async fn idle_with_pause_poll(
    flag: &AtomicBool,
    total: Duration,
    poll: Duration,
) -> bool {
    let mut remaining = total;
    loop {
        if flag.load(Ordering::Relaxed) {
            return true;
        }
        if remaining.is_zero() {
            return false;
        }
        let step = remaining.min(poll);
        tokio::time::sleep(step).await;
        remaining -= step;
    }
}
