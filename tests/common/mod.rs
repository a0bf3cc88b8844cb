//! Shared test fixtures: a scripted surface/extractor pair, a recording
//! wake timer, and state wiring over the in-memory store.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use serp_collector::model::{
    DelayRange, Engine, EngineConfig, OrganicResult, SearchResults, Session, SessionSettings,
};
use serp_collector::proxy::ProxyPolicy;
use serp_collector::store::{MemoryStore, PageArtifact, Store};
use serp_collector::surface::{
    Extraction, Extractor, PageSurface, PaginateOutcome, SurfaceError, SurfaceHandle,
};
use serp_collector::timer::WakeTimer;
use serp_collector::{AppConfig, AppState};

/// One scripted result page.
pub struct PageScript {
    pub captcha: bool,
    pub organic_urls: Vec<String>,
    pub next: PaginateOutcome,
}

impl PageScript {
    pub fn results(organic_urls: Vec<String>, next: PaginateOutcome) -> Self {
        Self { captcha: false, organic_urls, next }
    }

    pub fn captcha() -> Self {
        Self { captcha: true, organic_urls: Vec::new(), next: PaginateOutcome::Exhausted }
    }
}

/// Scripted surface + extractor. `open` positions the cursor from the URL's
/// pagination offset; `paginate` walks the script.
pub struct FakeBackend {
    script: Mutex<Vec<PageScript>>,
    cursor: AtomicUsize,
    pub opened: Mutex<Vec<String>>,
    pub close_count: AtomicUsize,
    pub paginate_calls: AtomicUsize,
    /// Every `open` fails with a connection error when set.
    pub fail_open: AtomicBool,
    /// Raised right after a successful `paginate`, simulating an external
    /// pause landing while the loop idles between pages.
    pub pause_after_advance: Mutex<Option<Arc<AtomicBool>>>,
}

impl FakeBackend {
    pub fn new(script: Vec<PageScript>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            cursor: AtomicUsize::new(0),
            opened: Mutex::new(Vec::new()),
            close_count: AtomicUsize::new(0),
            paginate_calls: AtomicUsize::new(0),
            fail_open: AtomicBool::new(false),
            pause_after_advance: Mutex::new(None),
        })
    }

    pub fn set_script(&self, script: Vec<PageScript>) {
        *self.script.lock() = script;
        self.cursor.store(0, Ordering::SeqCst);
    }

    fn page_index_from_url(url: &str) -> usize {
        if let Some(idx) = url.find("start=") {
            let digits: String = url[idx + 6..].chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<usize>().unwrap_or(0) / 10
        } else if let Some(idx) = url.find("first=") {
            let digits: String = url[idx + 6..].chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<usize>().unwrap_or(1).saturating_sub(1) / 10
        } else {
            0
        }
    }

    fn current(&self) -> Option<(bool, Vec<String>, PaginateOutcome)> {
        let script = self.script.lock();
        script
            .get(self.cursor.load(Ordering::SeqCst))
            .map(|p| (p.captcha, p.organic_urls.clone(), p.next))
    }
}

#[async_trait]
impl PageSurface for FakeBackend {
    async fn open(&self, url: &str) -> Result<SurfaceHandle, SurfaceError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(SurfaceError::ConnectionLost("scripted failure".into()));
        }
        self.cursor.store(Self::page_index_from_url(url), Ordering::SeqCst);
        self.opened.lock().push(url.to_string());
        Ok(SurfaceHandle::new())
    }

    async fn wait_loaded(&self, _handle: &SurfaceHandle) -> Result<(), SurfaceError> {
        Ok(())
    }

    async fn current_url(&self, _handle: &SurfaceHandle) -> Result<String, SurfaceError> {
        let cursor = self.cursor.load(Ordering::SeqCst);
        match self.current() {
            Some((true, _, _)) => Ok("https://www.google.com/sorry/index".to_string()),
            _ => Ok(format!("https://www.google.com/search?q=test&start={}", cursor * 10)),
        }
    }

    async fn capture(
        &self,
        _handle: &SurfaceHandle,
        html: bool,
        _screenshot: bool,
    ) -> Result<PageArtifact, SurfaceError> {
        Ok(PageArtifact {
            html: html.then(|| "<html>scripted</html>".to_string()),
            screenshot: None,
        })
    }

    async fn close(&self, _handle: &SurfaceHandle) -> Result<(), SurfaceError> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Extractor for FakeBackend {
    async fn check_captcha(&self, _handle: &SurfaceHandle) -> Result<bool, SurfaceError> {
        Ok(self.current().map(|(captcha, _, _)| captcha).unwrap_or(false))
    }

    async fn humanize(&self, _handle: &SurfaceHandle) -> Result<(), SurfaceError> {
        Ok(())
    }

    async fn extract(
        &self,
        _handle: &SurfaceHandle,
        start_rank: u32,
    ) -> Result<Extraction, SurfaceError> {
        let Some((captcha, urls, _)) = self.current() else {
            return Ok(Extraction::Results(SearchResults::default()));
        };
        if captcha {
            return Ok(Extraction::Captcha);
        }
        let organic = urls
            .into_iter()
            .enumerate()
            .map(|(i, url)| OrganicResult {
                rank: start_rank + i as u32,
                title: format!("result {}", start_rank + i as u32),
                url,
                snippet: None,
            })
            .collect();
        Ok(Extraction::Results(SearchResults { organic, ads: Vec::new(), ai_overview: None }))
    }

    async fn paginate(&self, _handle: &SurfaceHandle) -> Result<PaginateOutcome, SurfaceError> {
        self.paginate_calls.fetch_add(1, Ordering::SeqCst);
        let Some((_, _, next)) = self.current() else {
            return Ok(PaginateOutcome::Exhausted);
        };
        if next == PaginateOutcome::Advanced {
            self.cursor.fetch_add(1, Ordering::SeqCst);
            if let Some(flag) = self.pause_after_advance.lock().as_ref() {
                flag.store(true, Ordering::SeqCst);
            }
        }
        Ok(next)
    }
}

/// Timer that records instead of sleeping.
#[derive(Default)]
pub struct RecordingTimer {
    pub scheduled: Mutex<Vec<(String, Duration)>>,
    pub cancelled: Mutex<Vec<String>>,
}

#[async_trait]
impl WakeTimer for RecordingTimer {
    async fn schedule_once(&self, key: &str, delay: Duration) {
        self.scheduled.lock().push((key.to_string(), delay));
    }

    async fn cancel(&self, key: &str) {
        self.cancelled.lock().push(key.to_string());
    }
}

pub struct TestHarness {
    pub state: Arc<AppState>,
    pub backend: Arc<FakeBackend>,
    pub timer: Arc<RecordingTimer>,
    pub advance_rx: mpsc::UnboundedReceiver<String>,
}

/// Config with all waits zeroed so tests never sleep meaningfully.
pub fn fast_config() -> AppConfig {
    AppConfig {
        cooldown_min_ms: 0,
        cooldown_max_ms: 0,
        retry_delay_ms: 0,
        pause_poll_ms: 5,
        ..AppConfig::default()
    }
}

pub fn harness(script: Vec<PageScript>) -> TestHarness {
    let backend = FakeBackend::new(script);
    let timer = Arc::new(RecordingTimer::default());
    let (state, advance_rx) = AppState::new(
        fast_config(),
        Arc::new(MemoryStore::new()),
        backend.clone(),
        backend.clone(),
        timer.clone(),
        Arc::new(ProxyPolicy::new()),
    );
    TestHarness { state, backend, timer, advance_rx }
}

pub fn google_config() -> EngineConfig {
    EngineConfig {
        engine: Engine::Google,
        country: "us".to_string(),
        language: "en".to_string(),
        domain: "www.google.com".to_string(),
        location: None,
    }
}

/// Persist a RUNNING single-task session and return it.
pub async fn running_session(
    state: &Arc<AppState>,
    quota: u32,
    settings: SessionSettings,
) -> Session {
    let mut session = Session::new(
        vec!["rust async".to_string()],
        vec![google_config()],
        quota,
        DelayRange { min_ms: 0, max_ms: 0 },
        settings,
    );
    session.status = serp_collector::model::SessionStatus::Running;
    state.store.put_session(&session).await.unwrap();
    session
}

pub fn urls(range: std::ops::Range<u32>) -> Vec<String> {
    range.map(|i| format!("https://site-{}.example/", i)).collect()
}
