//! Session, task, and page records.
//!
//! These are the durable records the orchestrator reads and writes through
//! the store. Wire names are camelCase; status enums are stored in
//! SCREAMING_SNAKE_CASE to match the persisted session files.

use chrono::{DateTime, Utc};

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Open,
    Running,
    Paused,
    PausedCaptcha,
    Done,
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Open,
    Done,
    Failed,
    Cancelled,
}

/// Supported search engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Google,
    Bing,
}

/// One engine/locale combination a query is run against.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub engine: Engine,
    /// ISO country code (e.g. "us", "de")
    pub country: String,
    /// ISO language code (e.g. "en", "de")
    pub language: String,
    /// Engine domain to query (e.g. "www.google.com")
    pub domain: String,
    /// Optional location string for Google location spoofing
    #[serde(default)]
    pub location: Option<String>,
}

/// Inter-page idle range in milliseconds.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Default for DelayRange {
    fn default() -> Self {
        Self { min_ms: 3000, max_ms: 10000 }
    }
}

/// Per-session capture and proxy settings.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    #[serde(default)]
    pub capture_screenshots: bool,
    #[serde(default)]
    pub capture_html: bool,
    #[serde(default)]
    pub use_proxies: bool,
    /// Proxy entries in `ip:port:user:pass` form
    #[serde(default)]
    pub proxy_list: Vec<String>,
}

/// One organic listing on a result page.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganicResult {
    /// Rank across all pages of the task, never reset on pagination
    pub rank: u32,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: Option<String>,
}

/// One ad placement on a result page.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdResult {
    pub rank: u32,
    pub title: String,
    pub url: String,
}

/// Engine-generated AI summary block with cited sources.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiOverview {
    pub text: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Structured contents of one fetched result page.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    #[serde(default)]
    pub organic: Vec<OrganicResult>,
    #[serde(default)]
    pub ads: Vec<AdResult>,
    #[serde(default)]
    pub ai_overview: Option<AiOverview>,
}

/// One fetched result page recorded against a task.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    /// 1-based, monotonically increasing per task
    pub page_number: u32,
    pub results: SearchResults,
}

/// One (query, engine-config) pairing pursued until quota or exhaustion.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub term: String,
    pub config: EngineConfig,
    pub status: TaskStatus,
    #[serde(default)]
    pub pages: Vec<Page>,
    /// Running organic count across all pages, never above the session quota
    #[serde(default)]
    pub total_organic: u32,
    /// Transient-error retries, independent from CAPTCHA handling
    #[serde(default)]
    pub retry_count: u32,
}

impl Task {
    /// Create a fresh OPEN task for a term/config pairing.
    pub fn new(term: &str, config: EngineConfig) -> Self {
        Self {
            term: term.to_string(),
            config,
            status: TaskStatus::Open,
            pages: Vec::new(),
            total_organic: 0,
            retry_count: 0,
        }
    }

    /// All organic URLs recorded so far, for per-task deduplication.
    pub fn recorded_urls(&self) -> std::collections::HashSet<String> {
        self.pages
            .iter()
            .flat_map(|p| p.results.organic.iter().map(|o| o.url.clone()))
            .collect()
    }

    /// The next rank to hand to the extractor (ranks never reset on pagination).
    pub fn next_rank(&self) -> u32 {
        self.pages
            .iter()
            .flat_map(|p| {
                p.results
                    .organic
                    .iter()
                    .map(|o| o.rank)
                    .chain(p.results.ads.iter().map(|a| a.rank))
            })
            .max()
            .map(|r| r + 1)
            .unwrap_or(1)
    }
}

/// One study: query × engine-config tasks with shared quota and settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub tasks: Vec<Task>,
    /// Index of the task currently being processed (persisted for UI consistency)
    #[serde(default)]
    pub current_index: usize,
    /// Target organic-result count per task
    pub quota: u32,
    #[serde(default)]
    pub delay: DelayRange,
    #[serde(default)]
    pub settings: SessionSettings,
    /// Original query list, kept to generate new tasks when configs are added
    pub queries: Vec<String>,
    /// Original engine-config list, kept to generate new tasks when queries are added
    pub configs: Vec<EngineConfig>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Create a new OPEN session with the full query × config cross product.
    pub fn new(
        queries: Vec<String>,
        configs: Vec<EngineConfig>,
        quota: u32,
        delay: DelayRange,
        settings: SessionSettings,
    ) -> Self {
        let tasks = cross_product(&queries, &configs);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: SessionStatus::Open,
            tasks,
            current_index: 0,
            quota,
            delay,
            settings,
            queries,
            configs,
            created_at: Utc::now(),
        }
    }

    /// Index of the first OPEN task, in declaration order.
    pub fn next_open_task(&self) -> Option<usize> {
        self.tasks.iter().position(|t| t.status == TaskStatus::Open)
    }

    /// Whether every task has reached a terminal status.
    pub fn all_tasks_settled(&self) -> bool {
        self.tasks.iter().all(|t| t.status != TaskStatus::Open)
    }

    /// Append queries and/or configs, generating only the new cross-product
    /// tasks (existing pairings are not duplicated).
    pub fn add_items(&mut self, new_queries: Vec<String>, new_configs: Vec<EngineConfig>) {
        // New queries run against the existing configs, new configs against the
        // existing queries, and the new × new corner exactly once.
        self.tasks.extend(cross_product(&new_queries, &self.configs));
        self.tasks.extend(cross_product(&self.queries, &new_configs));
        self.tasks.extend(cross_product(&new_queries, &new_configs));
        self.queries.extend(new_queries);
        self.configs.extend(new_configs);
    }
}

fn cross_product(queries: &[String], configs: &[EngineConfig]) -> Vec<Task> {
    let mut tasks = Vec::with_capacity(queries.len() * configs.len());
    for query in queries {
        for config in configs {
            tasks.push(Task::new(query, config.clone()));
        }
    }
    tasks
}

/// Log severity for session logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Info,
    Warn,
    Success,
    Error,
}

/// Append-only session log line.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    /// Create a log entry stamped with the current time.
    pub fn new(session_id: &str, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(engine: Engine, country: &str) -> EngineConfig {
        EngineConfig {
            engine,
            country: country.to_string(),
            language: "en".to_string(),
            domain: "www.google.com".to_string(),
            location: None,
        }
    }

    #[test]
    fn test_session_tasks_are_cross_product() {
        let session = Session::new(
            vec!["rust".into(), "tokio".into()],
            vec![config(Engine::Google, "us"), config(Engine::Bing, "de")],
            10,
            DelayRange::default(),
            SessionSettings::default(),
        );
        assert_eq!(session.tasks.len(), 4);
        assert_eq!(session.status, SessionStatus::Open);
        assert!(session.tasks.iter().all(|t| t.status == TaskStatus::Open));
    }

    #[test]
    fn test_add_items_generates_only_new_pairings() {
        let mut session = Session::new(
            vec!["rust".into()],
            vec![config(Engine::Google, "us")],
            10,
            DelayRange::default(),
            SessionSettings::default(),
        );
        session.add_items(vec!["tokio".into()], vec![config(Engine::Bing, "de")]);

        // 1 original + tokio×google + rust×bing + tokio×bing
        assert_eq!(session.tasks.len(), 4);
        assert_eq!(session.queries.len(), 2);
        assert_eq!(session.configs.len(), 2);
    }

    #[test]
    fn test_next_open_task_is_first_by_index() {
        let mut session = Session::new(
            vec!["a".into(), "b".into()],
            vec![config(Engine::Google, "us")],
            10,
            DelayRange::default(),
            SessionSettings::default(),
        );
        session.tasks[0].status = TaskStatus::Done;
        assert_eq!(session.next_open_task(), Some(1));
        session.tasks[1].status = TaskStatus::Failed;
        assert_eq!(session.next_open_task(), None);
        assert!(session.all_tasks_settled());
    }

    #[test]
    fn test_next_rank_spans_organic_and_ads() {
        let mut task = Task::new("rust", config(Engine::Google, "us"));
        assert_eq!(task.next_rank(), 1);
        task.pages.push(Page {
            page_number: 1,
            results: SearchResults {
                organic: vec![OrganicResult {
                    rank: 1,
                    title: "a".into(),
                    url: "https://a.example".into(),
                    snippet: None,
                }],
                ads: vec![AdResult { rank: 2, title: "ad".into(), url: "https://ad.example".into() }],
                ai_overview: None,
            },
        });
        assert_eq!(task.next_rank(), 3);
        assert!(task.recorded_urls().contains("https://a.example"));
    }
}
