//! Page surface and extractor boundary.
//!
//! The orchestration core drives result pages through these two seams so it
//! stays engine-agnostic and testable with scripted fakes. [`HttpSurface`]
//! and [`HtmlExtractor`] are the bundled non-browser back-ends; a browser
//! back-end plugs in behind the same traits.

mod http;

pub use http::{HtmlExtractor, HttpSurface};

use async_trait::async_trait;
use thiserror::Error;

use crate::model::SearchResults;

/// Surface-level errors. All of these are transient from the scheduler's
/// point of view and route to the retry policy.
#[derive(Error, Debug)]
pub enum SurfaceError {
    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("Surface handle not found: {0}")]
    HandleNotFound(String),
}

/// Opaque handle to one open navigable context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(pub String);

impl SurfaceHandle {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SurfaceHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of running extraction on a loaded page.
#[derive(Debug, Clone)]
pub enum Extraction {
    Results(SearchResults),
    /// The page is a bot-detection challenge, not a result page.
    Captcha,
}

/// Outcome of requesting pagination advancement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginateOutcome {
    Advanced,
    Captcha,
    /// The engine offers no further page; a success exit, not a failure.
    Exhausted,
}

/// An automation handle that can open a navigable context at a URL, wait
/// for it to load, report its current URL, and be closed.
#[async_trait]
pub trait PageSurface: Send + Sync {
    async fn open(&self, url: &str) -> Result<SurfaceHandle, SurfaceError>;
    async fn wait_loaded(&self, handle: &SurfaceHandle) -> Result<(), SurfaceError>;
    async fn current_url(&self, handle: &SurfaceHandle) -> Result<String, SurfaceError>;
    /// Capture the requested page artifacts (HTML snapshot, screenshot).
    /// Back-ends without screenshot support return what they have.
    async fn capture(
        &self,
        handle: &SurfaceHandle,
        html: bool,
        screenshot: bool,
    ) -> Result<crate::store::PageArtifact, SurfaceError>;
    async fn close(&self, handle: &SurfaceHandle) -> Result<(), SurfaceError>;
}

/// Runs inside a loaded page: CAPTCHA checks, humanizing actions,
/// extraction, and pagination advancement.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn check_captcha(&self, handle: &SurfaceHandle) -> Result<bool, SurfaceError>;
    /// Detection-avoidance actions (scroll, hover). Non-browser back-ends
    /// may make this a no-op.
    async fn humanize(&self, handle: &SurfaceHandle) -> Result<(), SurfaceError>;
    async fn extract(
        &self,
        handle: &SurfaceHandle,
        start_rank: u32,
    ) -> Result<Extraction, SurfaceError>;
    async fn paginate(&self, handle: &SurfaceHandle) -> Result<PaginateOutcome, SurfaceError>;
}

/// URL patterns of known CAPTCHA / "sorry" interstitials. Used both by the
/// bundled extractor and by the recovery observer watching a held tab.
pub fn looks_like_captcha_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.contains("/sorry/")
        || lower.contains("ipv4.google.com/sorry")
        || lower.contains("captcha")
        || lower.contains("challenge")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_captcha_url_patterns() {
        assert!(looks_like_captcha_url("https://www.google.com/sorry/index?continue=x"));
        assert!(looks_like_captcha_url("https://www.bing.com/turing/captcha/challenge"));
        assert!(!looks_like_captcha_url("https://www.google.com/search?q=rust"));
    }
}
