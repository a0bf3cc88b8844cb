//! HTTP back-end for the page surface and extractor seams.
//!
//! Fetches result pages with `reqwest` through the process-wide proxy slot
//! and runs a thin markup pass over the returned HTML. This is the
//! non-browser back-end: `humanize` is a no-op and pagination follows the
//! engine's next-page link instead of scripted clicks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use scraper::{Html, Selector};
use tracing::{debug, warn};

use crate::model::{AdResult, Engine, OrganicResult, SearchResults};
use crate::proxy::ProxyPolicy;

use super::{
    looks_like_captcha_url, Extraction, Extractor, PageSurface, PaginateOutcome, SurfaceError,
    SurfaceHandle,
};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

struct OpenPage {
    url: String,
    html: String,
}

/// reqwest-backed page surface. One entry per open handle; the active proxy
/// slot is consulted on every fetch so a rotation takes effect on the next
/// navigation.
pub struct HttpSurface {
    proxy: Arc<ProxyPolicy>,
    pages: DashMap<String, OpenPage>,
}

impl HttpSurface {
    pub fn new(proxy: Arc<ProxyPolicy>) -> Self {
        Self { proxy, pages: DashMap::new() }
    }

    fn client(&self) -> Result<reqwest::Client, SurfaceError> {
        let mut builder = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(USER_AGENT)
            .cookie_store(true);

        if let Some(endpoint) = self.proxy.active() {
            let proxy = reqwest::Proxy::all(endpoint.url())
                .map_err(|e| SurfaceError::NavigationFailed(format!("invalid proxy: {}", e)))?
                .basic_auth(&endpoint.username, &endpoint.password);
            builder = builder.proxy(proxy);
        }

        builder
            .build()
            .map_err(|e| SurfaceError::NavigationFailed(format!("client build failed: {}", e)))
    }

    async fn fetch(&self, url: &str) -> Result<OpenPage, SurfaceError> {
        let client = self.client()?;
        let response = client.get(url).send().await.map_err(map_reqwest_error)?;
        let final_url = response.url().to_string();
        let html = response.text().await.map_err(map_reqwest_error)?;
        debug!("Fetched {} ({} bytes, final URL {})", url, html.len(), final_url);
        Ok(OpenPage { url: final_url, html })
    }

    /// Navigate an existing handle to a new URL, replacing its content.
    pub(crate) async fn navigate(
        &self,
        handle: &SurfaceHandle,
        url: &str,
    ) -> Result<(), SurfaceError> {
        let page = self.fetch(url).await?;
        match self.pages.get_mut(&handle.0) {
            Some(mut entry) => {
                *entry = page;
                Ok(())
            }
            None => Err(SurfaceError::HandleNotFound(handle.0.clone())),
        }
    }

    fn with_page<T>(
        &self,
        handle: &SurfaceHandle,
        f: impl FnOnce(&OpenPage) -> T,
    ) -> Result<T, SurfaceError> {
        self.pages
            .get(&handle.0)
            .map(|p| f(&p))
            .ok_or_else(|| SurfaceError::HandleNotFound(handle.0.clone()))
    }
}

fn map_reqwest_error(e: reqwest::Error) -> SurfaceError {
    if e.is_timeout() {
        SurfaceError::Timeout(e.to_string())
    } else if e.is_connect() {
        SurfaceError::ConnectionLost(e.to_string())
    } else {
        SurfaceError::NavigationFailed(e.to_string())
    }
}

#[async_trait]
impl PageSurface for HttpSurface {
    async fn open(&self, url: &str) -> Result<SurfaceHandle, SurfaceError> {
        let page = self.fetch(url).await?;
        let handle = SurfaceHandle::new();
        self.pages.insert(handle.0.clone(), page);
        Ok(handle)
    }

    async fn wait_loaded(&self, handle: &SurfaceHandle) -> Result<(), SurfaceError> {
        // Fetching is synchronous with `open`/`navigate`; the handle either
        // holds a loaded page or is gone.
        self.with_page(handle, |_| ())
    }

    async fn current_url(&self, handle: &SurfaceHandle) -> Result<String, SurfaceError> {
        self.with_page(handle, |p| p.url.clone())
    }

    async fn capture(
        &self,
        handle: &SurfaceHandle,
        html: bool,
        _screenshot: bool,
    ) -> Result<crate::store::PageArtifact, SurfaceError> {
        // Screenshots need a rendering back-end; this surface only has markup.
        self.with_page(handle, |p| crate::store::PageArtifact {
            html: if html { Some(p.html.clone()) } else { None },
            screenshot: None,
        })
    }

    async fn close(&self, handle: &SurfaceHandle) -> Result<(), SurfaceError> {
        self.pages.remove(&handle.0);
        Ok(())
    }
}

/// Thin HTML extractor for Google and Bing result pages.
///
/// Covers the stable markup skeleton (organic anchors, ad blocks, next-page
/// link); full per-engine DOM fidelity belongs to a browser back-end.
pub struct HtmlExtractor {
    surface: Arc<HttpSurface>,
}

impl HtmlExtractor {
    pub fn new(surface: Arc<HttpSurface>) -> Self {
        Self { surface }
    }

    fn engine_for(url: &str) -> Engine {
        if url.contains("bing.") {
            Engine::Bing
        } else {
            Engine::Google
        }
    }
}

fn page_is_captcha(url: &str, html: &str) -> bool {
    if looks_like_captcha_url(url) {
        return true;
    }
    let lower = html.to_ascii_lowercase();
    lower.contains("g-recaptcha") || lower.contains("unusual traffic from your computer")
}

fn parse_results(engine: Engine, html: &str, start_rank: u32) -> SearchResults {
    let document = Html::parse_document(html);
    let mut results = SearchResults::default();
    let mut rank = start_rank;

    let (organic_sel, ad_sel) = match engine {
        Engine::Google => ("div#search a[href] h3", "div[data-text-ad] a[href]"),
        Engine::Bing => ("li.b_algo h2 a[href]", "li.b_ad a[href]"),
    };

    if let Ok(selector) = Selector::parse(organic_sel) {
        for element in document.select(&selector) {
            // Google nests the title h3 inside the result anchor; walk up for
            // the href when the matched element is not the anchor itself.
            let anchor = if element.value().name() == "a" {
                Some(element)
            } else {
                element
                    .ancestors()
                    .filter_map(scraper::ElementRef::wrap)
                    .find(|el| el.value().name() == "a")
            };
            let Some(anchor) = anchor else { continue };
            let Some(href) = anchor.value().attr("href") else { continue };
            if !href.starts_with("http") {
                continue;
            }
            let title = element.text().collect::<String>().trim().to_string();
            if title.is_empty() {
                continue;
            }
            results.organic.push(OrganicResult {
                rank,
                title,
                url: href.to_string(),
                snippet: None,
            });
            rank += 1;
        }
    } else {
        warn!("Invalid organic selector for {:?}", engine);
    }

    if let Ok(selector) = Selector::parse(ad_sel) {
        for element in document.select(&selector) {
            let Some(href) = element.value().attr("href") else { continue };
            if !href.starts_with("http") {
                continue;
            }
            let title = element.text().collect::<String>().trim().to_string();
            results.ads.push(AdResult { rank, title, url: href.to_string() });
            rank += 1;
        }
    }

    results
}

fn next_page_href(engine: Engine, base_url: &str, html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = match engine {
        Engine::Google => Selector::parse("a#pnnext").ok()?,
        Engine::Bing => Selector::parse("a.sb_pagN").ok()?,
    };
    let href = document.select(&selector).next()?.value().attr("href")?;
    let base = url::Url::parse(base_url).ok()?;
    base.join(href).ok().map(|u| u.to_string())
}

#[async_trait]
impl Extractor for HtmlExtractor {
    async fn check_captcha(&self, handle: &SurfaceHandle) -> Result<bool, SurfaceError> {
        self.surface
            .with_page(handle, |p| page_is_captcha(&p.url, &p.html))
    }

    async fn humanize(&self, _handle: &SurfaceHandle) -> Result<(), SurfaceError> {
        // No DOM to scroll or hover over a plain HTTP fetch.
        Ok(())
    }

    async fn extract(
        &self,
        handle: &SurfaceHandle,
        start_rank: u32,
    ) -> Result<Extraction, SurfaceError> {
        self.surface.with_page(handle, |p| {
            if page_is_captcha(&p.url, &p.html) {
                Extraction::Captcha
            } else {
                Extraction::Results(parse_results(Self::engine_for(&p.url), &p.html, start_rank))
            }
        })
    }

    async fn paginate(&self, handle: &SurfaceHandle) -> Result<PaginateOutcome, SurfaceError> {
        let next = self.surface.with_page(handle, |p| {
            next_page_href(Self::engine_for(&p.url), &p.url, &p.html)
        })?;

        let Some(next_url) = next else {
            return Ok(PaginateOutcome::Exhausted);
        };

        self.surface.navigate(handle, &next_url).await?;

        let captcha = self
            .surface
            .with_page(handle, |p| page_is_captcha(&p.url, &p.html))?;
        if captcha {
            Ok(PaginateOutcome::Captcha)
        } else {
            Ok(PaginateOutcome::Advanced)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bing_organic_ranks_from_start() {
        let html = r#"
            <html><body>
              <li class="b_algo"><h2><a href="https://a.example/1">First</a></h2></li>
              <li class="b_algo"><h2><a href="https://a.example/2">Second</a></h2></li>
            </body></html>"#;
        let results = parse_results(Engine::Bing, html, 11);
        assert_eq!(results.organic.len(), 2);
        assert_eq!(results.organic[0].rank, 11);
        assert_eq!(results.organic[1].rank, 12);
        assert_eq!(results.organic[1].url, "https://a.example/2");
    }

    #[test]
    fn test_captcha_page_detected_by_body_marker() {
        assert!(page_is_captcha(
            "https://www.google.com/search?q=x",
            "<html>Our systems have detected unusual traffic from your computer</html>"
        ));
        assert!(!page_is_captcha("https://www.google.com/search?q=x", "<html>ok</html>"));
    }

    #[test]
    fn test_next_page_href_resolved_against_base() {
        let html = r#"<html><a id="pnnext" href="/search?q=rust&start=10">Next</a></html>"#;
        let next = next_page_href(Engine::Google, "https://www.google.com/search?q=rust", html);
        assert_eq!(next.as_deref(), Some("https://www.google.com/search?q=rust&start=10"));
    }
}
