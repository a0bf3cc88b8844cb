//! Search URL construction per engine.
//!
//! Google and Bing use different query-parameter names for locale; Google
//! additionally accepts an opaque `uule` parameter for location spoofing.

use base64::Engine as _;
use tracing::warn;

use crate::model::{Engine, EngineConfig};

/// Results requested per page.
pub const RESULTS_PER_PAGE: u32 = 10;

/// Build the search URL for `(term, config, page)`. `page` is 1-based.
pub fn search_url(term: &str, config: &EngineConfig, page: u32) -> String {
    let offset = page.saturating_sub(1) * RESULTS_PER_PAGE;
    let q = urlencoding::encode(term);

    match config.engine {
        Engine::Google => {
            let mut url = format!(
                "https://{}/search?q={}&gl={}&hl={}&num={}&start={}",
                config.domain, q, config.country, config.language, RESULTS_PER_PAGE, offset,
            );
            if let Some(uule) = config.location.as_deref().and_then(uule_param) {
                url.push_str("&uule=");
                url.push_str(&uule);
            }
            url
        }
        Engine::Bing => format!(
            "https://{}/search?q={}&cc={}&setlang={}&first={}",
            config.domain,
            q,
            config.country,
            config.language,
            offset + 1,
        ),
    }
}

/// Encode a canonical location name as Google's `uule` parameter.
///
/// Format: `w+CAIQICI` + base64("<len byte><location>"), where the length
/// byte precedes the UTF-8 location string. The single length byte caps the
/// location at 255 bytes; longer strings cannot be encoded and are skipped.
fn uule_param(location: &str) -> Option<String> {
    if location.len() > u8::MAX as usize {
        warn!("Location too long for uule encoding ({} bytes), skipping", location.len());
        return None;
    }
    let mut payload = Vec::with_capacity(location.len() + 1);
    payload.push(location.len() as u8);
    payload.extend_from_slice(location.as_bytes());
    Some(format!(
        "w+CAIQICI{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(&payload)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn google(location: Option<&str>) -> EngineConfig {
        EngineConfig {
            engine: Engine::Google,
            country: "us".into(),
            language: "en".into(),
            domain: "www.google.com".into(),
            location: location.map(|s| s.to_string()),
        }
    }

    #[test]
    fn test_google_url_carries_locale_and_offset() {
        let url = search_url("rust async", &google(None), 2);
        assert!(url.starts_with("https://www.google.com/search?q=rust%20async"));
        assert!(url.contains("gl=us"));
        assert!(url.contains("hl=en"));
        assert!(url.contains("start=10"));
        assert!(!url.contains("uule="));
    }

    #[test]
    fn test_google_location_adds_uule() {
        let url = search_url("pizza", &google(Some("Berlin,Germany")), 1);
        assert!(url.contains("&uule=w+CAIQICI"));
        assert!(url.contains("start=0"));
    }

    #[test]
    fn test_overlong_location_is_skipped_not_truncated() {
        let location = "x".repeat(300);
        let url = search_url("pizza", &google(Some(&location)), 1);
        assert!(!url.contains("uule="));
    }

    #[test]
    fn test_bing_uses_distinct_parameter_names() {
        let config = EngineConfig {
            engine: Engine::Bing,
            country: "de".into(),
            language: "de".into(),
            domain: "www.bing.com".into(),
            location: None,
        };
        let url = search_url("rust", &config, 3);
        assert!(url.starts_with("https://www.bing.com/search?q=rust"));
        assert!(url.contains("cc=de"));
        assert!(url.contains("setlang=de"));
        // Bing offsets are 1-based on the `first` parameter.
        assert!(url.contains("first=21"));
    }
}
