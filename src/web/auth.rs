//! Basic authentication for the web API.
//!
//! Credentials come from the environment: `SERP_WEB_USER` (default "admin")
//! and `SERP_WEB_PASS`. Without `SERP_WEB_PASS` the API is open, which is
//! the expected mode behind a reverse proxy that terminates auth itself.

use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};
use base64::Engine;
use tracing::warn;

/// Split an `Authorization: Basic <base64>` header into its user/password
/// pair. Returns `None` for any other scheme or malformed payload.
fn parse_basic_credentials(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let (username, password) = credentials.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Reject requests whose credentials do not match the configured pair.
/// A no-op when `SERP_WEB_PASS` is unset or empty.
pub async fn basic_auth_middleware(request: Request, next: Next) -> Result<Response, StatusCode> {
    let expected_pass = match std::env::var("SERP_WEB_PASS") {
        Ok(p) if !p.is_empty() => p,
        _ => return Ok(next.run(request).await),
    };
    let expected_user = std::env::var("SERP_WEB_USER").unwrap_or_else(|_| "admin".to_string());

    let supplied = request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_basic_credentials);

    match supplied {
        Some((user, pass)) if user == expected_user && pass == expected_pass => {
            Ok(next.run(request).await)
        }
        Some((user, _)) => {
            warn!("[Auth] Invalid credentials for user: {}", user);
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("[Auth] Missing or malformed Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(raw: &str) -> String {
        format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(raw))
    }

    #[test]
    fn test_parse_valid_basic_header() {
        let parsed = parse_basic_credentials(&encode("admin:s3cret"));
        assert_eq!(parsed, Some(("admin".to_string(), "s3cret".to_string())));
    }

    #[test]
    fn test_password_may_contain_colons() {
        let parsed = parse_basic_credentials(&encode("admin:a:b:c"));
        assert_eq!(parsed, Some(("admin".to_string(), "a:b:c".to_string())));
    }

    #[test]
    fn test_rejects_other_schemes_and_garbage() {
        assert!(parse_basic_credentials("Bearer abc123").is_none());
        assert!(parse_basic_credentials("Basic not-base64!!!").is_none());
        assert!(parse_basic_credentials(&encode("no-separator")).is_none());
    }
}
