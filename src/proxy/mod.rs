//! Proxy rotation policy.
//!
//! Holds the single process-wide outbound route. The scheduler runs one
//! task at a time, so one active proxy slot is sufficient; the slot also
//! stores the credential pair handed to the network layer whenever an
//! authentication challenge arrives.

use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use tracing::{info, warn};

/// One parsed `ip:port:user:pass` proxy entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl ProxyEndpoint {
    /// Parse an `ip:port:user:pass` entry. Malformed entries (wrong field
    /// count, non-numeric port) are a configuration error, not a crash.
    pub fn parse(entry: &str) -> Option<Self> {
        let fields: Vec<&str> = entry.trim().split(':').collect();
        if fields.len() != 4 {
            warn!("Skipping malformed proxy entry (expected ip:port:user:pass): {}", entry);
            return None;
        }
        let port: u16 = match fields[1].parse() {
            Ok(p) => p,
            Err(_) => {
                warn!("Skipping proxy entry with invalid port: {}", entry);
                return None;
            }
        };
        Some(Self {
            host: fields[0].to_string(),
            port,
            username: fields[2].to_string(),
            password: fields[3].to_string(),
        })
    }

    /// Proxy URL without credentials (credentials are injected via the
    /// authentication responder, not the URL).
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Process-wide proxy slot with credential storage.
#[derive(Default)]
pub struct ProxyPolicy {
    active: RwLock<Option<ProxyEndpoint>>,
}

impl ProxyPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick a uniformly random entry from the list and install it as the
    /// outbound route. Malformed entries are skipped; returns the endpoint
    /// that was activated, or `None` if nothing in the list parses.
    pub fn activate_random(&self, proxy_list: &[String]) -> Option<ProxyEndpoint> {
        let candidates: Vec<ProxyEndpoint> = proxy_list
            .iter()
            .filter_map(|entry| ProxyEndpoint::parse(entry))
            .collect();

        if candidates.is_empty() {
            warn!("No usable proxy entries in list of {}", proxy_list.len());
            return None;
        }

        let pick = rand::thread_rng().gen_range(0..candidates.len());
        let endpoint = candidates[pick].clone();
        info!("Activating proxy {}:{}", endpoint.host, endpoint.port);
        *self.active.write() = Some(endpoint.clone());
        Some(endpoint)
    }

    /// Clear the routing rule and the stored credential (direct connection).
    pub fn deactivate(&self) {
        let had = self.active.write().take().is_some();
        if had {
            info!("Proxy deactivated, reverting to direct connection");
        }
    }

    /// Currently active endpoint, if any.
    pub fn active(&self) -> Option<ProxyEndpoint> {
        self.active.read().clone()
    }

    /// Credential pair for the authentication-challenge responder.
    pub fn credentials_for(&self, host: &str, port: u16) -> Option<(String, String)> {
        self.active
            .read()
            .as_ref()
            .filter(|e| e.host == host && e.port == port)
            .map(|e| (e.username.clone(), e.password.clone()))
    }

    pub fn is_active(&self) -> bool {
        self.active.read().is_some()
    }
}

/// Fetch the public IP over a direct connection.
pub async fn fetch_ip_direct() -> Result<String, String> {
    let client = reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| format!("Failed to create client: {}", e))?;

    fetch_ip(&client).await
}

/// Fetch the public IP through the given proxy endpoint.
pub async fn fetch_ip_via(endpoint: &ProxyEndpoint) -> Result<String, String> {
    let proxy = reqwest::Proxy::all(endpoint.url())
        .map_err(|e| format!("Invalid proxy URL: {}", e))?
        .basic_auth(&endpoint.username, &endpoint.password);

    let client = reqwest::Client::builder()
        .proxy(proxy)
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| format!("Failed to create proxy client: {}", e))?;

    fetch_ip(&client).await
}

async fn fetch_ip(client: &reqwest::Client) -> Result<String, String> {
    let response = client
        .get("https://api.ipify.org/?format=json")
        .send()
        .await
        .map_err(|e| format!("Request failed: {}", e))?;

    let data: serde_json::Value = response
        .json()
        .await
        .map_err(|e| format!("Failed to parse response: {}", e))?;

    data.get("ip")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| "No IP in response".to_string())
}

/// Result of a proxy connectivity check.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyTestResult {
    pub working: bool,
    pub original_ip: String,
    pub proxy_ip: Option<String>,
    pub error: Option<String>,
}

/// Verify that an entry routes traffic: the proxied IP must differ from the
/// direct IP.
pub async fn test_proxy_entry(entry: &str) -> ProxyTestResult {
    let endpoint = match ProxyEndpoint::parse(entry) {
        Some(e) => e,
        None => {
            return ProxyTestResult {
                working: false,
                original_ip: String::new(),
                proxy_ip: None,
                error: Some("Malformed proxy entry".into()),
            }
        }
    };

    let original_ip = match fetch_ip_direct().await {
        Ok(ip) => ip,
        Err(e) => {
            return ProxyTestResult {
                working: false,
                original_ip: "Unknown".into(),
                proxy_ip: None,
                error: Some(format!("Failed to get original IP: {}", e)),
            }
        }
    };

    match fetch_ip_via(&endpoint).await {
        Ok(proxy_ip) => {
            let working = proxy_ip != original_ip;
            if working {
                info!("Proxy test SUCCESS: direct={}, proxied={}", original_ip, proxy_ip);
            } else {
                warn!("Proxy test FAILED: IPs are the same ({})", original_ip);
            }
            ProxyTestResult {
                working,
                original_ip,
                proxy_ip: Some(proxy_ip),
                error: if working { None } else { Some("Proxy not routing".into()) },
            }
        }
        Err(e) => ProxyTestResult {
            working: false,
            original_ip,
            proxy_ip: None,
            error: Some(format!("Proxy connection failed: {}", e)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_entry() {
        let endpoint = ProxyEndpoint::parse("10.0.0.1:8080:user:secret").unwrap();
        assert_eq!(endpoint.host, "10.0.0.1");
        assert_eq!(endpoint.port, 8080);
        assert_eq!(endpoint.username, "user");
        assert_eq!(endpoint.password, "secret");
        assert_eq!(endpoint.url(), "http://10.0.0.1:8080");
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        assert!(ProxyEndpoint::parse("10.0.0.1:8080").is_none());
        assert!(ProxyEndpoint::parse("10.0.0.1:notaport:u:p").is_none());
        assert!(ProxyEndpoint::parse("").is_none());
    }

    #[test]
    fn test_activate_skips_malformed_and_installs_slot() {
        let policy = ProxyPolicy::new();
        assert!(!policy.is_active());

        let activated = policy.activate_random(&[
            "bogus".to_string(),
            "10.0.0.1:8080:u:p".to_string(),
        ]);
        assert_eq!(activated.unwrap().host, "10.0.0.1");
        assert!(policy.is_active());
        assert_eq!(
            policy.credentials_for("10.0.0.1", 8080),
            Some(("u".to_string(), "p".to_string()))
        );

        policy.deactivate();
        assert!(!policy.is_active());
        assert!(policy.credentials_for("10.0.0.1", 8080).is_none());
    }

    #[test]
    fn test_activate_with_only_malformed_entries_is_noop() {
        let policy = ProxyPolicy::new();
        assert!(policy.activate_random(&["x:y".to_string()]).is_none());
        assert!(!policy.is_active());
    }
}
