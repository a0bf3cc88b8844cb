//! SERP Collector - Standalone Web Server
//!
//! Runs the orchestrator with a web dashboard accessible via browser.
//! Build: `cargo build --release --bin server`
//!
//! Environment variables:
//! - `SERP_WEB_PORT` - Server port (overrides the config file)
//! - `SERP_WEB_USER` - Basic auth username (default: "admin")
//! - `SERP_WEB_PASS` - Basic auth password (auth disabled if not set)

use std::sync::Arc;

use tracing::info;

use serp_collector::proxy::ProxyPolicy;
use serp_collector::store::JsonStore;
use serp_collector::surface::{HtmlExtractor, HttpSurface};
use serp_collector::timer::TokioWakeTimer;
use serp_collector::{AppConfig, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = serp_collector::init_logging();

    info!("Starting SERP Collector (server mode)");

    if let Some(dir) = serp_collector::log_dir() {
        info!("Log files saved to: {}", dir.display());
    }

    let config = AppConfig::load();

    let port: u16 = std::env::var("SERP_WEB_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(config.web_port);

    if std::env::var("SERP_WEB_PASS").map(|p| !p.is_empty()).unwrap_or(false) {
        let user = std::env::var("SERP_WEB_USER").unwrap_or_else(|_| "admin".to_string());
        info!("Basic auth enabled (user: {})", user);
    } else {
        info!("Basic auth disabled (set SERP_WEB_PASS to enable)");
    }

    let data_dir = serp_collector::data_dir()
        .ok_or("Could not determine data directory")?;
    let store = Arc::new(JsonStore::new(&data_dir)?);
    info!("Session store at {}", data_dir.display());

    let proxy = Arc::new(ProxyPolicy::new());
    let surface = Arc::new(HttpSurface::new(proxy.clone()));
    let extractor = Arc::new(HtmlExtractor::new(surface.clone()));
    let (timer, wake_rx) = TokioWakeTimer::new();

    let (state, advance_rx) = AppState::new(
        config,
        store,
        surface,
        extractor,
        Arc::new(timer),
        proxy,
    );

    serp_collector::spawn_dispatcher(state.clone(), advance_rx, wake_rx);
    serp_collector::reconcile_on_boot(&state).await;

    info!("Application state initialized");
    info!("Dashboard: http://0.0.0.0:{}", port);

    // Start the web server (blocks until shutdown)
    serp_collector::web::start_server(state, port).await?;

    Ok(())
}
