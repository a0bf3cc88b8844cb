//! HTTP route handlers for the web server.
//!
//! All business logic is delegated to `crate::session` and `crate::proxy`;
//! handlers only translate between HTTP and the logic functions.

use std::sync::Arc;

use axum::{
    extract::{Extension, Json, Path},
    http::StatusCode,
    middleware,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use tracing::{debug, info};

use crate::model::{DelayRange, EngineConfig};
use crate::proxy;
use crate::session;
use crate::AppConfig;
use crate::AppState;

/// JSON error response helper
fn err_response(status: StatusCode, msg: &str) -> impl IntoResponse {
    (status, Json(serde_json::json!({ "error": msg })))
}

/// Build the API router with all endpoints.
pub fn api_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Config
        .route("/config", get(get_config).post(configure))
        // Session lifecycle
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/sessions/:id/start", post(start_session))
        .route("/sessions/:id/pause", post(pause_session))
        .route("/sessions/:id/resume", post(resume_session))
        // Session mutation
        .route("/sessions/:id/items", post(add_items))
        .route("/sessions/:id/configs/remove", post(remove_config))
        .route("/sessions/:id/tasks/remove", post(remove_task))
        .route("/sessions/:id/quota", post(update_quota))
        .route("/sessions/:id/delay", post(update_delay))
        .route("/sessions/:id/proxies", post(update_proxies))
        // Collected data
        .route("/sessions/:id/logs", get(list_logs))
        .route("/sessions/:id/artifacts/:task/:page", get(get_artifact))
        // Proxy
        .route("/proxy/test", post(test_proxy))
        // Events & Logs
        .route("/events", get(event_stream))
        .route("/logs/dir", get(get_log_dir))
        // Auth middleware (only if SERP_WEB_PASS is set)
        .layer(middleware::from_fn(super::auth::basic_auth_middleware))
        .layer(Extension(state))
}

// ========== Config Handlers ==========

async fn get_config(
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    let config = state.config.read().await.clone();
    Json(config)
}

async fn configure(
    Extension(state): Extension<Arc<AppState>>,
    Json(config): Json<AppConfig>,
) -> impl IntoResponse {
    info!("Configuring application via web API");
    config.save();
    *state.config.write().await = config;
    StatusCode::OK
}

// ========== Session Lifecycle Handlers ==========

async fn list_sessions(
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    match state.store.list_sessions().await {
        Ok(sessions) => Json(sessions).into_response(),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).into_response(),
    }
}

async fn create_session(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<session::CreateSessionRequest>,
) -> impl IntoResponse {
    match session::create_session_logic(&state, req).await {
        Ok(created) => {
            session::warn_on_malformed_proxies(&created);
            Json(created).into_response()
        }
        Err(e) => err_response(StatusCode::BAD_REQUEST, &e).into_response(),
    }
}

async fn get_session(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_session(&id).await {
        Ok(Some(s)) => Json(s).into_response(),
        Ok(None) => err_response(StatusCode::NOT_FOUND, "Session not found").into_response(),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).into_response(),
    }
}

async fn delete_session(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    info!("Deleting session via web API: {}", id);
    match session::delete_session_logic(&state, &id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, &e).into_response(),
    }
}

async fn start_session(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match session::start_session_logic(&state, &id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => err_response(StatusCode::BAD_REQUEST, &e).into_response(),
    }
}

async fn pause_session(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match session::pause_session_logic(&state, &id, session::PauseReason::User).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => err_response(StatusCode::BAD_REQUEST, &e).into_response(),
    }
}

async fn resume_session(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match session::resume_session_logic(&state, &id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => err_response(StatusCode::BAD_REQUEST, &e).into_response(),
    }
}

// ========== Session Mutation Handlers ==========

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddItemsRequest {
    #[serde(default)]
    queries: Vec<String>,
    #[serde(default)]
    configs: Vec<EngineConfig>,
}

async fn add_items(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<AddItemsRequest>,
) -> impl IntoResponse {
    match session::add_items_logic(&state, &id, req.queries, req.configs).await {
        Ok(s) => Json(s).into_response(),
        Err(e) => err_response(StatusCode::BAD_REQUEST, &e).into_response(),
    }
}

async fn remove_config(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(config): Json<EngineConfig>,
) -> impl IntoResponse {
    match session::remove_config_logic(&state, &id, config).await {
        Ok(s) => Json(s).into_response(),
        Err(e) => err_response(StatusCode::BAD_REQUEST, &e).into_response(),
    }
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveTaskRequest {
    task_index: usize,
}

async fn remove_task(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RemoveTaskRequest>,
) -> impl IntoResponse {
    match session::remove_task_logic(&state, &id, req.task_index).await {
        Ok(s) => Json(s).into_response(),
        Err(e) => err_response(StatusCode::BAD_REQUEST, &e).into_response(),
    }
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateQuotaRequest {
    quota: u32,
}

async fn update_quota(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateQuotaRequest>,
) -> impl IntoResponse {
    match session::update_quota_logic(&state, &id, req.quota).await {
        Ok(s) => Json(s).into_response(),
        Err(e) => err_response(StatusCode::BAD_REQUEST, &e).into_response(),
    }
}

async fn update_delay(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(delay): Json<DelayRange>,
) -> impl IntoResponse {
    match session::update_delay_logic(&state, &id, delay).await {
        Ok(s) => Json(s).into_response(),
        Err(e) => err_response(StatusCode::BAD_REQUEST, &e).into_response(),
    }
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateProxiesRequest {
    use_proxies: bool,
    #[serde(default)]
    proxy_list: Vec<String>,
}

async fn update_proxies(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateProxiesRequest>,
) -> impl IntoResponse {
    match session::update_proxies_logic(&state, &id, req.use_proxies, req.proxy_list).await {
        Ok(s) => Json(s).into_response(),
        Err(e) => err_response(StatusCode::BAD_REQUEST, &e).into_response(),
    }
}

// ========== Collected Data Handlers ==========

async fn list_logs(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.list_logs(&id).await {
        Ok(logs) => Json(logs).into_response(),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).into_response(),
    }
}

async fn get_artifact(
    Extension(state): Extension<Arc<AppState>>,
    Path((id, task, page)): Path<(String, usize, u32)>,
) -> impl IntoResponse {
    match state.store.get_page_artifact(&id, task, page).await {
        Ok(Some(artifact)) => Json(artifact).into_response(),
        Ok(None) => err_response(StatusCode::NOT_FOUND, "Artifact not found").into_response(),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).into_response(),
    }
}

// ========== Proxy Handlers ==========

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestProxyRequest {
    entry: String,
}

async fn test_proxy(
    Json(req): Json<TestProxyRequest>,
) -> impl IntoResponse {
    Json(proxy::test_proxy_entry(&req.entry).await)
}

// ========== Events & Logs Handlers ==========

async fn event_stream(
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    let rx = state.notifier.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => match SseEvent::default().json_data(&event) {
                    Ok(sse) => return Some((Ok::<_, std::convert::Infallible>(sse), rx)),
                    Err(e) => {
                        debug!("Dropping unserializable event: {}", e);
                        continue;
                    }
                },
                // A lagged subscriber just misses events; the persisted
                // session record is the source of truth.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn get_log_dir() -> impl IntoResponse {
    match crate::log_dir() {
        Some(p) => Json(serde_json::json!({ "path": p.to_string_lossy() })).into_response(),
        None => err_response(StatusCode::INTERNAL_SERVER_ERROR, "Could not determine log directory").into_response(),
    }
}
