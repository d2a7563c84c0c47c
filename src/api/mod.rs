use axum::extract::{Query, State};
use axum::http::{header, Method};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

pub mod error;
pub mod metrics;

pub use error::AppError;

use crate::aggregator::Aggregator;
use crate::conntrack::DropCounter;
use crate::neighbor::NeighborResolver;
use crate::static_files::serve_static_asset;

/// Static catalog surfaced to the UI by `GET /api/meta` — e.g. links to
/// external IP-lookup tools keyed by display label.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AppMeta {
    pub ip_tools: HashMap<String, String>,
}

/// Shared application state available to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<NeighborResolver>,
    pub aggregator: Arc<Aggregator>,
    pub drops: Arc<DropCounter>,
    pub meta: Arc<AppMeta>,
}

/// Returned by every route's method-router fallback, so calling a route
/// with the wrong HTTP method gets the same JSON error envelope as any
/// other rejected request instead of axum's bare-text default.
async fn method_not_allowed() -> AppError {
    AppError::MethodNotAllowed
}

/// Build the main application router with all API routes.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::AllowOrigin::mirror_request())
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    let api_routes = Router::new()
        .route("/stats", get(stats).fallback(method_not_allowed))
        .route("/client", get(client).fallback(method_not_allowed))
        .route("/meta", get(meta).fallback(method_not_allowed))
        .route("/reset", post(reset).fallback(method_not_allowed))
        .route("/client/reset", post(reset_client).fallback(method_not_allowed))
        .route(
            "/client/reset_session",
            post(reset_client_session).fallback(method_not_allowed),
        );

    Router::new()
        .route("/metrics", get(metrics::handler).fallback(method_not_allowed))
        .nest("/api", api_routes)
        .fallback(serve_static_asset)
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ClientStatsJson {
    mac: String,
    name: String,
    start_time: chrono::DateTime<chrono::Utc>,
    last_active: chrono::DateTime<chrono::Utc>,
    cumulative_download: u64,
    cumulative_upload: u64,
    session_download: u64,
    session_upload: u64,
    download_speed: f64,
    upload_speed: f64,
    active_connections: u64,
}

impl From<&crate::aggregator::ClientStats> for ClientStatsJson {
    fn from(c: &crate::aggregator::ClientStats) -> Self {
        Self {
            mac: c.mac.clone(),
            name: c.name.clone(),
            start_time: c.start_time,
            last_active: c.last_active,
            cumulative_download: c.cumulative_download,
            cumulative_upload: c.cumulative_upload,
            session_download: c.session_download(),
            session_upload: c.session_upload(),
            download_speed: c.download_speed,
            upload_speed: c.upload_speed,
            active_connections: c.active_connections(),
        }
    }
}

#[derive(Debug, Serialize)]
struct GlobalStatsJson {
    start_time: chrono::DateTime<chrono::Utc>,
    wan_download: u64,
    wan_upload: u64,
    active_connections: u64,
}

impl From<&crate::aggregator::GlobalStats> for GlobalStatsJson {
    fn from(g: &crate::aggregator::GlobalStats) -> Self {
        Self {
            start_time: g.start_time,
            wan_download: g.wan_download,
            wan_upload: g.wan_upload,
            active_connections: g.active_connections(),
        }
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    start_time: chrono::DateTime<chrono::Utc>,
    global: GlobalStatsJson,
    clients: Vec<ClientStatsJson>,
}

/// GET /api/stats
async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let global = state.aggregator.global_stats().await;
    let clients = state.aggregator.clients().await;
    Json(StatsResponse {
        start_time: global.start_time,
        global: GlobalStatsJson::from(&global),
        clients: clients.iter().map(ClientStatsJson::from).collect(),
    })
}

#[derive(Debug, Deserialize)]
struct MacQuery {
    mac: Option<String>,
}

fn normalize_mac(raw: &str) -> String {
    raw.trim().to_lowercase()
}

fn require_mac(query: &MacQuery) -> Result<String, AppError> {
    match query.mac.as_deref().map(str::trim) {
        Some(mac) if !mac.is_empty() => Ok(normalize_mac(mac)),
        _ => Err(AppError::BadRequest("missing or empty mac query parameter".to_string())),
    }
}

#[derive(Debug, Serialize)]
struct FlowViewJson {
    protocol: String,
    remote_ip: String,
    remote_port: u16,
    local_ip: String,
    download: u64,
    upload: u64,
    session_download: u64,
    session_upload: u64,
    download_speed: f64,
    upload_speed: f64,
    active_connections: u64,
    ttl_remaining: i64,
}

impl From<&crate::aggregator::ClientFlowView> for FlowViewJson {
    fn from(v: &crate::aggregator::ClientFlowView) -> Self {
        Self {
            protocol: v.protocol.clone(),
            remote_ip: v.remote_ip.to_string(),
            remote_port: v.remote_port,
            local_ip: v.local_ip.to_string(),
            download: v.download,
            upload: v.upload,
            session_download: v.session_download,
            session_upload: v.session_upload,
            download_speed: v.download_speed,
            upload_speed: v.upload_speed,
            active_connections: v.active_connections,
            ttl_remaining: v.ttl_remaining,
        }
    }
}

#[derive(Debug, Serialize)]
struct ClientResponse {
    client: Option<ClientStatsJson>,
    flows: Vec<FlowViewJson>,
    local_ips: Vec<String>,
}

/// GET /api/client?mac=…
async fn client(
    State(state): State<AppState>,
    Query(query): Query<MacQuery>,
) -> Result<Json<ClientResponse>, AppError> {
    let mac = require_mac(&query)?;
    let client = state.aggregator.client_with_session(&mac).await;
    let (flows, _active_connections, local_ips) = state.aggregator.flows_by_mac(&mac).await;
    Ok(Json(ClientResponse {
        client: client.as_ref().map(ClientStatsJson::from),
        flows: flows.iter().map(FlowViewJson::from).collect(),
        local_ips: local_ips.iter().map(ToString::to_string).collect(),
    }))
}

/// GET /api/meta
async fn meta(State(state): State<AppState>) -> Json<AppMeta> {
    Json((*state.meta).clone())
}

#[derive(Serialize)]
struct StatusOk {
    status: &'static str,
}

/// POST /api/reset
async fn reset(State(state): State<AppState>) -> Json<StatusOk> {
    state.aggregator.reset().await;
    Json(StatusOk { status: "ok" })
}

/// POST /api/client/reset?mac=…
async fn reset_client(
    State(state): State<AppState>,
    Query(query): Query<MacQuery>,
) -> Result<Json<StatusOk>, AppError> {
    let mac = require_mac(&query)?;
    state.aggregator.reset_client_by_mac(&mac).await;
    Ok(Json(StatusOk { status: "ok" }))
}

/// POST /api/client/reset_session?mac=…
async fn reset_client_session(
    State(state): State<AppState>,
    Query(query): Query<MacQuery>,
) -> Result<Json<StatusOk>, AppError> {
    let mac = require_mac(&query)?;
    state.aggregator.reset_session_by_mac(&mac).await;
    Ok(Json(StatusOk { status: "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::test_support::{NoopDumpTransport, NoopListenTransport};
    use crate::conntrack::ConntrackMonitor;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let resolver = NeighborResolver::new();
        let aggregator = Aggregator::new(
            resolver.clone(),
            None,
            true,
            Duration::from_secs(60),
            HashMap::new(),
        );
        let (monitor, _rx) = ConntrackMonitor::start_with_transport(
            NoopListenTransport,
            NoopDumpTransport,
            Duration::from_secs(60),
        );
        AppState {
            resolver,
            aggregator,
            drops: monitor.drop_counter(),
            meta: Arc::new(AppMeta::default()),
        }
    }

    #[tokio::test]
    async fn client_without_mac_is_bad_request() {
        let app = router(test_state().await);
        let response = app
            .oneshot(Request::get("/api/client").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn reset_via_get_is_method_not_allowed() {
        let app = router(test_state().await);
        let response = app
            .oneshot(Request::get("/api/reset").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::METHOD_NOT_ALLOWED);
        let body = axum::body::to_bytes(response.into_body(), 1_000_000)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "method_not_allowed");
    }

    #[tokio::test]
    async fn stats_returns_ok() {
        let app = router(test_state().await);
        let response = app
            .oneshot(Request::get("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn reset_post_returns_ok_status() {
        let app = router(test_state().await);
        let response = app
            .oneshot(Request::post("/api/reset").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1_000_000)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }
}
