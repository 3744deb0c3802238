//! Local management API
//!
//! `/health` and `/ready` are always served. The `/api/local` surface is
//! mounted only when a local store exists (local and hybrid modes); every
//! mutation goes through [`LocalStore`], whose change events drive
//! regeneration.

use crate::auth::{ApiAuth, require_auth};
use crate::quota::QuotaMonitor;
use crate::supervisor::Supervisor;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Router, middleware};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use edgewarden_protocol::{CircuitBreaker, ManagementMode, Protocol, User};
use edgewarden_storage::{CreateUserRequest, LocalStore, StoreError, UpdateUserRequest};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": true,
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UserNotFound(_) => ApiError::NotFound("user not found".into()),
            StoreError::Invalid(msg) => ApiError::BadRequest(msg),
            other => {
                error!("Local store failure: {}", other);
                ApiError::Internal(other.to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(_: JsonRejection) -> Self {
        ApiError::BadRequest("invalid request body".into())
    }
}

/// Node facts served by `/api/local/config` and used for connection URLs
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub mode: ManagementMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_ip: Option<String>,
    pub public_key: String,
    pub short_id: String,
    pub vless_port: u16,
    pub ss_port: u16,
    pub ss_method: String,
    pub reality_sni: String,
}

impl NodeInfo {
    fn host(&self) -> Option<String> {
        let ip = self.server_ip.as_deref().filter(|s| !s.is_empty())?;
        Some(if ip.contains(':') {
            format!("[{ip}]")
        } else {
            ip.to_string()
        })
    }

    /// `vless://` share link with reality parameters
    pub fn vless_url(&self, user: &User) -> Option<String> {
        let mut url = Url::parse(&format!(
            "vless://{}@{}:{}",
            user.uuid,
            self.host()?,
            self.vless_port
        ))
        .ok()?;
        url.query_pairs_mut()
            .append_pair("encryption", "none")
            .append_pair("flow", "xtls-rprx-vision")
            .append_pair("security", "reality")
            .append_pair("sni", &self.reality_sni)
            .append_pair("fp", "chrome")
            .append_pair("pbk", &self.public_key)
            .append_pair("sid", &self.short_id)
            .append_pair("type", "tcp");
        url.set_fragment(Some(&user.name));
        Some(url.to_string())
    }

    /// SIP002 `ss://` link
    pub fn ss_url(&self, user: &User) -> Option<String> {
        let userinfo = URL_SAFE_NO_PAD.encode(format!("{}:{}", self.ss_method, user.ss_password));
        let mut url = Url::parse(&format!(
            "ss://{}@{}:{}",
            userinfo,
            self.host()?,
            self.ss_port
        ))
        .ok()?;
        url.set_fragment(Some(&user.name));
        Some(url.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct UserView {
    #[serde(flatten)]
    pub user: User,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vless_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ss_url: Option<String>,
}

impl UserView {
    fn new(node: &NodeInfo, user: User) -> Self {
        let vless_url = user
            .has_protocol(Protocol::Vless)
            .then(|| node.vless_url(&user))
            .flatten();
        let ss_url = user
            .has_protocol(Protocol::Shadowsocks)
            .then(|| node.ss_url(&user))
            .flatten();
        Self {
            user,
            vless_url,
            ss_url,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BreakerRequest {
    pub enabled: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone)]
pub struct ApiState {
    pub node: Arc<NodeInfo>,
    pub store: Option<Arc<LocalStore>>,
    pub monitor: Arc<QuotaMonitor>,
    /// `None` when the proxy is managed elsewhere; health then reports healthy
    pub supervisor: Option<Supervisor>,
    pub started: Instant,
}

impl ApiState {
    fn store(&self) -> Result<&Arc<LocalStore>, ApiError> {
        self.store
            .as_ref()
            .ok_or_else(|| ApiError::NotFound("local management disabled".into()))
    }

    /// Run a store mutation on the blocking pool; it fsyncs under the store lock
    async fn mutate<T, F>(&self, op: F) -> Result<T, ApiError>
    where
        F: FnOnce(&LocalStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(self.store()?);
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| ApiError::Internal(format!("store task failed: {e}")))?
            .map_err(ApiError::from)
    }
}

pub fn router(state: ApiState, auth: ApiAuth) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready));

    if state.store.is_some() {
        let local = Router::new()
            .route("/api/local/users", get(list_users).post(create_user))
            .route(
                "/api/local/users/:uuid",
                get(get_user).put(update_user).delete(delete_user),
            )
            .route("/api/local/config", get(node_config))
            .route("/api/local/stats", get(stats))
            .route(
                "/api/local/circuit-breaker",
                get(get_breaker).post(set_breaker),
            )
            .route_layer(middleware::from_fn_with_state(auth, require_auth));
        app = app.merge(local);
    }

    app.with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve(
    bind: SocketAddr,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!("Management API listening on {}", bind);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let status = state.supervisor.as_ref().map(|s| s.status());
    let healthy = status.as_ref().is_none_or(|s| s.running);
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let proxy = status.map(|s| {
        serde_json::json!({
            "running": s.running,
            "pid": s.pid,
            "restarts": s.restarts,
            "exhausted": s.exhausted,
        })
    });

    (
        code,
        Json(serde_json::json!({
            "status": if healthy { "healthy" } else { "unhealthy" },
            "uptime_secs": state.started.elapsed().as_secs(),
            "version": env!("CARGO_PKG_VERSION"),
            "mode": state.node.mode,
            "proxy": proxy,
        })),
    )
}

async fn ready() -> &'static str {
    "OK"
}

fn parse_uuid(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest("invalid user uuid".into()))
}

async fn list_users(State(state): State<ApiState>) -> Result<Json<serde_json::Value>, ApiError> {
    let users: Vec<UserView> = state
        .store()?
        .list_users()
        .into_iter()
        .map(|u| UserView::new(&state.node, u))
        .collect();

    Ok(Json(serde_json::json!({
        "total": users.len(),
        "users": users,
    })))
}

async fn create_user(
    State(state): State<ApiState>,
    body: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Result<Json<UserView>, ApiError> {
    let Json(req) = body?;
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name is required".into()));
    }

    let user = state.mutate(move |store| store.create_user(req)).await?;
    info!("Local user {} created", user.uuid);
    Ok(Json(UserView::new(&state.node, user)))
}

async fn get_user(
    State(state): State<ApiState>,
    Path(raw): Path<String>,
) -> Result<Json<UserView>, ApiError> {
    let uuid = parse_uuid(&raw)?;
    let user = state
        .store()?
        .get_user(&uuid)
        .ok_or_else(|| ApiError::NotFound("user not found".into()))?;
    Ok(Json(UserView::new(&state.node, user)))
}

async fn update_user(
    State(state): State<ApiState>,
    Path(raw): Path<String>,
    body: Result<Json<UpdateUserRequest>, JsonRejection>,
) -> Result<Json<UserView>, ApiError> {
    let uuid = parse_uuid(&raw)?;
    let Json(req) = body?;
    let user = state
        .mutate(move |store| store.update_user(&uuid, req))
        .await?;
    info!("Local user {} updated", uuid);
    Ok(Json(UserView::new(&state.node, user)))
}

async fn delete_user(
    State(state): State<ApiState>,
    Path(raw): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let uuid = parse_uuid(&raw)?;
    state.mutate(move |store| store.delete_user(&uuid)).await?;
    info!("Local user {} deleted", uuid);
    Ok(Json(serde_json::json!({
        "message": "user deleted",
        "uuid": uuid,
    })))
}

async fn node_config(State(state): State<ApiState>) -> Json<NodeInfo> {
    Json(state.node.as_ref().clone())
}

async fn stats(State(state): State<ApiState>) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.store()?;
    let users: Vec<serde_json::Value> = store
        .list_users()
        .into_iter()
        .map(|u| {
            serde_json::json!({
                "uuid": u.uuid,
                "name": u.name,
                "enabled": u.enabled,
                "traffic_used": u.traffic_used,
                "traffic_limit": u.traffic_limit,
                "session_traffic": state.monitor.session_traffic(&u.uuid).unwrap_or(0),
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "stats": users,
        "monitored_users": state.monitor.user_count(),
        "circuit_breaker": store.circuit_breaker().enabled,
        "proxy_running": state.supervisor.as_ref().map(|s| s.is_running()),
    })))
}

async fn get_breaker(State(state): State<ApiState>) -> Result<Json<CircuitBreaker>, ApiError> {
    Ok(Json(state.store()?.circuit_breaker()))
}

async fn set_breaker(
    State(state): State<ApiState>,
    body: Result<Json<BreakerRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(req) = body?;
    let breaker = state
        .mutate(move |store| store.set_circuit_breaker(req.enabled, req.reason, req.message))
        .await?;
    info!(
        "Circuit breaker {}",
        if breaker.enabled { "engaged" } else { "released" }
    );
    Ok(Json(serde_json::json!({
        "message": "circuit breaker updated",
        "enabled": breaker.enabled,
    })))
}

#[cfg(test)]
#[path = "management_tests.rs"]
mod tests;
