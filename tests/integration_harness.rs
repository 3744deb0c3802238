//! Integration Test Harness
#![allow(dead_code)]
//!
//! Runs the agent in-process against a mock manager and a fake proxy
//! control API, and provides polling helpers for the files it writes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use edgewarden_daemon::generator::ProxyDocument;
use edgewarden_daemon::{Agent, DaemonConfig};
use edgewarden_protocol::{ListSettings, Protocol, User, UserList};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const API_KEY: &str = "integration-key";

/// Reserve a loopback address nobody listens on
pub async fn free_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Wait for a TCP listener on `addr`
pub async fn wait_for_port(addr: SocketAddr, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

pub fn read_document(path: &FsPath) -> Option<ProxyDocument> {
    let data = std::fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
}

/// UUIDs in the stats block of the written configuration
pub fn configured_users(path: &FsPath) -> Vec<Uuid> {
    read_document(path)
        .map(|doc| doc.stats_users().to_vec())
        .unwrap_or_default()
}

pub fn test_user(limit: u64) -> User {
    let mut user = User::new(
        Uuid::new_v4(),
        vec![Protocol::Vless, Protocol::Shadowsocks],
        "integration-password",
    );
    user.name = "integration".into();
    user.traffic_limit = limit;
    user
}

/// Agent configuration with fast loops and nothing bound by default
pub async fn base_config(dir: &FsPath, mode: &str) -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.node.id = "it-node".into();
    config.node.api_key = API_KEY.into();
    config.node.mode = mode.into();
    config.node.server_ip = Some("198.51.100.7".into());
    config.node.data_dir = dir.to_path_buf();
    config.proxy.config_path = dir.join("proxy.json");
    config.proxy.control_addr = free_addr().await;
    config.proxy.stats_addr = free_addr().await;
    config.proxy.skip_start = true;
    config.api.enabled = false;
    config.manager.sync_interval_secs = 1;
    config.manager.stats_interval_secs = 1;
    config.manager.heartbeat_interval_secs = 1;
    config.manager.connections_interval_secs = 1;
    config.quota.check_interval_secs = 1;
    config
}

/// An agent running on a background task
pub struct RunningAgent {
    pub proxy_config: PathBuf,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl RunningAgent {
    pub async fn start(config: DaemonConfig) -> Self {
        let proxy_config = config.proxy.config_path.clone();
        let agent = Agent::new(config).await.expect("agent builds");
        Self::run(agent, proxy_config)
    }

    pub fn run(agent: Agent, proxy_config: PathBuf) -> Self {
        let (stop, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(agent.run(async move {
            let _ = stop_rx.await;
        }));
        Self {
            proxy_config,
            stop,
            handle,
        }
    }

    pub fn users(&self) -> Vec<Uuid> {
        configured_users(&self.proxy_config)
    }

    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        self.handle.await.unwrap().unwrap();
    }
}

/// In-memory stand-in for the remote manager
#[derive(Clone, Default)]
pub struct MockManager {
    pub list: Arc<Mutex<UserList>>,
    pub registrations: Arc<Mutex<Vec<serde_json::Value>>>,
    pub heartbeats: Arc<AtomicUsize>,
    pub fetches: Arc<AtomicUsize>,
    pub stats: Arc<Mutex<Vec<serde_json::Value>>>,
    pub connections: Arc<Mutex<Vec<serde_json::Value>>>,
    /// Returned by the next heartbeat only
    pub directive: Arc<Mutex<Option<serde_json::Value>>>,
}

impl MockManager {
    pub fn set_users(&self, version: &str, users: Vec<User>) {
        *self.list.lock() = UserList {
            version: version.into(),
            users,
            config: ListSettings {
                reality_sni: "www.example.com".into(),
            },
        };
    }

    pub fn reported_bytes(&self, uuid: &Uuid) -> u64 {
        let id = uuid.to_string();
        self.stats
            .lock()
            .iter()
            .flat_map(|r| r["stats"].as_array().cloned().unwrap_or_default())
            .filter(|e| e["uuid"] == id.as_str())
            .map(|e| e["upload"].as_u64().unwrap_or(0) + e["download"].as_u64().unwrap_or(0))
            .sum()
    }

    /// Serve and return the base URL
    pub async fn spawn(&self) -> String {
        let app = Router::new()
            .route("/api/node/users", get(manager_users))
            .route("/api/node/register", post(manager_register))
            .route("/api/node/heartbeat", post(manager_heartbeat))
            .route("/api/node/connections", post(manager_connections))
            .route("/api/node/stats", post(manager_stats))
            .route("/api/node/cert-ack", post(|| async { StatusCode::OK }))
            .route("/api/node/config", get(|| async { StatusCode::NOT_FOUND }))
            .with_state(self.clone());
        format!("http://{}", serve(app).await)
    }
}

async fn manager_users(State(m): State<MockManager>) -> Json<UserList> {
    m.fetches.fetch_add(1, Ordering::SeqCst);
    Json(m.list.lock().clone())
}

async fn manager_register(
    State(m): State<MockManager>,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    m.registrations.lock().push(body);
    StatusCode::OK
}

async fn manager_heartbeat(State(m): State<MockManager>) -> Json<serde_json::Value> {
    m.heartbeats.fetch_add(1, Ordering::SeqCst);
    let directive = m.directive.lock().take();
    Json(directive.unwrap_or_else(|| serde_json::json!({ "ok": true })))
}

async fn manager_connections(
    State(m): State<MockManager>,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    m.connections.lock().push(body);
    Json(serde_json::json!({ "ok": true }))
}

async fn manager_stats(
    State(m): State<MockManager>,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    m.stats.lock().push(body);
    StatusCode::OK
}

/// Stand-in for the proxy's control API
#[derive(Clone, Default)]
pub struct FakeControl {
    pub sessions: Arc<Mutex<Vec<serde_json::Value>>>,
    /// Pending counters, cleared on every read
    pub traffic: Arc<Mutex<Vec<(Uuid, u64, u64)>>>,
    pub closed: Arc<Mutex<Vec<String>>>,
}

impl FakeControl {
    pub fn add_session(&self, id: &str, user: &Uuid) {
        self.sessions.lock().push(serde_json::json!({
            "id": id,
            "metadata": { "user": user.to_string(), "source": "203.0.113.20:40000" },
            "upload": 0, "download": 0,
            "start": "2026-01-01T00:00:00Z"
        }));
    }

    pub fn add_traffic(&self, user: &Uuid, upload: u64, download: u64) {
        self.traffic.lock().push((*user, upload, download));
    }

    pub async fn spawn_at(&self, addr: SocketAddr) {
        let app = Router::new()
            .route("/connections", get(control_list))
            .route("/connections/:id", delete(control_close))
            .route("/stats/users", get(control_stats))
            .with_state(self.clone());
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
    }
}

async fn control_list(State(c): State<FakeControl>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "connections": *c.sessions.lock() }))
}

async fn control_close(State(c): State<FakeControl>, Path(id): Path<String>) -> StatusCode {
    c.sessions.lock().retain(|s| s["id"] != id.as_str());
    c.closed.lock().push(id);
    StatusCode::NO_CONTENT
}

async fn control_stats(
    State(c): State<FakeControl>,
    Query(_q): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let pending: Vec<_> = c.traffic.lock().drain(..).collect();
    let stat: Vec<serde_json::Value> = pending
        .iter()
        .flat_map(|(uuid, up, down)| {
            [
                serde_json::json!({ "name": format!("user>>>{uuid}>>>traffic>>>uplink"), "value": up }),
                serde_json::json!({ "name": format!("user>>>{uuid}>>>traffic>>>downlink"), "value": down }),
            ]
        })
        .collect();
    Json(serde_json::json!({ "stat": stat }))
}
