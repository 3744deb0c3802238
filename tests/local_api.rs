//! Local Management Integration Tests
//!
//! Drives the agent through its HTTP API and checks the proxy
//! configuration it writes in local and hybrid mode.

mod integration_harness;

use integration_harness::{
    API_KEY, MockManager, RunningAgent, base_config, free_addr, test_user, wait_for_port,
    wait_until,
};
use std::time::Duration;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(10);

struct ApiClient {
    client: reqwest::Client,
    base: String,
}

impl ApiClient {
    fn new(addr: std::net::SocketAddr) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: format!("http://{addr}"),
        }
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base, path))
            .bearer_auth(API_KEY)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn create_user(&self, name: &str) -> Uuid {
        let resp = self
            .post("/api/local/users", serde_json::json!({ "name": name }))
            .await;
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(body["vless_url"].as_str().unwrap().starts_with("vless://"));
        Uuid::parse_str(body["uuid"].as_str().unwrap()).unwrap()
    }
}

#[tokio::test]
async fn test_local_api_drives_configuration() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = base_config(dir.path(), "local").await;
    config.api.enabled = true;
    config.api.bind = free_addr().await;
    let bind = config.api.bind;
    let agent = RunningAgent::start(config).await;

    assert!(wait_for_port(bind, WAIT).await);
    let api = ApiClient::new(bind);

    // Health is public; the proxy is managed elsewhere here
    let health = reqwest::get(format!("{}/health", api.base)).await.unwrap();
    assert_eq!(health.status(), 200);

    // Everything under /api/local requires the key
    let unauth = api
        .client
        .get(format!("{}/api/local/users", api.base))
        .send()
        .await
        .unwrap();
    assert_eq!(unauth.status(), 401);

    let alice = api.create_user("alice").await;
    let bob = api.create_user("bob").await;
    assert!(wait_until(WAIT, || agent.users().len() == 2).await);
    assert!(agent.users().contains(&alice));

    // Disabling removes the user from the next configuration
    let resp = api
        .client
        .put(format!("{}/api/local/users/{bob}", api.base))
        .bearer_auth(API_KEY)
        .json(&serde_json::json!({ "enabled": false }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(wait_until(WAIT, || agent.users() == vec![alice]).await);

    // The circuit breaker empties every listener and is reversible
    let resp = api
        .post(
            "/api/local/circuit-breaker",
            serde_json::json!({ "enabled": true, "reason": "maintenance" }),
        )
        .await;
    assert_eq!(resp.status(), 200);
    assert!(wait_until(WAIT, || agent.users().is_empty()).await);

    api.post("/api/local/circuit-breaker", serde_json::json!({ "enabled": false }))
        .await;
    assert!(wait_until(WAIT, || agent.users() == vec![alice]).await);

    drop(api);
    agent.shutdown().await;
    assert!(!wait_for_port(bind, Duration::from_millis(200)).await);
}

#[tokio::test]
async fn test_hybrid_merges_local_and_remote() {
    let dir = tempfile::TempDir::new().unwrap();
    let manager = MockManager::default();
    let remote = test_user(0);
    manager.set_users("v1", vec![remote.clone()]);

    let mut config = base_config(dir.path(), "hybrid").await;
    config.manager.url = manager.spawn().await;
    config.api.enabled = true;
    config.api.bind = free_addr().await;
    let bind = config.api.bind;
    let agent = RunningAgent::start(config).await;

    assert!(wait_until(WAIT, || agent.users() == vec![remote.uuid]).await);
    assert!(wait_for_port(bind, WAIT).await);

    let api = ApiClient::new(bind);
    let local = api.create_user("carol").await;
    assert!(wait_until(WAIT, || agent.users().len() == 2).await);

    let users = agent.users();
    assert!(users.contains(&remote.uuid));
    assert!(users.contains(&local));

    drop(api);
    agent.shutdown().await;
}

#[tokio::test]
async fn test_remote_mode_has_no_local_routes() {
    let dir = tempfile::TempDir::new().unwrap();
    let manager = MockManager::default();
    manager.set_users("v1", vec![]);

    let mut config = base_config(dir.path(), "remote").await;
    config.manager.url = manager.spawn().await;
    config.api.enabled = true;
    config.api.bind = free_addr().await;
    let bind = config.api.bind;
    let agent = RunningAgent::start(config).await;
    assert!(wait_for_port(bind, WAIT).await);

    let api = ApiClient::new(bind);
    let resp = api
        .post("/api/local/users", serde_json::json!({ "name": "nobody" }))
        .await;
    assert_eq!(resp.status(), 404);

    let ready = reqwest::get(format!("{}/ready", api.base)).await.unwrap();
    assert_eq!(ready.text().await.unwrap(), "OK");

    drop(api);
    agent.shutdown().await;
}
