//! Remote manager client
//!
//! Every call carries the node's bearer credential and is bounded by a
//! 30 second timeout. Any 2xx is success; anything else becomes
//! `ManagerError::Api` with the response body.

use crate::generator::ProtocolSettings;
use async_trait::async_trait;
use edgewarden_crypto::NodeSecrets;
use edgewarden_protocol::{
    CertAck, ConnectionsReport, DirectiveResponse, HeartbeatRequest, NodeConfigResponse, Protocol,
    ProtocolEndpoint, RegisterRequest, StatsReport, UserList,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const MANAGER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Manager request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Manager returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Failed to decode manager response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Anything that can produce the remote user list
#[async_trait]
pub trait UserSource: Send + Sync {
    async fn fetch_users(&self) -> Result<UserList, ManagerError>;
}

#[derive(Debug, Clone)]
pub struct ManagerClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl ManagerClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, ManagerError> {
        Self::with_timeout(base_url, api_key, MANAGER_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, ManagerError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Announce this node; best effort at startup
    pub async fn register(&self, req: &RegisterRequest) -> Result<(), ManagerError> {
        self.post_ack("/api/node/register", req).await
    }

    pub async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<DirectiveResponse, ManagerError> {
        self.post("/api/node/heartbeat", req).await
    }

    pub async fn report_connections(
        &self,
        report: &ConnectionsReport,
    ) -> Result<DirectiveResponse, ManagerError> {
        self.post("/api/node/connections", report).await
    }

    pub async fn report_stats(&self, report: &StatsReport) -> Result<(), ManagerError> {
        self.post_ack("/api/node/stats", report).await
    }

    pub async fn ack_cert_update(&self, node_id: &str) -> Result<(), ManagerError> {
        let ack = CertAck {
            node_id: node_id.to_string(),
        };
        self.post_ack("/api/node/cert-ack", &ack).await
    }

    /// The node's settings as held by the manager
    pub async fn node_config(&self) -> Result<NodeConfigResponse, ManagerError> {
        let resp = self
            .client
            .get(self.url("/api/node/config"))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        decode(resp).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, ManagerError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned + Default,
    {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;
        decode(resp).await
    }

    async fn post_ack<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), ManagerError> {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;
        ensure_success(resp).await?;
        debug!("Manager accepted POST {}", path);
        Ok(())
    }
}

#[async_trait]
impl UserSource for ManagerClient {
    async fn fetch_users(&self) -> Result<UserList, ManagerError> {
        let resp = self
            .client
            .get(self.url("/api/node/users"))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        decode(resp).await
    }
}

async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, ManagerError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(ManagerError::Api { status, body })
}

/// Decode a JSON body; an empty body yields the default value
async fn decode<R: DeserializeOwned + Default>(resp: reqwest::Response) -> Result<R, ManagerError> {
    let bytes = ensure_success(resp).await?.bytes().await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(R::default());
    }
    Ok(serde_json::from_slice(&bytes)?)
}

/// Registration payload advertising every configured listener
pub fn registration(
    node_id: &str,
    secrets: &NodeSecrets,
    settings: &ProtocolSettings,
    vpn_domain: Option<&str>,
) -> RegisterRequest {
    let mut protocols = BTreeMap::new();
    protocols.insert(
        "vless_reality".to_string(),
        ProtocolEndpoint {
            port: settings.vless_port,
            method: None,
            domain: None,
        },
    );
    protocols.insert(
        Protocol::Shadowsocks.to_string(),
        ProtocolEndpoint {
            port: settings.ss_port,
            method: Some(settings.ss_method.clone()),
            domain: None,
        },
    );
    for protocol in Protocol::TLS {
        let port = settings.port(protocol);
        if port > 0 {
            protocols.insert(
                protocol.to_string(),
                ProtocolEndpoint {
                    port,
                    method: None,
                    domain: vpn_domain.map(str::to_string),
                },
            );
        }
    }

    RegisterRequest {
        node_id: node_id.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        public_key: secrets.public_key.clone(),
        short_ids: secrets.short_ids.clone(),
        protocols,
    }
}
