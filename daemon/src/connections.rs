//! Client for the proxy subprocess's local control API
//!
//! Lists and terminates sessions, and reads per-user traffic counters.

use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Control API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Control API returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionMetadata {
    /// User tag, the UUID for agent-generated configurations
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub destination: String,
}

/// One live session as seen by the subprocess
#[derive(Debug, Clone, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub metadata: SessionMetadata,
    #[serde(default)]
    pub upload: u64,
    #[serde(default)]
    pub download: u64,
    /// RFC 3339 start time
    #[serde(default)]
    pub start: String,
}

impl Session {
    pub fn user_uuid(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.metadata.user).ok()
    }

    /// Client address without the port
    pub fn client_ip(&self) -> String {
        match self.metadata.source.parse::<SocketAddr>() {
            Ok(addr) => addr.ip().to_string(),
            Err(_) => self.metadata.source.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SessionsResponse {
    #[serde(default)]
    connections: Vec<Session>,
}

#[derive(Debug, Deserialize)]
struct StatCounter {
    name: String,
    #[serde(default)]
    value: u64,
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    #[serde(default)]
    stat: Vec<StatCounter>,
}

/// Per-user byte counters since the previous read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficDelta {
    pub upload: u64,
    pub download: u64,
}

impl TrafficDelta {
    pub fn total(&self) -> u64 {
        self.upload.saturating_add(self.download)
    }
}

#[derive(Debug, Clone)]
pub struct ControlClient {
    base_url: String,
    client: reqwest::Client,
}

impl ControlClient {
    pub fn new(addr: SocketAddr) -> Result<Self, ControlError> {
        Self::with_base_url(format!("http://{addr}"))
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, ControlError> {
        let client = reqwest::Client::builder().timeout(CONTROL_TIMEOUT).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Every live session
    pub async fn list_sessions(&self) -> Result<Vec<Session>, ControlError> {
        let resp = self
            .client
            .get(format!("{}/connections", self.base_url))
            .send()
            .await?;
        let resp = check_status(resp).await?;
        Ok(resp.json::<SessionsResponse>().await?.connections)
    }

    /// Terminate one session
    pub async fn kick_session(&self, id: &str) -> Result<(), ControlError> {
        let resp = self
            .client
            .delete(format!("{}/connections/{}", self.base_url, id))
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }

    /// Terminate every session of `uuid`.
    ///
    /// Individual failures are logged and skipped. Returns how many sessions
    /// were terminated; fails only when the session list cannot be read.
    pub async fn kick_user(&self, uuid: &Uuid) -> Result<usize, ControlError> {
        let sessions = self.list_sessions().await?;
        let mut kicked = 0;

        for session in sessions
            .iter()
            .filter(|s| s.user_uuid().as_ref() == Some(uuid))
        {
            match self.kick_session(&session.id).await {
                Ok(()) => kicked += 1,
                Err(e) => warn!("Failed to close session {} of {}: {}", session.id, uuid, e),
            }
        }

        debug!("Closed {} sessions of {}", kicked, uuid);
        Ok(kicked)
    }

    /// Read and reset the per-user traffic counters
    pub async fn user_traffic(&self) -> Result<HashMap<Uuid, TrafficDelta>, ControlError> {
        let resp = self
            .client
            .get(format!("{}/stats/users", self.base_url))
            .query(&[("reset", "true")])
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let stats: StatsResponse = resp.json().await?;
        Ok(parse_user_counters(stats.stat))
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ControlError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(ControlError::Status { status, body })
}

/// Fold `user>>>{uuid}>>>traffic>>>uplink|downlink` counters per user
fn parse_user_counters(counters: Vec<StatCounter>) -> HashMap<Uuid, TrafficDelta> {
    let mut out: HashMap<Uuid, TrafficDelta> = HashMap::new();

    for counter in counters {
        let parts: Vec<&str> = counter.name.split(">>>").collect();
        let [kind, id, "traffic", direction] = parts.as_slice() else {
            continue;
        };
        if *kind != "user" {
            continue;
        }
        let Ok(uuid) = Uuid::parse_str(id) else {
            continue;
        };

        let entry = out.entry(uuid).or_default();
        match *direction {
            "uplink" => entry.upload = entry.upload.saturating_add(counter.value),
            "downlink" => entry.download = entry.download.saturating_add(counter.value),
            _ => {}
        }
    }

    out.retain(|_, d| d.total() > 0);
    out
}
