//! Remote manager wire types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Listener advertised to the manager at registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolEndpoint {
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Node registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_id: String,
    /// Agent version
    pub version: String,
    /// Reality public key (URL-safe base64)
    pub public_key: String,
    pub short_ids: Vec<String>,
    /// Keyed by protocol name (`vless_reality`, `shadowsocks`, `vmess`, ...)
    pub protocols: BTreeMap<String, ProtocolEndpoint>,
}

/// Load snapshot carried by a heartbeat
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeLoad {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    #[serde(default)]
    pub bandwidth_mbps: u64,
    pub active_connections: usize,
    pub user_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub load: NodeLoad,
}

/// Certificate material pushed by the manager or issued by the TLS service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertBundle {
    pub domain: String,
    /// PEM certificate
    pub cert: String,
    /// PEM private key
    pub key: String,
    /// PEM chain
    #[serde(default)]
    pub chain: String,
    #[serde(default)]
    pub issued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Reply to heartbeats and connection reports.
///
/// Any of the directives may be present; absent fields mean "nothing to do".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectiveResponse {
    #[serde(default)]
    pub ok: bool,

    /// User UUIDs whose sessions must be evicted now
    #[serde(default)]
    pub kick_users: Vec<String>,

    /// Re-fetch the user list immediately, ignoring the version token
    #[serde(default)]
    pub reload_users: bool,

    #[serde(default)]
    pub cert_update: Option<CertBundle>,
}

impl DirectiveResponse {
    pub fn is_empty(&self) -> bool {
        self.kick_users.is_empty() && !self.reload_users && self.cert_update.is_none()
    }
}

/// One live session as reported to the manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub user_uuid: String,
    pub client_ip: String,
    pub connected_at: DateTime<Utc>,
    pub upload: u64,
    pub download: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionsReport {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub connections: Vec<ConnectionRecord>,
}

/// Per-user byte deltas since the previous report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsEntry {
    pub uuid: String,
    pub upload: u64,
    pub download: u64,
}

impl StatsEntry {
    pub fn total(&self) -> u64 {
        self.upload.saturating_add(self.download)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    pub timestamp: DateTime<Utc>,
    pub stats: Vec<StatsEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertAck {
    pub node_id: String,
}

/// The node's own settings as held by the manager
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfigResponse {
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub vpn_domain: String,
    #[serde(default)]
    pub tls_service_url: String,
    #[serde(default)]
    pub reality_sni: String,
    #[serde(default)]
    pub vless_port: u16,
    #[serde(default)]
    pub ss_port: u16,
    #[serde(default)]
    pub vmess_port: u16,
    #[serde(default)]
    pub trojan_port: u16,
    #[serde(default)]
    pub hysteria2_port: u16,
    #[serde(default)]
    pub tuic_port: u16,
}

impl NodeConfigResponse {
    /// Whether the manager enabled any certificate-bearing protocol
    pub fn has_tls_protocol(&self) -> bool {
        self.protocols
            .iter()
            .any(|p| matches!(p.as_str(), "vmess" | "trojan" | "hysteria2" | "tuic"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_defaults() {
        let resp: DirectiveResponse = serde_json::from_str(r#"{"ok":true}"#).unwrap();
        assert!(resp.ok);
        assert!(resp.is_empty());

        let resp: DirectiveResponse = serde_json::from_str(
            r#"{"ok":true,"kick_users":["a"],"cert_update":{"domain":"vpn.example.com","cert":"C","key":"K"}}"#,
        )
        .unwrap();
        assert_eq!(resp.kick_users, vec!["a".to_string()]);
        let cert = resp.cert_update.unwrap();
        assert_eq!(cert.domain, "vpn.example.com");
        assert!(cert.chain.is_empty());
    }

    #[test]
    fn test_register_shape() {
        let mut protocols = BTreeMap::new();
        protocols.insert(
            "shadowsocks".to_string(),
            ProtocolEndpoint {
                port: 8388,
                method: Some("chacha20-ietf-poly1305".to_string()),
                domain: None,
            },
        );
        let req = RegisterRequest {
            node_id: "node-1".into(),
            version: "0.1.0".into(),
            public_key: "pk".into(),
            short_ids: vec!["0011223344556677".into()],
            protocols,
        };

        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["protocols"]["shadowsocks"]["port"], 8388);
        assert!(value["protocols"]["shadowsocks"].get("domain").is_none());
    }

    #[test]
    fn test_node_config_tls_detection() {
        let mut cfg = NodeConfigResponse {
            protocols: vec!["vless".into(), "shadowsocks".into()],
            ..Default::default()
        };
        assert!(!cfg.has_tls_protocol());

        cfg.protocols.push("trojan".into());
        assert!(cfg.has_tls_protocol());
    }
}
