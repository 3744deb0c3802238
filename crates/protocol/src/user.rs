//! User directory data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("Unknown management mode: {0}")]
    UnknownMode(String),
}

/// Proxy protocol a user may be enabled for.
///
/// `Vless` and `Shadowsocks` are always listened on. The remaining four
/// require certificate material. Names the agent does not know (sent by a
/// newer manager) deserialize as `Unknown` and are ignored downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vless,
    Shadowsocks,
    Vmess,
    Trojan,
    Hysteria2,
    Tuic,
    #[serde(other)]
    Unknown,
}

impl Protocol {
    /// Every known protocol, in listener order
    pub const ALL: [Protocol; 6] = [
        Protocol::Vless,
        Protocol::Shadowsocks,
        Protocol::Vmess,
        Protocol::Trojan,
        Protocol::Hysteria2,
        Protocol::Tuic,
    ];

    /// Protocols that need a certificate/key pair to listen
    pub const TLS: [Protocol; 4] = [
        Protocol::Vmess,
        Protocol::Trojan,
        Protocol::Hysteria2,
        Protocol::Tuic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vless => "vless",
            Protocol::Shadowsocks => "shadowsocks",
            Protocol::Vmess => "vmess",
            Protocol::Trojan => "trojan",
            Protocol::Hysteria2 => "hysteria2",
            Protocol::Tuic => "tuic",
            Protocol::Unknown => "unknown",
        }
    }

    pub fn requires_tls(&self) -> bool {
        Self::TLS.contains(self)
    }

    pub fn is_known(&self) -> bool {
        *self != Protocol::Unknown
    }

    /// Listener tag used in the generated proxy configuration
    pub fn inbound_tag(&self) -> &'static str {
        match self {
            Protocol::Vless => "vless-in",
            Protocol::Shadowsocks => "ss-in",
            Protocol::Vmess => "vmess-in",
            Protocol::Trojan => "trojan-in",
            Protocol::Hysteria2 => "hysteria2-in",
            Protocol::Tuic => "tuic-in",
            Protocol::Unknown => "unknown-in",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vless" => Ok(Protocol::Vless),
            "shadowsocks" | "ss" => Ok(Protocol::Shadowsocks),
            "vmess" => Ok(Protocol::Vmess),
            "trojan" => Ok(Protocol::Trojan),
            "hysteria2" => Ok(Protocol::Hysteria2),
            "tuic" => Ok(Protocol::Tuic),
            other => Err(ParseError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Where the effective user list comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagementMode {
    /// Local store only, no network sync
    #[default]
    Local,
    /// Remote manager only
    Remote,
    /// Remote list merged with the local store, local entries win
    Hybrid,
}

impl ManagementMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagementMode::Local => "local",
            ManagementMode::Remote => "remote",
            ManagementMode::Hybrid => "hybrid",
        }
    }

    /// Whether this mode talks to the remote manager
    pub fn syncs_remote(&self) -> bool {
        matches!(self, ManagementMode::Remote | ManagementMode::Hybrid)
    }

    /// Whether this mode reads the local store
    pub fn uses_local_store(&self) -> bool {
        matches!(self, ManagementMode::Local | ManagementMode::Hybrid)
    }
}

impl fmt::Display for ManagementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ManagementMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(ManagementMode::Local),
            "remote" => Ok(ManagementMode::Remote),
            "hybrid" => Ok(ManagementMode::Hybrid),
            other => Err(ParseError::UnknownMode(other.to_string())),
        }
    }
}

/// A user permitted to connect through this node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Stable identity, unique within a directory
    pub uuid: Uuid,

    /// Display name (local users only)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Enabled protocols
    #[serde(default)]
    pub protocols: Vec<Protocol>,

    /// Password shared by the protocols that take one
    #[serde(default)]
    pub ss_password: String,

    pub enabled: bool,

    /// Traffic ceiling in bytes, 0 = unlimited
    #[serde(default)]
    pub traffic_limit: u64,

    /// Server-attributed cumulative usage in bytes
    #[serde(default)]
    pub traffic_used: u64,

    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl User {
    /// New enabled user with no quota and no expiry
    pub fn new(uuid: Uuid, protocols: Vec<Protocol>, ss_password: impl Into<String>) -> Self {
        Self {
            uuid,
            name: String::new(),
            protocols,
            ss_password: ss_password.into(),
            enabled: true,
            traffic_limit: 0,
            traffic_used: 0,
            expire_at: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn has_protocol(&self, protocol: Protocol) -> bool {
        self.protocols.contains(&protocol)
    }

    /// Known protocols only, deduplicated, in declaration order
    pub fn known_protocols(&self) -> Vec<Protocol> {
        let mut out = Vec::with_capacity(self.protocols.len());
        for p in &self.protocols {
            if p.is_known() && !out.contains(p) {
                out.push(*p);
            }
        }
        out
    }

    /// Enabled and listening on at least one known protocol
    pub fn is_active(&self) -> bool {
        self.enabled && self.protocols.iter().any(Protocol::is_known)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expire_at.is_some_and(|at| now > at)
    }

    /// Quota exhausted by server-attributed usage alone
    pub fn is_over_quota(&self) -> bool {
        self.traffic_limit > 0 && self.traffic_used >= self.traffic_limit
    }
}

/// Node-wide kill switch that empties every inbound without touching users
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub enabled: bool,

    /// e.g. `quota_exceeded`, `subscription_expired`, `manual`
    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub enabled_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CircuitBreaker {
    pub fn engaged(reason: impl Into<String>, message: Option<String>) -> Self {
        Self {
            enabled: true,
            reason: reason.into(),
            enabled_at: Some(Utc::now()),
            message,
        }
    }
}

/// Protocol-wide settings shipped with the remote user list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListSettings {
    #[serde(default)]
    pub reality_sni: String,
}

/// Versioned user list as served by the remote manager
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserList {
    /// Opaque version token; equal tokens mean equal content
    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub users: Vec<User>,

    #[serde(default)]
    pub config: ListSettings,
}
