//! Agent configuration
//!
//! Loaded from TOML, then overridden by a handful of environment variables
//! so that provisioning scripts can inject credentials without editing files.

use edgewarden_protocol::{ManagementMode, Protocol};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Node identity and mode
    #[serde(default)]
    pub node: NodeConfig,

    /// Remote manager
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Supervised proxy subprocess
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Listener settings
    #[serde(default)]
    pub protocols: ProtocolsConfig,

    /// Local management API
    #[serde(default)]
    pub api: ApiConfig,

    /// Quota enforcement
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Default log filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            manager: ManagerConfig::default(),
            proxy: ProxyConfig::default(),
            protocols: ProtocolsConfig::default(),
            api: ApiConfig::default(),
            quota: QuotaConfig::default(),
            monitoring: MonitoringConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from `lookup`; empty values are ignored
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(key) = get("NODE_API_KEY") {
            self.node.api_key = key;
        }
        if let Some(id) = get("NODE_ID") {
            self.node.id = id;
        }
        if let Some(mode) = get("MANAGEMENT_MODE") {
            self.node.mode = mode;
        }
        if let Some(url) = get("MANAGER_URL") {
            self.manager.url = url;
        }
        if let Some(ip) = get("SERVER_IP") {
            self.node.server_ip = Some(ip);
        }
        if let Some(skip) = get("SKIP_PROXY") {
            self.proxy.skip_start = matches!(skip.as_str(), "1" | "true" | "yes");
        }
    }

    /// Reject configurations the agent cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "node.api_key (or NODE_API_KEY) is required".to_string(),
            ));
        }
        if self.management_mode().syncs_remote() && self.manager.url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "manager.url is required in remote and hybrid mode".to_string(),
            ));
        }

        if self.proxy.control_addr == self.proxy.stats_addr {
            return Err(ConfigError::Invalid(
                "proxy.control_addr and proxy.stats_addr must differ".to_string(),
            ));
        }

        let intervals = [
            ("manager.sync_interval_secs", self.manager.sync_interval_secs),
            ("manager.stats_interval_secs", self.manager.stats_interval_secs),
            ("manager.heartbeat_interval_secs", self.manager.heartbeat_interval_secs),
            ("manager.connections_interval_secs", self.manager.connections_interval_secs),
            ("quota.check_interval_secs", self.quota.check_interval_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    /// Parsed management mode; unknown values fall back to local
    pub fn management_mode(&self) -> ManagementMode {
        match self.node.mode.parse() {
            Ok(mode) => mode,
            Err(e) => {
                warn!("{}, falling back to local mode", e);
                ManagementMode::Local
            }
        }
    }
}

/// Node identity
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_id")]
    pub id: String,

    /// Bearer credential for the manager and the local API
    #[serde(default)]
    pub api_key: String,

    /// `local`, `remote` or `hybrid`
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Public address used in connection URLs and heartbeats
    #[serde(default)]
    pub server_ip: Option<String>,

    /// Directory for the local store, caches, spool, secrets and certs
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_node_id() -> String {
    "node-default".to_string()
}

fn default_mode() -> String {
    "local".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/edgewarden")
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            api_key: String::new(),
            mode: default_mode(),
            server_ip: None,
            data_dir: default_data_dir(),
        }
    }
}

/// Remote manager endpoints and cadences
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    #[serde(default)]
    pub url: String,

    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_connections_interval")]
    pub connections_interval_secs: u64,

    /// Certificate service; discovered from the manager when unset
    #[serde(default)]
    pub tls_service_url: Option<String>,

    /// Credential for the certificate service, defaults to the node key
    #[serde(default)]
    pub tls_service_key: Option<String>,
}

fn default_sync_interval() -> u64 {
    60
}

fn default_stats_interval() -> u64 {
    300
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_connections_interval() -> u64 {
    10
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            sync_interval_secs: default_sync_interval(),
            stats_interval_secs: default_stats_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            connections_interval_secs: default_connections_interval(),
            tls_service_url: None,
            tls_service_key: None,
        }
    }
}

impl ManagerConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn connections_interval(&self) -> Duration {
        Duration::from_secs(self.connections_interval_secs)
    }
}

/// Supervised subprocess
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_binary")]
    pub binary: PathBuf,

    /// Where the generated configuration is written
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,

    /// HTTP control API of the subprocess (sessions and per-user counters)
    #[serde(default = "default_control_addr")]
    pub control_addr: SocketAddr,

    /// gRPC stats API of the subprocess; must differ from `control_addr`
    #[serde(default = "default_stats_addr")]
    pub stats_addr: SocketAddr,

    /// Manage configuration only; never spawn the subprocess
    #[serde(default)]
    pub skip_start: bool,

    #[serde(default = "default_port_wait_timeout")]
    pub port_wait_timeout_secs: u64,

    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

fn default_binary() -> PathBuf {
    PathBuf::from("/usr/local/bin/sing-box")
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/sing-box/config.json")
}

fn default_control_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 10085))
}

fn default_stats_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 10086))
}

fn default_port_wait_timeout() -> u64 {
    30
}

fn default_stop_grace() -> u64 {
    5
}

fn default_max_restarts() -> u32 {
    5
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            config_path: default_config_path(),
            control_addr: default_control_addr(),
            stats_addr: default_stats_addr(),
            skip_start: false,
            port_wait_timeout_secs: default_port_wait_timeout(),
            stop_grace_secs: default_stop_grace(),
            max_restarts: default_max_restarts(),
        }
    }
}

/// Listener ports and protocol-wide settings
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolsConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_vless_port")]
    pub vless_port: u16,

    /// 0 = use the port assigned in the node secrets
    #[serde(default)]
    pub ss_port: u16,

    #[serde(default = "default_ss_method")]
    pub ss_method: String,

    /// TLS-bearing listeners, 0 = disabled
    #[serde(default)]
    pub vmess_port: u16,

    #[serde(default)]
    pub trojan_port: u16,

    #[serde(default)]
    pub hysteria2_port: u16,

    #[serde(default)]
    pub tuic_port: u16,

    /// Certificate domain; discovered from the manager when unset
    #[serde(default)]
    pub vpn_domain: Option<String>,

    /// Reality handshake target when the manager supplies none
    #[serde(default = "default_reality_sni")]
    pub reality_sni: String,
}

fn default_listen() -> String {
    "::".to_string()
}

fn default_vless_port() -> u16 {
    443
}

fn default_ss_method() -> String {
    "chacha20-ietf-poly1305".to_string()
}

fn default_reality_sni() -> String {
    "www.microsoft.com".to_string()
}

impl Default for ProtocolsConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            vless_port: default_vless_port(),
            ss_port: 0,
            ss_method: default_ss_method(),
            vmess_port: 0,
            trojan_port: 0,
            hysteria2_port: 0,
            tuic_port: 0,
            vpn_domain: None,
            reality_sni: default_reality_sni(),
        }
    }
}

impl ProtocolsConfig {
    /// Configured port for a TLS-bearing protocol
    pub fn tls_port(&self, protocol: Protocol) -> u16 {
        match protocol {
            Protocol::Vmess => self.vmess_port,
            Protocol::Trojan => self.trojan_port,
            Protocol::Hysteria2 => self.hysteria2_port,
            Protocol::Tuic => self.tuic_port,
            _ => 0,
        }
    }

    pub fn any_tls_port(&self) -> bool {
        Protocol::TLS.iter().any(|p| self.tls_port(*p) > 0)
    }
}

/// Local management API
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,

    #[serde(default = "default_api_bind")]
    pub bind: SocketAddr,

    /// IPs or host names allowed to call `/api/local`; empty allows all
    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    #[serde(default = "default_dns_refresh")]
    pub dns_refresh_secs: u64,
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_dns_refresh() -> u64 {
    300
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            bind: default_api_bind(),
            allowed_hosts: Vec::new(),
            dns_refresh_secs: default_dns_refresh(),
        }
    }
}

/// Quota enforcement
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_quota_interval")]
    pub check_interval_secs: u64,
}

fn default_quota_interval() -> u64 {
    10
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_quota_interval(),
        }
    }
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    /// Prometheus bind address
    #[serde(default = "default_prometheus_bind")]
    pub prometheus_bind: SocketAddr,

    /// Enable Prometheus metrics
    #[serde(default)]
    pub prometheus_enabled: bool,
}

fn default_prometheus_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            prometheus_bind: default_prometheus_bind(),
            prometheus_enabled: false,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
