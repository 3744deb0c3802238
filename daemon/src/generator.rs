//! Proxy configuration generation
//!
//! A pure transform from the effective user list and the node's protocol
//! capabilities to the document the proxy subprocess consumes. Writing the
//! result to disk is the caller's concern.

use crate::config::DaemonConfig;
use edgewarden_crypto::NodeSecrets;
use edgewarden_protocol::{Protocol, User};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use uuid::Uuid;

const VLESS_FLOW: &str = "xtls-rprx-vision";
const TUIC_CONGESTION: &str = "bbr";
const REALITY_HANDSHAKE_PORT: u16 = 443;

/// What this node can listen on, independent of any user list
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolSettings {
    pub listen: String,
    pub vless_port: u16,
    pub ss_port: u16,
    pub ss_method: String,
    pub vmess_port: u16,
    pub trojan_port: u16,
    pub hysteria2_port: u16,
    pub tuic_port: u16,
    /// Reality private key
    pub private_key: String,
    pub short_ids: Vec<String>,
    /// Reality handshake target when the user list carries none
    pub default_sni: String,
    /// Subprocess HTTP control API
    pub control_addr: SocketAddr,
    /// Subprocess gRPC stats API
    pub stats_addr: SocketAddr,
}

impl ProtocolSettings {
    /// Derive settings from configuration and node secrets
    pub fn from_config(config: &DaemonConfig, secrets: &NodeSecrets) -> Self {
        let p = &config.protocols;
        Self {
            listen: p.listen.clone(),
            vless_port: p.vless_port,
            ss_port: if p.ss_port > 0 { p.ss_port } else { secrets.ss_port },
            ss_method: p.ss_method.clone(),
            vmess_port: p.vmess_port,
            trojan_port: p.trojan_port,
            hysteria2_port: p.hysteria2_port,
            tuic_port: p.tuic_port,
            private_key: secrets.private_key.clone(),
            short_ids: secrets.short_ids.clone(),
            default_sni: p.reality_sni.clone(),
            control_addr: config.proxy.control_addr,
            stats_addr: config.proxy.stats_addr,
        }
    }

    pub fn port(&self, protocol: Protocol) -> u16 {
        match protocol {
            Protocol::Vless => self.vless_port,
            Protocol::Shadowsocks => self.ss_port,
            Protocol::Vmess => self.vmess_port,
            Protocol::Trojan => self.trojan_port,
            Protocol::Hysteria2 => self.hysteria2_port,
            Protocol::Tuic => self.tuic_port,
            Protocol::Unknown => 0,
        }
    }

    /// Listeners to emit this cycle, in order.
    ///
    /// The primary and secondary protocols are always present. TLS-bearing
    /// protocols need a non-zero port and certificate material.
    pub fn active_protocols(&self, tls_available: bool) -> Vec<Protocol> {
        Protocol::ALL
            .into_iter()
            .filter(|p| {
                if p.requires_tls() {
                    tls_available && self.port(*p) > 0
                } else {
                    true
                }
            })
            .collect()
    }

    pub fn any_tls_port(&self) -> bool {
        Protocol::TLS.iter().any(|p| self.port(*p) > 0)
    }
}

/// Certificate material for the TLS-bearing listeners
#[derive(Debug, Clone, PartialEq)]
pub struct TlsMaterial {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub server_name: String,
}

/// Inputs that vary per generation cycle
#[derive(Debug, Clone, Copy)]
pub struct GenerateRequest<'a> {
    pub users: &'a [User],
    /// Empty falls back to [`ProtocolSettings::default_sni`]
    pub reality_sni: &'a str,
    pub circuit_breaker: bool,
    pub tls: Option<&'a TlsMaterial>,
}

/// Generated subprocess configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyDocument {
    pub log: LogBlock,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    pub experimental: Experimental,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogBlock {
    pub level: String,
    pub timestamp: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    #[serde(rename = "type")]
    pub kind: Protocol,
    pub tag: String,
    pub listen: String,
    pub listen_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<InboundTls>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub congestion_control: Option<String>,
    /// Always serialized, empty lists keep the listener bound
    pub users: Vec<InboundUser>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundTls {
    pub enabled: bool,
    pub server_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reality: Option<Reality>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reality {
    pub enabled: bool,
    pub handshake: Handshake,
    pub private_key: String,
    pub short_id: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub server: String,
    pub server_port: u16,
}

/// Credential entry; `name` carries the user UUID so sessions are tagged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundUser {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
}

impl InboundUser {
    fn for_protocol(protocol: Protocol, user: &User) -> Self {
        let name = user.uuid.to_string();
        let (uuid, password, flow) = match protocol {
            Protocol::Vless => (Some(user.uuid), None, Some(VLESS_FLOW.to_string())),
            Protocol::Shadowsocks => (None, Some(user.ss_password.clone()), None),
            Protocol::Vmess => (Some(user.uuid), None, None),
            Protocol::Trojan | Protocol::Hysteria2 => (None, Some(name.clone()), None),
            Protocol::Tuic => (Some(user.uuid), Some(user.ss_password.clone()), None),
            Protocol::Unknown => (None, None, None),
        };
        Self {
            name,
            uuid,
            password,
            flow,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outbound {
    #[serde(rename = "type")]
    pub kind: String,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experimental {
    pub v2ray_api: V2RayApi,
    pub clash_api: ClashApi,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V2RayApi {
    pub listen: String,
    pub stats: StatsBlock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsBlock {
    pub enabled: bool,
    /// Every active user exactly once, whatever their protocols
    pub users: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClashApi {
    pub external_controller: String,
}

impl ProxyDocument {
    pub fn inbound(&self, protocol: Protocol) -> Option<&Inbound> {
        self.inbounds.iter().find(|i| i.kind == protocol)
    }

    pub fn stats_users(&self) -> &[Uuid] {
        &self.experimental.v2ray_api.stats.users
    }

    /// Number of users with at least one credential entry
    pub fn active_user_count(&self) -> usize {
        self.stats_users().len()
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }
}

/// Build the subprocess configuration.
///
/// Deterministic for identical inputs. Disabled users and users with no
/// known protocol are skipped; with the circuit breaker engaged every
/// listener is emitted with an empty user list.
pub fn generate(settings: &ProtocolSettings, req: GenerateRequest<'_>) -> ProxyDocument {
    let protocols = settings.active_protocols(req.tls.is_some());
    let mut credentials: Vec<Vec<InboundUser>> = vec![Vec::new(); protocols.len()];
    let mut stats_users = Vec::new();
    let mut seen = HashSet::new();

    if !req.circuit_breaker {
        for user in req.users {
            if !user.is_active() || !seen.insert(user.uuid) {
                continue;
            }
            stats_users.push(user.uuid);

            for protocol in user.known_protocols() {
                if let Some(idx) = protocols.iter().position(|p| *p == protocol) {
                    credentials[idx].push(InboundUser::for_protocol(protocol, user));
                }
            }
        }
    }

    let sni = if req.reality_sni.is_empty() {
        settings.default_sni.as_str()
    } else {
        req.reality_sni
    };

    let inbounds = protocols
        .into_iter()
        .zip(credentials)
        .map(|(protocol, users)| build_inbound(settings, protocol, users, sni, req.tls))
        .collect();

    ProxyDocument {
        log: LogBlock {
            level: "info".to_string(),
            timestamp: true,
        },
        inbounds,
        outbounds: vec![Outbound {
            kind: "direct".to_string(),
            tag: "direct".to_string(),
        }],
        experimental: Experimental {
            v2ray_api: V2RayApi {
                listen: settings.stats_addr.to_string(),
                stats: StatsBlock {
                    enabled: true,
                    users: stats_users,
                },
            },
            clash_api: ClashApi {
                external_controller: settings.control_addr.to_string(),
            },
        },
    }
}

fn build_inbound(
    settings: &ProtocolSettings,
    protocol: Protocol,
    users: Vec<InboundUser>,
    sni: &str,
    tls: Option<&TlsMaterial>,
) -> Inbound {
    let tls_block = match protocol {
        Protocol::Vless => Some(InboundTls {
            enabled: true,
            server_name: sni.to_string(),
            certificate_path: None,
            key_path: None,
            reality: Some(Reality {
                enabled: true,
                handshake: Handshake {
                    server: sni.to_string(),
                    server_port: REALITY_HANDSHAKE_PORT,
                },
                private_key: settings.private_key.clone(),
                short_id: settings.short_ids.clone(),
            }),
        }),
        p if p.requires_tls() => tls.map(|m| InboundTls {
            enabled: true,
            server_name: m.server_name.clone(),
            certificate_path: Some(m.cert_path.clone()),
            key_path: Some(m.key_path.clone()),
            reality: None,
        }),
        _ => None,
    };

    Inbound {
        kind: protocol,
        tag: protocol.inbound_tag().to_string(),
        listen: settings.listen.clone(),
        listen_port: settings.port(protocol),
        method: (protocol == Protocol::Shadowsocks).then(|| settings.ss_method.clone()),
        tls: tls_block,
        congestion_control: (protocol == Protocol::Tuic).then(|| TUIC_CONGESTION.to_string()),
        users,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ProtocolSettings {
        ProtocolSettings {
            listen: "::".into(),
            vless_port: 443,
            ss_port: 8388,
            ss_method: "chacha20-ietf-poly1305".into(),
            vmess_port: 8443,
            trojan_port: 8444,
            hysteria2_port: 0,
            tuic_port: 8446,
            private_key: "priv".into(),
            short_ids: vec!["abcd".into()],
            default_sni: "www.example.com".into(),
            control_addr: "127.0.0.1:10085".parse().unwrap(),
            stats_addr: "127.0.0.1:10086".parse().unwrap(),
        }
    }

    fn tls() -> TlsMaterial {
        TlsMaterial {
            cert_path: "/data/certs/cert.pem".into(),
            key_path: "/data/certs/key.pem".into(),
            server_name: "vpn.example.com".into(),
        }
    }

    fn user(protocols: &[Protocol]) -> User {
        User::new(Uuid::new_v4(), protocols.to_vec(), "sspw")
    }

    fn request(users: &[User]) -> GenerateRequest<'_> {
        GenerateRequest {
            users,
            reality_sni: "",
            circuit_breaker: false,
            tls: None,
        }
    }

    fn inbound_names(doc: &ProxyDocument, protocol: Protocol) -> Vec<String> {
        doc.inbound(protocol)
            .map(|i| i.users.iter().map(|u| u.name.clone()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_control_listeners_are_separate() {
        let doc = generate(&settings(), request(&[]));
        let json: serde_json::Value = serde_json::from_slice(&doc.to_json().unwrap()).unwrap();

        let stats = &json["experimental"]["v2ray_api"]["listen"];
        let controller = &json["experimental"]["clash_api"]["external_controller"];
        assert_eq!(stats, "127.0.0.1:10086");
        assert_eq!(controller, "127.0.0.1:10085");
        assert_ne!(stats, controller);
    }

    #[test]
    fn test_listeners_without_users() {
        let doc = generate(&settings(), request(&[]));

        let kinds: Vec<_> = doc.inbounds.iter().map(|i| i.kind).collect();
        assert_eq!(kinds, vec![Protocol::Vless, Protocol::Shadowsocks]);
        assert!(doc.inbounds.iter().all(|i| i.users.is_empty()));
        assert!(doc.stats_users().is_empty());

        let json: serde_json::Value = serde_json::from_slice(&doc.to_json().unwrap()).unwrap();
        assert_eq!(json["inbounds"][0]["users"], serde_json::json!([]));
        assert_eq!(json["inbounds"][1]["method"], "chacha20-ietf-poly1305");
    }

    #[test]
    fn test_tls_listeners_need_material() {
        let material = tls();
        let doc = generate(
            &settings(),
            GenerateRequest {
                tls: Some(&material),
                ..request(&[])
            },
        );

        let kinds: Vec<_> = doc.inbounds.iter().map(|i| i.kind).collect();
        // hysteria2 has no port configured
        assert_eq!(
            kinds,
            vec![
                Protocol::Vless,
                Protocol::Shadowsocks,
                Protocol::Vmess,
                Protocol::Trojan,
                Protocol::Tuic
            ]
        );
        let trojan = doc.inbound(Protocol::Trojan).unwrap();
        let trojan_tls = trojan.tls.as_ref().unwrap();
        assert_eq!(trojan_tls.server_name, "vpn.example.com");
        assert_eq!(trojan_tls.key_path, Some(PathBuf::from("/data/certs/key.pem")));
        assert_eq!(
            doc.inbound(Protocol::Tuic).unwrap().congestion_control.as_deref(),
            Some("bbr")
        );
    }

    #[test]
    fn test_credentials_per_protocol() {
        let material = tls();
        let u = user(&[Protocol::Vless, Protocol::Shadowsocks, Protocol::Trojan, Protocol::Tuic]);
        let doc = generate(
            &settings(),
            GenerateRequest {
                tls: Some(&material),
                ..request(std::slice::from_ref(&u))
            },
        );

        let vless = &doc.inbound(Protocol::Vless).unwrap().users[0];
        assert_eq!(vless.uuid, Some(u.uuid));
        assert_eq!(vless.flow.as_deref(), Some("xtls-rprx-vision"));

        let ss = &doc.inbound(Protocol::Shadowsocks).unwrap().users[0];
        assert_eq!(ss.password.as_deref(), Some("sspw"));
        assert_eq!(ss.name, u.uuid.to_string());

        let trojan = &doc.inbound(Protocol::Trojan).unwrap().users[0];
        assert_eq!(trojan.password, Some(u.uuid.to_string()));

        let tuic = &doc.inbound(Protocol::Tuic).unwrap().users[0];
        assert_eq!(tuic.uuid, Some(u.uuid));
        assert_eq!(tuic.password.as_deref(), Some("sspw"));

        assert!(doc.inbound(Protocol::Vmess).unwrap().users.is_empty());
    }

    #[test]
    fn test_stats_list_invariant() {
        let active = user(&[Protocol::Shadowsocks]);
        let tls_only = user(&[Protocol::Trojan]);
        let mut disabled = user(&[Protocol::Vless]);
        disabled.enabled = false;
        let no_protocols = user(&[]);
        let unknown_only = user(&[Protocol::Unknown]);
        let users = vec![
            active.clone(),
            tls_only.clone(),
            disabled.clone(),
            no_protocols,
            unknown_only,
            active.clone(),
        ];

        let doc = generate(&settings(), request(&users));

        // counted for stats even though its listener is down this cycle
        assert_eq!(doc.stats_users(), &[active.uuid, tls_only.uuid]);

        let stats: HashSet<_> = doc.stats_users().iter().map(Uuid::to_string).collect();
        for inbound in &doc.inbounds {
            for entry in &inbound.users {
                assert!(stats.contains(&entry.name));
                assert_ne!(entry.name, disabled.uuid.to_string());
            }
        }
        assert_eq!(inbound_names(&doc, Protocol::Shadowsocks).len(), 1);
    }

    #[test]
    fn test_circuit_breaker_empties_lists() {
        let users: Vec<_> = (0..5)
            .map(|_| user(&[Protocol::Vless, Protocol::Shadowsocks]))
            .collect();

        let broken = generate(
            &settings(),
            GenerateRequest {
                circuit_breaker: true,
                ..request(&users)
            },
        );
        assert_eq!(broken.inbounds.len(), 2);
        assert!(broken.inbounds.iter().all(|i| i.users.is_empty()));
        assert!(broken.stats_users().is_empty());

        let restored = generate(&settings(), request(&users));
        assert_eq!(restored.active_user_count(), 5);
        assert_eq!(inbound_names(&restored, Protocol::Vless).len(), 5);
    }

    #[test]
    fn test_reality_sni_fallback() {
        let doc = generate(&settings(), request(&[]));
        let reality = doc.inbounds[0].tls.as_ref().unwrap().reality.as_ref().unwrap();
        assert_eq!(reality.handshake.server, "www.example.com");
        assert_eq!(reality.short_id, vec!["abcd".to_string()]);

        let doc = generate(
            &settings(),
            GenerateRequest {
                reality_sni: "cdn.example.org",
                ..request(&[])
            },
        );
        assert_eq!(doc.inbounds[0].tls.as_ref().unwrap().server_name, "cdn.example.org");
    }

    #[test]
    fn test_deterministic() {
        let users: Vec<_> = (0..3).map(|_| user(&[Protocol::Vless])).collect();
        let a = generate(&settings(), request(&users)).to_json().unwrap();
        let b = generate(&settings(), request(&users)).to_json().unwrap();
        assert_eq!(a, b);
    }
}
