//! Local API authentication
//!
//! Requests pass the IP allow-list first, then the bearer check. An empty
//! allow-list admits every address.

use crate::management::ApiError;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Request, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Allowed client addresses; entries may be IPs or host names
#[derive(Debug, Default)]
pub struct AllowList {
    entries: Vec<String>,
    resolved: RwLock<HashSet<IpAddr>>,
}

impl AllowList {
    pub fn new(entries: impl IntoIterator<Item = String>) -> Self {
        let entries: Vec<String> = entries
            .into_iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();

        let literal = entries
            .iter()
            .filter_map(|e| e.parse::<IpAddr>().ok())
            .collect();

        Self {
            entries,
            resolved: RwLock::new(literal),
        }
    }

    /// No entries: everyone is allowed
    pub fn is_open(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        self.is_open() || self.resolved.read().contains(&ip.to_canonical())
    }

    /// Re-resolve every entry; a failed lookup keeps nothing for that name
    pub async fn refresh(&self) -> usize {
        let mut next = HashSet::new();

        for entry in &self.entries {
            if let Ok(ip) = entry.parse::<IpAddr>() {
                next.insert(ip);
                continue;
            }
            match tokio::net::lookup_host((entry.as_str(), 0)).await {
                Ok(addrs) => {
                    let before = next.len();
                    next.extend(addrs.map(|a| a.ip().to_canonical()));
                    debug!("Resolved {} to {} addresses", entry, next.len() - before);
                }
                Err(e) => warn!("Failed to resolve allowed host {}: {}", entry, e),
            }
        }

        let count = next.len();
        *self.resolved.write() = next;
        count
    }

    /// Periodic DNS refresh until shutdown
    pub fn spawn_refresh(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = ticker.tick() => {
                        let count = self.refresh().await;
                        debug!("Allow-list refreshed, {} addresses", count);
                    }
                }
            }
        })
    }
}

/// Shared state of the auth middleware
#[derive(Clone)]
pub struct ApiAuth {
    api_key: Arc<str>,
    allow: Arc<AllowList>,
}

impl ApiAuth {
    pub fn new(api_key: &str, allow: Arc<AllowList>) -> Self {
        if allow.is_open() {
            info!("Local API allow-list empty, accepting any address");
        }
        Self {
            api_key: Arc::from(api_key),
            allow,
        }
    }

    pub fn check(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Result<(), ApiError> {
        if !self.allow.is_open() {
            let ip = client_ip(headers, peer);
            if !ip.is_some_and(|ip| self.allow.allows(ip)) {
                warn!("Blocked local API request from {:?}", ip);
                return Err(ApiError::Forbidden("ip not allowed".into()));
            }
        }

        let value = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("missing authorization header".into()))?;

        let token = match value.split_once(' ') {
            Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => token.trim(),
            _ => {
                return Err(ApiError::Unauthorized(
                    "invalid authorization format".into(),
                ));
            }
        };

        if !constant_time_eq(token.as_bytes(), self.api_key.as_bytes()) {
            return Err(ApiError::Unauthorized("invalid api key".into()));
        }
        Ok(())
    }
}

/// X-Real-IP, then the first X-Forwarded-For hop, then the peer
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    let header_ip = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    };

    header_ip("x-real-ip")
        .or_else(|| header_ip("x-forwarded-for"))
        .or_else(|| peer.map(|p| p.ip()))
        .map(|ip| ip.to_canonical())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub async fn require_auth(
    State(auth): State<ApiAuth>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0);

    match auth.check(req.headers(), peer) {
        Ok(()) => next.run(req).await,
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    fn peer() -> Option<SocketAddr> {
        Some("192.0.2.50:40000".parse().unwrap())
    }

    #[test]
    fn test_client_ip_precedence() {
        let h = headers(&[
            ("x-real-ip", "198.51.100.1"),
            ("x-forwarded-for", "203.0.113.7, 10.0.0.1"),
        ]);
        assert_eq!(client_ip(&h, peer()), Some("198.51.100.1".parse().unwrap()));

        let h = headers(&[("x-forwarded-for", "203.0.113.7, 10.0.0.1")]);
        assert_eq!(client_ip(&h, peer()), Some("203.0.113.7".parse().unwrap()));

        assert_eq!(client_ip(&HeaderMap::new(), peer()), Some("192.0.2.50".parse().unwrap()));
        assert_eq!(client_ip(&HeaderMap::new(), None), None);
    }

    #[test]
    fn test_bearer_check() {
        let auth = ApiAuth::new("secret", Arc::new(AllowList::default()));

        assert!(auth.check(&headers(&[("authorization", "Bearer secret")]), peer()).is_ok());
        assert!(auth.check(&headers(&[("authorization", "bearer secret")]), peer()).is_ok());
        assert!(matches!(
            auth.check(&HeaderMap::new(), peer()),
            Err(ApiError::Unauthorized(_))
        ));
        assert!(matches!(
            auth.check(&headers(&[("authorization", "Basic secret")]), peer()),
            Err(ApiError::Unauthorized(_))
        ));
        assert!(matches!(
            auth.check(&headers(&[("authorization", "Bearer wrong")]), peer()),
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_allow_list_checked_before_token() {
        let allow = Arc::new(AllowList::new(["198.51.100.1".to_string()]));
        let auth = ApiAuth::new("secret", allow);

        let blocked = headers(&[("authorization", "Bearer secret")]);
        assert!(matches!(
            auth.check(&blocked, peer()),
            Err(ApiError::Forbidden(_))
        ));

        let allowed = headers(&[("authorization", "Bearer wrong"), ("x-real-ip", "198.51.100.1")]);
        assert!(matches!(
            auth.check(&allowed, peer()),
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_allow_list_resolves_names() {
        let allow = AllowList::new(["localhost".to_string(), " ".to_string(), "10.1.2.3".to_string()]);
        assert!(!allow.is_open());
        assert!(allow.allows("10.1.2.3".parse().unwrap()));
        assert!(!allow.allows("127.0.0.1".parse().unwrap()));

        allow.refresh().await;
        assert!(allow.allows("127.0.0.1".parse().unwrap()));
        assert!(allow.allows("10.1.2.3".parse().unwrap()));
        assert!(allow.allows("::ffff:10.1.2.3".parse().unwrap()));
    }
}
