//! Heartbeat load snapshot

use edgewarden_protocol::NodeLoad;
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use sysinfo::System;
use tracing::debug;

const PUBLIC_IP_TTL: Duration = Duration::from_secs(300);
const ECHO_TIMEOUT: Duration = Duration::from_secs(5);

/// IPv4-only echo services, tried in order
pub const ECHO_SERVICES: &[&str] = &[
    "https://api.ipify.org",
    "https://ipv4.icanhazip.com",
    "https://v4.ident.me",
];

/// Public IPv4 lookup with a short-lived cache
pub struct PublicIp {
    configured: Option<String>,
    services: Vec<String>,
    client: reqwest::Client,
    cached: Mutex<Option<(String, Instant)>>,
}

impl PublicIp {
    pub fn new(configured: Option<String>) -> Self {
        Self::with_services(
            configured,
            ECHO_SERVICES.iter().map(|s| s.to_string()).collect(),
        )
    }

    pub fn with_services(configured: Option<String>, services: Vec<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(ECHO_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            configured: configured.filter(|s| !s.is_empty()),
            services,
            client,
            cached: Mutex::new(None),
        }
    }

    /// Configured address, else a cached or freshly discovered one
    pub async fn get(&self) -> Option<String> {
        if let Some(ip) = &self.configured {
            return Some(ip.clone());
        }

        if let Some((ip, at)) = self.cached.lock().as_ref() {
            if at.elapsed() < PUBLIC_IP_TTL {
                return Some(ip.clone());
            }
        }

        let ip = self.discover().await?;
        *self.cached.lock() = Some((ip.clone(), Instant::now()));
        Some(ip)
    }

    async fn discover(&self) -> Option<String> {
        for url in &self.services {
            let body = match self.client.get(url).send().await {
                Ok(resp) => match resp.text().await {
                    Ok(body) => body,
                    Err(e) => {
                        debug!("Public IP lookup via {} failed: {}", url, e);
                        continue;
                    }
                },
                Err(e) => {
                    debug!("Public IP lookup via {} failed: {}", url, e);
                    continue;
                }
            };

            if let Ok(ip) = body.trim().parse::<Ipv4Addr>() {
                return Some(ip.to_string());
            }
        }
        None
    }
}

/// CPU and memory sampling for heartbeats
pub struct LoadSampler {
    sys: Mutex<System>,
    public_ip: PublicIp,
}

impl LoadSampler {
    pub fn new(public_ip: PublicIp) -> Self {
        Self {
            sys: Mutex::new(System::new()),
            public_ip,
        }
    }

    /// Current load; bandwidth is not measured and reported as zero
    pub async fn sample(&self, active_connections: usize, user_count: usize) -> NodeLoad {
        let (cpu_percent, memory_percent) = {
            let mut sys = self.sys.lock();
            sys.refresh_memory();
            sys.refresh_cpu_usage();

            let cpus = sys.cpus();
            let cpu = if cpus.is_empty() {
                0.0
            } else {
                cpus.iter().map(|c| f64::from(c.cpu_usage())).sum::<f64>() / cpus.len() as f64
            };
            let memory = match sys.total_memory() {
                0 => 0.0,
                total => sys.used_memory() as f64 / total as f64 * 100.0,
            };
            (cpu, memory)
        };

        NodeLoad {
            cpu_percent,
            memory_percent,
            bandwidth_mbps: 0,
            active_connections,
            user_count,
            public_ip: self.public_ip.get().await,
        }
    }
}
