//! Prometheus metrics

use crate::config::MonitoringConfig;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::LazyLock;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Global metrics registry
static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::new);

/// Process-wide metric handles
pub fn metrics() -> &'static Metrics {
    &METRICS
}

/// Metrics struct
pub struct Metrics {
    // Counters
    /// Remote sync outcomes: ok, unchanged, failed
    pub syncs: IntCounterVec,
    pub applies: IntCounter,
    pub apply_failures: IntCounter,
    pub reloads: IntCounter,
    pub crash_restarts: IntCounter,
    /// Evictions by reason: expired, quota_exceeded, remote
    pub evictions: IntCounterVec,
    pub kicked_sessions: IntCounter,
    pub spooled_reports: IntCounter,
    pub reported_bytes: IntCounter,

    // Gauges
    pub proxy_running: IntGauge,
    pub effective_users: IntGauge,
    pub monitored_users: IntGauge,
    pub circuit_breaker: IntGauge,

    // Histograms
    pub apply_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let syncs = IntCounterVec::new(
            Opts::new("edgewarden_syncs_total", "Remote user list syncs by outcome"),
            &["outcome"],
        )
        .unwrap();

        let applies = IntCounter::with_opts(Opts::new(
            "edgewarden_applies_total",
            "Proxy configurations written",
        ))
        .unwrap();

        let apply_failures = IntCounter::with_opts(Opts::new(
            "edgewarden_apply_failures_total",
            "Failed configuration applies",
        ))
        .unwrap();

        let reloads = IntCounter::with_opts(Opts::new(
            "edgewarden_reloads_total",
            "Proxy reloads",
        ))
        .unwrap();

        let crash_restarts = IntCounter::with_opts(Opts::new(
            "edgewarden_crash_restarts_total",
            "Automatic restarts after a proxy crash",
        ))
        .unwrap();

        let evictions = IntCounterVec::new(
            Opts::new("edgewarden_evictions_total", "User evictions by reason"),
            &["reason"],
        )
        .unwrap();

        let kicked_sessions = IntCounter::with_opts(Opts::new(
            "edgewarden_kicked_sessions_total",
            "Proxy sessions closed through the control API",
        ))
        .unwrap();

        let spooled_reports = IntCounter::with_opts(Opts::new(
            "edgewarden_spooled_reports_total",
            "Stats reports written to the offline spool",
        ))
        .unwrap();

        let reported_bytes = IntCounter::with_opts(Opts::new(
            "edgewarden_reported_bytes_total",
            "Traffic bytes accounted (upload plus download)",
        ))
        .unwrap();

        let proxy_running = IntGauge::with_opts(Opts::new(
            "edgewarden_proxy_running",
            "1 when the proxy subprocess is running",
        ))
        .unwrap();

        let effective_users = IntGauge::with_opts(Opts::new(
            "edgewarden_effective_users",
            "Users in the last applied configuration",
        ))
        .unwrap();

        let monitored_users = IntGauge::with_opts(Opts::new(
            "edgewarden_monitored_users",
            "Users tracked by the quota monitor",
        ))
        .unwrap();

        let circuit_breaker = IntGauge::with_opts(Opts::new(
            "edgewarden_circuit_breaker",
            "1 when the local circuit breaker is engaged",
        ))
        .unwrap();

        let apply_duration = Histogram::with_opts(HistogramOpts::new(
            "edgewarden_apply_duration_seconds",
            "Time to generate, write and reload a configuration",
        ))
        .unwrap();

        // Register metrics
        REGISTRY.register(Box::new(syncs.clone())).ok();
        REGISTRY.register(Box::new(applies.clone())).ok();
        REGISTRY.register(Box::new(apply_failures.clone())).ok();
        REGISTRY.register(Box::new(reloads.clone())).ok();
        REGISTRY.register(Box::new(crash_restarts.clone())).ok();
        REGISTRY.register(Box::new(evictions.clone())).ok();
        REGISTRY.register(Box::new(kicked_sessions.clone())).ok();
        REGISTRY.register(Box::new(spooled_reports.clone())).ok();
        REGISTRY.register(Box::new(reported_bytes.clone())).ok();
        REGISTRY.register(Box::new(proxy_running.clone())).ok();
        REGISTRY.register(Box::new(effective_users.clone())).ok();
        REGISTRY.register(Box::new(monitored_users.clone())).ok();
        REGISTRY.register(Box::new(circuit_breaker.clone())).ok();
        REGISTRY.register(Box::new(apply_duration.clone())).ok();

        Self {
            syncs,
            applies,
            apply_failures,
            reloads,
            crash_restarts,
            evictions,
            kicked_sessions,
            spooled_reports,
            reported_bytes,
            proxy_running,
            effective_users,
            monitored_users,
            circuit_breaker,
            apply_duration,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Text exposition of everything registered
pub fn render() -> Vec<u8> {
    use prometheus::Encoder;

    LazyLock::force(&METRICS);
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    buffer
}

/// Start the metrics server
pub fn start_server(config: &MonitoringConfig) -> JoinHandle<()> {
    let bind = config.prometheus_bind;
    let enabled = config.prometheus_enabled;

    tokio::spawn(async move {
        if !enabled {
            info!("Prometheus metrics disabled");
            return;
        }

        use bytes::Bytes;
        use http_body_util::Full;
        use hyper::{Response, server::conn::http1, service::service_fn};
        use hyper_util::rt::TokioIo;

        let listener = match tokio::net::TcpListener::bind(bind).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind metrics server: {}", e);
                return;
            }
        };

        info!("Prometheus metrics server listening on {}", bind);

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(r) => r,
                Err(e) => {
                    error!("Metrics accept error: {}", e);
                    continue;
                }
            };

            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = service_fn(|_req| async {
                    let mut response = Response::new(Full::new(Bytes::from(render())));
                    response.headers_mut().insert(
                        hyper::header::CONTENT_TYPE,
                        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
                    );
                    Ok::<_, std::convert::Infallible>(response)
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Metrics connection error: {}", e);
                }
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_metrics() {
        metrics().syncs.with_label_values(&["ok"]).inc();
        metrics().evictions.with_label_values(&["expired"]).inc();

        let text = String::from_utf8(render()).unwrap();
        assert!(text.contains("edgewarden_syncs_total"));
        assert!(text.contains("edgewarden_evictions_total"));
        assert!(text.contains("edgewarden_proxy_running"));
    }
}
