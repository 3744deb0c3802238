//! Traffic accounting and upstream reporting
//!
//! The subprocess's per-user counters are the single source of byte
//! attribution. The quota tick reads them, parks the deltas in a ledger and
//! feeds them to the quota monitor; the stats tick drains the ledger into the
//! local store and the remote collector, spooling batches the collector
//! could not take.

use crate::connections::{ControlClient, ControlError, TrafficDelta};
use crate::manager::{ManagerClient, ManagerError};
use crate::metrics::metrics;
use crate::quota::QuotaMonitor;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use edgewarden_protocol::{StatsEntry, StatsReport};
use edgewarden_storage::{LocalStore, StatsSpool};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Deltas collected but not yet flushed
#[derive(Debug, Default)]
pub struct TrafficLedger {
    pending: DashMap<Uuid, TrafficDelta>,
}

impl TrafficLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, uuid: Uuid, delta: TrafficDelta) {
        let mut entry = self.pending.entry(uuid).or_default();
        entry.upload = entry.upload.saturating_add(delta.upload);
        entry.download = entry.download.saturating_add(delta.download);
    }

    /// Take everything pending
    pub fn drain(&self) -> HashMap<Uuid, TrafficDelta> {
        let keys: Vec<Uuid> = self.pending.iter().map(|e| *e.key()).collect();
        keys.into_iter()
            .filter_map(|k| self.pending.remove(&k))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Where stats batches go
#[async_trait]
pub trait StatsSink: Send + Sync {
    async fn report_stats(&self, report: &StatsReport) -> Result<(), ManagerError>;
}

#[async_trait]
impl StatsSink for ManagerClient {
    async fn report_stats(&self, report: &StatsReport) -> Result<(), ManagerError> {
        ManagerClient::report_stats(self, report).await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub users: usize,
    pub bytes: u64,
    pub reported: bool,
    pub spooled: bool,
    pub replayed: usize,
}

pub struct StatsPipeline {
    control: ControlClient,
    ledger: TrafficLedger,
    monitor: Arc<QuotaMonitor>,
    local: Option<Arc<LocalStore>>,
    sink: Option<Arc<dyn StatsSink>>,
    spool: StatsSpool,
}

impl StatsPipeline {
    pub fn new(
        control: ControlClient,
        monitor: Arc<QuotaMonitor>,
        local: Option<Arc<LocalStore>>,
        sink: Option<Arc<dyn StatsSink>>,
        spool: StatsSpool,
    ) -> Self {
        Self {
            control,
            ledger: TrafficLedger::new(),
            monitor,
            local,
            sink,
            spool,
        }
    }

    pub fn ledger(&self) -> &TrafficLedger {
        &self.ledger
    }

    /// Read counter deltas and run the quota check for each user that moved
    pub async fn collect(&self) -> Result<usize, ControlError> {
        let deltas = self.control.user_traffic().await?;

        for (uuid, delta) in &deltas {
            self.ledger.record(*uuid, *delta);
            if !self.monitor.check_user(uuid, delta.total()) {
                debug!("User {} no longer allowed after {} bytes", uuid, delta.total());
            }
        }
        Ok(deltas.len())
    }

    /// Quota tick: collect, then sweep for expiry
    pub async fn quota_tick(&self) {
        match self.collect().await {
            Ok(0) => {}
            Ok(n) => debug!("Collected traffic for {} users", n),
            Err(e) => debug!("Traffic collection failed: {}", e),
        }

        let expired = self.monitor.check_all_users();
        if expired > 0 {
            info!("Expiry sweep evicted {} users", expired);
        }
    }

    /// Stats tick: fold pending traffic into storage and report it upstream
    pub async fn flush(&self) -> FlushOutcome {
        let batch = self.ledger.drain();
        let mut outcome = FlushOutcome {
            users: batch.len(),
            bytes: batch.values().map(TrafficDelta::total).sum(),
            ..Default::default()
        };

        if let Some(store) = &self.local {
            let totals: HashMap<Uuid, u64> = batch
                .iter()
                .map(|(uuid, d)| (*uuid, d.total()))
                .filter(|(_, total)| *total > 0)
                .collect();
            if !totals.is_empty() {
                let store = Arc::clone(store);
                match tokio::task::spawn_blocking(move || store.record_traffic(&totals)).await {
                    Ok(Ok(n)) => debug!("Recorded traffic for {} local users", n),
                    Ok(Err(e)) => warn!("Failed to record local traffic: {}", e),
                    Err(e) => warn!("Local traffic task failed: {}", e),
                }
            }
        }

        if let Some(sink) = &self.sink {
            let deliver = if batch.is_empty() {
                true
            } else {
                let report = build_report(&batch);
                match sink.report_stats(&report).await {
                    Ok(()) => {
                        outcome.reported = true;
                        true
                    }
                    Err(e) => {
                        warn!("Stats report failed, spooling: {}", e);
                        match self.spool.push(&report).await {
                            Ok(path) => {
                                outcome.spooled = true;
                                metrics().spooled_reports.inc();
                                debug!("Spooled stats batch to {}", path.display());
                            }
                            Err(e) => warn!("Failed to spool stats batch: {}", e),
                        }
                        false
                    }
                }
            };

            if deliver {
                outcome.replayed = self.replay(sink).await;
            }
        }

        metrics().reported_bytes.inc_by(outcome.bytes);
        self.monitor.commit_session_traffic();
        outcome
    }

    async fn replay(&self, sink: &Arc<dyn StatsSink>) -> usize {
        let result = self
            .spool
            .replay(|report| {
                let sink = Arc::clone(sink);
                async move { sink.report_stats(&report).await }
            })
            .await;

        match result {
            Ok(outcome) => outcome.sent,
            Err(e) => {
                warn!("Failed to replay stats spool: {}", e);
                0
            }
        }
    }
}

fn build_report(batch: &HashMap<Uuid, TrafficDelta>) -> StatsReport {
    let mut stats: Vec<StatsEntry> = batch
        .iter()
        .map(|(uuid, d)| StatsEntry {
            uuid: uuid.to_string(),
            upload: d.upload,
            download: d.download,
        })
        .collect();
    stats.sort_by(|a, b| a.uuid.cmp(&b.uuid));

    StatsReport {
        timestamp: Utc::now(),
        stats,
    }
}
