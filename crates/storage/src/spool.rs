//! Retry spool for stats reports that could not be delivered.
//!
//! One file per batch, named so that lexical order is arrival order.

use crate::{StoreError, write_atomic_async};
use edgewarden_protocol::StatsReport;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

const SPOOL_PREFIX: &str = "stats_";
const SPOOL_SUFFIX: &str = ".json";

/// Result of one replay pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// Batches delivered and removed
    pub sent: usize,
    /// Unreadable batches removed without sending
    pub discarded: usize,
    /// Batches still waiting after the pass stopped
    pub remaining: usize,
}

#[derive(Debug)]
pub struct StatsSpool {
    dir: PathBuf,
    seq: AtomicU64,
}

impl StatsSpool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `report` as a new batch file
    pub async fn push(&self, report: &StatsReport) -> Result<PathBuf, StoreError> {
        let nanos = report.timestamp.timestamp_nanos_opt().unwrap_or_default().max(0);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let path = self
            .dir
            .join(format!("{SPOOL_PREFIX}{nanos:020}_{seq:06}{SPOOL_SUFFIX}"));

        let data = serde_json::to_vec(report)?;
        write_atomic_async(&path, data, None).await?;
        info!(
            "Spooled stats batch with {} entries to {}",
            report.stats.len(),
            path.display()
        );
        Ok(path)
    }

    /// Pending batch files, oldest first
    pub async fn pending(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.dir, e)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(SPOOL_PREFIX) && name.ends_with(SPOOL_SUFFIX) {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Send pending batches in order.
    ///
    /// Delivered and corrupt files are deleted. The pass stops at the first
    /// send failure so later batches are never delivered ahead of it.
    pub async fn replay<F, Fut, E>(&self, mut send: F) -> Result<ReplayOutcome, StoreError>
    where
        F: FnMut(StatsReport) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        let files = self.pending().await?;
        let mut outcome = ReplayOutcome::default();

        for (idx, path) in files.iter().enumerate() {
            let report = match tokio::fs::read(path).await {
                Ok(data) => serde_json::from_slice::<StatsReport>(&data).ok(),
                Err(e) => {
                    warn!("Failed to read spooled batch {}: {}", path.display(), e);
                    None
                }
            };

            let Some(report) = report else {
                warn!("Discarding unreadable spooled batch {}", path.display());
                remove(path).await;
                outcome.discarded += 1;
                continue;
            };

            match send(report).await {
                Ok(()) => {
                    remove(path).await;
                    outcome.sent += 1;
                }
                Err(e) => {
                    debug!("Spool replay stopped at {}: {}", path.display(), e);
                    outcome.remaining = files.len() - idx;
                    break;
                }
            }
        }

        if outcome.sent > 0 || outcome.discarded > 0 {
            info!(
                "Spool replay: {} sent, {} discarded, {} remaining",
                outcome.sent, outcome.discarded, outcome.remaining
            );
        }
        Ok(outcome)
    }
}

async fn remove(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!("Failed to remove spooled batch {}: {}", path.display(), e);
    }
}
