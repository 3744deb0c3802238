//! User reconciliation
//!
//! Merges the local store and the remote mirror according to the management
//! mode, and turns the result into a written configuration plus a reload.
//! Every apply feeds the same list to the quota monitor.

use crate::certs::CertManager;
use crate::generator::{GenerateRequest, ProtocolSettings, generate};
use crate::manager::{ManagerError, UserSource};
use crate::metrics::metrics;
use crate::quota::QuotaMonitor;
use crate::supervisor::{ServiceControl, SupervisorError};
use edgewarden_protocol::{ManagementMode, User, UserList};
use edgewarden_storage::{LocalStore, RemoteCache, StoreError, write_atomic_async};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("Remote sync is unavailable in {0} mode")]
    NoRemote(ManagementMode),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error("Failed to encode proxy configuration: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to write proxy configuration: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to reload proxy: {0}")]
    Reload(#[from] SupervisorError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Version token matched the applied one; nothing was written
    Unchanged,
    Applied { version: String, users: usize },
}

/// Everything the reconciler coordinates
pub struct ReconcilerParts {
    pub mode: ManagementMode,
    pub local: Option<Arc<LocalStore>>,
    pub remote: Option<Arc<dyn UserSource>>,
    pub cache: RemoteCache,
    pub settings: ProtocolSettings,
    pub certs: CertManager,
    /// Server name for TLS listeners; falls back to the stored certificate domain
    pub tls_server_name: Option<String>,
    pub service: Arc<dyn ServiceControl>,
    pub monitor: Arc<QuotaMonitor>,
    pub config_path: PathBuf,
}

pub struct Reconciler {
    mode: ManagementMode,
    local: Option<Arc<LocalStore>>,
    remote: Option<Arc<dyn UserSource>>,
    cache: RemoteCache,
    settings: ProtocolSettings,
    certs: CertManager,
    tls_server_name: Option<String>,
    service: Arc<dyn ServiceControl>,
    monitor: Arc<QuotaMonitor>,
    config_path: PathBuf,
    applied_version: RwLock<Option<String>>,
    remote_list: RwLock<Option<UserList>>,
    /// Held from fetch to version record so overlapping syncs apply in fetch order
    sync_lock: Mutex<()>,
    apply_lock: Mutex<()>,
}

/// Union of both lists; local entries replace remote ones with the same UUID
pub fn merge_users(remote: &[User], local: &[User]) -> Vec<User> {
    let mut merged: BTreeMap<Uuid, User> = remote.iter().map(|u| (u.uuid, u.clone())).collect();
    for user in local {
        merged.insert(user.uuid, user.clone());
    }
    merged.into_values().collect()
}

impl Reconciler {
    pub fn new(parts: ReconcilerParts) -> Self {
        Self {
            mode: parts.mode,
            local: parts.local,
            remote: parts.remote,
            cache: parts.cache,
            settings: parts.settings,
            certs: parts.certs,
            tls_server_name: parts.tls_server_name,
            service: parts.service,
            monitor: parts.monitor,
            config_path: parts.config_path,
            applied_version: RwLock::new(None),
            remote_list: RwLock::new(None),
            sync_lock: Mutex::new(()),
            apply_lock: Mutex::new(()),
        }
    }

    pub fn mode(&self) -> ManagementMode {
        self.mode
    }

    pub fn settings(&self) -> &ProtocolSettings {
        &self.settings
    }

    pub fn local_store(&self) -> Option<&Arc<LocalStore>> {
        self.local.as_ref()
    }

    pub fn certs(&self) -> &CertManager {
        &self.certs
    }

    pub fn applied_version(&self) -> Option<String> {
        self.applied_version.read().clone()
    }

    /// The effective user list for the current mode
    pub fn effective_users(&self) -> Vec<User> {
        let local = self
            .local
            .as_ref()
            .map(|s| s.list_users())
            .unwrap_or_default();
        let remote = self
            .remote_list
            .read()
            .as_ref()
            .map(|l| l.users.clone())
            .unwrap_or_default();

        match self.mode {
            ManagementMode::Local => local,
            ManagementMode::Remote => remote,
            ManagementMode::Hybrid => merge_users(&remote, &local),
        }
    }

    /// Breaker state always comes from the local store
    pub fn circuit_breaker_engaged(&self) -> bool {
        self.local
            .as_ref()
            .is_some_and(|s| s.circuit_breaker().enabled)
    }

    /// Fetch the remote list and apply it when its version changed
    pub async fn sync(&self, force: bool) -> Result<SyncOutcome, ApplyError> {
        let _guard = self.sync_lock.lock().await;
        self.sync_locked(force).await
    }

    async fn sync_locked(&self, force: bool) -> Result<SyncOutcome, ApplyError> {
        let source = self.remote.as_ref().ok_or(ApplyError::NoRemote(self.mode))?;

        let list = match source.fetch_users().await {
            Ok(list) => list,
            Err(e) => {
                metrics().syncs.with_label_values(&["failed"]).inc();
                return Err(e.into());
            }
        };

        if !force && self.applied_version.read().as_deref() == Some(list.version.as_str()) {
            debug!("User list unchanged (version {})", list.version);
            metrics().syncs.with_label_values(&["unchanged"]).inc();
            return Ok(SyncOutcome::Unchanged);
        }

        if let Err(e) = self.cache.save(&list).await {
            warn!("Failed to cache user list: {}", e);
        }

        let version = list.version.clone();
        let fetched = list.users.len();
        *self.remote_list.write() = Some(list);

        let users = self.apply().await?;
        *self.applied_version.write() = Some(version.clone());
        metrics().syncs.with_label_values(&["ok"]).inc();
        info!(
            "Applied user list version {} ({} fetched, {} active)",
            version, fetched, users
        );
        Ok(SyncOutcome::Applied { version, users })
    }

    /// First apply after startup.
    ///
    /// Remote modes fall back to the on-disk cache when the manager is
    /// unreachable; hybrid then still applies the local users.
    pub async fn initial_sync(&self) -> Result<usize, ApplyError> {
        if !self.mode.syncs_remote() {
            return self.apply().await;
        }

        let _guard = self.sync_lock.lock().await;
        match self.sync_locked(true).await {
            Ok(SyncOutcome::Applied { users, .. }) => return Ok(users),
            Ok(SyncOutcome::Unchanged) => return Ok(0),
            Err(e) => warn!("Initial sync failed: {}", e),
        }

        match self.cache.load().await {
            Some(list) => {
                info!(
                    "Using cached user list version {} ({} users)",
                    list.version,
                    list.users.len()
                );
                let version = list.version.clone();
                *self.remote_list.write() = Some(list);
                let users = self.apply().await?;
                *self.applied_version.write() = Some(version);
                Ok(users)
            }
            None => {
                warn!("No cached user list available");
                self.apply().await
            }
        }
    }

    /// React to a local store mutation
    pub async fn on_local_change(&self) -> Result<usize, ApplyError> {
        if !self.mode.uses_local_store() {
            return Ok(0);
        }
        self.apply().await
    }

    /// Regenerate, write and reload; returns the number of active users
    pub async fn apply(&self) -> Result<usize, ApplyError> {
        let _guard = self.apply_lock.lock().await;
        let timer = metrics().apply_duration.start_timer();
        let result = self.apply_locked().await;
        timer.observe_duration();

        if result.is_err() {
            metrics().apply_failures.inc();
        }
        result
    }

    async fn apply_locked(&self) -> Result<usize, ApplyError> {
        let users = self.effective_users();
        self.monitor.update_users(&users);
        metrics().monitored_users.set(self.monitor.user_count() as i64);

        let breaker = self.circuit_breaker_engaged();
        metrics().circuit_breaker.set(i64::from(breaker));

        let reality_sni = self
            .remote_list
            .read()
            .as_ref()
            .map(|l| l.config.reality_sni.clone())
            .unwrap_or_default();
        let tls = self.certs.material(self.tls_server_name.as_deref());

        let document = generate(
            &self.settings,
            GenerateRequest {
                users: &users,
                reality_sni: &reality_sni,
                circuit_breaker: breaker,
                tls: tls.as_ref(),
            },
        );
        let active = document.active_user_count();

        write_atomic_async(&self.config_path, document.to_json()?, Some(0o600)).await?;
        metrics().applies.inc();
        metrics().effective_users.set(active as i64);

        if breaker {
            warn!("Circuit breaker engaged, configuration carries no users");
        }

        if self.service.is_running() {
            self.service.reload().await?;
        } else {
            debug!("Proxy not running, configuration written only");
        }
        Ok(active)
    }
}
