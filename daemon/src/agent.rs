//! Agent orchestration
//!
//! Owns every component and runs one task per periodic concern. Tasks share
//! components through `Arc`s and stop on a broadcast shutdown signal; a slow
//! tick in one loop never delays another.

use crate::auth::{AllowList, ApiAuth};
use crate::certs::{CertManager, TlsServiceClient, ensure_certificate};
use crate::config::DaemonConfig;
use crate::connections::{ControlClient, Session};
use crate::generator::ProtocolSettings;
use crate::management::{self, ApiState, NodeInfo};
use crate::manager::{ManagerClient, UserSource, registration};
use crate::metrics::{self, metrics};
use crate::node_load::{LoadSampler, PublicIp};
use crate::quota::{Eviction, QuotaMonitor};
use crate::reconciler::{Reconciler, ReconcilerParts, SyncOutcome};
use crate::stats::{StatsPipeline, StatsSink};
use crate::supervisor::{ServiceControl, Supervisor, SupervisorSettings};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use edgewarden_crypto::NodeSecrets;
use edgewarden_protocol::{
    CertBundle, ConnectionRecord, ConnectionsReport, DirectiveResponse, HeartbeatRequest,
    ManagementMode,
};
use edgewarden_storage::{LocalStore, RemoteCache, StatsSpool};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SPOOL_DIR: &str = "stats_spool";
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Components shared by the agent's tasks
struct Shared {
    config: DaemonConfig,
    mode: ManagementMode,
    store: Option<Arc<LocalStore>>,
    manager: Option<Arc<ManagerClient>>,
    reconciler: Arc<Reconciler>,
    supervisor: Supervisor,
    monitor: Arc<QuotaMonitor>,
    control: ControlClient,
    stats: StatsPipeline,
    sampler: LoadSampler,
}

pub struct Agent {
    shared: Arc<Shared>,
    secrets: NodeSecrets,
    evictions: mpsc::UnboundedReceiver<Eviction>,
    shutdown: broadcast::Sender<()>,
    started: Instant,
}

impl Agent {
    /// Build every component; fails only on unusable local state
    pub async fn new(config: DaemonConfig) -> Result<Self> {
        let data_dir = config.node.data_dir.clone();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let secrets = NodeSecrets::load_or_generate(&data_dir).context("Failed to load node secrets")?;
        let mode = config.management_mode();
        info!("Node {} starting in {} mode", config.node.id, mode);

        let store = if mode.uses_local_store() {
            let store = LocalStore::open(&data_dir).context("Failed to open local user store")?;
            info!("Local store holds {} users", store.user_count());
            Some(Arc::new(store))
        } else {
            None
        };

        let manager = if mode.syncs_remote() {
            let client = ManagerClient::new(&config.manager.url, &config.node.api_key)
                .context("Failed to build manager client")?;
            Some(Arc::new(client))
        } else {
            None
        };

        let settings = ProtocolSettings::from_config(&config, &secrets);
        let (evict_tx, evictions) = mpsc::unbounded_channel();
        let monitor = Arc::new(QuotaMonitor::new(evict_tx));
        let supervisor = Supervisor::new(SupervisorSettings::from_config(&config.proxy));

        let reconciler = Arc::new(Reconciler::new(ReconcilerParts {
            mode,
            local: store.clone(),
            remote: manager.clone().map(|m| m as Arc<dyn UserSource>),
            cache: RemoteCache::new(&data_dir),
            settings,
            certs: CertManager::new(&data_dir),
            tls_server_name: config.protocols.vpn_domain.clone(),
            service: Arc::new(supervisor.clone()) as Arc<dyn ServiceControl>,
            monitor: monitor.clone(),
            config_path: config.proxy.config_path.clone(),
        }));

        let control =
            ControlClient::new(config.proxy.control_addr).context("Failed to build control client")?;
        let stats = StatsPipeline::new(
            control.clone(),
            monitor.clone(),
            store.clone(),
            manager.clone().map(|m| m as Arc<dyn StatsSink>),
            StatsSpool::new(data_dir.join(SPOOL_DIR)),
        );
        let sampler = LoadSampler::new(PublicIp::new(config.node.server_ip.clone()));

        let (shutdown, _) = broadcast::channel(1);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                mode,
                store,
                manager,
                reconciler,
                supervisor,
                monitor,
                control,
                stats,
                sampler,
            }),
            secrets,
            evictions,
            shutdown,
            started: Instant::now(),
        })
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.shared.supervisor
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.shared.reconciler
    }

    /// Run until `signal` resolves, then shut down in order
    pub async fn run(self, signal: impl Future<Output = ()>) -> Result<()> {
        let Agent {
            shared,
            secrets,
            evictions,
            shutdown,
            started,
        } = self;
        let config = &shared.config;
        let metrics_handle = metrics::start_server(&config.monitoring);

        if let Some(manager) = &shared.manager {
            register(manager, config, &secrets, shared.reconciler.settings()).await;
            prepare_tls(manager, config, shared.reconciler.certs()).await;
        }

        match shared.reconciler.initial_sync().await {
            Ok(users) => info!("Initial configuration applied with {} users", users),
            Err(e) => error!("Initial configuration failed: {}", e),
        }

        if config.proxy.skip_start {
            info!("Proxy start skipped by configuration");
        } else if let Err(e) = shared.supervisor.start().await {
            error!("Failed to start proxy: {}", e);
        }

        let mut tasks = Vec::new();
        tasks.push(spawn_eviction_worker(
            shared.clone(),
            evictions,
            shutdown.subscribe(),
        ));

        if let Some(store) = &shared.store {
            tasks.push(spawn_store_worker(
                shared.clone(),
                store.subscribe(),
                shutdown.subscribe(),
            ));
        }

        if config.api.enabled {
            tasks.extend(spawn_api(&shared, &secrets, &shutdown, started));
        }

        let quota = shared.clone();
        tasks.push(spawn_ticker(
            "quota",
            Duration::from_secs(config.quota.check_interval_secs),
            shutdown.subscribe(),
            move || {
                let shared = quota.clone();
                async move { shared.stats.quota_tick().await }
            },
        ));

        let stats = shared.clone();
        tasks.push(spawn_ticker(
            "stats",
            config.manager.stats_interval(),
            shutdown.subscribe(),
            move || {
                let shared = stats.clone();
                async move {
                    let outcome = shared.stats.flush().await;
                    debug!("Stats flush: {:?}", outcome);
                }
            },
        ));

        if shared.mode.syncs_remote() {
            let sync = shared.clone();
            tasks.push(spawn_ticker(
                "sync",
                config.manager.sync_interval(),
                shutdown.subscribe(),
                move || {
                    let shared = sync.clone();
                    async move { shared.sync(false).await }
                },
            ));

            let heartbeat = shared.clone();
            tasks.push(spawn_ticker(
                "heartbeat",
                config.manager.heartbeat_interval(),
                shutdown.subscribe(),
                move || {
                    let shared = heartbeat.clone();
                    async move { shared.heartbeat().await }
                },
            ));

            let connections = shared.clone();
            tasks.push(spawn_ticker(
                "connections",
                config.manager.connections_interval(),
                shutdown.subscribe(),
                move || {
                    let shared = connections.clone();
                    async move { shared.report_connections().await }
                },
            ));
        }

        info!("Agent running");
        signal.await;
        info!("Shutting down");

        let _ = shutdown.send(());
        if tokio::time::timeout(TASK_JOIN_TIMEOUT, join_all(tasks)).await.is_err() {
            warn!("Background tasks did not stop in time");
        }

        let outcome = shared.stats.flush().await;
        info!(
            "Final stats flush: {} users, {} bytes",
            outcome.users, outcome.bytes
        );

        if let Err(e) = shared.supervisor.stop().await {
            error!("Failed to stop proxy: {}", e);
        }
        metrics_handle.abort();
        info!("Agent stopped");
        Ok(())
    }
}

fn spawn_api(
    shared: &Arc<Shared>,
    secrets: &NodeSecrets,
    shutdown: &broadcast::Sender<()>,
    started: Instant,
) -> Vec<JoinHandle<()>> {
    let config = &shared.config;
    let settings = shared.reconciler.settings();
    let node = NodeInfo {
        node_id: config.node.id.clone(),
        mode: shared.mode,
        server_ip: config.node.server_ip.clone(),
        public_key: secrets.public_key.clone(),
        short_id: secrets.short_ids.first().cloned().unwrap_or_default(),
        vless_port: settings.vless_port,
        ss_port: settings.ss_port,
        ss_method: settings.ss_method.clone(),
        reality_sni: settings.default_sni.clone(),
    };

    let allow = Arc::new(AllowList::new(config.api.allowed_hosts.clone()));
    let mut handles = Vec::new();
    if !allow.is_open() {
        let refresh = allow.clone();
        let interval = Duration::from_secs(config.api.dns_refresh_secs.max(1));
        let shutdown = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            let count = refresh.refresh().await;
            info!("Local API allow-list holds {} addresses", count);
            let _ = refresh.spawn_refresh(interval, shutdown).await;
        }));
    }

    let state = ApiState {
        node: Arc::new(node),
        store: shared.store.clone(),
        monitor: shared.monitor.clone(),
        supervisor: (!config.proxy.skip_start).then(|| shared.supervisor.clone()),
        started,
    };
    let app = management::router(state, ApiAuth::new(&config.node.api_key, allow));
    let bind = config.api.bind;
    let mut shutdown = shutdown.subscribe();

    handles.push(tokio::spawn(async move {
        let stop = async move {
            let _ = shutdown.recv().await;
        };
        if let Err(e) = management::serve(bind, app, stop).await {
            error!("Management API failed: {}", e);
        }
    }));
    handles
}

impl Shared {
    async fn sync(&self, force: bool) {
        match self.reconciler.sync(force).await {
            Ok(SyncOutcome::Unchanged) => {}
            Ok(SyncOutcome::Applied { version, users }) => {
                debug!("Sync applied version {} ({} users)", version, users)
            }
            Err(e) => warn!("Sync failed: {}", e),
        }
    }

    async fn heartbeat(&self) {
        let Some(manager) = &self.manager else {
            return;
        };

        let sessions = match self.control.list_sessions().await {
            Ok(sessions) => sessions.len(),
            Err(e) => {
                debug!("Failed to count sessions: {}", e);
                0
            }
        };
        let load = self.sampler.sample(sessions, self.monitor.user_count()).await;
        let req = HeartbeatRequest {
            node_id: self.config.node.id.clone(),
            timestamp: Utc::now(),
            load,
        };

        match manager.heartbeat(&req).await {
            Ok(directives) => self.handle_directives(directives).await,
            Err(e) => warn!("Heartbeat failed: {}", e),
        }
    }

    async fn report_connections(&self) {
        let Some(manager) = &self.manager else {
            return;
        };

        let sessions = match self.control.list_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                debug!("Failed to list sessions: {}", e);
                return;
            }
        };

        let report = ConnectionsReport {
            node_id: self.config.node.id.clone(),
            timestamp: Utc::now(),
            connections: sessions.iter().map(connection_record).collect(),
        };

        match manager.report_connections(&report).await {
            Ok(directives) => self.handle_directives(directives).await,
            Err(e) => warn!("Connection report failed: {}", e),
        }
    }

    /// Apply manager instructions immediately
    async fn handle_directives(&self, directives: DirectiveResponse) {
        if directives.is_empty() {
            return;
        }

        if !directives.kick_users.is_empty() {
            self.kick_requested(&directives.kick_users).await;
        }
        if let Some(bundle) = directives.cert_update {
            self.apply_cert_update(bundle).await;
        }
        if directives.reload_users {
            info!("Manager requested a user reload");
            self.sync(true).await;
        }
    }

    async fn kick_requested(&self, uuids: &[String]) {
        for raw in uuids {
            let Ok(uuid) = Uuid::parse_str(raw) else {
                warn!("Ignoring kick for invalid user id {}", raw);
                continue;
            };
            metrics().evictions.with_label_values(&["remote"]).inc();
            match self.control.kick_user(&uuid).await {
                Ok(kicked) => {
                    metrics().kicked_sessions.inc_by(kicked as u64);
                    if kicked > 0 {
                        info!("Kicked {} sessions of {} on manager request", kicked, uuid);
                    }
                }
                Err(e) => warn!("Failed to kick {}: {}", uuid, e),
            }
        }
    }

    async fn apply_cert_update(&self, bundle: CertBundle) {
        let Some(manager) = &self.manager else {
            return;
        };
        info!("Received certificate update for {}", bundle.domain);

        if let Err(e) = self.reconciler.certs().save(&bundle) {
            error!("Failed to save certificate: {}", e);
            return;
        }
        if let Err(e) = manager.ack_cert_update(&self.config.node.id).await {
            warn!("Failed to acknowledge certificate update: {}", e);
        }
        if let Err(e) = self.reconciler.apply().await {
            error!("Failed to apply configuration after certificate update: {}", e);
        }
    }
}

fn connection_record(session: &Session) -> ConnectionRecord {
    let connected_at = DateTime::parse_from_rfc3339(&session.start)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    ConnectionRecord {
        user_uuid: session.metadata.user.clone(),
        client_ip: session.client_ip(),
        connected_at,
        upload: session.upload,
        download: session.download,
    }
}

/// Best-effort registration; failures are logged only
async fn register(
    manager: &ManagerClient,
    config: &DaemonConfig,
    secrets: &NodeSecrets,
    settings: &ProtocolSettings,
) {
    let req = registration(
        &config.node.id,
        secrets,
        settings,
        config.protocols.vpn_domain.as_deref(),
    );
    match manager.register(&req).await {
        Ok(()) => info!("Registered with manager at {}", manager.base_url()),
        Err(e) => warn!("Registration failed: {}", e),
    }
}

/// Obtain certificate material for TLS listeners when any is configured
async fn prepare_tls(manager: &ManagerClient, config: &DaemonConfig, certs: &CertManager) {
    if !config.protocols.any_tls_port() || certs.has_valid_material() {
        return;
    }

    let mut service_url = config.manager.tls_service_url.clone().filter(|s| !s.is_empty());
    let mut domain = config.protocols.vpn_domain.clone().filter(|s| !s.is_empty());

    if service_url.is_none() || domain.is_none() {
        match manager.node_config().await {
            Ok(remote) => {
                if service_url.is_none() && !remote.tls_service_url.is_empty() {
                    service_url = Some(remote.tls_service_url);
                }
                if domain.is_none() && !remote.vpn_domain.is_empty() {
                    domain = Some(remote.vpn_domain);
                }
            }
            Err(e) => warn!("Failed to fetch node config: {}", e),
        }
    }

    let (Some(service_url), Some(domain)) = (service_url, domain) else {
        warn!("TLS ports configured but no certificate service or domain known, TLS listeners disabled");
        return;
    };

    let key = config
        .manager
        .tls_service_key
        .clone()
        .unwrap_or_else(|| config.node.api_key.clone());
    match TlsServiceClient::new(&service_url, &key) {
        Ok(service) => {
            if !ensure_certificate(certs, &service, &domain).await {
                warn!("No certificate for {}, TLS listeners disabled", domain);
            }
        }
        Err(e) => warn!("Failed to build certificate client: {}", e),
    }
}

fn spawn_eviction_worker(
    shared: Arc<Shared>,
    mut evictions: mpsc::UnboundedReceiver<Eviction>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let eviction = tokio::select! {
                _ = shutdown.recv() => return,
                ev = evictions.recv() => match ev {
                    Some(ev) => ev,
                    None => return,
                },
            };

            metrics()
                .evictions
                .with_label_values(&[eviction.reason.as_str()])
                .inc();
            info!("Evicting {} ({})", eviction.uuid, eviction.reason.as_str());

            let control = shared.control.clone();
            tokio::spawn(async move {
                match control.kick_user(&eviction.uuid).await {
                    Ok(kicked) => {
                        metrics().kicked_sessions.inc_by(kicked as u64);
                        debug!("Closed {} sessions of {}", kicked, eviction.uuid);
                    }
                    Err(e) => warn!("Failed to kick {}: {}", eviction.uuid, e),
                }
            });
        }
    })
}

/// Regenerate on local store changes; bursts collapse into one apply
fn spawn_store_worker(
    shared: Arc<Shared>,
    mut events: broadcast::Receiver<edgewarden_storage::StoreEvent>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                ev = events.recv() => match ev {
                    Ok(ev) => debug!("Local store event: {:?}", ev),
                    Err(RecvError::Lagged(n)) => debug!("Missed {} local store events", n),
                    Err(RecvError::Closed) => return,
                },
            }

            loop {
                match events.try_recv() {
                    Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }

            match shared.reconciler.on_local_change().await {
                Ok(users) => info!("Local change applied, {} active users", users),
                Err(e) => error!("Failed to apply local change: {}", e),
            }
        }
    })
}

fn spawn_ticker<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("{} loop stopped", name);
                    return;
                }
                _ = ticker.tick() => tick().await,
            }
        }
    })
}
