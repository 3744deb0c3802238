//! Proxy subprocess supervision
//!
//! Exactly one subprocess instance runs at a time. Each instance gets a
//! generation number; its watcher task compares that number against the
//! current one after the process exits, so an instance that was replaced by
//! a newer start or reload never triggers a restart. An explicit stop sets a
//! flag the watcher consults before restarting.
//!
//! Only the watcher that owns the `Child` ever signals it; stop requests
//! travel over its channel, so a reaped pid is never signalled.
//!
//! Lock discipline: `ops` serializes the public operations end to end;
//! `state` guards the process handle and is released while waiting for the
//! process to exit and while sleeping through a backoff.

use crate::config::ProxyConfig;
use crate::metrics::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Proxy is already running")]
    AlreadyRunning,

    #[error("Proxy is not running")]
    NotRunning,

    #[error("Proxy configuration not found: {0}")]
    ConfigMissing(PathBuf),

    #[error("Proxy binary not found: {0}")]
    BinaryMissing(PathBuf),

    #[error("Control port {addr} still in use after {waited:?}")]
    PortBusy { addr: SocketAddr, waited: Duration },

    #[error("Failed to spawn proxy: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Proxy did not exit after a forced kill")]
    StopTimeout,

    #[error("Configuration check failed: {0}")]
    CheckFailed(String),

    #[error("Failed to run configuration check: {0}")]
    CheckSpawn(#[source] std::io::Error),
}

/// Timings and limits; production values come from [`ProxyConfig`]
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub binary: PathBuf,
    pub config_path: PathBuf,
    pub control_addr: SocketAddr,
    pub stats_addr: SocketAddr,
    /// Bound on waiting for each control port to free up
    pub port_wait_timeout: Duration,
    pub port_poll_interval: Duration,
    pub port_dial_timeout: Duration,
    /// Wait after SIGTERM before a forced kill
    pub stop_grace: Duration,
    /// Wait after the forced kill
    pub kill_wait: Duration,
    /// Pause after a confirmed exit so the OS releases bound ports
    pub port_release_pause: Duration,
    /// Crashes closer than this to the last restart attempt accumulate
    pub crash_window: Duration,
    /// Backoff is `min(2^count, 32)` of these
    pub backoff_unit: Duration,
    pub max_restarts: u32,
}

impl SupervisorSettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            config_path: config.config_path.clone(),
            control_addr: config.control_addr,
            stats_addr: config.stats_addr,
            port_wait_timeout: Duration::from_secs(config.port_wait_timeout_secs),
            port_poll_interval: Duration::from_secs(1),
            port_dial_timeout: Duration::from_millis(100),
            stop_grace: Duration::from_secs(config.stop_grace_secs),
            kill_wait: Duration::from_secs(2),
            port_release_pause: Duration::from_millis(500),
            crash_window: Duration::from_secs(10),
            backoff_unit: Duration::from_secs(1),
            max_restarts: config.max_restarts,
        }
    }
}

const MAX_BACKOFF_UNITS: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp { crashes: u32 },
}

/// Consecutive-crash accounting and backoff
#[derive(Debug, Clone)]
pub struct CrashTracker {
    count: u32,
    last_restart: Option<Instant>,
    window: Duration,
    unit: Duration,
    max_restarts: u32,
}

impl CrashTracker {
    pub fn new(window: Duration, unit: Duration, max_restarts: u32) -> Self {
        Self {
            count: 0,
            last_restart: None,
            window,
            unit,
            max_restarts,
        }
    }

    /// Register a crash observed at `now`
    pub fn on_crash(&mut self, now: Instant) -> RestartDecision {
        self.count = match self.last_restart {
            Some(at) if now.saturating_duration_since(at) < self.window => self.count + 1,
            _ => 1,
        };

        if self.count > self.max_restarts {
            return RestartDecision::GiveUp {
                crashes: self.count,
            };
        }

        let units = 1u32
            .checked_shl(self.count)
            .unwrap_or(u32::MAX)
            .min(MAX_BACKOFF_UNITS);
        RestartDecision::Retry {
            attempt: self.count,
            delay: self.unit * units,
        }
    }

    /// Mark the moment an automatic restart is actually attempted
    pub fn record_attempt(&mut self, now: Instant) {
        self.last_restart = Some(now);
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.last_restart = None;
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Point-in-time view, readable without touching the supervisor locks
#[derive(Debug, Clone, Default, Serialize)]
pub struct SupervisorStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub generation: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub consecutive_crashes: u32,
    pub restarts: u64,
    /// Automatic restarts gave up; operator action needed
    pub exhausted: bool,
}

/// Requests the watcher forwards to its child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Term,
    Kill,
}

struct Instance {
    generation: u64,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    exited: watch::Receiver<bool>,
    signals: mpsc::Sender<Signal>,
}

struct ProcessState {
    instance: Option<Instance>,
    generation: u64,
    stop_requested: bool,
    crashes: CrashTracker,
    exhausted: bool,
    restarts: u64,
}

struct Inner {
    settings: SupervisorSettings,
    ops: Mutex<()>,
    state: Mutex<ProcessState>,
    status: RwLock<SupervisorStatus>,
}

/// Handle to the supervised subprocess; cheap to clone
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        let crashes = CrashTracker::new(
            settings.crash_window,
            settings.backoff_unit,
            settings.max_restarts,
        );
        Self {
            inner: Arc::new(Inner {
                settings,
                ops: Mutex::new(()),
                state: Mutex::new(ProcessState {
                    instance: None,
                    generation: 0,
                    stop_requested: false,
                    crashes,
                    exhausted: false,
                    restarts: 0,
                }),
                status: RwLock::new(SupervisorStatus::default()),
            }),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    pub fn status(&self) -> SupervisorStatus {
        self.inner.status.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.status.read().running
    }

    /// Spawn the subprocess once the control port is free
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let _op = self.inner.ops.lock().await;
        self.inner.start().await
    }

    /// Terminate the subprocess; a no-op success when nothing runs.
    ///
    /// Always records the stop request, cancelling any pending restart.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let _op = self.inner.ops.lock().await;
        self.inner.stop().await
    }

    /// Stop then start, resetting the crash counter
    pub async fn reload(&self) -> Result<(), SupervisorError> {
        let _op = self.inner.ops.lock().await;
        if self.inner.state.lock().await.instance.is_none() {
            return Err(SupervisorError::NotRunning);
        }

        info!("Reloading proxy");
        self.inner.stop().await?;
        self.inner.state.lock().await.crashes.reset();
        self.inner.start().await?;
        metrics().reloads.inc();
        Ok(())
    }

    /// Run the binary's own validation against the current configuration
    pub async fn check_config(&self) -> Result<(), SupervisorError> {
        let s = &self.inner.settings;
        let output = Command::new(&s.binary)
            .arg("check")
            .arg("-c")
            .arg(&s.config_path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(SupervisorError::CheckSpawn)?;

        if output.status.success() {
            return Ok(());
        }
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Err(SupervisorError::CheckFailed(text.trim().to_string()))
    }
}

/// The seam the reconciler applies configurations through
#[async_trait]
pub trait ServiceControl: Send + Sync {
    fn is_running(&self) -> bool;
    async fn reload(&self) -> Result<(), SupervisorError>;
}

#[async_trait]
impl ServiceControl for Supervisor {
    fn is_running(&self) -> bool {
        Supervisor::is_running(self)
    }

    async fn reload(&self) -> Result<(), SupervisorError> {
        Supervisor::reload(self).await
    }
}

impl Inner {
    async fn start(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().await;
        if state.instance.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }

        self.prepare().await?;
        state.stop_requested = false;
        state.exhausted = false;
        self.spawn_locked(&mut state)
    }

    async fn stop(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let (generation, pid, mut exited, signals) = {
            let mut state = self.state.lock().await;
            state.stop_requested = true;
            match state.instance.as_ref() {
                Some(inst) => (
                    inst.generation,
                    inst.pid,
                    inst.exited.clone(),
                    inst.signals.clone(),
                ),
                None => {
                    self.publish(&state);
                    return Ok(());
                }
            }
        };

        info!("Stopping proxy (pid {:?})", pid);
        let graceful = signals.send(Signal::Term).await.is_ok();
        if !graceful || !wait_exit(&mut exited, self.settings.stop_grace).await {
            warn!("Proxy did not exit gracefully, killing");
            let _ = signals.send(Signal::Kill).await;
            if !wait_exit(&mut exited, self.settings.kill_wait).await {
                error!("Proxy still alive after kill");
                return Err(SupervisorError::StopTimeout);
            }
        }

        {
            let mut state = self.state.lock().await;
            if state
                .instance
                .as_ref()
                .is_some_and(|i| i.generation == generation)
            {
                state.instance = None;
            }
            self.publish(&state);
        }

        tokio::time::sleep(self.settings.port_release_pause).await;
        info!("Proxy stopped");
        Ok(())
    }

    /// Pre-spawn checks and the port wait
    async fn prepare(&self) -> Result<(), SupervisorError> {
        let s = &self.settings;
        if !tokio::fs::try_exists(&s.config_path).await.unwrap_or(false) {
            return Err(SupervisorError::ConfigMissing(s.config_path.clone()));
        }
        if !tokio::fs::try_exists(&s.binary).await.unwrap_or(false) {
            return Err(SupervisorError::BinaryMissing(s.binary.clone()));
        }
        for addr in [s.control_addr, s.stats_addr] {
            wait_port_free(
                addr,
                s.port_wait_timeout,
                s.port_poll_interval,
                s.port_dial_timeout,
            )
            .await?;
        }
        Ok(())
    }

    /// Spawn a new instance and its watcher; `state` must be locked
    fn spawn_locked(self: &Arc<Self>, state: &mut ProcessState) -> Result<(), SupervisorError> {
        let s = &self.settings;
        let child = Command::new(&s.binary)
            .arg("run")
            .arg("-c")
            .arg(&s.config_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(SupervisorError::Spawn)?;

        state.generation += 1;
        let generation = state.generation;
        let pid = child.id();
        let (exited_tx, exited_rx) = watch::channel(false);
        let (signal_tx, signal_rx) = mpsc::channel(2);

        state.instance = Some(Instance {
            generation,
            pid,
            started_at: Utc::now(),
            exited: exited_rx,
            signals: signal_tx,
        });
        self.publish(state);
        info!("Proxy started (pid {:?}, generation {})", pid, generation);

        tokio::spawn(watch_instance(
            Arc::clone(self),
            generation,
            child,
            exited_tx,
            signal_rx,
        ));
        Ok(())
    }

    /// Crash handling for the instance `generation` after it exited
    async fn on_exit(self: Arc<Self>, generation: u64) {
        loop {
            let delay = {
                let mut state = self.state.lock().await;
                if state
                    .instance
                    .as_ref()
                    .is_some_and(|i| i.generation == generation)
                {
                    state.instance = None;
                }

                if state.stop_requested || state.generation != generation {
                    debug!("Proxy generation {} exit was expected", generation);
                    self.publish(&state);
                    return;
                }

                match state.crashes.on_crash(Instant::now()) {
                    RestartDecision::GiveUp { crashes } => {
                        state.exhausted = true;
                        self.publish(&state);
                        error!(
                            "Proxy crashed {} times in a row, giving up until restarted by an operator",
                            crashes
                        );
                        return;
                    }
                    RestartDecision::Retry { attempt, delay } => {
                        self.publish(&state);
                        warn!(
                            "Proxy exited unexpectedly, restart {} in {:?}",
                            attempt, delay
                        );
                        delay
                    }
                }
            };

            tokio::time::sleep(delay).await;

            let mut state = self.state.lock().await;
            if state.stop_requested || state.instance.is_some() || state.generation != generation {
                debug!("Pending restart of generation {} cancelled", generation);
                return;
            }

            state.crashes.record_attempt(Instant::now());
            state.restarts += 1;
            metrics().crash_restarts.inc();

            let result = match self.prepare().await {
                Ok(()) => self.spawn_locked(&mut state),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => return,
                Err(e) => {
                    error!("Proxy restart failed: {}", e);
                    self.publish(&state);
                }
            }
        }
    }

    fn publish(&self, state: &ProcessState) {
        let status = SupervisorStatus {
            running: state.instance.is_some(),
            pid: state.instance.as_ref().and_then(|i| i.pid),
            generation: state.generation,
            started_at: state.instance.as_ref().map(|i| i.started_at),
            consecutive_crashes: state.crashes.count(),
            restarts: state.restarts,
            exhausted: state.exhausted,
        };
        metrics().proxy_running.set(i64::from(status.running));
        *self.status.write() = status;
    }
}

/// Owns the child: waits for exit, forwards stop signals
async fn watch_instance(
    inner: Arc<Inner>,
    generation: u64,
    mut child: Child,
    exited: watch::Sender<bool>,
    mut signals: mpsc::Receiver<Signal>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(signal) = signals.recv() => {
                if !signal_child(&mut child, signal) {
                    debug!("Proxy generation {} not signalled ({:?})", generation, signal);
                }
            }
        }
    };

    match status {
        Ok(status) => info!("Proxy generation {} exited: {}", generation, status),
        Err(e) => warn!("Failed to wait for proxy generation {}: {}", generation, e),
    }
    let _ = exited.send(true);
    inner.on_exit(generation).await;
}

/// Deliver `signal` while the child is still unreaped; false otherwise
fn signal_child(child: &mut Child, signal: Signal) -> bool {
    if !matches!(child.try_wait(), Ok(None)) {
        return false;
    }
    match signal {
        Signal::Term => terminate(child),
        Signal::Kill => match child.start_kill() {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to kill proxy: {}", e);
                false
            }
        },
    }
}

#[cfg(unix)]
fn terminate(child: &Child) -> bool {
    let Some(pid) = child.id().and_then(|p| i32::try_from(p).ok()) else {
        return false;
    };
    // SAFETY: the caller owns the unreaped child, so the pid is still ours
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) -> bool {
    false
}

async fn wait_exit(exited: &mut watch::Receiver<bool>, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, exited.wait_for(|done| *done)).await {
        Ok(_) => true,
        Err(_) => false,
    }
}

/// Block until nothing accepts connections on `addr`
async fn wait_port_free(
    addr: SocketAddr,
    timeout: Duration,
    poll: Duration,
    dial_timeout: Duration,
) -> Result<(), SupervisorError> {
    let started = Instant::now();
    let mut warned = false;

    loop {
        let busy = matches!(
            tokio::time::timeout(dial_timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        );
        if !busy {
            return Ok(());
        }

        let waited = started.elapsed();
        if waited >= timeout {
            return Err(SupervisorError::PortBusy { addr, waited });
        }
        if !warned {
            info!("Control port {} still in use, waiting", addr);
            warned = true;
        }
        tokio::time::sleep(poll.min(timeout - waited)).await;
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
