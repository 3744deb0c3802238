//! Locally administered users and the circuit breaker

use crate::{StoreError, write_json_atomic};
use chrono::{Duration, Utc};
use edgewarden_crypto::random_password;
use edgewarden_protocol::{CircuitBreaker, Protocol, User};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

/// File name of the local store inside the data directory
pub const LOCAL_USERS_FILE: &str = "local_users.json";

const PASSWORD_LEN: usize = 16;
const EVENT_CAPACITY: usize = 64;

/// Change notification published after a successful persist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    UserCreated(Uuid),
    UserUpdated(Uuid),
    UserDeleted(Uuid),
    CircuitBreakerChanged { enabled: bool },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    /// Defaults to vless + shadowsocks when empty
    #[serde(default)]
    pub protocols: Vec<Protocol>,
    /// Bytes, 0 = unlimited
    #[serde(default)]
    pub traffic_limit: u64,
    /// Days from now, 0 = never
    #[serde(default)]
    pub expire_days: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateUserRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub traffic_limit: Option<u64>,
    /// 0 clears the expiry
    #[serde(default)]
    pub expire_days: Option<u32>,
    /// Ignored when empty
    #[serde(default)]
    pub protocols: Option<Vec<Protocol>>,
}

/// On-disk shape of the store
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    version: String,
    #[serde(default)]
    users: Vec<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    circuit_breaker: Option<CircuitBreaker>,
}

#[derive(Debug, Clone, Default)]
struct StoreState {
    version: String,
    users: BTreeMap<Uuid, User>,
    circuit_breaker: CircuitBreaker,
}

impl StoreState {
    fn to_file(&self) -> StoreFile {
        StoreFile {
            version: self.version.clone(),
            users: self.users.values().cloned().collect(),
            circuit_breaker: Some(self.circuit_breaker.clone()),
        }
    }
}

/// Local user directory.
///
/// Every mutation rewrites the whole file while holding the write lock, so
/// readers observe either the old or the new snapshot. A failed write rolls
/// the in-memory state back and no event is published.
pub struct LocalStore {
    path: PathBuf,
    state: RwLock<StoreState>,
    events: broadcast::Sender<StoreEvent>,
}

impl LocalStore {
    /// Open `<dir>/local_users.json`, starting empty when it does not exist
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join(LOCAL_USERS_FILE);
        let state = match std::fs::read(&path) {
            Ok(data) => {
                let file: StoreFile =
                    serde_json::from_slice(&data).map_err(|source| StoreError::Corrupt {
                        path: path.clone(),
                        source,
                    })?;
                StoreState {
                    version: file.version,
                    users: file.users.into_iter().map(|u| (u.uuid, u)).collect(),
                    circuit_breaker: file.circuit_breaker.unwrap_or_default(),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        info!(
            "Local store loaded from {} ({} users)",
            path.display(),
            state.users.len()
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            path,
            state: RwLock::new(state),
            events,
        })
    }

    /// Subscribe to change events
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Version token of the last persisted snapshot
    pub fn version(&self) -> String {
        self.state.read().version.clone()
    }

    pub fn list_users(&self) -> Vec<User> {
        self.state.read().users.values().cloned().collect()
    }

    pub fn get_user(&self, uuid: &Uuid) -> Option<User> {
        self.state.read().users.get(uuid).cloned()
    }

    pub fn user_count(&self) -> usize {
        self.state.read().users.len()
    }

    pub fn circuit_breaker(&self) -> CircuitBreaker {
        self.state.read().circuit_breaker.clone()
    }

    pub fn create_user(&self, req: CreateUserRequest) -> Result<User, StoreError> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(StoreError::Invalid("name is required".to_string()));
        }
        let protocols = if req.protocols.is_empty() {
            vec![Protocol::Vless, Protocol::Shadowsocks]
        } else {
            validate_protocols(req.protocols)?
        };

        let now = Utc::now();
        let user = User {
            uuid: Uuid::new_v4(),
            name: name.to_string(),
            protocols,
            ss_password: random_password(PASSWORD_LEN),
            enabled: true,
            traffic_limit: req.traffic_limit,
            traffic_used: 0,
            expire_at: (req.expire_days > 0).then(|| now + Duration::days(req.expire_days.into())),
            created_at: Some(now),
            updated_at: Some(now),
        };

        let created = user.clone();
        self.mutate(|state| {
            state.users.insert(user.uuid, user);
            Ok(())
        })?;

        info!("Created local user {} ({})", created.uuid, created.name);
        self.publish(StoreEvent::UserCreated(created.uuid));
        Ok(created)
    }

    pub fn update_user(&self, uuid: &Uuid, req: UpdateUserRequest) -> Result<User, StoreError> {
        let protocols = match req.protocols {
            Some(p) if !p.is_empty() => Some(validate_protocols(p)?),
            _ => None,
        };

        let updated = self.mutate(|state| {
            let user = state
                .users
                .get_mut(uuid)
                .ok_or(StoreError::UserNotFound(*uuid))?;
            let now = Utc::now();

            if let Some(name) = req.name {
                user.name = name;
            }
            if let Some(enabled) = req.enabled {
                user.enabled = enabled;
            }
            if let Some(limit) = req.traffic_limit {
                user.traffic_limit = limit;
            }
            if let Some(days) = req.expire_days {
                user.expire_at = (days > 0).then(|| now + Duration::days(days.into()));
            }
            if let Some(protocols) = protocols {
                user.protocols = protocols;
            }
            user.updated_at = Some(now);
            Ok(user.clone())
        })?;

        self.publish(StoreEvent::UserUpdated(*uuid));
        Ok(updated)
    }

    pub fn delete_user(&self, uuid: &Uuid) -> Result<(), StoreError> {
        self.mutate(|state| {
            state
                .users
                .remove(uuid)
                .map(|_| ())
                .ok_or(StoreError::UserNotFound(*uuid))
        })?;

        info!("Deleted local user {}", uuid);
        self.publish(StoreEvent::UserDeleted(*uuid));
        Ok(())
    }

    /// Engage or release the circuit breaker
    pub fn set_circuit_breaker(
        &self,
        enabled: bool,
        reason: Option<String>,
        message: Option<String>,
    ) -> Result<CircuitBreaker, StoreError> {
        let breaker = self.mutate(|state| {
            state.circuit_breaker = if enabled {
                CircuitBreaker::engaged(reason.unwrap_or_else(|| "manual".to_string()), message)
            } else {
                CircuitBreaker::default()
            };
            Ok(state.circuit_breaker.clone())
        })?;

        info!("Circuit breaker {}", if enabled { "engaged" } else { "released" });
        self.publish(StoreEvent::CircuitBreakerChanged { enabled });
        Ok(breaker)
    }

    /// Fold attributed traffic into `traffic_used`.
    ///
    /// Accounting only: no change event is published, so this never causes
    /// a configuration reload. Returns how many local users were updated.
    pub fn record_traffic(&self, deltas: &HashMap<Uuid, u64>) -> Result<usize, StoreError> {
        self.mutate(|state| {
            let mut updated = 0;
            for (uuid, bytes) in deltas {
                if *bytes == 0 {
                    continue;
                }
                if let Some(user) = state.users.get_mut(uuid) {
                    user.traffic_used = user.traffic_used.saturating_add(*bytes);
                    updated += 1;
                }
            }
            Ok(updated)
        })
    }

    /// Apply `f` and persist the result under one write lock.
    ///
    /// Nothing is written when `f` fails; the previous state is restored
    /// when the write fails.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut StoreState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.state.write();
        let previous = state.clone();

        let out = f(&mut state)?;
        state.version = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_string();

        if let Err(e) = write_json_atomic(&self.path, &state.to_file(), Some(0o600)) {
            *state = previous;
            return Err(e);
        }
        debug!("Local store persisted (version {})", state.version);
        Ok(out)
    }

    fn publish(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

fn validate_protocols(protocols: Vec<Protocol>) -> Result<Vec<Protocol>, StoreError> {
    if protocols.iter().any(|p| !p.is_known()) {
        return Err(StoreError::Invalid("unknown protocol".to_string()));
    }
    let mut out = Vec::with_capacity(protocols.len());
    for p in protocols {
        if !out.contains(&p) {
            out.push(p);
        }
    }
    Ok(out)
}
