//! Real-time quota and expiry enforcement
//!
//! The monitor keeps a working copy of every enabled user's limits. Traffic
//! deltas are fed in through `check_user`; a violation removes the user from
//! the working set and emits an `Eviction` on the channel handed to `new`.

use chrono::{DateTime, Utc};
use edgewarden_protocol::User;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionReason {
    Expired,
    QuotaExceeded,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::Expired => "expired",
            EvictionReason::QuotaExceeded => "quota_exceeded",
        }
    }
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to terminate every live session of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eviction {
    pub uuid: Uuid,
    pub reason: EvictionReason,
}

#[derive(Debug, Clone, PartialEq)]
struct UserQuota {
    /// 0 = unlimited
    traffic_limit: u64,
    /// Server-attributed usage at the last update
    traffic_used: u64,
    /// Accrued since the last stats flush
    session_traffic: u64,
    expire_at: Option<DateTime<Utc>>,
}

impl UserQuota {
    fn violation(&self, now: DateTime<Utc>) -> Option<EvictionReason> {
        if self.expire_at.is_some_and(|at| now > at) {
            return Some(EvictionReason::Expired);
        }
        if self.traffic_limit > 0
            && self.traffic_used.saturating_add(self.session_traffic) >= self.traffic_limit
        {
            return Some(EvictionReason::QuotaExceeded);
        }
        None
    }
}

pub struct QuotaMonitor {
    users: RwLock<HashMap<Uuid, UserQuota>>,
    evictions: mpsc::UnboundedSender<Eviction>,
}

impl QuotaMonitor {
    pub fn new(evictions: mpsc::UnboundedSender<Eviction>) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            evictions,
        }
    }

    /// Replace the working set from `users`.
    ///
    /// Disabled users are dropped. Surviving users keep their session
    /// traffic; new users start at zero.
    pub fn update_users(&self, users: &[User]) {
        let mut guard = self.users.write();
        let mut next = HashMap::with_capacity(users.len());

        for user in users.iter().filter(|u| u.enabled) {
            let session_traffic = guard
                .get(&user.uuid)
                .map(|q| q.session_traffic)
                .unwrap_or(0);
            next.insert(
                user.uuid,
                UserQuota {
                    traffic_limit: user.traffic_limit,
                    traffic_used: user.traffic_used,
                    session_traffic,
                    expire_at: user.expire_at,
                },
            );
        }

        *guard = next;
    }

    /// Account `additional_bytes` to `uuid` and report whether it may stay
    /// connected. Unknown users are never allowed.
    pub fn check_user(&self, uuid: &Uuid, additional_bytes: u64) -> bool {
        let now = Utc::now();
        let reason = {
            let mut guard = self.users.write();
            let Some(quota) = guard.get_mut(uuid) else {
                return false;
            };
            quota.session_traffic = quota.session_traffic.saturating_add(additional_bytes);

            let reason = quota.violation(now);
            if reason.is_some() {
                guard.remove(uuid);
            }
            reason
        };

        match reason {
            Some(reason) => {
                self.evict(*uuid, reason);
                false
            }
            None => true,
        }
    }

    /// Sweep for expired users; quota is only checked on traffic.
    ///
    /// Returns how many users were evicted.
    pub fn check_all_users(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<Uuid> = {
            let mut guard = self.users.write();
            let expired: Vec<Uuid> = guard
                .iter()
                .filter(|(_, q)| q.expire_at.is_some_and(|at| now > at))
                .map(|(uuid, _)| *uuid)
                .collect();
            for uuid in &expired {
                guard.remove(uuid);
            }
            expired
        };

        for uuid in &expired {
            self.evict(*uuid, EvictionReason::Expired);
        }
        expired.len()
    }

    pub fn session_traffic(&self, uuid: &Uuid) -> Option<u64> {
        self.users.read().get(uuid).map(|q| q.session_traffic)
    }

    /// Non-zero session counters
    pub fn all_session_traffic(&self) -> HashMap<Uuid, u64> {
        self.users
            .read()
            .iter()
            .filter(|(_, q)| q.session_traffic > 0)
            .map(|(uuid, q)| (*uuid, q.session_traffic))
            .collect()
    }

    /// Zero every session counter
    pub fn reset_session_traffic(&self) {
        for quota in self.users.write().values_mut() {
            quota.session_traffic = 0;
        }
    }

    /// Fold session counters into the used counters after a flush.
    ///
    /// Keeps the quota view exact until the next authoritative update.
    pub fn commit_session_traffic(&self) {
        for quota in self.users.write().values_mut() {
            quota.traffic_used = quota.traffic_used.saturating_add(quota.session_traffic);
            quota.session_traffic = 0;
        }
    }

    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_monitored(&self, uuid: &Uuid) -> bool {
        self.users.read().contains_key(uuid)
    }

    fn evict(&self, uuid: Uuid, reason: EvictionReason) {
        info!("Evicting user {} ({})", uuid, reason);
        if self.evictions.send(Eviction { uuid, reason }).is_err() {
            warn!("Eviction channel closed, user {} not kicked", uuid);
        }
    }
}
