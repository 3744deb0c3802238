//! Last-known-good copy of the remote user list.
//!
//! Read at startup when the remote manager is unreachable.

use crate::{StoreError, write_atomic_async};
use edgewarden_protocol::UserList;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File name of the remote cache inside the data directory
pub const REMOTE_CACHE_FILE: &str = "users.json";

#[derive(Debug, Clone)]
pub struct RemoteCache {
    path: PathBuf,
}

impl RemoteCache {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(REMOTE_CACHE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `list` atomically
    pub async fn save(&self, list: &UserList) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(list)?;
        write_atomic_async(&self.path, data, Some(0o600)).await?;
        debug!(
            "Cached {} remote users (version {})",
            list.users.len(),
            list.version
        );
        Ok(())
    }

    /// Load the cached list, `None` when absent or unreadable
    pub async fn load(&self) -> Option<UserList> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(list) => Some(list),
                Err(e) => {
                    warn!("Ignoring corrupt user cache {}: {}", self.path.display(), e);
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Failed to read user cache {}: {}", self.path.display(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgewarden_protocol::{Protocol, User};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RemoteCache::new(dir.path());

        let list = UserList {
            version: "v7".into(),
            users: vec![User::new(Uuid::new_v4(), vec![Protocol::Vless], "pw")],
            ..Default::default()
        };
        cache.save(&list).await.unwrap();

        assert_eq!(cache.load().await.unwrap(), list);
    }

    #[tokio::test]
    async fn test_load_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RemoteCache::new(dir.path()).load().await.is_none());
    }

    #[tokio::test]
    async fn test_load_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RemoteCache::new(dir.path());
        tokio::fs::write(cache.path(), b"not json").await.unwrap();
        assert!(cache.load().await.is_none());
    }
}
