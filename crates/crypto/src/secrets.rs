//! Reality key pair, short-ids and assigned ports

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use x25519_dalek::{PublicKey, StaticSecret};

/// File name of the persisted secrets inside the data directory
pub const SECRETS_FILE: &str = "secrets.json";

/// Range the shadowsocks port is drawn from when none is configured
pub const SS_PORT_RANGE: std::ops::Range<u16> = 10000..60000;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Key deserialization failed: {0}")]
    KeyDeserializationFailed(String),

    #[error("Key serialization failed: {0}")]
    KeySerializationFailed(String),

    #[error("Secrets I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Node identity handed to the remote manager and the proxy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSecrets {
    /// X25519 private key, URL-safe base64 without padding
    pub private_key: String,

    /// X25519 public key, URL-safe base64 without padding
    pub public_key: String,

    pub short_ids: Vec<String>,

    /// Randomly assigned shadowsocks port, 0 in files written by old agents
    #[serde(default)]
    pub ss_port: u16,
}

impl NodeSecrets {
    /// Generate a fresh key pair, one short-id and a random port
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        Self {
            private_key: URL_SAFE_NO_PAD.encode(secret.to_bytes()),
            public_key: URL_SAFE_NO_PAD.encode(public.as_bytes()),
            short_ids: vec![random_short_id()],
            ss_port: random_port(),
        }
    }

    /// Load `<dir>/secrets.json`, or generate and persist new secrets.
    ///
    /// A file that does not parse is replaced; one whose keys do not match
    /// is an error. A file missing the shadowsocks port gets one assigned
    /// and is re-saved.
    pub fn load_or_generate(dir: &Path) -> Result<Self, KeyError> {
        let path = dir.join(SECRETS_FILE);

        match fs::read(&path) {
            Ok(data) => match serde_json::from_slice::<NodeSecrets>(&data) {
                Ok(mut secrets) => {
                    secrets.validate()?;
                    if secrets.ss_port == 0 {
                        secrets.ss_port = random_port();
                        info!("Assigned shadowsocks port {} to existing secrets", secrets.ss_port);
                        secrets.save(dir)?;
                    }
                    return Ok(secrets);
                }
                Err(e) => warn!("Discarding unreadable secrets file {}: {}", path.display(), e),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(KeyError::Io { path, source: e }),
        }

        let secrets = Self::generate();
        secrets.save(dir)?;
        info!("Generated new node secrets at {}", path.display());
        Ok(secrets)
    }

    /// Persist to `<dir>/secrets.json` with mode 0600
    pub fn save(&self, dir: &Path) -> Result<(), KeyError> {
        let path = dir.join(SECRETS_FILE);
        let io_err = |source| KeyError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(dir).map_err(io_err)?;
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| KeyError::KeySerializationFailed(e.to_string()))?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&path).map_err(io_err)?;
        file.write_all(&data).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        Ok(())
    }

    /// Check that the stored public key matches the private key
    pub fn validate(&self) -> Result<(), KeyError> {
        let secret = decode_key(&self.private_key)?;
        let public = PublicKey::from(&StaticSecret::from(secret));
        if URL_SAFE_NO_PAD.encode(public.as_bytes()) != self.public_key {
            return Err(KeyError::KeyDeserializationFailed(
                "public key does not match private key".to_string(),
            ));
        }
        Ok(())
    }
}

fn decode_key(encoded: &str) -> Result<[u8; 32], KeyError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| KeyError::KeyDeserializationFailed(e.to_string()))?;
    let actual = bytes.len();
    bytes
        .try_into()
        .map_err(|_| KeyError::InvalidKeyLength {
            expected: 32,
            actual,
        })
}

/// 8 random bytes, hex encoded
pub fn random_short_id() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Random port in [`SS_PORT_RANGE`]
pub fn random_port() -> u16 {
    OsRng.gen_range(SS_PORT_RANGE)
}

/// Random alphanumeric credential
pub fn random_password(len: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
