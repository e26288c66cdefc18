//! Per-device identity used as the correlation key for anonymous quota
//! accounting on the backend.
//!
//! Resolution order: in-memory cache, durable store, host fingerprint, random
//! fallback. Whichever candidate is installed first wins for the lifetime of
//! the resolver; every later caller (sync or async) observes that value.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{bail, Context};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ClientError, ClientResult};

const RANDOM_PREFIX: &str = "fp_";
const RANDOM_LEN: usize = 13;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `fp_` followed by 13 random base36 characters.
    pub fn random() -> Self {
        let mut rng = rand::rng();
        let suffix: String = (0..RANDOM_LEN)
            .map(|_| BASE36[rng.random_range(0..BASE36.len())] as char)
            .collect();
        Self(format!("{}{}", RANDOM_PREFIX, suffix))
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable storage for the single `device_id` entry.
pub trait IdentityStore: Send + Sync {
    fn load(&self) -> ClientResult<Option<String>>;
    fn save(&self, device_id: &str) -> ClientResult<()>;
}

/// Stores the identifier as a one-line file.
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self) -> ClientResult<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents.trim().to_string()).filter(|v| !v.is_empty())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ClientError::Storage(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn save(&self, device_id: &str) -> ClientResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ClientError::Storage(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        std::fs::write(&self.path, format!("{}\n", device_id)).map_err(|e| {
            ClientError::Storage(format!("Failed to write {}: {}", self.path.display(), e))
        })
    }
}

/// Process-local store; also records how many writes happened.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    value: Mutex<Option<String>>,
    writes: Mutex<usize>,
}

impl MemoryIdentityStore {
    pub fn with_value(device_id: &str) -> Self {
        Self {
            value: Mutex::new(Some(device_id.to_string())),
            writes: Mutex::new(0),
        }
    }

    pub fn writes(&self) -> usize {
        *self.writes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> ClientResult<Option<String>> {
        Ok(self.value.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, device_id: &str) -> ClientResult<()> {
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = Some(device_id.to_string());
        *self.writes.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }
}

/// Derives a stable per-device hash. Failures fall back to a random id.
#[async_trait]
pub trait FingerprintProbe: Send + Sync {
    async fn fingerprint(&self) -> anyhow::Result<String>;
}

/// Hashes the machine id together with host name, OS and architecture.
#[derive(Debug, Clone)]
pub struct HostFingerprint {
    machine_id_paths: Vec<PathBuf>,
}

impl Default for HostFingerprint {
    fn default() -> Self {
        Self {
            machine_id_paths: vec![
                PathBuf::from("/etc/machine-id"),
                PathBuf::from("/var/lib/dbus/machine-id"),
            ],
        }
    }
}

impl HostFingerprint {
    pub fn with_paths(machine_id_paths: Vec<PathBuf>) -> Self {
        Self { machine_id_paths }
    }

    async fn machine_id(&self) -> anyhow::Result<String> {
        for path in &self.machine_id_paths {
            if let Ok(contents) = tokio::fs::read_to_string(path).await {
                let trimmed = contents.trim();
                if !trimmed.is_empty() {
                    return Ok(trimmed.to_string());
                }
            }
        }
        bail!("No readable machine id in {:?}", self.machine_id_paths)
    }
}

#[async_trait]
impl FingerprintProbe for HostFingerprint {
    async fn fingerprint(&self) -> anyhow::Result<String> {
        let machine_id = self
            .machine_id()
            .await
            .context("Host fingerprint unavailable")?;
        let host = std::env::var("HOSTNAME").unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(machine_id.as_bytes());
        hasher.update(b"|");
        hasher.update(host.as_bytes());
        hasher.update(b"|");
        hasher.update(std::env::consts::OS.as_bytes());
        hasher.update(b"|");
        hasher.update(std::env::consts::ARCH.as_bytes());

        let digest = hex::encode(hasher.finalize());
        Ok(digest[..32].to_string())
    }
}

pub struct DeviceIdentityResolver {
    store: Arc<dyn IdentityStore>,
    probe: Arc<dyn FingerprintProbe>,
    cached: OnceLock<DeviceIdentity>,
    // Serializes the async path so only one probe runs at a time
    resolving: tokio::sync::Mutex<()>,
}

impl DeviceIdentityResolver {
    pub fn new(store: Arc<dyn IdentityStore>, probe: Arc<dyn FingerprintProbe>) -> Self {
        Self {
            store,
            probe,
            cached: OnceLock::new(),
            resolving: tokio::sync::Mutex::new(()),
        }
    }

    /// Resolves the device identity. Idempotent, safe to call concurrently,
    /// and never fails.
    pub async fn resolve(&self) -> DeviceIdentity {
        if let Some(identity) = self.cached.get() {
            return identity.clone();
        }

        let _guard = self.resolving.lock().await;
        if let Some(identity) = self.cached.get() {
            return identity.clone();
        }

        // Store IO goes through the blocking pool; the sync path below reads
        // inline.
        let store = self.store.clone();
        let loaded = tokio::task::spawn_blocking(move || store.load())
            .await
            .unwrap_or_else(|e| Err(ClientError::Storage(format!("Identity load task failed: {}", e))));
        if let Some(stored) = Self::stored_identity(loaded) {
            return self.claim(stored, false).0;
        }

        let candidate = match self.probe.fingerprint().await {
            Ok(hash) if !hash.trim().is_empty() => DeviceIdentity(hash.trim().to_string()),
            Ok(_) => {
                tracing::warn!("Fingerprint probe returned an empty hash, using random id");
                DeviceIdentity::random()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Fingerprint probe failed, using random id");
                DeviceIdentity::random()
            }
        };

        let (identity, installed) = self.claim(candidate, true);
        if installed {
            let store = self.store.clone();
            let value = identity.as_str().to_string();
            let saved = tokio::task::spawn_blocking(move || store.save(&value))
                .await
                .unwrap_or_else(|e| {
                    Err(ClientError::Storage(format!("Identity save task failed: {}", e)))
                });
            Self::log_save_failure(saved);
        }
        identity
    }

    /// Synchronous variant for call sites that cannot await.
    ///
    /// Returns the cached or stored identity; otherwise installs a random one
    /// into the same slot the async path uses, so the two paths can never
    /// hand out different identifiers.
    pub fn current_or_fallback(&self) -> DeviceIdentity {
        if let Some(identity) = self.cached.get() {
            return identity.clone();
        }

        if let Some(stored) = self.load_stored() {
            return self.install(stored, false);
        }

        self.install(DeviceIdentity::random(), true)
    }

    fn load_stored(&self) -> Option<DeviceIdentity> {
        Self::stored_identity(self.store.load())
    }

    fn stored_identity(loaded: ClientResult<Option<String>>) -> Option<DeviceIdentity> {
        match loaded {
            Ok(Some(value)) if !value.trim().is_empty() => {
                Some(DeviceIdentity(value.trim().to_string()))
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read stored device id");
                None
            }
        }
    }

    fn install(&self, candidate: DeviceIdentity, persist: bool) -> DeviceIdentity {
        let (identity, installed) = self.claim(candidate, persist);
        if installed && persist {
            Self::log_save_failure(self.store.save(identity.as_str()));
        }
        identity
    }

    /// Puts `candidate` in the slot unless another caller got there first.
    /// The flag is true when this call installed it.
    fn claim(&self, candidate: DeviceIdentity, persist: bool) -> (DeviceIdentity, bool) {
        let mut installed = false;
        let winner = self.cached.get_or_init(|| {
            installed = true;
            candidate
        });

        if installed {
            tracing::info!(device_id = %winner, persisted = persist, "Device identity resolved");
        }
        (winner.clone(), installed && persist)
    }

    fn log_save_failure(saved: ClientResult<()>) {
        if let Err(e) = saved {
            tracing::warn!(error = %e, "Failed to persist device id, keeping it in memory");
        }
    }
}
