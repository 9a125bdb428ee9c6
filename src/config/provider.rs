//! Configuration provider and snapshot cache
//!
//! The core never reads config files directly: it consumes a
//! [`ConfigProvider`] and caches the snapshot for the life of a refresh
//! cycle. The shipped [`FileConfigProvider`] loads the YAML application file
//! and resolves per-device external JSON overrides.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::utils::error::{AcqError, Result};

use super::spec::{DeviceSpec, ParameterSpec, PollMode, ReadBlock};
use super::AppConfig;

/// Callback invoked with every fresh snapshot
pub type SnapshotWatcher = Box<dyn Fn(Arc<AppConfig>) + Send + Sync>;

/// Read-only source of configuration snapshots
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Current snapshot without touching the backing store
    async fn get_snapshot(&self) -> Arc<AppConfig>;

    /// Reload from the backing store and return the fresh snapshot
    async fn refresh(&self) -> Result<Arc<AppConfig>>;

    /// Register a callback invoked after each successful refresh
    fn watch(&self, callback: SnapshotWatcher);
}

/// External per-device JSON override file
#[derive(Debug, Deserialize)]
struct DeviceFileOverride {
    #[serde(default)]
    poll_mode: Option<PollMode>,
    #[serde(default)]
    read_blocks: Option<Vec<ReadBlock>>,
    #[serde(default)]
    parameters: Option<Vec<ParameterSpec>>,
    #[serde(default)]
    description: Option<String>,
}

/// File-backed provider: YAML application file + device JSON overrides
pub struct FileConfigProvider {
    path: PathBuf,
    snapshot: RwLock<Arc<AppConfig>>,
    watchers: std::sync::Mutex<Vec<SnapshotWatcher>>,
}

impl FileConfigProvider {
    /// Load the initial snapshot; fails if the file is unreadable or any
    /// device override file is broken.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let config = Self::read(&path)?;
        Ok(Self {
            path,
            snapshot: RwLock::new(Arc::new(config)),
            watchers: std::sync::Mutex::new(Vec::new()),
        })
    }

    fn read(path: &Path) -> Result<AppConfig> {
        let mut config = AppConfig::from_file(path)?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

        for conn in &mut config.connections {
            for device in &mut conn.devices {
                if let Some(file) = device.config_file.clone() {
                    let resolved = if file.is_absolute() {
                        file
                    } else {
                        base_dir.join(file)
                    };
                    apply_device_override(device, &resolved)?;
                }
            }
        }

        Ok(config)
    }
}

fn apply_device_override(device: &mut DeviceSpec, path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        AcqError::config(format!(
            "device '{}': cannot read {}: {e}",
            device.device_id,
            path.display()
        ))
    })?;
    let overrides: DeviceFileOverride = serde_json::from_str(&text).map_err(|e| {
        AcqError::config(format!(
            "device '{}': invalid JSON in {}: {e}",
            device.device_id,
            path.display()
        ))
    })?;

    if let Some(poll_mode) = overrides.poll_mode {
        device.poll_mode = poll_mode;
    }
    if let Some(read_blocks) = overrides.read_blocks {
        device.read_blocks = read_blocks;
    }
    if let Some(parameters) = overrides.parameters {
        device.parameters = parameters;
    }
    if let Some(description) = overrides.description {
        device.description = Some(description);
    }

    info!(
        device_id = %device.device_id,
        file = %path.display(),
        "applied external device configuration"
    );
    Ok(())
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn get_snapshot(&self) -> Arc<AppConfig> {
        self.snapshot.read().await.clone()
    }

    async fn refresh(&self) -> Result<Arc<AppConfig>> {
        let fresh = Arc::new(Self::read(&self.path)?);
        *self.snapshot.write().await = fresh.clone();

        if let Ok(watchers) = self.watchers.lock() {
            for watcher in watchers.iter() {
                watcher(fresh.clone());
            }
        }
        Ok(fresh)
    }

    fn watch(&self, callback: SnapshotWatcher) {
        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.push(callback);
        }
    }
}

/// Snapshot cache in front of a provider. Readers always see one atomically
/// consistent snapshot; `refresh` swaps the whole Arc.
pub struct ConfigCache {
    provider: Arc<dyn ConfigProvider>,
    snapshot: RwLock<Arc<AppConfig>>,
}

impl ConfigCache {
    pub async fn new(provider: Arc<dyn ConfigProvider>) -> Self {
        let snapshot = provider.get_snapshot().await;
        Self {
            provider,
            snapshot: RwLock::new(snapshot),
        }
    }

    /// Current cached snapshot
    pub async fn snapshot(&self) -> Arc<AppConfig> {
        self.snapshot.read().await.clone()
    }

    /// Pull a fresh snapshot through the provider. On provider failure the
    /// previous snapshot stays in place.
    pub async fn refresh(&self) -> Result<Arc<AppConfig>> {
        match self.provider.refresh().await {
            Ok(fresh) => {
                *self.snapshot.write().await = fresh.clone();
                Ok(fresh)
            },
            Err(e) => {
                warn!("config refresh failed, keeping previous snapshot: {e}");
                Err(e)
            },
        }
    }
}
