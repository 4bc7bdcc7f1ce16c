//! Settings model and the stores it is loaded from.
//!
//! Managers read their section once at construction and again only when the
//! caller pushes an update; nothing here is polled.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{TaskError, TaskResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScanSettings {
    pub max_concurrent_probes: usize,
    pub timeout_ms: u64,
    pub randomize_order: bool,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            max_concurrent_probes: 50,
            timeout_ms: 3000,
            randomize_order: false,
        }
    }
}

impl ScanSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DownloadSettings {
    pub max_concurrent_downloads: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub allowed_extensions: Vec<String>,
    pub default_destination: String,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            retry_attempts: 3,
            retry_delay_ms: 5000,
            allowed_extensions: vec!["*".to_string()],
            default_destination: "downloads".to_string(),
        }
    }
}

impl DownloadSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BatchSettings {
    pub lock_timeout_ms: u64,
    /// Undo applied copies and moves when a batch fails part way. Deletes
    /// are never undone.
    pub compensate_on_rollback: bool,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 30_000,
            compensate_on_rollback: false,
        }
    }
}

impl BatchSettings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub scan: ScanSettings,
    pub download: DownloadSettings,
    pub batch: BatchSettings,
}

impl Settings {
    pub fn validate(&self) -> TaskResult<()> {
        if self.scan.max_concurrent_probes == 0 {
            return Err(TaskError::Validation("maxConcurrentProbes must be at least 1".into()));
        }
        if self.download.max_concurrent_downloads == 0 {
            return Err(TaskError::Validation("maxConcurrentDownloads must be at least 1".into()));
        }
        if self.scan.timeout_ms == 0 {
            return Err(TaskError::Validation("scan timeoutMs must be positive".into()));
        }
        Ok(())
    }
}

/// Persistence collaborator for [`Settings`].
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> TaskResult<Settings>;
    fn save(&self, settings: &Settings) -> TaskResult<()>;
}

/// Settings kept as a pretty-printed JSON file, replaced atomically on save.
#[derive(Debug)]
pub struct JsonSettingsStore {
    path: PathBuf,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store under the platform's local data directory.
    pub fn in_data_dir() -> TaskResult<Self> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| TaskError::NotFound("Could not determine app data directory".into()))?;
        Ok(Self::new(data_dir.join("taskdeck").join("settings.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonSettingsStore {
    /// A missing file yields the defaults.
    fn load(&self) -> TaskResult<Settings> {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "no settings file, using defaults");
            return Ok(Settings::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        let settings: Settings = serde_json::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    fn save(&self, settings: &Settings) -> TaskResult<()> {
        settings.validate()?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let temp_file = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(settings)?;
        std::fs::write(&temp_file, content)?;
        std::fs::rename(&temp_file, &self.path)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    settings: RwLock<Settings>,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> TaskResult<Settings> {
        Ok(self.settings.read().clone())
    }

    fn save(&self, settings: &Settings) -> TaskResult<()> {
        settings.validate()?;
        *self.settings.write() = settings.clone();
        Ok(())
    }
}
