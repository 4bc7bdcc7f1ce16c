//! Task orchestration core: port scan sessions, a download queue and
//! transactional batch file operations, each reporting through its own
//! event bus.

pub mod batch;
pub mod download;
pub mod errors;
pub mod events;
pub mod file_ops;
pub mod gate;
pub mod logging;
pub mod scan;
pub mod settings;
pub mod task;
pub mod validation;

use parking_lot::RwLock;
use std::sync::Arc;

pub use batch::{
    BatchOperationManager, FileOperation, FileVersion, OperationType, Transaction,
    TransactionStatus,
};
pub use download::{
    DownloadOptions, DownloadPriority, DownloadQueueManager, DownloadStatus, DownloadTask, Transfer,
    TransferOutcome, TransferProgress,
};
pub use errors::{TaskError, TaskResult};
pub use events::{EventBus, ServiceError, ServiceEvent, ServiceMetrics, ServiceStatus, Subscription};
pub use file_ops::{FileSystem, LocalFileSystem};
pub use gate::{ConcurrencyGate, GatePermit};
pub use scan::{
    PortStatus, ProbeOutcome, Prober, ScanResult, ScanSession, ScanSessionManager, ScanStatus,
};
pub use settings::{JsonSettingsStore, MemorySettingsStore, Settings, SettingsStore};

/// Owns one instance of every manager, wired to its own bus and gate.
pub struct TaskCore {
    store: Arc<dyn SettingsStore>,
    settings: RwLock<Settings>,
    pub scans: Arc<ScanSessionManager>,
    pub downloads: Arc<DownloadQueueManager>,
    pub batch: Arc<BatchOperationManager>,
}

impl TaskCore {
    /// Loads settings from `store` and builds the managers around them.
    pub fn new(store: Arc<dyn SettingsStore>, fs: Arc<dyn FileSystem>) -> TaskResult<Self> {
        let settings = store.load()?;
        settings.validate()?;

        let scans = ScanSessionManager::new(
            Arc::new(EventBus::new("scan")),
            Arc::new(ConcurrencyGate::new("scan", settings.scan.max_concurrent_probes)),
            settings.scan.clone(),
        );
        let downloads = DownloadQueueManager::new(
            Arc::new(EventBus::new("download")),
            Arc::new(ConcurrencyGate::new("download", settings.download.max_concurrent_downloads)),
            settings.download.clone(),
        )?;
        let batch = BatchOperationManager::new(
            Arc::new(EventBus::new("batch")),
            fs,
            settings.batch.clone(),
        );

        tracing::info!(
            probes = settings.scan.max_concurrent_probes,
            downloads = settings.download.max_concurrent_downloads,
            "task core ready"
        );

        Ok(Self {
            store,
            settings: RwLock::new(settings),
            scans: Arc::new(scans),
            downloads: Arc::new(downloads),
            batch: Arc::new(batch),
        })
    }

    /// Core backed by the local disk and a settings file in the platform
    /// data directory.
    pub fn with_defaults() -> TaskResult<Self> {
        Self::new(
            Arc::new(JsonSettingsStore::in_data_dir()?),
            Arc::new(LocalFileSystem::default()),
        )
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    /// Persists `settings` and pushes each section to its manager. Nothing
    /// changes if validation or the store fails.
    pub fn update_settings(&self, settings: Settings) -> TaskResult<()> {
        settings.validate()?;
        validation::ExtensionPolicy::new(&settings.download.allowed_extensions)?;
        self.store.save(&settings)?;

        self.scans.update_settings(settings.scan.clone());
        self.downloads.update_settings(settings.download.clone())?;
        self.batch.update_settings(settings.batch.clone());
        *self.settings.write() = settings;
        tracing::info!("settings updated");
        Ok(())
    }

    /// Health of every manager's bus.
    pub fn status(&self) -> Vec<ServiceStatus> {
        vec![
            self.scans.bus().status(),
            self.downloads.bus().status(),
            self.batch.bus().status(),
        ]
    }

    pub fn is_healthy(&self) -> bool {
        self.status().iter().all(|s| s.healthy)
    }

    /// Drops every subscriber on every bus.
    pub fn dispose(&self) {
        self.scans.bus().dispose();
        self.downloads.bus().dispose();
        self.batch.bus().dispose();
    }
}
