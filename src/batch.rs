//! Batch file operations under advisory per-path locks.
//!
//! A batch is recorded as a [`Transaction`] before anything touches the
//! filesystem. Operations run one after another; a failure stops the batch
//! and marks it rolled back. Applied operations stay applied unless
//! [`BatchSettings::compensate_on_rollback`] is set.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

use crate::errors::{TaskError, TaskResult};
use crate::events::{to_payload, EventBus};
use crate::file_ops::FileSystem;
use crate::settings::BatchSettings;
use crate::task::TaskStatus;

pub const BATCH_STARTED: &str = "batch:started";
pub const BATCH_PROGRESS: &str = "batch:progress";
pub const BATCH_COMMITTED: &str = "batch:committed";
pub const BATCH_ROLLING_BACK: &str = "batch:rolling_back";
pub const BATCH_ROLLED_BACK: &str = "batch:rolled_back";
pub const BATCH_LOCK_EXPIRED: &str = "batch:lock_expired";
pub const BATCH_VERSION_CREATED: &str = "batch:version_created";
pub const BATCH_ERROR: &str = "batch:error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Copy,
    Move,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Copy => "copy",
            OperationType::Move => "move",
            OperationType::Delete => "delete",
        }
    }

    fn needs_destination(&self) -> bool {
        !matches!(self, OperationType::Delete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransactionStatus {
    Pending,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl TaskStatus for TransactionStatus {
    fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Committed | TransactionStatus::RolledBack)
    }

    fn is_active(&self) -> bool {
        matches!(self, TransactionStatus::Committing | TransactionStatus::RollingBack)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOperation {
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub source: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub operations: Vec<FileOperation>,
    pub status: TransactionStatus,
    pub timestamp: DateTime<Utc>,
    /// Number of operations that were applied, in order, before the batch
    /// committed or stopped.
    pub completed_operations: usize,
    pub compensated_operations: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileVersion {
    pub path: PathBuf,
    pub version: u32,
    pub checksum: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct LockEntry {
    acquired_at: DateTime<Utc>,
    expires_at: Instant,
    generation: u64,
}

impl LockEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Default)]
struct LockTable {
    locks: HashMap<PathBuf, LockEntry>,
    next_generation: u64,
}

/// A live lock as seen from outside the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub path: PathBuf,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct BatchState {
    transactions: HashMap<String, Transaction>,
    order: Vec<String>,
    versions: HashMap<PathBuf, Vec<FileVersion>>,
}

pub struct BatchOperationManager {
    bus: Arc<EventBus>,
    fs: Arc<dyn FileSystem>,
    settings: RwLock<BatchSettings>,
    locks: Arc<Mutex<LockTable>>,
    state: RwLock<BatchState>,
}

impl std::fmt::Debug for BatchOperationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOperationManager")
            .field("bus", &self.bus)
            .field("locks", &self.locks.lock().locks.len())
            .field("transactions", &self.state.read().order.len())
            .finish()
    }
}

impl BatchOperationManager {
    pub fn new(bus: Arc<EventBus>, fs: Arc<dyn FileSystem>, settings: BatchSettings) -> Self {
        Self {
            bus,
            fs,
            settings: RwLock::new(settings),
            locks: Arc::new(Mutex::new(LockTable::default())),
            state: RwLock::new(BatchState::default()),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn settings(&self) -> BatchSettings {
        self.settings.read().clone()
    }

    /// Applies to locks taken after the call.
    pub fn update_settings(&self, settings: BatchSettings) {
        *self.settings.write() = settings;
    }

    fn reject(&self, error: TaskError) -> TaskError {
        self.bus.report_error(BATCH_ERROR, &error);
        error
    }

    /// Takes the advisory lock on `path`. Returns `false` while another live
    /// lock holds it; an expired lock is replaced.
    pub fn acquire_lock(&self, path: &Path) -> bool {
        self.try_lock(path).is_some()
    }

    fn try_lock(&self, path: &Path) -> Option<u64> {
        let timeout = self.settings.read().lock_timeout();
        let now = Instant::now();
        let generation = {
            let mut table = self.locks.lock();
            if table.locks.get(path).is_some_and(|entry| entry.is_live(now)) {
                return None;
            }
            table.next_generation += 1;
            let generation = table.next_generation;
            table.locks.insert(
                path.to_path_buf(),
                LockEntry {
                    acquired_at: Utc::now(),
                    expires_at: now + timeout,
                    generation,
                },
            );
            generation
        };

        tracing::debug!(path = %path.display(), generation, "lock acquired");
        self.schedule_expiry(path.to_path_buf(), generation, timeout);
        Some(generation)
    }

    /// Drops the lock once its timeout passes, unless it was released and
    /// taken again in the meantime. Without a runtime, expiry is only
    /// noticed on the next lookup.
    fn schedule_expiry(&self, path: PathBuf, generation: u64, timeout: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let table: Weak<Mutex<LockTable>> = Arc::downgrade(&self.locks);
        let bus = Arc::clone(&self.bus);
        handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(table) = table.upgrade() else { return };
            let expired = release_generation(&table, &path, generation);
            if expired {
                tracing::debug!(path = %path.display(), generation, "lock expired");
                bus.emit(BATCH_LOCK_EXPIRED, json!({ "path": path }));
            }
        });
    }

    pub fn release_lock(&self, path: &Path) -> bool {
        let released = self.locks.lock().locks.remove(path).is_some();
        if released {
            tracing::debug!(path = %path.display(), "lock released");
        }
        released
    }

    pub fn is_locked(&self, path: &Path) -> bool {
        let now = Instant::now();
        self.locks
            .lock()
            .locks
            .get(path)
            .is_some_and(|entry| entry.is_live(now))
    }

    pub fn locked_paths(&self) -> Vec<LockInfo> {
        let now = Instant::now();
        let mut live: Vec<LockInfo> = self
            .locks
            .lock()
            .locks
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(path, entry)| LockInfo {
                path: path.clone(),
                acquired_at: entry.acquired_at,
            })
            .collect();
        live.sort_by(|a, b| a.path.cmp(&b.path));
        live
    }

    fn release_held(&self, held: &[(PathBuf, u64)]) {
        for (path, generation) in held {
            release_generation(&self.locks, path, *generation);
        }
    }

    /// Applies `op_type` to every path in order, each under its own lock.
    /// For copy and move, each source lands at `destination/<file name>`.
    pub async fn batch_operation(
        &self,
        paths: &[PathBuf],
        op_type: OperationType,
        destination: Option<&Path>,
    ) -> TaskResult<Transaction> {
        let operations = plan_operations(paths, op_type, destination).map_err(|e| self.reject(e))?;

        let transaction = Transaction {
            id: uuid::Uuid::new_v4().to_string(),
            operations,
            status: TransactionStatus::Pending,
            timestamp: Utc::now(),
            completed_operations: 0,
            compensated_operations: 0,
            error: None,
        };
        let id = transaction.id.clone();
        {
            let mut state = self.state.write();
            state.order.push(id.clone());
            state.transactions.insert(id.clone(), transaction.clone());
        }
        tracing::info!(
            transaction = %id,
            op = op_type.as_str(),
            count = paths.len(),
            "batch started"
        );
        self.bus.emit(BATCH_STARTED, to_payload(&transaction));

        let mut held = Vec::with_capacity(paths.len());
        for path in paths {
            match self.try_lock(path) {
                Some(generation) => held.push((path.clone(), generation)),
                None => {
                    self.release_held(&held);
                    let error = TaskError::Conflict(format!(
                        "{} is locked by another operation",
                        path.display()
                    ));
                    let rolled_back =
                        self.finish(&id, TransactionStatus::RolledBack, Some(error.to_string()));
                    tracing::warn!(
                        transaction = %id,
                        path = %path.display(),
                        "batch aborted, path locked"
                    );
                    if let Some(tx) = rolled_back {
                        self.bus.emit(BATCH_ROLLED_BACK, to_payload(&tx));
                    }
                    return Err(self.reject(error));
                }
            }
        }

        self.set_status(&id, TransactionStatus::Committing);
        let mut failure = None;
        for (index, operation) in transaction.operations.iter().enumerate() {
            let name = format!("batch:{}", operation.op_type.as_str());
            match self.bus.track_operation(&name, self.apply(operation)).await {
                Ok(()) => {
                    let done = index + 1;
                    self.update(&id, |tx| tx.completed_operations = done);
                    self.bus.emit(
                        BATCH_PROGRESS,
                        json!({
                            "id": id,
                            "completed": done,
                            "total": transaction.operations.len(),
                            "source": operation.source,
                        }),
                    );
                }
                Err(error) => {
                    failure = Some(into_operation_error(operation, error));
                    break;
                }
            }
        }

        let Some(error) = failure else {
            self.release_held(&held);
            let committed = self
                .finish(&id, TransactionStatus::Committed, None)
                .ok_or_else(|| TaskError::NotFound(format!("transaction {}", id)))?;
            tracing::info!(transaction = %id, "batch committed");
            self.bus.emit(BATCH_COMMITTED, to_payload(&committed));
            return Ok(committed);
        };

        self.set_status(&id, TransactionStatus::RollingBack);
        self.bus.emit(BATCH_ROLLING_BACK, json!({ "id": id, "error": error.to_string() }));
        let applied = self.transaction(&id).map(|tx| tx.completed_operations).unwrap_or(0);
        if self.settings.read().compensate_on_rollback {
            let compensated = self.compensate(&transaction.operations[..applied]).await;
            self.update(&id, |tx| tx.compensated_operations = compensated);
        }
        self.release_held(&held);

        let rolled_back = self.finish(&id, TransactionStatus::RolledBack, Some(error.to_string()));
        tracing::warn!(transaction = %id, applied, "batch rolled back: {}", error);
        if let Some(tx) = rolled_back {
            self.bus.emit(BATCH_ROLLED_BACK, to_payload(&tx));
        }
        Err(self.reject(error))
    }

    async fn apply(&self, operation: &FileOperation) -> TaskResult<()> {
        let destination = operation.destination.as_deref();
        match (operation.op_type, destination) {
            (OperationType::Copy, Some(dest)) => {
                self.fs.copy(&operation.source, dest).await.map(|_| ())
            }
            (OperationType::Move, Some(dest)) => self.fs.move_path(&operation.source, dest).await,
            (OperationType::Delete, _) => self.fs.delete(&operation.source).await,
            (op, None) => Err(TaskError::Validation(format!(
                "{} requires a destination",
                op.as_str()
            ))),
        }
    }

    /// Undoes applied copies and moves, newest first. Returns how many were
    /// undone; failures are logged and skipped.
    async fn compensate(&self, applied: &[FileOperation]) -> usize {
        let mut undone = 0;
        for operation in applied.iter().rev() {
            let result = match (operation.op_type, operation.destination.as_deref()) {
                (OperationType::Copy, Some(dest)) => self.fs.delete(dest).await,
                (OperationType::Move, Some(dest)) => {
                    self.fs.move_path(dest, &operation.source).await
                }
                _ => continue,
            };
            match result {
                Ok(()) => undone += 1,
                Err(e) => tracing::warn!(
                    source = %operation.source.display(),
                    "compensation failed: {}",
                    e
                ),
            }
        }
        undone
    }

    fn update<F>(&self, id: &str, apply: F) -> Option<Transaction>
    where
        F: FnOnce(&mut Transaction),
    {
        let mut state = self.state.write();
        let tx = state.transactions.get_mut(id)?;
        apply(tx);
        Some(tx.clone())
    }

    fn set_status(&self, id: &str, status: TransactionStatus) {
        self.update(id, |tx| tx.status = status);
        tracing::debug!(transaction = id, ?status, "transaction status");
    }

    fn finish(
        &self,
        id: &str,
        status: TransactionStatus,
        error: Option<String>,
    ) -> Option<Transaction> {
        self.update(id, |tx| {
            tx.status = status;
            tx.error = error;
        })
    }

    /// Records a new version of `path` with its current checksum and size.
    /// Version numbers start at 1 and grow by one per path.
    pub async fn create_file_version(&self, path: &Path) -> TaskResult<FileVersion> {
        let checksum = self
            .bus
            .track_operation("batch:hash", self.fs.hash(path))
            .await
            .map_err(|e| self.reject(e))?;
        let size = self.fs.size(path).await.map_err(|e| self.reject(e))?;

        let version = {
            let mut state = self.state.write();
            let history = state.versions.entry(path.to_path_buf()).or_default();
            let version = FileVersion {
                path: path.to_path_buf(),
                version: history.last().map(|v| v.version + 1).unwrap_or(1),
                checksum,
                size,
                created_at: Utc::now(),
            };
            history.push(version.clone());
            version
        };

        tracing::debug!(path = %path.display(), version = version.version, "file version created");
        self.bus.emit(BATCH_VERSION_CREATED, to_payload(&version));
        Ok(version)
    }

    pub fn file_versions(&self, path: &Path) -> Vec<FileVersion> {
        self.state.read().versions.get(path).cloned().unwrap_or_default()
    }

    pub fn latest_version(&self, path: &Path) -> Option<FileVersion> {
        self.state.read().versions.get(path).and_then(|v| v.last().cloned())
    }

    pub fn transaction(&self, id: &str) -> Option<Transaction> {
        self.state.read().transactions.get(id).cloned()
    }

    /// Oldest first.
    pub fn transactions(&self) -> Vec<Transaction> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter_map(|id| state.transactions.get(id).cloned())
            .collect()
    }
}

fn release_generation(table: &Mutex<LockTable>, path: &Path, generation: u64) -> bool {
    let mut table = table.lock();
    if table.locks.get(path).map(|entry| entry.generation) == Some(generation) {
        table.locks.remove(path);
        true
    } else {
        false
    }
}

fn plan_operations(
    paths: &[PathBuf],
    op_type: OperationType,
    destination: Option<&Path>,
) -> TaskResult<Vec<FileOperation>> {
    if paths.is_empty() {
        return Err(TaskError::Validation("batch needs at least one path".into()));
    }
    let destination = match (op_type.needs_destination(), destination) {
        (true, None) => {
            return Err(TaskError::Validation(format!(
                "{} requires a destination",
                op_type.as_str()
            )));
        }
        (true, Some(dest)) if dest.as_os_str().is_empty() => {
            return Err(TaskError::Validation("destination must not be empty".into()));
        }
        (true, dest) => dest,
        (false, _) => None,
    };

    let mut seen = HashSet::new();
    paths
        .iter()
        .map(|source| {
            if source.as_os_str().is_empty() {
                return Err(TaskError::Validation("path must not be empty".into()));
            }
            if !seen.insert(source) {
                return Err(TaskError::Validation(format!("{} listed twice", source.display())));
            }
            let destination = match destination {
                Some(dir) => {
                    let name = source
                        .file_name()
                        .ok_or_else(|| {
                            TaskError::Validation(format!("{} has no file name", source.display()))
                        })?;
                    Some(dir.join(name))
                }
                None => None,
            };
            Ok(FileOperation {
                op_type,
                source: source.clone(),
                destination,
            })
        })
        .collect()
}

fn into_operation_error(operation: &FileOperation, error: TaskError) -> TaskError {
    match error {
        TaskError::Operation { .. } => error,
        other => TaskError::operation_from(
            format!("{} of {} failed", operation.op_type.as_str(), operation.source.display()),
            other,
        ),
    }
}
