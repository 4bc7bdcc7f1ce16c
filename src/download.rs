//! Download queue: independent transfer tasks admitted through a gate.
//!
//! Tasks move `pending -> downloading -> {paused, completed, error}` and
//! back from `paused` to `downloading`. Cancelling removes a task outright,
//! so cancelled downloads leave no history behind.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{TaskError, TaskResult};
use crate::events::{to_payload, EventBus};
use crate::gate::ConcurrencyGate;
use crate::settings::DownloadSettings;
use crate::task::{elapsed_ms, TaskMeta, TaskStatus};
use crate::validation::{validate_download_url, validate_filename, ExtensionPolicy};

pub const DOWNLOAD_ADDED: &str = "download:added";
pub const DOWNLOAD_STARTED: &str = "download:started";
pub const DOWNLOAD_PROGRESS: &str = "download:progress";
pub const DOWNLOAD_PAUSED: &str = "download:paused";
pub const DOWNLOAD_RESUMED: &str = "download:resumed";
pub const DOWNLOAD_COMPLETED: &str = "download:completed";
pub const DOWNLOAD_FAILED: &str = "download:failed";
pub const DOWNLOAD_RETRY: &str = "download:retry";
pub const DOWNLOAD_RETRIED: &str = "download:retried";
pub const DOWNLOAD_CANCELLED: &str = "download:cancelled";
pub const DOWNLOAD_ERROR: &str = "download:error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Error,
}

impl TaskStatus for DownloadStatus {
    fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Error)
    }

    fn is_active(&self) -> bool {
        matches!(self, DownloadStatus::Downloading)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadPriority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Falls back to the configured default destination.
    pub destination_uri: Option<String>,
    pub priority: DownloadPriority,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadTask {
    #[serde(flatten)]
    pub meta: TaskMeta,
    pub url: String,
    pub filename: String,
    pub destination_uri: String,
    pub status: DownloadStatus,
    pub priority: DownloadPriority,
    pub progress: f64,
    pub size: Option<u64>,
    pub downloaded_size: u64,
    /// Bytes per second, as last reported by the transfer.
    pub speed: f64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DownloadTask {
    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(elapsed_ms(start, end)),
            _ => None,
        }
    }

    /// Progress only moves forward and stays within `[0, 1]`.
    fn advance(&mut self, progress: f64) {
        if progress.is_finite() {
            self.progress = self.progress.max(progress.clamp(0.0, 1.0));
        }
    }

    fn apply_bytes(&mut self, downloaded: u64, size: Option<u64>) {
        if let Some(size) = size {
            self.size = Some(size);
        }
        self.downloaded_size = match self.size {
            Some(size) => downloaded.min(size).max(self.downloaded_size.min(size)),
            None => downloaded.max(self.downloaded_size),
        };
        if let Some(size) = self.size.filter(|s| *s > 0) {
            self.advance(self.downloaded_size as f64 / size as f64);
        }
    }
}

/// Progress reported by the transfer collaborator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
    pub speed: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferOutcome {
    pub size: u64,
}

/// Progress callback handed to [`Transfer::fetch`]. Returns `false` once the
/// task was paused or cancelled and the transfer should stop.
pub type ProgressFn<'a> = &'a (dyn Fn(TransferProgress) -> bool + Send + Sync);

/// Transfer primitive supplied by the platform's download APIs.
#[async_trait]
pub trait Transfer: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        destination_uri: &str,
        on_progress: ProgressFn<'_>,
    ) -> TaskResult<TransferOutcome>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStats {
    pub total: usize,
    pub pending: usize,
    pub downloading: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub total_progress: f64,
    pub average_progress: f64,
    pub total_speed: f64,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
}

impl DownloadStats {
    pub fn from_tasks(tasks: &[DownloadTask]) -> Self {
        let mut stats = DownloadStats {
            total: tasks.len(),
            ..Default::default()
        };
        for task in tasks {
            match task.status {
                DownloadStatus::Pending => stats.pending += 1,
                DownloadStatus::Downloading => {
                    stats.downloading += 1;
                    stats.total_speed += task.speed;
                }
                DownloadStatus::Paused => stats.paused += 1,
                DownloadStatus::Completed => stats.completed += 1,
                DownloadStatus::Error => stats.failed += 1,
            }
            stats.total_progress += task.progress;
            stats.total_bytes += task.size.unwrap_or(0);
            stats.downloaded_bytes += task.downloaded_size;
        }
        if !tasks.is_empty() {
            stats.average_progress = stats.total_progress / tasks.len() as f64;
        }
        stats
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadAnalytics {
    pub total_downloads: usize,
    pub completed_downloads: usize,
    pub failed_downloads: usize,
    /// Completed over finished (completed or failed) downloads.
    pub success_rate: f64,
    /// Mean bytes per second over completed downloads.
    pub average_speed: f64,
    pub last_completed_at: Option<DateTime<Utc>>,
}

impl DownloadAnalytics {
    pub fn from_tasks(tasks: &[DownloadTask]) -> Self {
        let completed: Vec<&DownloadTask> = tasks
            .iter()
            .filter(|t| t.status == DownloadStatus::Completed)
            .collect();
        let failed = tasks.iter().filter(|t| t.status == DownloadStatus::Error).count();

        let speeds: Vec<f64> = completed
            .iter()
            .map(|t| match t.duration_ms() {
                Some(ms) if ms > 0 => t.downloaded_size as f64 * 1000.0 / ms as f64,
                _ => t.speed,
            })
            .collect();

        let finished = completed.len() + failed;
        Self {
            total_downloads: tasks.len(),
            completed_downloads: completed.len(),
            failed_downloads: failed,
            success_rate: if finished == 0 {
                0.0
            } else {
                completed.len() as f64 / finished as f64
            },
            average_speed: if speeds.is_empty() {
                0.0
            } else {
                speeds.iter().sum::<f64>() / speeds.len() as f64
            },
            last_completed_at: completed.iter().filter_map(|t| t.end_time).max(),
        }
    }
}

#[derive(Debug)]
pub struct DownloadQueueManager {
    bus: Arc<EventBus>,
    gate: Arc<ConcurrencyGate>,
    settings: RwLock<DownloadSettings>,
    extensions: RwLock<ExtensionPolicy>,
    tasks: RwLock<HashMap<String, DownloadTask>>,
}

impl DownloadQueueManager {
    pub fn new(
        bus: Arc<EventBus>,
        gate: Arc<ConcurrencyGate>,
        settings: DownloadSettings,
    ) -> TaskResult<Self> {
        let extensions = ExtensionPolicy::new(&settings.allowed_extensions)?;
        gate.set_max_concurrent(settings.max_concurrent_downloads);
        Ok(Self {
            bus,
            gate,
            settings: RwLock::new(settings),
            extensions: RwLock::new(extensions),
            tasks: RwLock::new(HashMap::new()),
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    pub fn settings(&self) -> DownloadSettings {
        self.settings.read().clone()
    }

    pub fn update_settings(&self, settings: DownloadSettings) -> TaskResult<()> {
        let extensions = ExtensionPolicy::new(&settings.allowed_extensions)?;
        self.gate.set_max_concurrent(settings.max_concurrent_downloads);
        *self.extensions.write() = extensions;
        *self.settings.write() = settings;
        Ok(())
    }

    fn reject(&self, error: TaskError) -> TaskError {
        self.bus.report_error(DOWNLOAD_ERROR, &error);
        error
    }

    pub fn add_download(
        &self,
        url: &str,
        filename: &str,
        options: DownloadOptions,
    ) -> TaskResult<DownloadTask> {
        let url = validate_download_url(url).map_err(|e| self.reject(e))?;
        validate_filename(filename).map_err(|e| self.reject(e))?;
        self.extensions.read().check(filename).map_err(|e| self.reject(e))?;

        let destination_uri = options
            .destination_uri
            .unwrap_or_else(|| self.settings.read().default_destination.clone());
        let task = DownloadTask {
            meta: TaskMeta::new(),
            url: url.to_string(),
            filename: filename.to_string(),
            destination_uri,
            status: DownloadStatus::Pending,
            priority: options.priority,
            progress: 0.0,
            size: options.size,
            downloaded_size: 0,
            speed: 0.0,
            start_time: None,
            end_time: None,
            error: None,
        };

        self.tasks.write().insert(task.id().to_string(), task.clone());
        tracing::info!(task = task.id(), url = %task.url, "download added");
        self.bus.emit(DOWNLOAD_ADDED, to_payload(&task));
        Ok(task)
    }

    /// Applies `update` to the task under the write lock and emits
    /// `event_type` with the resulting snapshot. Errors from `update` are
    /// reported on the bus and returned; the task is left untouched.
    fn mutate<F>(&self, id: &str, event_type: &str, update: F) -> TaskResult<DownloadTask>
    where
        F: FnOnce(&mut DownloadTask, &ConcurrencyGate) -> TaskResult<()>,
    {
        let snapshot = {
            let mut tasks = self.tasks.write();
            let Some(task) = tasks.get_mut(id) else {
                drop(tasks);
                return Err(self.reject(TaskError::NotFound(format!("download {}", id))));
            };
            let mut draft = task.clone();
            if let Err(error) = update(&mut draft, self.gate.as_ref()) {
                drop(tasks);
                return Err(self.reject(error));
            }
            draft.meta.touch();
            *task = draft.clone();
            draft
        };

        tracing::debug!(task = id, status = ?snapshot.status, event_type, "download updated");
        self.bus.emit(event_type, to_payload(&snapshot));
        Ok(snapshot)
    }

    pub fn start_download(&self, id: &str) -> TaskResult<DownloadTask> {
        self.mutate(id, DOWNLOAD_STARTED, |task, gate| {
            if !matches!(task.status, DownloadStatus::Pending | DownloadStatus::Paused) {
                return Err(TaskError::InvalidState(format!(
                    "cannot start download in state {:?}",
                    task.status
                )));
            }
            admit(gate, task)?;
            task.status = DownloadStatus::Downloading;
            if task.start_time.is_none() {
                task.start_time = Some(Utc::now());
            }
            Ok(())
        })
    }

    /// Frees the task's slot; bytes already received are kept.
    pub fn pause_download(&self, id: &str) -> TaskResult<DownloadTask> {
        self.mutate(id, DOWNLOAD_PAUSED, |task, gate| {
            if task.status != DownloadStatus::Downloading {
                return Err(TaskError::InvalidState(format!(
                    "cannot pause download in state {:?}",
                    task.status
                )));
            }
            gate.release(task.id());
            task.status = DownloadStatus::Paused;
            task.speed = 0.0;
            Ok(())
        })
    }

    pub fn resume_download(&self, id: &str) -> TaskResult<DownloadTask> {
        self.mutate(id, DOWNLOAD_RESUMED, |task, gate| {
            if task.status != DownloadStatus::Paused {
                return Err(TaskError::InvalidState(format!(
                    "cannot resume download in state {:?}",
                    task.status
                )));
            }
            admit(gate, task)?;
            task.status = DownloadStatus::Downloading;
            if task.start_time.is_none() {
                task.start_time = Some(Utc::now());
            }
            Ok(())
        })
    }

    /// Records forward progress without changing state. Updates for a
    /// finished task are ignored.
    pub fn update_progress(
        &self,
        id: &str,
        progress: f64,
        speed: Option<f64>,
    ) -> TaskResult<DownloadTask> {
        self.progress_update(id, |task| {
            task.advance(progress);
            if let Some(speed) = speed {
                task.speed = speed.max(0.0);
            }
        })
    }

    /// Byte-level variant of [`update_progress`](Self::update_progress);
    /// progress is derived once the total size is known.
    pub fn update_bytes(
        &self,
        id: &str,
        downloaded: u64,
        size: Option<u64>,
        speed: Option<f64>,
    ) -> TaskResult<DownloadTask> {
        self.progress_update(id, |task| {
            task.apply_bytes(downloaded, size);
            if let Some(speed) = speed {
                task.speed = speed.max(0.0);
            }
        })
    }

    fn progress_update<F>(&self, id: &str, apply: F) -> TaskResult<DownloadTask>
    where
        F: FnOnce(&mut DownloadTask),
    {
        let snapshot = {
            let mut tasks = self.tasks.write();
            let Some(task) = tasks.get_mut(id) else {
                drop(tasks);
                return Err(self.reject(TaskError::NotFound(format!("download {}", id))));
            };
            if task.is_finished() {
                return Ok(task.clone());
            }
            apply(task);
            task.meta.touch();
            task.clone()
        };

        self.bus.emit(
            DOWNLOAD_PROGRESS,
            json!({
                "id": snapshot.id(),
                "progress": snapshot.progress,
                "downloadedSize": snapshot.downloaded_size,
                "size": snapshot.size,
                "speed": snapshot.speed,
            }),
        );
        Ok(snapshot)
    }

    /// Completing an already completed task is a no-op.
    pub fn complete_download(&self, id: &str) -> TaskResult<DownloadTask> {
        if let Some(task) = self.task(id).filter(|t| t.status == DownloadStatus::Completed) {
            return Ok(task);
        }
        let task = self.mutate(id, DOWNLOAD_COMPLETED, |task, gate| {
            if !matches!(task.status, DownloadStatus::Downloading | DownloadStatus::Paused) {
                return Err(TaskError::InvalidState(format!(
                    "cannot complete download in state {:?}",
                    task.status
                )));
            }
            gate.release(task.id());
            task.status = DownloadStatus::Completed;
            task.progress = 1.0;
            if let Some(size) = task.size {
                task.downloaded_size = size;
            } else {
                task.size = Some(task.downloaded_size);
            }
            task.end_time = Some(Utc::now());
            task.error = None;
            Ok(())
        })?;
        tracing::info!(task = id, bytes = task.downloaded_size, "download completed");
        Ok(task)
    }

    pub fn fail_download(&self, id: &str, message: &str) -> TaskResult<DownloadTask> {
        let task = self.mutate(id, DOWNLOAD_FAILED, |task, gate| {
            if task.is_finished() {
                return Err(TaskError::InvalidState(format!(
                    "download already finished as {:?}",
                    task.status
                )));
            }
            gate.release(task.id());
            task.status = DownloadStatus::Error;
            task.speed = 0.0;
            task.end_time = Some(Utc::now());
            task.error = Some(message.to_string());
            Ok(())
        })?;
        tracing::warn!(task = id, "download failed: {}", message);
        Ok(task)
    }

    /// Puts a failed task back in the queue.
    pub fn retry_download(&self, id: &str) -> TaskResult<DownloadTask> {
        self.mutate(id, DOWNLOAD_RETRIED, |task, _| {
            if task.status != DownloadStatus::Error {
                return Err(TaskError::InvalidState(format!(
                    "only failed downloads can be retried, not {:?}",
                    task.status
                )));
            }
            task.status = DownloadStatus::Pending;
            task.meta.retry_count += 1;
            task.end_time = None;
            task.error = None;
            Ok(())
        })
    }

    /// Removes the task entirely and frees its slot.
    pub fn cancel_download(&self, id: &str) -> TaskResult<DownloadTask> {
        let removed = self.tasks.write().remove(id);
        let Some(task) = removed else {
            return Err(self.reject(TaskError::NotFound(format!("download {}", id))));
        };
        self.gate.release(id);
        tracing::info!(task = id, "download cancelled");
        self.bus.emit(DOWNLOAD_CANCELLED, to_payload(&task));
        Ok(task)
    }

    /// Drives one task through the transfer collaborator, starting or
    /// resuming it first. Failed attempts are retried up to
    /// `retry_attempts` times. Returns early, without error, if the task is
    /// paused or cancelled mid-transfer.
    pub async fn run_download<T>(&self, id: &str, transfer: &T) -> TaskResult<DownloadTask>
    where
        T: Transfer + ?Sized,
    {
        let task = match self.task(id).map(|t| t.status) {
            Some(DownloadStatus::Paused) => self.resume_download(id)?,
            _ => self.start_download(id)?,
        };
        let settings = self.settings();

        let on_progress = |progress: TransferProgress| -> bool {
            match self.update_bytes(id, progress.downloaded, progress.total, Some(progress.speed)) {
                Ok(task) => task.status == DownloadStatus::Downloading,
                Err(_) => false,
            }
        };

        let mut attempt: u32 = 0;
        loop {
            let outcome = self
                .bus
                .track_operation(
                    "download:transfer",
                    transfer.fetch(&task.url, &task.destination_uri, &on_progress),
                )
                .await;

            let status = self.task(id).map(|t| t.status);
            match (outcome, status) {
                (_, None) => {
                    tracing::debug!(task = id, "download cancelled during transfer");
                    return Err(self.cancelled(id));
                }
                (_, Some(DownloadStatus::Paused)) => {
                    return self.task(id).ok_or_else(|| TaskError::NotFound(id.to_string()));
                }
                (Ok(outcome), Some(_)) => {
                    self.update_bytes(id, outcome.size, Some(outcome.size), None)?;
                    return self.complete_download(id);
                }
                (Err(error), Some(_)) => {
                    if !error.is_retryable() || attempt >= settings.retry_attempts {
                        self.fail_download(id, &error.to_string())?;
                        return Err(error);
                    }
                    attempt += 1;
                    self.note_retry(id, attempt, &error);
                    tokio::time::sleep(settings.retry_delay()).await;

                    // The task may have been paused, cancelled or finished
                    // while waiting; only a task still holding its slot
                    // goes again.
                    match self.task(id) {
                        None => {
                            tracing::debug!(task = id, "download cancelled before retry");
                            return Err(self.cancelled(id));
                        }
                        Some(current)
                            if current.status == DownloadStatus::Downloading
                                && self.gate.is_admitted(id) => {}
                        Some(current) => {
                            tracing::debug!(task = id, status = ?current.status, "retry abandoned");
                            return Ok(current);
                        }
                    }
                }
            }
        }
    }

    fn cancelled(&self, id: &str) -> TaskError {
        self.reject(TaskError::NotFound(format!("download {} was cancelled", id)))
    }

    fn note_retry(&self, id: &str, attempt: u32, error: &TaskError) {
        let retry_count = {
            let mut tasks = self.tasks.write();
            let Some(task) = tasks.get_mut(id) else { return };
            task.meta.retry_count += 1;
            task.meta.touch();
            task.meta.retry_count
        };
        tracing::warn!(task = id, attempt, "transfer failed, retrying: {}", error);
        self.bus.emit(
            DOWNLOAD_RETRY,
            json!({
                "id": id,
                "attempt": attempt,
                "retryCount": retry_count,
                "error": error.to_string(),
            }),
        );
    }

    pub fn task(&self, id: &str) -> Option<DownloadTask> {
        self.tasks.read().get(id).cloned()
    }

    /// All tasks, highest priority first, then oldest first.
    pub fn tasks(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<DownloadTask> = self.tasks.read().values().cloned().collect();
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.meta.created_at.cmp(&b.meta.created_at))
        });
        tasks
    }

    pub fn stats(&self) -> DownloadStats {
        DownloadStats::from_tasks(&self.tasks())
    }

    pub fn analytics(&self) -> DownloadAnalytics {
        DownloadAnalytics::from_tasks(&self.tasks())
    }

    /// Drops completed and failed tasks.
    pub fn clear_finished(&self) -> usize {
        let mut tasks = self.tasks.write();
        let before = tasks.len();
        tasks.retain(|_, t| !t.is_finished());
        before - tasks.len()
    }
}

fn admit(gate: &ConcurrencyGate, task: &DownloadTask) -> TaskResult<()> {
    if gate.try_admit(task.id()) {
        Ok(())
    } else {
        Err(TaskError::ResourceExhausted(format!(
            "{} of {} download slots in use",
            gate.active(),
            gate.max_concurrent()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn manager(max: usize) -> DownloadQueueManager {
        let settings = DownloadSettings {
            max_concurrent_downloads: max,
            ..DownloadSettings::default()
        };
        DownloadQueueManager::new(
            Arc::new(EventBus::new("downloads")),
            Arc::new(ConcurrencyGate::new("downloads", max)),
            settings,
        )
        .unwrap()
    }

    fn add(queue: &DownloadQueueManager, name: &str) -> String {
        queue
            .add_download(
                &format!("https://example.com/{}", name),
                name,
                DownloadOptions::default(),
            )
            .unwrap()
            .meta
            .id
    }

    #[test]
    fn validates_before_creating_tasks() {
        let queue = manager(1);
        let opts = DownloadOptions::default;
        assert!(matches!(
            queue.add_download("nope", "a.zip", opts()),
            Err(TaskError::Validation(_))
        ));
        assert!(matches!(
            queue.add_download("https://example.com/a", "../a.zip", opts()),
            Err(TaskError::Validation(_))
        ));
        queue
            .update_settings(DownloadSettings {
                allowed_extensions: vec!["mp4".into()],
                ..DownloadSettings::default()
            })
            .unwrap();
        assert!(matches!(
            queue.add_download("https://example.com/a", "a.exe", opts()),
            Err(TaskError::Validation(_))
        ));
        assert!(queue.tasks().is_empty());
        assert!(queue.add_download("https://example.com/a", "a.mp4", opts()).is_ok());
    }

    #[test]
    fn pause_and_resume_follow_the_state_machine() {
        let queue = manager(1);
        let id = add(&queue, "a.bin");
        assert!(matches!(queue.pause_download(&id), Err(TaskError::InvalidState(_))));
        assert!(matches!(queue.resume_download(&id), Err(TaskError::InvalidState(_))));

        queue.start_download(&id).unwrap();
        assert!(matches!(queue.start_download(&id), Err(TaskError::InvalidState(_))));
        let paused = queue.pause_download(&id).unwrap();
        assert_eq!(paused.status, DownloadStatus::Paused);
        assert_eq!(queue.gate().active(), 0);

        let other = add(&queue, "b.bin");
        queue.start_download(&other).unwrap();
        assert!(matches!(queue.resume_download(&id), Err(TaskError::ResourceExhausted(_))));
        assert_eq!(queue.task(&id).unwrap().status, DownloadStatus::Paused);

        queue.cancel_download(&other).unwrap();
        assert_eq!(queue.resume_download(&id).unwrap().status, DownloadStatus::Downloading);
    }

    #[test]
    fn progress_is_monotonic_and_bounded() {
        let queue = manager(1);
        let id = add(&queue, "a.bin");
        queue.start_download(&id).unwrap();
        queue.update_progress(&id, 0.5, Some(100.0)).unwrap();
        let task = queue.update_progress(&id, 0.2, None).unwrap();
        assert_eq!(task.progress, 0.5);
        assert_eq!(task.status, DownloadStatus::Downloading);
        assert_eq!(queue.update_progress(&id, 7.0, None).unwrap().progress, 1.0);

        let task = queue.update_bytes(&id, 2_000, Some(1_000), None).unwrap();
        assert_eq!(task.downloaded_size, 1_000);
    }

    #[test]
    fn completion_fills_size_and_frees_slot() {
        let queue = manager(1);
        let id = add(&queue, "a.bin");
        queue.start_download(&id).unwrap();
        queue.update_bytes(&id, 400, Some(1_000), Some(50.0)).unwrap();
        let done = queue.complete_download(&id).unwrap();
        assert_eq!(done.progress, 1.0);
        assert_eq!(done.downloaded_size, 1_000);
        assert!(done.end_time.is_some());
        assert_eq!(queue.gate().active(), 0);

        assert_eq!(queue.complete_download(&id).unwrap(), done);
        assert_eq!(queue.update_progress(&id, 0.1, None).unwrap().progress, 1.0);
    }

    #[test]
    fn cancel_removes_the_task() {
        let queue = manager(2);
        let id = add(&queue, "a.bin");
        queue.start_download(&id).unwrap();
        assert!(queue.gate().is_admitted(&id));
        queue.cancel_download(&id).unwrap();
        assert!(!queue.gate().is_admitted(&id));
        assert!(queue.task(&id).is_none());
        assert_eq!(queue.gate().active(), 0);
        assert!(matches!(queue.cancel_download(&id), Err(TaskError::NotFound(_))));
    }

    #[test]
    fn failed_tasks_can_be_requeued() {
        let queue = manager(1);
        let id = add(&queue, "a.bin");
        queue.start_download(&id).unwrap();
        queue.fail_download(&id, "connection reset").unwrap();
        assert_eq!(queue.gate().active(), 0);
        assert!(matches!(queue.fail_download(&id, "again"), Err(TaskError::InvalidState(_))));

        let retried = queue.retry_download(&id).unwrap();
        assert_eq!(retried.status, DownloadStatus::Pending);
        assert_eq!(retried.meta.retry_count, 1);
        assert!(retried.error.is_none());
    }

    #[test]
    fn stats_and_analytics_are_derived_from_tasks() {
        let queue = manager(3);
        let a = add(&queue, "a.bin");
        let b = add(&queue, "b.bin");
        let _c = add(&queue, "c.bin");

        queue.start_download(&a).unwrap();
        queue.update_bytes(&a, 500, Some(1_000), Some(10.0)).unwrap();
        queue.start_download(&b).unwrap();
        queue.update_bytes(&b, 100, Some(100), Some(5.0)).unwrap();
        queue.complete_download(&b).unwrap();

        let stats = queue.stats();
        assert_eq!(stats.total, 3);
        assert_eq!((stats.pending, stats.downloading, stats.completed), (1, 1, 1));
        assert_eq!(stats.total_speed, 10.0);
        assert_eq!(stats.total_bytes, 1_100);
        assert_eq!(stats.downloaded_bytes, 600);
        assert!((stats.average_progress - 0.5).abs() < 1e-9);

        let analytics = queue.analytics();
        assert_eq!(analytics.completed_downloads, 1);
        assert_eq!(analytics.success_rate, 1.0);
        assert!(analytics.last_completed_at.is_some());

        assert_eq!(queue.clear_finished(), 1);
        assert_eq!(queue.tasks().len(), 2);
    }

    #[test]
    fn tasks_are_ordered_by_priority() {
        let queue = manager(1);
        let low = queue
            .add_download(
                "https://example.com/low",
                "low.bin",
                DownloadOptions {
                    priority: DownloadPriority::Low,
                    ..Default::default()
                },
            )
            .unwrap();
        let high = queue
            .add_download(
                "https://example.com/high",
                "high.bin",
                DownloadOptions {
                    priority: DownloadPriority::High,
                    destination_uri: Some("/sdcard/Download".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        let order: Vec<String> = queue.tasks().into_iter().map(|t| t.meta.id).collect();
        assert_eq!(order, vec![high.meta.id, low.meta.id]);
        assert_eq!(low.destination_uri, "downloads");
        assert_eq!(high.destination_uri, "/sdcard/Download");
    }

    #[test]
    fn single_slot_admits_one_download_at_a_time() {
        let queue = manager(1);
        let ids: Vec<String> = ["a.bin", "b.bin", "c.bin"].iter().map(|n| add(&queue, n)).collect();

        let started: Vec<bool> = ids.iter().map(|id| queue.start_download(id).is_ok()).collect();
        assert_eq!(started, vec![true, false, false]);
        assert_eq!(queue.stats().downloading, 1);
        assert_eq!(queue.stats().pending, 2);

        queue.complete_download(&ids[0]).unwrap();
        assert!(queue.start_download(&ids[1]).is_ok());
        assert!(matches!(queue.start_download(&ids[2]), Err(TaskError::ResourceExhausted(_))));

        queue.fail_download(&ids[1], "timeout").unwrap();
        assert!(queue.start_download(&ids[2]).is_ok());
    }

    struct FlakyTransfer {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Transfer for FlakyTransfer {
        async fn fetch(
            &self,
            _url: &str,
            _dest: &str,
            on_progress: ProgressFn<'_>,
        ) -> TaskResult<TransferOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(TaskError::operation("connection reset"));
            }
            on_progress(TransferProgress {
                downloaded: 512,
                total: Some(1024),
                speed: 256.0,
            });
            Ok(TransferOutcome { size: 1024 })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_download_retries_transient_failures() {
        let queue = manager(1);
        let id = add(&queue, "a.bin");
        let transfer = FlakyTransfer {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let (_sub, mut retries) = queue.bus().subscribe_channel(DOWNLOAD_RETRY);

        let task = queue.run_download(&id, &transfer).await.unwrap();
        assert_eq!(task.status, DownloadStatus::Completed);
        assert_eq!(task.size, Some(1024));
        assert_eq!(task.meta.retry_count, 2);
        assert_eq!(transfer.calls.load(Ordering::SeqCst), 3);
        assert!(retries.try_recv().is_ok());
        assert!(retries.try_recv().is_ok());
        assert!(retries.try_recv().is_err());
        assert_eq!(queue.gate().active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_download_gives_up_after_retry_budget() {
        let queue = manager(1);
        let id = add(&queue, "a.bin");
        let transfer = FlakyTransfer {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        };

        assert!(queue.run_download(&id, &transfer).await.is_err());
        let task = queue.task(&id).unwrap();
        assert_eq!(task.status, DownloadStatus::Error);
        assert_eq!(task.error.as_deref(), Some("connection reset"));
        assert_eq!(transfer.calls.load(Ordering::SeqCst), 4);
        assert_eq!(queue.gate().active(), 0);
        assert_eq!(queue.bus().metrics().error_count, 4);
    }

    struct PausingTransfer<'a> {
        queue: &'a DownloadQueueManager,
        id: String,
    }

    #[async_trait]
    impl<'a> Transfer for PausingTransfer<'a> {
        async fn fetch(
            &self,
            _url: &str,
            _dest: &str,
            on_progress: ProgressFn<'_>,
        ) -> TaskResult<TransferOutcome> {
            let progress = |downloaded| TransferProgress {
                downloaded,
                total: Some(1000),
                speed: 100.0,
            };
            assert!(on_progress(progress(400)));
            self.queue.pause_download(&self.id)?;
            assert!(!on_progress(progress(500)));
            Err(TaskError::operation("interrupted"))
        }
    }

    #[tokio::test]
    async fn pausing_mid_transfer_keeps_partial_progress() {
        let queue = manager(1);
        let id = add(&queue, "a.bin");
        let transfer = PausingTransfer {
            queue: &queue,
            id: id.clone(),
        };

        let task = queue.run_download(&id, &transfer).await.unwrap();
        assert_eq!(task.status, DownloadStatus::Paused);
        assert_eq!(task.downloaded_size, 500);
        assert!((task.progress - 0.5).abs() < 1e-9);
        assert_eq!(queue.gate().active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pausing_during_retry_delay_gives_up_the_slot() {
        let queue = manager(1);
        let a = add(&queue, "a.bin");
        let b = add(&queue, "b.bin");
        let transfer = FlakyTransfer {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        };

        let control = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            queue.pause_download(&a).unwrap();
            queue.start_download(&b).unwrap();
        };
        let (outcome, ()) = tokio::join!(queue.run_download(&a, &transfer), control);

        assert_eq!(outcome.unwrap().status, DownloadStatus::Paused);
        assert_eq!(transfer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.gate().active(), 1);
        assert!(queue.gate().is_admitted(&b));
        assert!(!queue.gate().is_admitted(&a));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_during_retry_delay_skips_the_next_attempt() {
        let queue = manager(1);
        let id = add(&queue, "a.bin");
        let transfer = FlakyTransfer {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let (_sub, mut errors) = queue.bus().subscribe_channel(DOWNLOAD_ERROR);

        let control = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            queue.cancel_download(&id).unwrap();
        };
        let (outcome, ()) = tokio::join!(queue.run_download(&id, &transfer), control);

        assert!(matches!(outcome, Err(TaskError::NotFound(_))));
        assert_eq!(transfer.calls.load(Ordering::SeqCst), 1);
        assert!(queue.task(&id).is_none());
        assert_eq!(queue.gate().active(), 0);
        assert_eq!(errors.try_recv().unwrap().payload["code"], "NOT_FOUND_ERROR");
    }

    #[test]
    fn progress_for_unknown_task_is_reported() {
        let queue = manager(1);
        let (_sub, mut errors) = queue.bus().subscribe_channel(DOWNLOAD_ERROR);

        assert!(matches!(queue.update_progress("missing", 0.5, None), Err(TaskError::NotFound(_))));
        assert!(matches!(
            queue.update_bytes("missing", 10, None, None),
            Err(TaskError::NotFound(_))
        ));
        assert_eq!(errors.try_recv().unwrap().payload["code"], "NOT_FOUND_ERROR");
        assert!(errors.try_recv().is_ok());
    }

    #[test]
    fn restarting_a_paused_task_keeps_its_start_time() {
        let queue = manager(1);
        let id = add(&queue, "a.bin");
        let first = queue.start_download(&id).unwrap().start_time;
        queue.pause_download(&id).unwrap();

        let restarted = queue.start_download(&id).unwrap();
        assert_eq!(restarted.status, DownloadStatus::Downloading);
        assert_eq!(restarted.start_time, first);
    }
}
