//! Task store for persisting and managing batch task state.
//!
//! A batch job is split into tasks, one per planned output file. The store
//! owns every task's lifecycle: status transitions, progress aggregation,
//! retry scheduling with exponential backoff, and JSON persistence that is
//! durable enough to resume a crashed run.

use crate::classify::FailureReason;
use crate::naming::generate_unique_output_path;
use crate::scan::list_materials;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

/// Backoff delays in seconds, indexed by `min(retry_count - 1, 4)`.
///
/// Tunable constant, kept at this table for behavioral compatibility.
pub const RETRY_DELAYS_SECS: [u64; 5] = [1, 2, 4, 8, 16];

/// Interval of the auto-save safety net.
const AUTO_SAVE_INTERVAL: Duration = Duration::from_secs(30);

/// Error type for task store operations
#[derive(Debug, Error)]
pub enum TaskStoreError {
    /// IO error reading or writing persisted state
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The input folder holds no material files
    #[error("no material files found in {}", folder.display())]
    NoMaterials { folder: PathBuf },

    /// Fewer materials than a single output needs
    #[error("only {available} materials for {needed} per output")]
    InsufficientMaterials { available: usize, needed: usize },

    /// No persisted state exists for the job id
    #[error("no persisted state for job {job_id}")]
    UnknownJob { job_id: String },
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is waiting to run.
    Pending,
    /// Task is currently running.
    Running,
    /// Task completed successfully.
    Completed,
    /// Task failed; may still have retries left.
    Failed,
    /// Task was cancelled by the caller.
    Cancelled,
    /// Task is waiting out a retry backoff.
    Retrying,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
            TaskStatus::Retrying => write!(f, "retrying"),
        }
    }
}

/// One retryable unit of work inside a batch job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInfo {
    /// Unique task identifier.
    pub task_id: String,
    /// Material file names feeding this output.
    pub input_files: Vec<String>,
    /// Destination path of the produced output.
    pub output_path: PathBuf,
    /// 1-based index of the output within the job.
    pub output_number: u32,
    #[serde(default)]
    pub status: TaskStatus,
    /// Progress in [0, 1].
    #[serde(default)]
    pub progress: f32,
    pub created_time: String,
    #[serde(default)]
    pub started_time: Option<String>,
    #[serde(default)]
    pub completed_time: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub estimated_duration: f64,
    #[serde(default)]
    pub actual_duration: f64,
}

impl TaskInfo {
    /// Whether the task has burned through all of its retries.
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Batch-level metadata for a job, carrying enough identifying information
/// to reconstruct a runner after a crash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchJobInfo {
    pub job_id: String,
    pub input_folder: PathBuf,
    pub output_folder: PathBuf,
    pub videos_per_output: usize,
    pub total_outputs: usize,
    /// Caller-defined settings bundle; opaque to the engine.
    #[serde(default)]
    pub settings: serde_json::Value,
    pub created_time: String,
    #[serde(default)]
    pub started_time: Option<String>,
    #[serde(default)]
    pub completed_time: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub completed_tasks: u32,
    #[serde(default)]
    pub failed_tasks: u32,
    #[serde(default)]
    pub total_progress: f32,
}

/// Parameters for creating a batch job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub input_folder: PathBuf,
    pub output_folder: PathBuf,
    pub videos_per_output: usize,
    pub total_outputs: usize,
    /// Caller-defined settings bundle; stored verbatim.
    pub settings: serde_json::Value,
}

/// Counts by status plus aggregate progress and remaining-time estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatistics {
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub running: usize,
    pub overall_progress: f32,
    pub estimated_remaining_time: f64,
}

/// On-disk shape of one job's persisted state.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedJob {
    job: BatchJobInfo,
    tasks: Vec<TaskInfo>,
    saved_time: String,
}

struct StoreInner {
    job: Option<BatchJobInfo>,
    tasks: BTreeMap<String, TaskInfo>,
}

/// Persistent store for one batch job's tasks.
pub struct TaskStore {
    persistence_dir: PathBuf,
    max_retries: u32,
    inner: Mutex<StoreInner>,
}

impl TaskStore {
    /// Create a store persisting into `persistence_dir`.
    pub fn new(persistence_dir: impl Into<PathBuf>, max_retries: u32) -> Self {
        Self {
            persistence_dir: persistence_dir.into(),
            max_retries,
            inner: Mutex::new(StoreInner {
                job: None,
                tasks: BTreeMap::new(),
            }),
        }
    }

    /// Create a store from engine configuration.
    pub fn from_config(config: &vidmerge_config::EngineConfig) -> Self {
        Self::new(config.storage.state_dir.clone(), config.retry.max_retries)
    }

    /// Create a batch job and generate its tasks, one per planned output.
    ///
    /// Each task gets a collision-free output path up front. Input files are
    /// a provisional pick; the runner reselects through the diversity
    /// selector at execution time.
    pub fn create_job(&self, spec: JobSpec) -> Result<String, TaskStoreError> {
        let materials = list_materials(&spec.input_folder)?;
        if materials.is_empty() {
            return Err(TaskStoreError::NoMaterials {
                folder: spec.input_folder.clone(),
            });
        }
        if materials.len() < spec.videos_per_output {
            return Err(TaskStoreError::InsufficientMaterials {
                available: materials.len(),
                needed: spec.videos_per_output,
            });
        }

        let job_id = format!(
            "job_{}_{}",
            current_timestamp_secs(),
            folder_fingerprint(&spec.input_folder) % 10000
        );

        {
            let mut inner = self.inner.lock().unwrap();

            inner.job = Some(BatchJobInfo {
                job_id: job_id.clone(),
                input_folder: spec.input_folder.clone(),
                output_folder: spec.output_folder.clone(),
                videos_per_output: spec.videos_per_output,
                total_outputs: spec.total_outputs,
                settings: spec.settings,
                created_time: now_iso(),
                started_time: None,
                completed_time: None,
                status: TaskStatus::Pending,
                completed_tasks: 0,
                failed_tasks: 0,
                total_progress: 0.0,
            });

            inner.tasks.clear();
            for i in 1..=spec.total_outputs {
                let task_id = format!("{}_task_{:04}", job_id, i);
                let output_path = generate_unique_output_path(
                    &spec.output_folder,
                    &format!("merged_{:03}", i),
                    "mp4",
                );

                let task = TaskInfo {
                    task_id: task_id.clone(),
                    input_files: materials[..spec.videos_per_output].to_vec(),
                    output_path,
                    output_number: i as u32,
                    status: TaskStatus::Pending,
                    progress: 0.0,
                    created_time: now_iso(),
                    started_time: None,
                    completed_time: None,
                    retry_count: 0,
                    max_retries: self.max_retries,
                    failure_reason: None,
                    error_message: String::new(),
                    estimated_duration: 0.0,
                    actual_duration: 0.0,
                };
                inner.tasks.insert(task_id, task);
            }
        }

        self.save_state()?;
        Ok(job_id)
    }

    /// Load a previously persisted job by id.
    pub fn load_job(&self, job_id: &str) -> Result<(), TaskStoreError> {
        let job_file = self.persistence_dir.join(format!("{}.json", job_id));
        if !job_file.exists() {
            return Err(TaskStoreError::UnknownJob {
                job_id: job_id.to_string(),
            });
        }

        let content = std::fs::read_to_string(&job_file)?;
        let persisted: PersistedJob = serde_json::from_str(&content)?;

        let mut inner = self.inner.lock().unwrap();
        inner.tasks = persisted
            .tasks
            .into_iter()
            .map(|t| (t.task_id.clone(), t))
            .collect();
        inner.job = Some(persisted.job);

        debug!(job_id, tasks = inner.tasks.len(), "loaded persisted job");
        Ok(())
    }

    /// Write the current job and task list to disk.
    pub fn save_state(&self) -> Result<(), TaskStoreError> {
        let persisted = {
            let inner = self.inner.lock().unwrap();
            let Some(job) = &inner.job else {
                return Ok(());
            };
            PersistedJob {
                job: job.clone(),
                tasks: inner.tasks.values().cloned().collect(),
                saved_time: now_iso(),
            }
        };

        std::fs::create_dir_all(&self.persistence_dir)?;
        let job_file = self
            .persistence_dir
            .join(format!("{}.json", persisted.job.job_id));
        let json = serde_json::to_string_pretty(&persisted)?;
        std::fs::write(job_file, json)?;
        Ok(())
    }

    /// Persist, logging instead of propagating; status transitions must not
    /// fail on a transient disk hiccup.
    fn save_state_logged(&self) {
        if let Err(e) = self.save_state() {
            warn!(error = %e, "failed to persist task state");
        }
    }

    /// Current job metadata, if a job exists.
    pub fn current_job(&self) -> Option<BatchJobInfo> {
        self.inner.lock().unwrap().job.clone()
    }

    /// Snapshot of one task.
    pub fn task(&self, task_id: &str) -> Option<TaskInfo> {
        self.inner.lock().unwrap().tasks.get(task_id).cloned()
    }

    /// Tasks eligible to (re)run: pending, or failed with retries left.
    pub fn get_resumable_tasks(&self) -> Vec<TaskInfo> {
        let inner = self.inner.lock().unwrap();
        inner
            .tasks
            .values()
            .filter(|t| match t.status {
                TaskStatus::Pending => true,
                TaskStatus::Failed => !t.is_exhausted(),
                _ => false,
            })
            .cloned()
            .collect()
    }

    /// Tasks that finished successfully.
    pub fn get_completed_tasks(&self) -> Vec<TaskInfo> {
        let inner = self.inner.lock().unwrap();
        inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Completed)
            .cloned()
            .collect()
    }

    /// Tasks that failed permanently (retries exhausted).
    pub fn get_failed_tasks(&self) -> Vec<TaskInfo> {
        let inner = self.inner.lock().unwrap();
        inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Failed && t.is_exhausted())
            .cloned()
            .collect()
    }

    /// Mark a task as running. Unknown task ids are ignored.
    pub fn mark_task_started(&self, task_id: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(task) = inner.tasks.get_mut(task_id) {
                task.status = TaskStatus::Running;
                task.started_time = Some(now_iso());
            }
            update_job_progress(&mut inner);
        }
        self.save_state_logged();
    }

    /// Mark a task as completed, recording its actual duration.
    pub fn mark_task_completed(&self, task_id: &str, actual_duration: f64) {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(task) = inner.tasks.get_mut(task_id) {
                task.status = TaskStatus::Completed;
                task.completed_time = Some(now_iso());
                task.progress = 1.0;
                task.actual_duration = actual_duration;
            }
            if let Some(job) = &mut inner.job {
                job.completed_tasks += 1;
            }
            update_job_progress(&mut inner);
        }
        self.save_state_logged();
    }

    /// Mark a task as failed with a classified reason.
    ///
    /// The retry count is expected to have been advanced by the executor
    /// already; when retries remain, a backoff-delayed retry is scheduled.
    pub fn mark_task_failed(
        self: &Arc<Self>,
        task_id: &str,
        error_message: &str,
        failure_reason: FailureReason,
    ) {
        let schedule = {
            let mut inner = self.inner.lock().unwrap();
            let mut schedule = false;
            if let Some(task) = inner.tasks.get_mut(task_id) {
                task.status = TaskStatus::Failed;
                task.error_message = error_message.to_string();
                task.failure_reason = Some(failure_reason);
                schedule = !task.is_exhausted();
            }
            if let Some(job) = &mut inner.job {
                job.failed_tasks += 1;
            }
            update_job_progress(&mut inner);
            schedule
        };
        self.save_state_logged();

        if schedule {
            self.schedule_retry(task_id);
        }
    }

    /// Mark a task as cancelled. Cancelled tasks are never resurrected by a
    /// pending retry.
    pub fn mark_task_cancelled(&self, task_id: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(task) = inner.tasks.get_mut(task_id) {
                task.status = TaskStatus::Cancelled;
            }
            update_job_progress(&mut inner);
        }
        self.save_state_logged();
    }

    /// Update a task's progress, clamped to [0, 1].
    pub fn update_task_progress(&self, task_id: &str, progress: f32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = inner.tasks.get_mut(task_id) {
            task.progress = progress.clamp(0.0, 1.0);
        }
        update_job_progress(&mut inner);
    }

    /// Advance a task's retry count, capped at its retry limit.
    /// Returns the new count.
    pub fn increment_retry(&self, task_id: &str) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        match inner.tasks.get_mut(task_id) {
            Some(task) => {
                task.retry_count = (task.retry_count + 1).min(task.max_retries);
                task.retry_count
            }
            None => 0,
        }
    }

    /// Exhaust a task's retries, making its failure permanent.
    pub fn force_exhaust(&self, task_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = inner.tasks.get_mut(task_id) {
            task.retry_count = task.max_retries;
        }
    }

    /// After the backoff delay, flip the task back to pending, but only if
    /// it is still failed, so a task cancelled in the meantime stays
    /// cancelled.
    fn schedule_retry(self: &Arc<Self>, task_id: &str) {
        let delay = {
            let inner = self.inner.lock().unwrap();
            let Some(task) = inner.tasks.get(task_id) else {
                return;
            };
            if task.is_exhausted() {
                return;
            }
            let index = (task.retry_count.saturating_sub(1) as usize)
                .min(RETRY_DELAYS_SECS.len() - 1);
            Duration::from_secs(RETRY_DELAYS_SECS[index])
        };

        let store = Arc::clone(self);
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let flipped = {
                let mut inner = store.inner.lock().unwrap();
                match inner.tasks.get_mut(&task_id) {
                    Some(task) if task.status == TaskStatus::Failed => {
                        task.status = TaskStatus::Pending;
                        task.error_message.clear();
                        true
                    }
                    _ => false,
                }
            };
            if flipped {
                debug!(%task_id, "task re-queued after backoff");
                store.save_state_logged();
            }
        });
    }

    /// Counts by status, overall progress, and a remaining-time estimate of
    /// `average completed duration x tasks not yet completed`.
    pub fn get_statistics(&self) -> JobStatistics {
        let inner = self.inner.lock().unwrap();

        let total_tasks = inner.tasks.len();
        let mut completed = 0;
        let mut failed = 0;
        let mut pending = 0;
        let mut running = 0;
        let mut progress_sum = 0.0f32;
        let mut duration_sum = 0.0f64;
        let mut duration_count = 0usize;

        for task in inner.tasks.values() {
            progress_sum += task.progress;
            match task.status {
                TaskStatus::Completed => {
                    completed += 1;
                    if task.actual_duration > 0.0 {
                        duration_sum += task.actual_duration;
                        duration_count += 1;
                    }
                }
                TaskStatus::Failed => failed += 1,
                TaskStatus::Pending => pending += 1,
                TaskStatus::Running => running += 1,
                _ => {}
            }
        }

        let overall_progress = if total_tasks > 0 {
            progress_sum / total_tasks as f32
        } else {
            0.0
        };

        let estimated_remaining_time = if duration_count > 0 {
            let avg = duration_sum / duration_count as f64;
            avg * (total_tasks - completed) as f64
        } else {
            0.0
        };

        JobStatistics {
            total_tasks,
            completed,
            failed,
            pending,
            running,
            overall_progress,
            estimated_remaining_time,
        }
    }

    /// Spawn the auto-save safety net, flushing state every 30 seconds.
    pub fn start_auto_save(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(AUTO_SAVE_INTERVAL).await;
                store.save_state_logged();
            }
        })
    }

    /// Remove persisted job files older than `days` days.
    pub fn cleanup_old_jobs(&self, days: u64) {
        let Ok(entries) = std::fs::read_dir(&self.persistence_dir) else {
            return;
        };

        let cutoff = Duration::from_secs(days * 24 * 60 * 60);

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
                .map(|age| age > cutoff)
                .unwrap_or(false);

            if expired {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "failed to remove old job file");
                }
            }
        }
    }
}

/// Recompute the job's mean task progress; a job with every task completed
/// becomes completed itself.
fn update_job_progress(inner: &mut StoreInner) {
    let task_count = inner.tasks.len();
    if task_count == 0 {
        return;
    }

    let progress_sum: f32 = inner.tasks.values().map(|t| t.progress).sum();
    let completed = inner
        .tasks
        .values()
        .filter(|t| t.status == TaskStatus::Completed)
        .count();

    if let Some(job) = &mut inner.job {
        job.total_progress = progress_sum / task_count as f32;
        if completed == task_count && job.status != TaskStatus::Completed {
            job.status = TaskStatus::Completed;
            job.completed_time = Some(now_iso());
        }
    }
}

/// Current wall-clock time as an ISO-8601 string.
fn now_iso() -> String {
    chrono::Local::now().to_rfc3339()
}

/// Seconds since the Unix epoch.
fn current_timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Stable small fingerprint of a folder path, for readable job ids.
fn folder_fingerprint(folder: &Path) -> u64 {
    let digest = Sha256::digest(folder.to_string_lossy().as_bytes());
    u64::from_be_bytes(digest[..8].try_into().unwrap_or_default())
}
