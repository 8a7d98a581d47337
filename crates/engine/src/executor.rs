//! Retry-aware execution of single tasks.
//!
//! Wraps one task execution with duration measurement, failure
//! classification and retry accounting. Failures are absorbed into retry
//! decisions here; they surface to the caller only once a task is
//! permanently exhausted.

use crate::classify::{classify, should_retry};
use crate::runner::RunnerError;
use crate::tasks::{TaskInfo, TaskStore};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Executes tasks against the store with classification-driven retries.
pub struct RetryExecutor {
    store: Arc<TaskStore>,
}

impl RetryExecutor {
    pub fn new(store: Arc<TaskStore>) -> Self {
        Self { store }
    }

    /// Execute one task via `processor`, recording the outcome.
    ///
    /// On success the actual duration is recorded and the task completes.
    /// On failure the error message is classified and the retry count
    /// advances; when the classifier rules the failure out for retrying the
    /// count is forced to the task's limit so the failure is permanent. The
    /// store schedules the backoff-delayed retry for tasks with retries
    /// left. Returns whether the task succeeded.
    pub fn execute_task<F>(&self, task: &TaskInfo, processor: F) -> bool
    where
        F: FnOnce(&TaskInfo) -> Result<(), RunnerError>,
    {
        let task_id = task.task_id.as_str();

        self.store.mark_task_started(task_id);
        let start = Instant::now();

        match processor(task) {
            Ok(()) => {
                let duration = start.elapsed().as_secs_f64();
                debug!(task_id, duration, "task completed");
                self.store.mark_task_completed(task_id, duration);
                true
            }
            Err(err) => {
                let reason = classify(&err.message);
                // Eligibility is judged on the count before this failure.
                let retry = should_retry(reason, task.retry_count);

                self.store.increment_retry(task_id);
                if !retry {
                    self.store.force_exhaust(task_id);
                }

                warn!(
                    task_id,
                    %reason,
                    retry,
                    error = %err,
                    "task failed"
                );
                self.store.mark_task_failed(task_id, &err.message, reason);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::FailureReason;
    use crate::tasks::{JobSpec, TaskStatus};
    use std::fs::File;
    use tempfile::TempDir;

    fn store_with_job(outputs: usize) -> (Arc<TaskStore>, TempDir, TempDir, TempDir) {
        let input = TempDir::new().unwrap();
        for i in 0..5 {
            File::create(input.path().join(format!("clip_{:02}.mp4", i))).unwrap();
        }
        let output = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();

        let store = Arc::new(TaskStore::new(state.path(), 3));
        store
            .create_job(JobSpec {
                input_folder: input.path().to_path_buf(),
                output_folder: output.path().to_path_buf(),
                videos_per_output: 3,
                total_outputs: outputs,
                settings: serde_json::json!({}),
            })
            .unwrap();

        (store, input, output, state)
    }

    #[tokio::test]
    async fn test_successful_task_records_duration() {
        let (store, _i, _o, _s) = store_with_job(1);
        let executor = RetryExecutor::new(store.clone());
        let task = store.get_resumable_tasks().remove(0);

        let ok = executor.execute_task(&task, |_| Ok(()));

        assert!(ok);
        let task = store.task(&task.task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.actual_duration >= 0.0);
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_retries() {
        let (store, _i, _o, _s) = store_with_job(1);
        let executor = RetryExecutor::new(store.clone());
        let task = store.get_resumable_tasks().remove(0);

        let ok = executor.execute_task(&task, |_| {
            Err(RunnerError::new("ffmpeg exited with code 1"))
        });

        assert!(!ok);
        let task = store.task(&task.task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.failure_reason, Some(FailureReason::EncoderError));
        assert_eq!(task.retry_count, 1);
        assert!(!task.is_exhausted());
    }

    #[tokio::test]
    async fn test_non_retryable_failure_exhausts_task() {
        let (store, _i, _o, _s) = store_with_job(1);
        let executor = RetryExecutor::new(store.clone());
        let task = store.get_resumable_tasks().remove(0);

        let ok = executor.execute_task(&task, |_| {
            Err(RunnerError::new("No such file: x.mp4"))
        });

        assert!(!ok);
        let task = store.task(&task.task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.failure_reason, Some(FailureReason::FileNotFound));
        assert!(task.is_exhausted());
        assert_eq!(task.retry_count, task.max_retries);
    }

    // Scenario: three tasks where the second always raises a missing-file
    // error. The second task ran exactly once and failed permanently with
    // FileNotFound; the others completed.
    #[tokio::test]
    async fn test_mixed_batch_with_one_missing_file() {
        let (store, _i, _o, _s) = store_with_job(3);
        let executor = RetryExecutor::new(store.clone());
        let tasks = {
            let mut t = store.get_resumable_tasks();
            t.sort_by(|a, b| a.output_number.cmp(&b.output_number));
            t
        };
        assert_eq!(tasks.len(), 3);

        let mut executions = [0u32; 3];
        for (idx, task) in tasks.iter().enumerate() {
            executor.execute_task(task, |_| {
                executions[idx] += 1;
                if idx == 1 {
                    Err(RunnerError::new("No such file: x.mp4"))
                } else {
                    Ok(())
                }
            });
        }

        // Nothing remains resumable: the failed task is exhausted.
        assert!(store.get_resumable_tasks().is_empty());

        let task1 = store.task(&tasks[0].task_id).unwrap();
        let task2 = store.task(&tasks[1].task_id).unwrap();
        let task3 = store.task(&tasks[2].task_id).unwrap();

        assert_eq!(task1.status, TaskStatus::Completed);
        assert_eq!(task3.status, TaskStatus::Completed);

        assert_eq!(task2.status, TaskStatus::Failed);
        assert_eq!(task2.failure_reason, Some(FailureReason::FileNotFound));
        assert_eq!(executions, [1, 1, 1], "the failing task must run exactly once");
        assert!(task2.is_exhausted());

        let stats = store.get_statistics();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_disk_full_retries_once() {
        let (store, _i, _o, _s) = store_with_job(1);
        let executor = RetryExecutor::new(store.clone());
        let task = store.get_resumable_tasks().remove(0);

        // First failure: retry_count was 0, so one retry is allowed.
        executor.execute_task(&task, |_| Err(RunnerError::new("No space left on device")));
        let after_first = store.task(&task.task_id).unwrap();
        assert_eq!(after_first.retry_count, 1);
        assert!(!after_first.is_exhausted());

        // Second failure: retry_count 1, the classifier says stop.
        executor.execute_task(&after_first, |_| {
            Err(RunnerError::new("No space left on device"))
        });
        let after_second = store.task(&task.task_id).unwrap();
        assert_eq!(after_second.failure_reason, Some(FailureReason::DiskFull));
        assert!(after_second.is_exhausted());
    }
}
