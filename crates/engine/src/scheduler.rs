//! Bounded-concurrency batch job scheduling.
//!
//! A dispatch loop pulls submitted jobs off a pending queue and hands each
//! one to a worker slot bounded by a semaphore. Workers invoke the external
//! job runner on a blocking-capable thread, translate its callbacks into
//! job progress, and route completion back into job state. Pause and cancel
//! are cooperative: they stop dispatch and ask running runners to comply.
//!
//! Observers subscribe to a typed event stream delivered in order over a
//! single channel.

use crate::runner::{CancelToken, JobRunner, RunnerContext, RunnerFactory};
use serde::{Deserialize, Serialize};
use vidmerge_config::EngineConfig;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Default worker-pool bound.
pub const DEFAULT_MAX_CONCURRENT_JOBS: u32 = 2;

/// Default dispatch-loop poll interval.
const DEFAULT_DISPATCH_POLL: Duration = Duration::from_millis(200);

/// Status of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting in the queue.
    Pending,
    /// Job is currently running.
    Processing,
    /// Job is paused.
    Paused,
    /// Job completed successfully.
    Completed,
    /// Job failed with an error.
    Failed,
    /// Job was cancelled.
    Cancelled,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Paused => write!(f, "paused"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Check if the job still has work ahead of it.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

/// One caller-submitted unit of batch work.
#[derive(Debug, Clone)]
pub struct BatchJob {
    /// Job identifier; by convention the submitted input folder path.
    pub job_id: String,
    /// Caller-defined settings bundle; opaque to the scheduler.
    pub settings: Value,
    pub status: JobStatus,
    /// Progress in [0, 1].
    pub progress: f32,
    pub error_message: String,
    /// Unix timestamp (milliseconds) when processing started.
    pub start_time: Option<i64>,
    /// Unix timestamp (milliseconds) when the job reached a terminal state.
    pub end_time: Option<i64>,
}

/// Typed scheduler events, replacing ad hoc callback wiring.
///
/// Delivered in emission order over a single consumer channel; handlers on
/// that consumer need not be reentrant.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    JobStarted { job_id: String },
    JobProgress { job_id: String, progress: f32 },
    JobCompleted { job_id: String, message: String },
    JobFailed { job_id: String, error: String },
    JobPaused { job_id: String },
    JobResumed { job_id: String },
    JobCancelled { job_id: String },
    BatchStarted,
    BatchCompleted,
    BatchPaused,
    BatchResumed,
    BatchCancelled,
    OverallProgress { progress: f32 },
}

/// Aggregate counts across all submitted jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchStatistics {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub paused_jobs: usize,
    pub cancelled: usize,
    pub running: bool,
    pub paused: bool,
    pub overall_progress: f32,
}

struct JobEntry {
    job: BatchJob,
    runner: Option<Arc<dyn JobRunner>>,
    cancel: CancelToken,
}

struct SchedulerState {
    jobs: HashMap<String, JobEntry>,
    pending: VecDeque<String>,
    running: bool,
    paused: bool,
    cancelled: bool,
}

/// Schedules batch jobs across a bounded worker pool.
pub struct BatchScheduler {
    state: Mutex<SchedulerState>,
    semaphore: Arc<Semaphore>,
    factory: Arc<dyn RunnerFactory>,
    dispatch_poll: Duration,
    events: UnboundedSender<SchedulerEvent>,
}

impl BatchScheduler {
    /// Create a scheduler with at most `max_concurrent_jobs` simultaneous
    /// workers ([`DEFAULT_MAX_CONCURRENT_JOBS`] when in doubt). Returns the
    /// scheduler and the event stream's receiving end.
    pub fn new(
        max_concurrent_jobs: u32,
        factory: Arc<dyn RunnerFactory>,
    ) -> (Arc<Self>, UnboundedReceiver<SchedulerEvent>) {
        Self::build(max_concurrent_jobs, DEFAULT_DISPATCH_POLL, factory)
    }

    /// Create a scheduler from engine configuration.
    pub fn from_config(
        config: &EngineConfig,
        factory: Arc<dyn RunnerFactory>,
    ) -> (Arc<Self>, UnboundedReceiver<SchedulerEvent>) {
        Self::build(
            config.effective_max_concurrent_jobs(),
            Duration::from_millis(config.scheduler.dispatch_poll_ms),
            factory,
        )
    }

    fn build(
        max_concurrent_jobs: u32,
        dispatch_poll: Duration,
        factory: Arc<dyn RunnerFactory>,
    ) -> (Arc<Self>, UnboundedReceiver<SchedulerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let permits = max_concurrent_jobs.max(1) as usize;

        let scheduler = Arc::new(Self {
            state: Mutex::new(SchedulerState {
                jobs: HashMap::new(),
                pending: VecDeque::new(),
                running: false,
                paused: false,
                cancelled: false,
            }),
            semaphore: Arc::new(Semaphore::new(permits)),
            factory,
            dispatch_poll,
            events: tx,
        });

        (scheduler, rx)
    }

    /// Submit a job. Returns false when a job with the same id already
    /// exists.
    pub fn submit(&self, job_id: impl Into<String>, settings: Value) -> bool {
        let job_id = job_id.into();
        let mut state = self.state.lock().unwrap();

        if state.jobs.contains_key(&job_id) {
            return false;
        }

        state.jobs.insert(
            job_id.clone(),
            JobEntry {
                job: BatchJob {
                    job_id: job_id.clone(),
                    settings,
                    status: JobStatus::Pending,
                    progress: 0.0,
                    error_message: String::new(),
                    start_time: None,
                    end_time: None,
                },
                runner: None,
                cancel: CancelToken::new(),
            },
        );
        state.pending.push_back(job_id);
        true
    }

    /// Start the batch. No-op returning false when already running or when
    /// nothing has been submitted.
    pub fn start(self: &Arc<Self>) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.running || state.jobs.is_empty() {
                return false;
            }
            state.running = true;
            state.paused = false;
            state.cancelled = false;
        }

        self.emit(SchedulerEvent::BatchStarted);

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.dispatch_loop().await;
        });
        true
    }

    /// Submit a job and make sure the batch is dispatching.
    ///
    /// Returns false when the job id is a duplicate. When the batch is
    /// already running the job simply joins the pending queue; otherwise the
    /// batch is started.
    pub fn submit_and_run(self: &Arc<Self>, job_id: impl Into<String>, settings: Value) -> bool {
        if !self.submit(job_id, settings) {
            return false;
        }
        self.start();
        true
    }

    /// Pause the batch: stop dispatching, and ask every processing job's
    /// runner to pause cooperatively.
    pub fn pause(&self) -> bool {
        let paused_jobs = {
            let mut state = self.state.lock().unwrap();
            if !state.running || state.paused {
                return false;
            }
            state.paused = true;

            let mut paused_jobs = Vec::new();
            for entry in state.jobs.values_mut() {
                if entry.job.status == JobStatus::Processing {
                    entry.job.status = JobStatus::Paused;
                    paused_jobs.push((entry.job.job_id.clone(), entry.runner.clone()));
                }
            }
            paused_jobs
        };

        for (job_id, runner) in paused_jobs {
            if let Some(runner) = runner {
                runner.pause();
            }
            self.emit(SchedulerEvent::JobPaused { job_id });
        }
        self.emit(SchedulerEvent::BatchPaused);
        true
    }

    /// Resume a paused batch, reversing both effects of [`pause`].
    ///
    /// [`pause`]: BatchScheduler::pause
    pub fn resume(&self) -> bool {
        let resumed_jobs = {
            let mut state = self.state.lock().unwrap();
            if !state.running || !state.paused {
                return false;
            }
            state.paused = false;

            let mut resumed_jobs = Vec::new();
            for entry in state.jobs.values_mut() {
                if entry.job.status == JobStatus::Paused {
                    entry.job.status = JobStatus::Processing;
                    resumed_jobs.push((entry.job.job_id.clone(), entry.runner.clone()));
                }
            }
            resumed_jobs
        };

        for (job_id, runner) in resumed_jobs {
            if let Some(runner) = runner {
                runner.resume();
            }
            self.emit(SchedulerEvent::JobResumed { job_id });
        }
        self.emit(SchedulerEvent::BatchResumed);
        true
    }

    /// Cancel the batch: flag every non-terminal job cancelled, stop its
    /// runner, and drain the pending queue. The batch does not restart on
    /// its own afterwards.
    pub fn cancel(&self) -> bool {
        let cancelled_jobs = {
            let mut state = self.state.lock().unwrap();
            if !state.running {
                return false;
            }
            state.cancelled = true;
            state.running = false;
            state.paused = false;
            state.pending.clear();

            let mut cancelled_jobs = Vec::new();
            for entry in state.jobs.values_mut() {
                if entry.job.status.is_active() {
                    entry.job.status = JobStatus::Cancelled;
                    entry.job.end_time = Some(current_timestamp_ms());
                    entry.cancel.cancel();
                    cancelled_jobs.push((entry.job.job_id.clone(), entry.runner.clone()));
                }
            }
            cancelled_jobs
        };

        for (job_id, runner) in cancelled_jobs {
            if let Some(runner) = runner {
                runner.stop();
            }
            self.emit(SchedulerEvent::JobCancelled { job_id });
        }
        self.emit(SchedulerEvent::BatchCancelled);
        true
    }

    /// Remove a job, cancelling it first when it is still active.
    pub fn remove_job(&self, job_id: &str) -> bool {
        let runner = {
            let mut state = self.state.lock().unwrap();
            let Some(entry) = state.jobs.get_mut(job_id) else {
                return false;
            };

            let runner = if matches!(entry.job.status, JobStatus::Processing | JobStatus::Paused)
            {
                entry.job.status = JobStatus::Cancelled;
                entry.job.end_time = Some(current_timestamp_ms());
                entry.cancel.cancel();
                entry.runner.clone()
            } else {
                None
            };

            state.jobs.remove(job_id);
            state.pending.retain(|id| id != job_id);
            runner
        };

        if let Some(runner) = runner {
            runner.stop();
            self.emit(SchedulerEvent::JobCancelled {
                job_id: job_id.to_string(),
            });
        }
        true
    }

    /// Pause one processing job.
    pub fn pause_job(&self, job_id: &str) -> bool {
        let runner = {
            let mut state = self.state.lock().unwrap();
            let Some(entry) = state.jobs.get_mut(job_id) else {
                return false;
            };
            if entry.job.status != JobStatus::Processing {
                return false;
            }
            entry.job.status = JobStatus::Paused;
            entry.runner.clone()
        };

        if let Some(runner) = runner {
            runner.pause();
        }
        self.emit(SchedulerEvent::JobPaused {
            job_id: job_id.to_string(),
        });
        true
    }

    /// Resume one paused job.
    pub fn resume_job(&self, job_id: &str) -> bool {
        let runner = {
            let mut state = self.state.lock().unwrap();
            let Some(entry) = state.jobs.get_mut(job_id) else {
                return false;
            };
            if entry.job.status != JobStatus::Paused {
                return false;
            }
            entry.job.status = JobStatus::Processing;
            entry.runner.clone()
        };

        if let Some(runner) = runner {
            runner.resume();
        }
        self.emit(SchedulerEvent::JobResumed {
            job_id: job_id.to_string(),
        });
        true
    }

    /// Current status of a job.
    pub fn get_job_status(&self, job_id: &str) -> Option<JobStatus> {
        let state = self.state.lock().unwrap();
        state.jobs.get(job_id).map(|e| e.job.status)
    }

    /// Current progress of a job.
    pub fn get_job_progress(&self, job_id: &str) -> f32 {
        let state = self.state.lock().unwrap();
        state.jobs.get(job_id).map(|e| e.job.progress).unwrap_or(0.0)
    }

    /// Overall progress: the unweighted mean across all jobs' progress.
    /// Jobs of very different sizes count equally; callers relying on
    /// weighted progress must aggregate from job statistics themselves.
    pub fn get_overall_progress(&self) -> f32 {
        let state = self.state.lock().unwrap();
        overall_progress_locked(&state)
    }

    /// Counts by status plus batch flags and overall progress.
    pub fn get_statistics(&self) -> BatchStatistics {
        let state = self.state.lock().unwrap();

        let mut stats = BatchStatistics {
            total: state.jobs.len(),
            pending: 0,
            processing: 0,
            completed: 0,
            failed: 0,
            paused_jobs: 0,
            cancelled: 0,
            running: state.running,
            paused: state.paused,
            overall_progress: overall_progress_locked(&state),
        };

        for entry in state.jobs.values() {
            match entry.job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Paused => stats.paused_jobs += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }

        stats
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().unwrap().paused
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().cancelled
    }

    /// The dispatch loop: short-polls the pending queue so pause and cancel
    /// flags are observed promptly, and exits once the queue is empty with
    /// no job left in a non-terminal state.
    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            let (cancelled, paused, next) = {
                let mut state = self.state.lock().unwrap();
                let next = if state.cancelled || state.paused {
                    None
                } else {
                    state.pending.pop_front()
                };
                (state.cancelled, state.paused, next)
            };

            if cancelled {
                return;
            }

            if paused {
                sleep(self.dispatch_poll).await;
                continue;
            }

            match next {
                Some(job_id) => match self.semaphore.clone().try_acquire_owned() {
                    Ok(permit) => {
                        let scheduler = Arc::clone(&self);
                        tokio::spawn(async move {
                            scheduler.run_job(job_id, permit).await;
                        });
                    }
                    Err(_) => {
                        // Pool is full; requeue and look again shortly.
                        {
                            let mut state = self.state.lock().unwrap();
                            state.pending.push_front(job_id);
                        }
                        sleep(self.dispatch_poll).await;
                    }
                },
                None => {
                    // Exit decision and batch completion share one lock
                    // acquisition, so a submit can never slip in between
                    // "nothing left" and "stop dispatching".
                    let finished = {
                        let mut state = self.state.lock().unwrap();
                        let all_terminal = state.pending.is_empty()
                            && state.jobs.values().all(|e| e.job.status.is_terminal());
                        if !all_terminal {
                            None
                        } else if state.running && !state.cancelled {
                            state.running = false;
                            Some(true)
                        } else {
                            Some(false)
                        }
                    };

                    match finished {
                        Some(true) => {
                            self.emit(SchedulerEvent::BatchCompleted);
                            return;
                        }
                        Some(false) => return,
                        None => sleep(self.dispatch_poll).await,
                    }
                }
            }
        }
    }

    /// Worker body for one job.
    async fn run_job(self: Arc<Self>, job_id: String, _permit: OwnedSemaphorePermit) {
        let (settings, cancel) = {
            let mut state = self.state.lock().unwrap();
            if state.cancelled {
                return;
            }
            let Some(entry) = state.jobs.get_mut(&job_id) else {
                return;
            };
            if entry.job.status != JobStatus::Pending {
                return;
            }

            entry.job.status = JobStatus::Processing;
            entry.job.start_time = Some(current_timestamp_ms());
            (entry.job.settings.clone(), entry.cancel.clone())
        };

        // Factory code runs without the state lock; it may call back in.
        let runner = self.factory.create(&job_id, &settings);
        {
            let mut state = self.state.lock().unwrap();
            if let Some(entry) = state.jobs.get_mut(&job_id) {
                entry.runner = Some(runner.clone());
            }
        }

        self.emit(SchedulerEvent::JobStarted {
            job_id: job_id.clone(),
        });
        debug!(%job_id, "job dispatched to worker");

        let progress_scheduler = Arc::clone(&self);
        let progress_job_id = job_id.clone();
        let ctx = RunnerContext::new(job_id.clone(), settings, cancel, move |progress| {
            progress_scheduler.on_job_progress(&progress_job_id, progress);
        });

        // The runner blocks on external-process I/O; it gets a real thread.
        let result = tokio::task::spawn_blocking(move || runner.run(&ctx)).await;

        match result {
            Ok(Ok(message)) => self.on_job_finished(&job_id, Ok(message)),
            Ok(Err(err)) => self.on_job_finished(&job_id, Err(err.message)),
            Err(join_err) => {
                warn!(%job_id, error = %join_err, "job worker panicked");
                self.on_job_finished(&job_id, Err(format!("job worker panicked: {}", join_err)))
            }
        }
    }

    /// Progress callback from a runner.
    fn on_job_progress(&self, job_id: &str, progress: f32) {
        let overall = {
            let mut state = self.state.lock().unwrap();
            let Some(entry) = state.jobs.get_mut(job_id) else {
                return;
            };
            entry.job.progress = progress.clamp(0.0, 1.0);
            overall_progress_locked(&state)
        };

        self.emit(SchedulerEvent::JobProgress {
            job_id: job_id.to_string(),
            progress,
        });
        self.emit(SchedulerEvent::OverallProgress { progress: overall });
    }

    /// Completion callback from a worker.
    fn on_job_finished(&self, job_id: &str, result: Result<String, String>) {
        let event = {
            let mut state = self.state.lock().unwrap();
            let Some(entry) = state.jobs.get_mut(job_id) else {
                return;
            };

            // A job cancelled mid-flight keeps its cancelled status.
            if entry.job.status == JobStatus::Cancelled {
                None
            } else {
                entry.job.end_time = Some(current_timestamp_ms());
                match &result {
                    Ok(message) => {
                        entry.job.status = JobStatus::Completed;
                        entry.job.progress = 1.0;
                        Some(SchedulerEvent::JobCompleted {
                            job_id: job_id.to_string(),
                            message: message.clone(),
                        })
                    }
                    Err(error) => {
                        entry.job.status = JobStatus::Failed;
                        entry.job.error_message = error.clone();
                        Some(SchedulerEvent::JobFailed {
                            job_id: job_id.to_string(),
                            error: error.clone(),
                        })
                    }
                }
            }
        };

        if let Some(event) = event {
            self.emit(event);
        }
        self.try_finish_batch();
    }

    /// One-shot completion check. The terminal-state scan and the decision
    /// to notify share the job-state lock, so the notification fires exactly
    /// once per run.
    fn try_finish_batch(&self) {
        let finished = {
            let mut state = self.state.lock().unwrap();
            let all_terminal = state.pending.is_empty()
                && state.jobs.values().all(|e| e.job.status.is_terminal());
            if state.running && !state.cancelled && all_terminal {
                state.running = false;
                true
            } else {
                false
            }
        };

        if finished {
            self.emit(SchedulerEvent::BatchCompleted);
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        // A dropped receiver only means nobody is listening.
        let _ = self.events.send(event);
    }
}

fn overall_progress_locked(state: &SchedulerState) -> f32 {
    if state.jobs.is_empty() {
        return 0.0;
    }
    let sum: f32 = state.jobs.values().map(|e| e.job.progress).sum();
    sum / state.jobs.len() as f32
}

/// Get current timestamp in milliseconds since Unix epoch.
fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RunnerError;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::time::timeout;

    /// Runner that sleeps briefly, reports progress, and succeeds or fails.
    struct TestRunner {
        work: Duration,
        fail_with: Option<String>,
        stopped: Arc<AtomicBool>,
        paused: Arc<AtomicBool>,
        runs: Arc<AtomicU32>,
    }

    impl TestRunner {
        fn succeeding(work: Duration) -> Self {
            Self {
                work,
                fail_with: None,
                stopped: Arc::new(AtomicBool::new(false)),
                paused: Arc::new(AtomicBool::new(false)),
                runs: Arc::new(AtomicU32::new(0)),
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                fail_with: Some(message.to_string()),
                ..Self::succeeding(Duration::from_millis(5))
            }
        }
    }

    impl JobRunner for TestRunner {
        fn run(&self, ctx: &RunnerContext) -> Result<String, RunnerError> {
            self.runs.fetch_add(1, Ordering::SeqCst);

            let slices = 10u32;
            for i in 0..slices {
                if self.stopped.load(Ordering::SeqCst) || ctx.cancel.is_cancelled() {
                    return Err(RunnerError::new("stopped"));
                }
                std::thread::sleep(self.work / slices);
                ctx.report_progress((i + 1) as f32 / slices as f32);
            }

            match &self.fail_with {
                Some(message) => Err(RunnerError::new(message.clone())),
                None => Ok("merge finished".to_string()),
            }
        }

        fn pause(&self) {
            self.paused.store(true, Ordering::SeqCst);
        }

        fn resume(&self) {
            self.paused.store(false, Ordering::SeqCst);
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn factory_of(runners: Vec<Arc<TestRunner>>) -> Arc<dyn RunnerFactory> {
        let index = AtomicU32::new(0);
        Arc::new(move |_job_id: &str, _settings: &Value| -> Arc<dyn JobRunner> {
            let i = index.fetch_add(1, Ordering::SeqCst) as usize;
            runners[i.min(runners.len() - 1)].clone() as Arc<dyn JobRunner>
        })
    }

    async fn drain_until(
        rx: &mut UnboundedReceiver<SchedulerEvent>,
        stop_at: &SchedulerEvent,
    ) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        let deadline = Duration::from_secs(10);
        loop {
            let event = timeout(deadline, rx.recv())
                .await
                .expect("timed out waiting for scheduler event")
                .expect("event channel closed unexpectedly");
            let done = &event == stop_at;
            events.push(event);
            if done {
                return events;
            }
        }
    }

    #[tokio::test]
    async fn test_submit_rejects_duplicate_ids() {
        let (scheduler, _rx) = BatchScheduler::new(2, factory_of(vec![]));
        assert!(scheduler.submit("/media/pool_a", serde_json::json!({})));
        assert!(!scheduler.submit("/media/pool_a", serde_json::json!({})));
        assert!(scheduler.submit("/media/pool_b", serde_json::json!({})));
    }

    #[tokio::test]
    async fn test_start_requires_jobs_and_is_single_shot() {
        let runner = Arc::new(TestRunner::succeeding(Duration::from_millis(50)));
        let (scheduler, _rx) = BatchScheduler::new(2, factory_of(vec![runner]));

        assert!(!scheduler.start(), "empty batch must not start");

        scheduler.submit("/media/pool_a", serde_json::json!({}));
        assert!(scheduler.start());
        assert!(!scheduler.start(), "second start while running is a no-op");
    }

    #[tokio::test]
    async fn test_batch_runs_all_jobs_to_completion() {
        let runners: Vec<Arc<TestRunner>> = (0..3)
            .map(|_| Arc::new(TestRunner::succeeding(Duration::from_millis(20))))
            .collect();
        let (scheduler, mut rx) = BatchScheduler::new(2, factory_of(runners.clone()));

        for i in 0..3 {
            scheduler.submit(format!("/media/pool_{}", i), serde_json::json!({}));
        }
        scheduler.start();

        let events = drain_until(&mut rx, &SchedulerEvent::BatchCompleted).await;

        let started = events
            .iter()
            .filter(|e| matches!(e, SchedulerEvent::JobStarted { .. }))
            .count();
        let completed = events
            .iter()
            .filter(|e| matches!(e, SchedulerEvent::JobCompleted { .. }))
            .count();
        assert_eq!(started, 3);
        assert_eq!(completed, 3);

        for i in 0..3 {
            let id = format!("/media/pool_{}", i);
            assert_eq!(scheduler.get_job_status(&id), Some(JobStatus::Completed));
            assert!((scheduler.get_job_progress(&id) - 1.0).abs() < 1e-6);
        }
        assert!(!scheduler.is_running());
        assert!((scheduler.get_overall_progress() - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_batch_completed_fires_exactly_once() {
        let runners: Vec<Arc<TestRunner>> = (0..4)
            .map(|_| Arc::new(TestRunner::succeeding(Duration::from_millis(10))))
            .collect();
        let (scheduler, mut rx) = BatchScheduler::new(4, factory_of(runners));

        for i in 0..4 {
            scheduler.submit(format!("/media/pool_{}", i), serde_json::json!({}));
        }
        scheduler.start();

        drain_until(&mut rx, &SchedulerEvent::BatchCompleted).await;

        // Give any stray duplicate a chance to arrive, then check silence.
        sleep(Duration::from_millis(300)).await;
        let mut extra_completions = 0;
        while let Ok(event) = rx.try_recv() {
            if event == SchedulerEvent::BatchCompleted {
                extra_completions += 1;
            }
        }
        assert_eq!(extra_completions, 0, "BatchCompleted must fire exactly once");
    }

    #[tokio::test]
    async fn test_failed_job_reports_error_and_batch_still_completes() {
        let good = Arc::new(TestRunner::succeeding(Duration::from_millis(10)));
        let bad = Arc::new(TestRunner::failing("ffmpeg exited with code 1"));
        let (scheduler, mut rx) = BatchScheduler::new(1, factory_of(vec![good, bad]));

        scheduler.submit("/media/good", serde_json::json!({}));
        scheduler.submit("/media/bad", serde_json::json!({}));
        scheduler.start();

        let events = drain_until(&mut rx, &SchedulerEvent::BatchCompleted).await;

        assert!(events.iter().any(|e| matches!(
            e,
            SchedulerEvent::JobFailed { error, .. } if error.contains("ffmpeg")
        )));
        assert_eq!(
            scheduler.get_job_status("/media/bad"),
            Some(JobStatus::Failed)
        );
        assert_eq!(
            scheduler.get_job_status("/media/good"),
            Some(JobStatus::Completed)
        );

        let stats = scheduler.get_statistics();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert!(!stats.running);
    }

    #[tokio::test]
    async fn test_worker_pool_is_bounded() {
        // One worker slot: jobs must run one after another.
        let runners: Vec<Arc<TestRunner>> = (0..2)
            .map(|_| Arc::new(TestRunner::succeeding(Duration::from_millis(60))))
            .collect();
        let (scheduler, mut rx) = BatchScheduler::new(1, factory_of(runners));

        scheduler.submit("/media/pool_a", serde_json::json!({}));
        scheduler.submit("/media/pool_b", serde_json::json!({}));
        scheduler.start();

        let events = drain_until(&mut rx, &SchedulerEvent::BatchCompleted).await;

        // The second JobStarted must come after the first JobCompleted.
        let positions: Vec<(usize, &SchedulerEvent)> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                matches!(
                    e,
                    SchedulerEvent::JobStarted { .. } | SchedulerEvent::JobCompleted { .. }
                )
            })
            .collect();
        let second_start = positions
            .iter()
            .filter(|(_, e)| matches!(e, SchedulerEvent::JobStarted { .. }))
            .nth(1)
            .map(|(i, _)| *i)
            .unwrap();
        let first_complete = positions
            .iter()
            .find(|(_, e)| matches!(e, SchedulerEvent::JobCompleted { .. }))
            .map(|(i, _)| *i)
            .unwrap();
        assert!(
            second_start > first_complete,
            "with one slot the second job starts only after the first finishes"
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_runners_and_drains_queue() {
        let runner = Arc::new(TestRunner::succeeding(Duration::from_secs(5)));
        let stopped = runner.stopped.clone();
        let (scheduler, mut rx) = BatchScheduler::new(1, factory_of(vec![runner]));

        scheduler.submit("/media/running", serde_json::json!({}));
        scheduler.submit("/media/queued", serde_json::json!({}));
        scheduler.start();

        // Let the first job get going.
        let events = drain_until(
            &mut rx,
            &SchedulerEvent::JobStarted {
                job_id: "/media/running".to_string(),
            },
        )
        .await;
        assert!(!events.is_empty());

        assert!(scheduler.cancel());
        let events = drain_until(&mut rx, &SchedulerEvent::BatchCancelled).await;

        assert!(stopped.load(Ordering::SeqCst), "runner must be told to stop");
        assert_eq!(
            scheduler.get_job_status("/media/running"),
            Some(JobStatus::Cancelled)
        );
        assert_eq!(
            scheduler.get_job_status("/media/queued"),
            Some(JobStatus::Cancelled)
        );
        assert!(!scheduler.is_running());
        assert!(scheduler.is_cancelled());
        assert!(events
            .iter()
            .any(|e| matches!(e, SchedulerEvent::JobCancelled { .. })));

        // Cancelled batches stay down until explicitly restarted.
        sleep(Duration::from_millis(100)).await;
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_pause_and_resume_propagate_to_runner() {
        let runner = Arc::new(TestRunner::succeeding(Duration::from_millis(400)));
        let paused_flag = runner.paused.clone();
        let (scheduler, mut rx) = BatchScheduler::new(1, factory_of(vec![runner]));

        scheduler.submit("/media/pool_a", serde_json::json!({}));
        scheduler.start();

        drain_until(
            &mut rx,
            &SchedulerEvent::JobStarted {
                job_id: "/media/pool_a".to_string(),
            },
        )
        .await;

        assert!(scheduler.pause());
        assert!(scheduler.is_paused());
        assert!(paused_flag.load(Ordering::SeqCst));
        assert_eq!(
            scheduler.get_job_status("/media/pool_a"),
            Some(JobStatus::Paused)
        );
        assert!(!scheduler.pause(), "pausing twice is a no-op");

        assert!(scheduler.resume());
        assert!(!scheduler.is_paused());
        assert!(!paused_flag.load(Ordering::SeqCst));
        assert_eq!(
            scheduler.get_job_status("/media/pool_a"),
            Some(JobStatus::Processing)
        );

        let events = drain_until(&mut rx, &SchedulerEvent::BatchCompleted).await;
        assert!(events.contains(&SchedulerEvent::BatchPaused));
        assert!(events.contains(&SchedulerEvent::BatchResumed));
    }

    #[tokio::test]
    async fn test_remove_job() {
        let (scheduler, _rx) = BatchScheduler::new(2, factory_of(vec![]));
        scheduler.submit("/media/pool_a", serde_json::json!({}));

        assert!(scheduler.remove_job("/media/pool_a"));
        assert!(scheduler.get_job_status("/media/pool_a").is_none());
        assert!(!scheduler.remove_job("/media/pool_a"));
    }

    #[tokio::test]
    async fn test_overall_progress_is_unweighted_mean() {
        let (scheduler, _rx) = BatchScheduler::new(2, factory_of(vec![]));
        scheduler.submit("/media/pool_a", serde_json::json!({}));
        scheduler.submit("/media/pool_b", serde_json::json!({}));

        assert_eq!(scheduler.get_overall_progress(), 0.0);

        scheduler.on_job_progress("/media/pool_a", 1.0);
        assert!((scheduler.get_overall_progress() - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_progress_events_carry_job_progress() {
        let runner = Arc::new(TestRunner::succeeding(Duration::from_millis(50)));
        let (scheduler, mut rx) = BatchScheduler::new(1, factory_of(vec![runner]));

        scheduler.submit("/media/pool_a", serde_json::json!({}));
        scheduler.start();

        let events = drain_until(&mut rx, &SchedulerEvent::BatchCompleted).await;

        let progress_values: Vec<f32> = events
            .iter()
            .filter_map(|e| match e {
                SchedulerEvent::JobProgress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect();
        assert!(!progress_values.is_empty());
        assert!(progress_values.iter().all(|p| (0.0..=1.0).contains(p)));
        // Monotone: the runner reports increasing slices.
        for pair in progress_values.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
    }

    #[tokio::test]
    async fn test_submit_and_run_joins_a_live_batch() {
        let runners: Vec<Arc<TestRunner>> = (0..2)
            .map(|_| Arc::new(TestRunner::succeeding(Duration::from_millis(40))))
            .collect();
        let (scheduler, mut rx) = BatchScheduler::new(2, factory_of(runners));

        assert!(scheduler.submit_and_run("/media/pool_a", serde_json::json!({})));
        drain_until(
            &mut rx,
            &SchedulerEvent::JobStarted {
                job_id: "/media/pool_a".to_string(),
            },
        )
        .await;

        // The second submission joins the already-running batch (or restarts
        // it, if the first job already drained the queue).
        assert!(scheduler.submit_and_run("/media/pool_b", serde_json::json!({})));
        drain_until(
            &mut rx,
            &SchedulerEvent::JobCompleted {
                job_id: "/media/pool_b".to_string(),
                message: "merge finished".to_string(),
            },
        )
        .await;

        assert_eq!(
            scheduler.get_job_status("/media/pool_b"),
            Some(JobStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_from_config_builds_a_working_scheduler() {
        let runner = Arc::new(TestRunner::succeeding(Duration::from_millis(10)));
        let config = EngineConfig::default();
        let (scheduler, mut rx) = BatchScheduler::from_config(&config, factory_of(vec![runner]));

        scheduler.submit("/media/pool_a", serde_json::json!({}));
        scheduler.start();

        drain_until(&mut rx, &SchedulerEvent::BatchCompleted).await;
        assert_eq!(
            scheduler.get_job_status("/media/pool_a"),
            Some(JobStatus::Completed)
        );
    }

    #[test]
    fn test_job_status_display_and_terminality() {
        assert_eq!(format!("{}", JobStatus::Pending), "pending");
        assert_eq!(format!("{}", JobStatus::Processing), "processing");
        assert_eq!(format!("{}", JobStatus::Cancelled), "cancelled");

        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(JobStatus::Paused.is_active());
    }
}
