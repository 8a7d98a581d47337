//! Job runner contract.
//!
//! The engine treats a job as a black box that consumes inputs and produces
//! an output file or an error. The runner is the external collaborator that
//! does the real work (building encoder commands, spawning processes); it
//! must expose cooperative pause/resume/stop and emit progress through the
//! context it is handed.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Error raised by a job runner.
///
/// The message is the classification surface: it should carry the underlying
/// failure text (encoder stderr, IO error) so the error classifier can map
/// it to a failure reason.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RunnerError {
    pub message: String,
}

impl RunnerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for RunnerError {
    fn from(e: std::io::Error) -> Self {
        Self::new(e.to_string())
    }
}

/// Centralized per-job cancellation state.
///
/// Cloning shares the flag; runners check it between work units.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Execution context handed to a runner for one job.
pub struct RunnerContext {
    /// The job being executed.
    pub job_id: String,
    /// The caller's opaque settings bundle.
    pub settings: Value,
    /// Cancellation flag for this job.
    pub cancel: CancelToken,
    progress: Box<dyn Fn(f32) + Send + Sync>,
}

impl RunnerContext {
    pub fn new(
        job_id: impl Into<String>,
        settings: Value,
        cancel: CancelToken,
        progress: impl Fn(f32) + Send + Sync + 'static,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            settings,
            cancel,
            progress: Box::new(progress),
        }
    }

    /// Report fractional progress in [0, 1]; out-of-range values are clamped.
    pub fn report_progress(&self, progress: f32) {
        (self.progress)(progress.clamp(0.0, 1.0));
    }
}

/// A pluggable job execution strategy.
///
/// `run` blocks its thread until the job finishes; the scheduler invokes it
/// on a blocking-capable worker. The pause/resume/stop hooks are cooperative
/// and must be safe to call at any time, including when the runner is idle.
pub trait JobRunner: Send + Sync {
    /// Execute the job to completion. Returns a human-readable completion
    /// message on success.
    fn run(&self, ctx: &RunnerContext) -> Result<String, RunnerError>;

    /// Cooperatively pause the job. No-op by default.
    fn pause(&self) {}

    /// Resume a paused job. No-op by default.
    fn resume(&self) {}

    /// Request cooperative stop. No-op by default.
    fn stop(&self) {}
}

/// Creates runner instances for submitted jobs.
pub trait RunnerFactory: Send + Sync {
    fn create(&self, job_id: &str, settings: &Value) -> Arc<dyn JobRunner>;
}

impl<F> RunnerFactory for F
where
    F: Fn(&str, &Value) -> Arc<dyn JobRunner> + Send + Sync,
{
    fn create(&self, job_id: &str, settings: &Value) -> Arc<dyn JobRunner> {
        self(job_id, settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_cancel_token_shared_across_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_context_clamps_progress() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let ctx = RunnerContext::new(
            "job-1",
            serde_json::json!({}),
            CancelToken::new(),
            move |p| sink.lock().unwrap().push(p),
        );

        ctx.report_progress(-0.5);
        ctx.report_progress(0.5);
        ctx.report_progress(1.5);

        assert_eq!(*seen.lock().unwrap(), vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_runner_error_message_is_display() {
        let err = RunnerError::new("ffmpeg exited with code 1");
        assert_eq!(err.to_string(), "ffmpeg exited with code 1");

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file: x.mp4");
        let err: RunnerError = io.into();
        assert!(err.to_string().contains("no such file"));
    }

    #[test]
    fn test_closure_is_a_runner_factory() {
        struct NoopRunner;
        impl JobRunner for NoopRunner {
            fn run(&self, _ctx: &RunnerContext) -> Result<String, RunnerError> {
                Ok("done".to_string())
            }
        }

        let factory =
            |_job_id: &str, _settings: &Value| -> Arc<dyn JobRunner> { Arc::new(NoopRunner) };
        let runner = factory.create("job-1", &serde_json::json!({}));

        let ctx = RunnerContext::new("job-1", serde_json::json!({}), CancelToken::new(), |_| {});
        assert_eq!(runner.run(&ctx).unwrap(), "done");
    }
}
