//! Supervision of external encoder processes.
//!
//! Tracks every live external process together with the temp files it may
//! leave behind and its designated output file. Cancellation is two-phase:
//! a graceful terminate with a polling window, then a forced kill. After a
//! cancel, outputs that look like unfinished artifacts are deleted.
//!
//! Also hosts the line-oriented progress parser for the encoder's
//! `-progress` side channel.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Poll interval while waiting for graceful termination.
const TERMINATION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Per-process settle window after a forced kill.
const KILL_SETTLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Outputs smaller than this are treated as unfinished artifacts.
const UNFINISHED_OUTPUT_MAX_BYTES: u64 = 1024 * 1024;

/// Outputs modified more recently than this are treated as unfinished.
const UNFINISHED_OUTPUT_MAX_AGE: Duration = Duration::from_secs(30);

/// Minimum progress delta forwarded to observers.
pub const PROGRESS_DELTA_THRESHOLD: f32 = 0.01;

/// Abstraction over a live external process.
///
/// The engine never talks to the OS process table directly during
/// supervision; everything goes through this seam, which also lets tests
/// supervise fake processes.
pub trait ManagedProcess: Send {
    /// OS process id.
    fn pid(&self) -> u32;

    /// Whether the process is still running.
    fn is_running(&mut self) -> bool;

    /// Request cooperative termination. Best-effort; a process may ignore it.
    fn terminate(&mut self);

    /// Force-kill the process. Best-effort.
    fn kill(&mut self);
}

impl ManagedProcess for std::process::Child {
    fn pid(&self) -> u32 {
        self.id()
    }

    fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    fn terminate(&mut self) {
        use sysinfo::{Pid, ProcessesToUpdate, Signal, System};

        // std::process::Child only exposes SIGKILL; the graceful signal goes
        // out via the process table. Platforms without SIGTERM fall through
        // to the forced phase.
        let pid = Pid::from_u32(self.id());
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        if let Some(process) = sys.process(pid) {
            process.kill_with(Signal::Term);
        }
    }

    fn kill(&mut self) {
        if let Err(e) = std::process::Child::kill(self) {
            debug!(pid = self.id(), error = %e, "kill signal not delivered");
        }
        let _ = self.try_wait();
    }
}

struct ProcessEntry {
    id: u64,
    process: Box<dyn ManagedProcess>,
    temp_files: Vec<PathBuf>,
    output_file: Option<PathBuf>,
}

/// Registry and lifecycle manager for external encoder processes.
pub struct ProcessSupervisor {
    entries: Mutex<Vec<ProcessEntry>>,
    cancelled: AtomicBool,
    cleanup_on_cancel: AtomicBool,
    next_id: AtomicU64,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
            cleanup_on_cancel: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a supervisor from engine configuration.
    pub fn from_config(config: &vidmerge_config::EngineConfig) -> Self {
        let supervisor = Self::new();
        supervisor.set_cleanup_on_cancel(config.cleanup.cleanup_on_cancel);
        supervisor
    }

    /// Register a live process with its temp files and output path.
    /// Returns a registration id for [`ProcessSupervisor::unregister`].
    pub fn register(
        &self,
        process: impl ManagedProcess + 'static,
        temp_files: Vec<PathBuf>,
        output_file: Option<PathBuf>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock().unwrap();
        entries.push(ProcessEntry {
            id,
            process: Box::new(process),
            temp_files,
            output_file,
        });
        id
    }

    /// Remove a process from the registry, normally on natural exit.
    pub fn unregister(&self, registration_id: u64) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|e| e.id != registration_id);
    }

    /// Number of tracked processes.
    pub fn active_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether a cancel has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Control whether temp/output files are deleted after a cancel.
    pub fn set_cleanup_on_cancel(&self, cleanup: bool) {
        self.cleanup_on_cancel.store(cleanup, Ordering::SeqCst);
    }

    /// Clear the cancelled flag and drop all registrations.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
        self.entries.lock().unwrap().clear();
    }

    /// Cancel every tracked process.
    ///
    /// Phase one sends a graceful terminate to each live process and polls
    /// for natural exit until `timeout` elapses. Phase two force-kills
    /// whatever is left, allowing a short settle window per process. When
    /// cleanup-on-cancel is enabled, registered temp files are deleted along
    /// with any registered output that looks unfinished.
    ///
    /// Returns `true` when the registry ended up empty.
    pub async fn cancel_all(&self, timeout: Duration) -> bool {
        self.cancelled.store(true, Ordering::SeqCst);

        let mut entries: Vec<ProcessEntry> = {
            let mut guard = self.entries.lock().unwrap();
            guard.drain(..).collect()
        };

        if entries.is_empty() {
            return true;
        }

        let temp_files: Vec<PathBuf> = entries
            .iter()
            .flat_map(|e| e.temp_files.iter().cloned())
            .collect();
        let output_files: Vec<PathBuf> = entries
            .iter()
            .filter_map(|e| e.output_file.clone())
            .collect();

        // Phase one: graceful terminate, then poll for natural exit.
        for entry in &mut entries {
            if entry.process.is_running() {
                debug!(pid = entry.process.pid(), "sending graceful terminate");
                entry.process.terminate();
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            if entries.iter_mut().all(|e| !e.process.is_running()) {
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            sleep(TERMINATION_POLL_INTERVAL).await;
        }
        entries.retain_mut(|e| e.process.is_running());

        // Phase two: force-kill the stragglers.
        for entry in &mut entries {
            warn!(pid = entry.process.pid(), "graceful terminate ignored, killing");
            entry.process.kill();

            let kill_deadline = Instant::now() + KILL_SETTLE_TIMEOUT;
            while entry.process.is_running() && Instant::now() < kill_deadline {
                sleep(TERMINATION_POLL_INTERVAL).await;
            }
        }
        entries.retain_mut(|e| e.process.is_running());

        if self.cleanup_on_cancel.load(Ordering::SeqCst) {
            cleanup_cancelled_files(&temp_files, &output_files);
        }

        // Whatever refused to die stays tracked.
        let survivors = !entries.is_empty();
        if survivors {
            let mut guard = self.entries.lock().unwrap();
            guard.extend(entries);
        }

        !survivors
    }
}

/// Delete temp files unconditionally and output files that look like
/// unfinished artifacts of a killed process. Failures are swallowed; cleanup
/// must never abort a cancel.
fn cleanup_cancelled_files(temp_files: &[PathBuf], output_files: &[PathBuf]) {
    for path in temp_files {
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                debug!(path = %path.display(), error = %e, "temp file cleanup failed");
            }
        }
    }

    for path in output_files {
        let Ok(metadata) = std::fs::metadata(path) else {
            continue;
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
            .unwrap_or(Duration::ZERO);

        if is_unfinished_output(metadata.len(), age) {
            if let Err(e) = std::fs::remove_file(path) {
                debug!(path = %path.display(), error = %e, "output cleanup failed");
            }
        }
    }
}

/// Heuristic for "this output is an unfinished artifact of a killed
/// process": very small, or written to within the last half minute. Not a
/// guarantee either way.
pub fn is_unfinished_output(size_bytes: u64, modified_age: Duration) -> bool {
    size_bytes < UNFINISHED_OUTPUT_MAX_BYTES || modified_age < UNFINISHED_OUTPUT_MAX_AGE
}

/// Parse an encoder progress stream, forwarding fractional progress.
///
/// Reads `out_time_ms=` lines (microseconds of media time), converts them to
/// progress against `total_duration_secs`, and suppresses updates smaller
/// than [`PROGRESS_DELTA_THRESHOLD`] to limit event volume. A terminating
/// `progress=end` line forwards the final value. Returns the last progress
/// forwarded.
pub fn monitor_progress<R, C, F>(reader: R, total_duration_secs: f64, is_cancelled: C, mut on_progress: F) -> f32
where
    R: BufRead,
    C: Fn() -> bool,
    F: FnMut(f32),
{
    let mut last_progress = 0.0f32;

    for line in reader.lines() {
        let Ok(line) = line else { break };
        if is_cancelled() {
            break;
        }

        let line = line.trim();
        if let Some(value) = line.strip_prefix("out_time_ms=") {
            let Ok(time_us) = value.parse::<i64>() else {
                continue;
            };
            if total_duration_secs <= 0.0 {
                continue;
            }

            let current_secs = time_us as f64 / 1_000_000.0;
            let progress = (current_secs / total_duration_secs).min(1.0) as f32;

            if (progress - last_progress).abs() >= PROGRESS_DELTA_THRESHOLD {
                last_progress = progress;
                on_progress(progress);
            }
        } else if line == "progress=end" {
            last_progress = 1.0;
            on_progress(1.0);
        }
    }

    last_progress
}
