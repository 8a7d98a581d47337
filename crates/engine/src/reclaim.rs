//! Resource reclamation for temp and scratch files.
//!
//! Encoder processes routinely hold file handles open past their useful
//! life, so plain deletion fails intermittently. Deletion here retries with
//! capped exponential waits, and files that stay locked get a detached
//! delayed cleanup instead of blocking the caller. A forced sweep can also
//! terminate stray encoder processes discovered by name before deleting.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Delete retries for ordinary intermediate files.
pub const INTERMEDIATE_DELETE_RETRIES: u32 = 5;

/// Delete retries for encoder scratch files, which stay locked longer.
pub const SCRATCH_DELETE_RETRIES: u32 = 8;

/// Upper bound on the per-attempt retry wait, in seconds.
const MAX_RETRY_WAIT_SECS: u64 = 10;

/// Delay before a detached last-chance cleanup fires.
const DELAYED_CLEANUP_DELAY: Duration = Duration::from_secs(5);

/// Process names treated as encoder processes during forced cleanup.
pub const ENCODER_PROCESS_NAMES: &[&str] = &["ffmpeg", "ffprobe"];

/// Error type for reclamation operations
#[derive(Debug, Error)]
pub enum ReclaimError {
    /// The file stayed locked through every retry; a delayed cleanup was
    /// scheduled in its place.
    #[error("file still locked after retries, delayed cleanup scheduled: {}", path.display())]
    StillLocked { path: PathBuf },
}

/// Class of a registered temp file, determining delete persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempFileClass {
    /// Short-lived intermediate artifacts (concat lists, chunk files).
    Intermediate,
    /// Encoder scratch output that the encoder may keep open for a while.
    EncoderScratch,
}

impl TempFileClass {
    fn delete_retries(self) -> u32 {
        match self {
            TempFileClass::Intermediate => INTERMEDIATE_DELETE_RETRIES,
            TempFileClass::EncoderScratch => SCRATCH_DELETE_RETRIES,
        }
    }
}

#[derive(Debug, Clone)]
struct TempFileEntry {
    path: PathBuf,
    class: TempFileClass,
}

/// Registry of temp files with retrying, lock-tolerant cleanup.
pub struct ResourceReclaimer {
    files: Mutex<Vec<TempFileEntry>>,
    pending_delayed: Arc<AtomicUsize>,
}

impl Default for ResourceReclaimer {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceReclaimer {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(Vec::new()),
            pending_delayed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register an intermediate temp file for cleanup.
    pub fn register_temp_file(&self, path: impl Into<PathBuf>) {
        self.register(path.into(), TempFileClass::Intermediate);
    }

    /// Register an encoder scratch file for cleanup.
    pub fn register_scratch_file(&self, path: impl Into<PathBuf>) {
        self.register(path.into(), TempFileClass::EncoderScratch);
    }

    fn register(&self, path: PathBuf, class: TempFileClass) {
        let mut files = self.files.lock().unwrap();
        if !files.iter().any(|e| e.path == path) {
            files.push(TempFileEntry { path, class });
        }
    }

    /// Number of registered files awaiting cleanup.
    pub fn registered_count(&self) -> usize {
        self.files.lock().unwrap().len()
    }

    /// Number of detached delayed cleanups that have not fired yet.
    pub fn pending_delayed_cleanups(&self) -> usize {
        self.pending_delayed.load(Ordering::SeqCst)
    }

    /// Recursively scan `base_dir` for encoder temp-file debris and register
    /// every hit for cleanup. Returns the discovered paths.
    pub fn scan_temp_files(&self, base_dir: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();

        for entry in WalkDir::new(base_dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if is_temp_file_name(&name) {
                let path = entry.path().to_path_buf();
                debug!(path = %path.display(), "discovered temp file");
                self.register(path.clone(), TempFileClass::Intermediate);
                found.push(path);
            }
        }

        found
    }

    /// Delete a file, retrying on failure with `min(2^attempt, 10)` second
    /// waits. After `max_retries` failed attempts, schedules a detached
    /// delayed cleanup and returns [`ReclaimError::StillLocked`].
    pub async fn delete_with_retry(
        &self,
        path: &Path,
        max_retries: u32,
    ) -> Result<(), ReclaimError> {
        self.delete_with_retry_using(path, max_retries, |p| std::fs::remove_file(p))
            .await
    }

    /// Retry loop with an injectable delete attempt, shared by the public
    /// entry points and exercised directly by tests.
    async fn delete_with_retry_using<F>(
        &self,
        path: &Path,
        max_retries: u32,
        mut attempt_delete: F,
    ) -> Result<(), ReclaimError>
    where
        F: FnMut(&Path) -> std::io::Result<()>,
    {
        for attempt in 0..max_retries {
            match attempt_delete(path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    if attempt + 1 < max_retries {
                        let wait = 2u64.pow(attempt).min(MAX_RETRY_WAIT_SECS);
                        warn!(
                            path = %path.display(),
                            attempt = attempt + 1,
                            max_retries,
                            error = %e,
                            "file busy, retrying delete in {}s", wait
                        );
                        sleep(Duration::from_secs(wait)).await;
                    } else {
                        warn!(
                            path = %path.display(),
                            error = %e,
                            "delete retries exhausted, scheduling delayed cleanup"
                        );
                        self.schedule_delayed_cleanup(path);
                        return Err(ReclaimError::StillLocked {
                            path: path.to_path_buf(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Fire-once, best-effort cleanup a few seconds from now. Errors are
    /// swallowed; the pending counter makes the outstanding work observable.
    fn schedule_delayed_cleanup(&self, path: &Path) {
        let path = path.to_path_buf();
        let pending = self.pending_delayed.clone();
        pending.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            sleep(DELAYED_CLEANUP_DELAY).await;
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "delayed cleanup succeeded"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "delayed cleanup failed"),
            }
            pending.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Delete every registered file.
    ///
    /// With `force`, first terminates any still-running encoder process found
    /// by name, then waits a settle interval for the OS to release handles
    /// before the first delete attempt. Returns the number of files removed;
    /// files that stay locked are left to their delayed cleanups.
    pub async fn cleanup_all(&self, force: bool) -> usize {
        if force {
            let killed = kill_encoder_processes();
            if killed > 0 {
                warn!(killed, "terminated lingering encoder processes");
            }
        }

        // Settle interval so freshly released handles actually close.
        let settle = if force {
            Duration::from_secs(1)
        } else {
            Duration::from_millis(500)
        };
        sleep(settle).await;

        let entries: Vec<TempFileEntry> = {
            let mut files = self.files.lock().unwrap();
            files.drain(..).collect()
        };

        let mut removed = 0;
        for entry in entries {
            match self
                .delete_with_retry(&entry.path, entry.class.delete_retries())
                .await
            {
                Ok(()) => removed += 1,
                Err(ReclaimError::StillLocked { .. }) => {
                    // Delayed cleanup is already on its way; nothing more to do.
                }
            }
        }

        debug!(removed, "temp file cleanup pass finished");
        removed
    }
}

/// Name patterns produced by encoders and interrupted downloads.
pub fn is_temp_file_name(name: &str) -> bool {
    name.ends_with(".tmp")
        || name.ends_with(".partial")
        || name.ends_with(".downloading")
        || name.ends_with('~')
        || name.starts_with("ffmpeg_")
        || name.starts_with(".tmp")
        || name.contains("_ffmpeg_")
        || name.contains("_temp.")
}

/// Kill still-running encoder processes discovered by name. Returns how many
/// were signalled.
fn kill_encoder_processes() -> usize {
    use sysinfo::{ProcessesToUpdate, System};

    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All);

    let mut killed = 0;
    for process in sys.processes().values() {
        let name = process.name().to_string_lossy().to_lowercase();
        if ENCODER_PROCESS_NAMES.iter().any(|n| name.contains(n)) && process.kill() {
            warn!(pid = process.pid().as_u32(), %name, "killed encoder process");
            killed += 1;
        }
    }

    killed
}
