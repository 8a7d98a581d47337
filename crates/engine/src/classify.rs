//! Failure classification for batch task errors.
//!
//! Maps raw error messages coming out of the external encoder or job runner
//! to a closed failure taxonomy, and decides whether a failure class is worth
//! retrying at a given retry count.

use serde::{Deserialize, Serialize};

/// Classified reason for a task failure.
///
/// Every failed task carries exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Failure could not be classified.
    Unknown,
    /// An input or intermediate file is missing.
    FileNotFound,
    /// The encoder or runner ran out of memory.
    InsufficientMemory,
    /// No space left on the output device.
    DiskFull,
    /// Filesystem permission error.
    PermissionDenied,
    /// The external encoder reported an error.
    EncoderError,
    /// The operation timed out.
    Timeout,
    /// An input or output file is corrupt or invalid.
    Corruption,
}

impl Default for FailureReason {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Unknown => write!(f, "unknown"),
            FailureReason::FileNotFound => write!(f, "file_not_found"),
            FailureReason::InsufficientMemory => write!(f, "insufficient_memory"),
            FailureReason::DiskFull => write!(f, "disk_full"),
            FailureReason::PermissionDenied => write!(f, "permission_denied"),
            FailureReason::EncoderError => write!(f, "encoder_error"),
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::Corruption => write!(f, "corruption"),
        }
    }
}

/// Maximum retries granted to transient failure classes.
///
/// Tunable constant, kept at 3 for behavioral compatibility with the retry
/// policy table in `should_retry`.
pub const TRANSIENT_RETRY_LIMIT: u32 = 3;

/// Classifies an error message into a [`FailureReason`].
///
/// Matching is ordered, case-insensitive substring matching; the first
/// matching class wins. Messages that match nothing classify as `Unknown`.
pub fn classify(message: &str) -> FailureReason {
    let msg = message.to_lowercase();

    if msg.contains("no such file") || msg.contains("file not found") {
        FailureReason::FileNotFound
    } else if msg.contains("memory") || msg.contains("out of memory") {
        FailureReason::InsufficientMemory
    } else if msg.contains("no space left") || msg.contains("disk full") {
        FailureReason::DiskFull
    } else if msg.contains("permission denied") || msg.contains("access denied") {
        FailureReason::PermissionDenied
    } else if msg.contains("ffmpeg") {
        FailureReason::EncoderError
    } else if msg.contains("timeout") || msg.contains("timed out") {
        FailureReason::Timeout
    } else if msg.contains("corrupt") || msg.contains("invalid") {
        FailureReason::Corruption
    } else {
        FailureReason::Unknown
    }
}

/// Decides whether a failure with the given reason should be retried after
/// `retry_count` prior attempts.
///
/// Policy table:
/// - `FileNotFound`, `PermissionDenied`, `Corruption`: never retried
/// - `DiskFull`: retried at most once
/// - everything else: retried while `retry_count < TRANSIENT_RETRY_LIMIT`
pub fn should_retry(reason: FailureReason, retry_count: u32) -> bool {
    match reason {
        FailureReason::FileNotFound
        | FailureReason::PermissionDenied
        | FailureReason::Corruption => false,
        FailureReason::DiskFull => retry_count < 1,
        _ => retry_count < TRANSIENT_RETRY_LIMIT,
    }
}
