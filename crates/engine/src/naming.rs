//! Collision-free output file naming.
//!
//! Generated outputs never silently overwrite an existing file. Names follow
//! `{base}_{yyyyMMdd_HHmmss}_{counter:03}.{ext}`; once the counter is spent
//! the name falls back to a microsecond-resolution timestamp suffix.

use chrono::Local;
use std::path::{Path, PathBuf};

/// Highest counter value tried before falling back to a microsecond suffix.
const MAX_NAME_COUNTER: u32 = 999;

/// Generates a unique output path inside `output_folder`.
///
/// Tries `{base}_{timestamp}_{counter:03}.{ext}` with the counter running
/// from 1 to 999; if every candidate exists, returns
/// `{base}_{timestamp_with_microseconds}.{ext}` instead.
pub fn generate_unique_output_path(
    output_folder: &Path,
    base_name: &str,
    extension: &str,
) -> PathBuf {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();

    for counter in 1..=MAX_NAME_COUNTER {
        let filename = format!("{}_{}_{:03}.{}", base_name, timestamp, counter, extension);
        let full_path = output_folder.join(filename);
        if !full_path.exists() {
            return full_path;
        }
    }

    // Counter exhausted; a microsecond timestamp breaks the tie.
    let micro_timestamp = Local::now().format("%Y%m%d_%H%M%S_%6f").to_string();
    output_folder.join(format!("{}_{}.{}", base_name, micro_timestamp, extension))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    #[test]
    fn test_generates_first_counter_when_folder_empty() {
        let dir = TempDir::new().unwrap();
        let path = generate_unique_output_path(dir.path(), "merged_001", "mp4");

        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("merged_001_"));
        assert!(name.ends_with("_001.mp4"));
        assert!(!path.exists());
    }

    #[test]
    fn test_counter_advances_past_existing_files() {
        let dir = TempDir::new().unwrap();

        // Occupy the first slot, then ask again within the same second.
        let first = generate_unique_output_path(dir.path(), "merged_001", "mp4");
        File::create(&first).unwrap();

        let second = generate_unique_output_path(dir.path(), "merged_001", "mp4");
        assert_ne!(first, second);
        assert!(!second.exists());
    }

    #[test]
    fn test_name_format_shape() {
        let dir = TempDir::new().unwrap();
        let path = generate_unique_output_path(dir.path(), "out", "mkv");
        let name = path.file_name().unwrap().to_string_lossy().to_string();

        // out_YYYYMMDD_HHMMSS_001.mkv
        let parts: Vec<&str> = name.trim_end_matches(".mkv").split('_').collect();
        assert_eq!(parts[0], "out");
        assert_eq!(parts[1].len(), 8); // date
        assert_eq!(parts[2].len(), 6); // time
        assert_eq!(parts[3], "001");
    }

    #[test]
    fn test_distinct_base_names_never_collide() {
        let dir = TempDir::new().unwrap();
        let a = generate_unique_output_path(dir.path(), "merged_001", "mp4");
        let b = generate_unique_output_path(dir.path(), "merged_002", "mp4");
        assert_ne!(a, b);
    }
}
