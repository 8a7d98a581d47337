//! Material discovery for input folders.
//!
//! Lists the clip files a job can draw on. Listing is non-recursive: a job's
//! material pool is exactly the files sitting in its input folder.

use std::io;
use std::path::Path;

/// Clip file extensions eligible as materials (case-insensitive matching).
pub const MATERIAL_EXTENSIONS: &[&str] = &[
    ".mp4", ".avi", ".mov", ".mkv", ".flv", ".wmv", ".mpeg", ".mpg",
];

/// Checks if a file has a material extension (case-insensitive).
pub fn is_material_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            MATERIAL_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// Lists material file names in `folder`, sorted for deterministic ordering.
///
/// Returns bare file names rather than full paths; material identity is the
/// name within its folder.
pub fn list_materials(folder: &Path) -> io::Result<Vec<String>> {
    let mut materials = Vec::new();

    for entry in std::fs::read_dir(folder)? {
        let entry = entry?;
        let path = entry.path();

        if !path.is_file() || !is_material_file(&path) {
            continue;
        }

        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            materials.push(name.to_string());
        }
    }

    materials.sort();
    Ok(materials)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_is_material_file() {
        assert!(is_material_file(&PathBuf::from("clip.mp4")));
        assert!(is_material_file(&PathBuf::from("clip.MKV")));
        assert!(is_material_file(&PathBuf::from("/a/b/clip.mpeg")));
        assert!(!is_material_file(&PathBuf::from("clip.txt")));
        assert!(!is_material_file(&PathBuf::from("clip")));
        assert!(!is_material_file(&PathBuf::from("clip.mp4.json")));
    }

    #[test]
    fn test_list_materials_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        File::create(dir.path().join("b.mp4")).unwrap();
        File::create(dir.path().join("a.mov")).unwrap();
        File::create(dir.path().join("notes.txt")).unwrap();
        File::create(dir.path().join("c.AVI")).unwrap();

        let materials = list_materials(dir.path()).unwrap();
        assert_eq!(materials, vec!["a.mov", "b.mp4", "c.AVI"]);
    }

    #[test]
    fn test_list_materials_is_not_recursive() {
        let dir = TempDir::new().unwrap();
        File::create(dir.path().join("top.mp4")).unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        File::create(dir.path().join("nested/inner.mp4")).unwrap();

        let materials = list_materials(dir.path()).unwrap();
        assert_eq!(materials, vec!["top.mp4"]);
    }

    #[test]
    fn test_list_materials_missing_folder_errors() {
        assert!(list_materials(Path::new("/nonexistent/input/folder")).is_err());
    }
}
