//! Test fixtures for storage testing.

/// Creates a temporary download directory.
///
/// # Panics
///
/// Panics if temporary directory creation fails.
pub fn create_temp_download_dir() -> (tempfile::TempDir, std::path::PathBuf) {
    let temp_dir = tempfile::tempdir().unwrap();
    let downloads_dir = temp_dir.path().join("downloads");
    std::fs::create_dir_all(&downloads_dir).unwrap();
    (temp_dir, downloads_dir)
}
