//! Path utilities for archive tests.
//!
//! Every test gets its own output and scratch directories below one
//! temporary root, so runs never see each other's artifacts.

use std::path::{Path, PathBuf};

/// Returns the workspace root directory.
///
/// This is determined by walking up from the current crate's manifest directory
/// until we find the workspace Cargo.toml.
pub fn workspace_root() -> PathBuf {
    // Start from the test-utils crate manifest dir
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    PathBuf::from(manifest_dir)
        .parent() // crates/
        .and_then(|p| p.parent()) // workspace root
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from(manifest_dir))
}

/// The sample configuration shipped with the workspace.
pub fn sample_config_path() -> PathBuf {
    workspace_root().join("config").join("archive.yaml")
}

/// Creates a temporary directory for test output.
///
/// The directory is automatically cleaned up when the returned `TempDir` is dropped.
pub fn temp_test_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temporary test directory")
}

/// Output and scratch directories for one archive run.
pub struct ArchiveDirs {
    root: tempfile::TempDir,
}

impl ArchiveDirs {
    pub fn new() -> Self {
        let root = tempfile::Builder::new()
            .prefix("cog_archive_test_")
            .tempdir()
            .expect("Failed to create temporary test directory");
        Self { root }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Where final COGs and the catalog land. Not created up front.
    pub fn output(&self) -> PathBuf {
        self.root.path().join("cogs")
    }

    /// Staging root. Not created up front.
    pub fn scratch(&self) -> PathBuf {
        self.root.path().join("scratch")
    }
}

impl Default for ArchiveDirs {
    fn default() -> Self {
        Self::new()
    }
}

/// Every regular file below `dir`, sorted. A missing directory has none.
pub fn list_files(dir: impl AsRef<Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![dir.as_ref().to_path_buf()];

    while let Some(current) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }

    files.sort();
    files
}
