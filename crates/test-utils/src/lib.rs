//! Shared test utilities for the cog-archive workspace.
//!
//! This crate provides common testing infrastructure including:
//! - Temporary output/scratch directory layouts
//! - Fake raster payloads and `gdalinfo -json` reports
//! - A fake WCS server bound to an ephemeral localhost port
//!
//! # Usage
//!
//! Add to your crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { path = "../test-utils" }
//! ```
//!
//! Then import in your tests:
//!
//! ```ignore
//! use test_utils::{ArchiveDirs, FakeWcs};
//! ```

pub mod fixtures;
pub mod paths;
pub mod wcs;

// Re-export commonly used items at the crate root
pub use fixtures::*;
pub use paths::*;
pub use wcs::*;

/// Assert that a directory tree contains no files at all.
///
/// Empty directories are allowed.
///
/// # Usage
///
/// ```ignore
/// use test_utils::assert_no_files;
///
/// assert_no_files!(dirs.scratch());
/// ```
#[macro_export]
macro_rules! assert_no_files {
    ($dir:expr) => {{
        let files = $crate::list_files($dir);
        if !files.is_empty() {
            panic!(
                "assertion failed: expected no files under {:?}, found {:?}",
                $dir, files
            );
        }
    }};
}
