//! Scoped ownership of a slice's temporary files.
//!
//! A [`StagingArea`] is `<scratch>/<run_id>/<slice>/`, so paths are unique
//! per (run, slice) even when runs overlap. Everything created inside it,
//! plus any extra paths registered with [`StagingArea::track`], is removed
//! by [`StagingArea::release`] or, failing that, on drop.
//!
//! A killed process gets neither. Each run therefore holds a [`RunLock`]
//! next to its files, and [`reclaim_abandoned`] deletes whatever belongs to
//! a run whose lock nobody holds.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use fs4::FileExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::slice::TimeSlice;

pub struct StagingArea {
    dir: PathBuf,
    tracked: Vec<PathBuf>,
    released: bool,
}

impl StagingArea {
    /// Create a fresh staging directory for `slice` within run `run_id`.
    pub async fn acquire(scratch_root: &Path, run_id: Uuid, slice: TimeSlice) -> io::Result<Self> {
        let dir = scratch_root
            .join(run_id.to_string())
            .join(slice.to_string());

        // Anything already here is garbage from an interrupted attempt.
        if fs::try_exists(&dir).await? {
            fs::remove_dir_all(&dir).await?;
        }
        fs::create_dir_all(&dir).await?;

        debug!(path = %dir.display(), "Acquired staging area");
        Ok(Self {
            dir,
            tracked: Vec::new(),
            released: false,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a staging file inside the area.
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Register a temporary path living outside the staging directory.
    pub fn track(&mut self, path: PathBuf) {
        self.tracked.push(path);
    }

    /// Delete every staging artifact. Safe to call whatever state the
    /// pipeline stopped in.
    pub async fn release(mut self) -> io::Result<()> {
        self.released = true;
        let mut first_error = None;

        for path in self.tracked.drain(..) {
            if let Err(e) = remove_file_if_exists(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove tracked staging file");
                first_error.get_or_insert(e);
            }
        }

        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.dir.display(), error = %e, "Failed to remove staging area");
                first_error.get_or_insert(e);
            }
        }

        // Drop the run directory once its last slice is gone; a sibling
        // slice still in flight keeps it non-empty and the call fails.
        if let Some(run_dir) = self.dir.parent() {
            let _ = fs::remove_dir(run_dir).await;
        }

        debug!(path = %self.dir.display(), "Released staging area");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        for path in &self.tracked {
            let _ = std::fs::remove_file(path);
        }
        let _ = std::fs::remove_dir_all(&self.dir);
        if let Some(run_dir) = self.dir.parent() {
            let _ = std::fs::remove_dir(run_dir);
        }
    }
}

/// Exclusive advisory lock marking a run as alive.
///
/// Lives at `<dir>/.<run_id>.lock` while the run is in progress. The file
/// is locked under a temporary name before it is renamed into place, so a
/// visible lock file that can be locked belongs to a dead run.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    file: Option<std::fs::File>,
}

impl RunLock {
    pub fn acquire(dir: &Path, run_id: Uuid) -> io::Result<Self> {
        let path = lock_path(dir, run_id);
        let pending = dir.join(format!(".{}.lock.new", run_id.simple()));

        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&pending)?;
        if let Err(e) = file
            .try_lock_exclusive()
            .and_then(|()| std::fs::rename(&pending, &path))
        {
            let _ = std::fs::remove_file(&pending);
            return Err(e);
        }

        debug!(path = %path.display(), "Acquired run lock");
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a live run holds its lock in `dir`.
    pub fn is_held(dir: &Path, run_id: Uuid) -> io::Result<bool> {
        let file = match std::fs::File::open(lock_path(dir, run_id)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        // Closing the probe handle drops the lock again.
        match file.try_lock_exclusive() {
            Ok(()) => Ok(false),
            Err(e) if is_contended(&e) => Ok(true),
            Err(e) => Err(e),
        }
    }

    pub fn release(mut self) {
        self.unlock();
    }

    fn unlock(&mut self) {
        if self.file.take().is_some() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove run lock");
                }
            }
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

fn lock_path(dir: &Path, run_id: Uuid) -> PathBuf {
    dir.join(format!(".{}.lock", run_id.simple()))
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == fs4::lock_contended_error().raw_os_error()
}

/// Leftovers removed by [`reclaim_abandoned`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reclaimed {
    pub staging_dirs: Vec<PathBuf>,
    pub partials: Vec<PathBuf>,
}

impl Reclaimed {
    pub fn is_empty(&self) -> bool {
        self.staging_dirs.is_empty() && self.partials.is_empty()
    }
}

/// Delete the staging directories and packager partials of dead runs.
///
/// A run is dead when its lock in the same directory is missing or free.
/// Only `<scratch>/<uuid>/` directories and `.<name>.<uuid>.partial` files
/// are considered, and `current` is never touched. Blocking.
pub fn reclaim_abandoned(scratch_root: &Path, output_dir: &Path, current: Uuid) -> io::Result<Reclaimed> {
    let mut reclaimed = Reclaimed::default();

    for (path, owner) in run_entries(scratch_root, |name| Uuid::parse_str(name).ok())? {
        if owner == current || !path.is_dir() || RunLock::is_held(scratch_root, owner)? {
            continue;
        }
        std::fs::remove_dir_all(&path)?;
        reclaimed.staging_dirs.push(path);
    }

    for (path, owner) in run_entries(output_dir, partial_owner)? {
        if owner == current || RunLock::is_held(output_dir, owner)? {
            continue;
        }
        std::fs::remove_file(&path)?;
        reclaimed.partials.push(path);
    }

    // Lock files of dead runs.
    for dir in [scratch_root, output_dir] {
        for (path, owner) in run_entries(dir, lock_owner)? {
            if owner != current && !RunLock::is_held(dir, owner)? {
                let _ = std::fs::remove_file(&path);
            }
        }
    }

    Ok(reclaimed)
}

fn run_entries(dir: &Path, owner: impl Fn(&str) -> Option<Uuid>) -> io::Result<Vec<(PathBuf, Uuid)>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(run_id) = name.to_str().and_then(&owner) {
            entries.push((entry.path(), run_id));
        }
    }
    Ok(entries)
}

/// `.permanentgreenland_2020.tif.<run>.partial` -> `<run>`
fn partial_owner(name: &str) -> Option<Uuid> {
    let (_, run) = name.strip_prefix('.')?.strip_suffix(".partial")?.rsplit_once('.')?;
    Uuid::parse_str(run).ok()
}

fn lock_owner(name: &str) -> Option<Uuid> {
    Uuid::parse_str(name.strip_prefix('.')?.strip_suffix(".lock")?).ok()
}

pub(crate) async fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Write `contents` to a temporary sibling, fsync it and rename it over
/// `path`, so readers see either the old file or the complete new one.
pub(crate) async fn write_atomically(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp_name = path.file_name().map(OsString::from).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let result: io::Result<()> = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(contents).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await
    }
    .await;

    if result.is_err() {
        let _ = remove_file_if_exists(&tmp).await;
    }
    result
}
