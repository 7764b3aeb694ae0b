//! Local scratch files backing open object handles
//!
//! Every open handle owns one uniquely named `.cache` file in the store's
//! scratch directory. The file is removed when the handle is closed or
//! dropped; only a crash can leave one behind, which is what [`sweep`]
//! cleans up.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use cloudstore_core::config::CACHE_FILE_EXT;
use cloudstore_core::{Error, Result};
use tokio::fs;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Longest object-name fragment embedded in a scratch file name
const MAX_NAME_FRAGMENT: usize = 64;

/// Allocator of scratch files under one directory
#[derive(Debug, Clone)]
pub struct CacheFiles {
    dir: PathBuf,
}

impl CacheFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fresh scratch path for `name`
    ///
    /// Embeds a random token, so two handles on the same name never share
    /// a path.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!(
            "{}.{}.{}",
            sanitize(name),
            Uuid::new_v4().simple(),
            CACHE_FILE_EXT
        ))
    }

    /// Create a new, empty scratch file for `name`
    ///
    /// # Returns
    /// The owning guard and a read/write handle positioned at offset 0
    pub async fn create(&self, name: &str) -> Result<(CacheFile, fs::File)> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::local_io(&self.dir, e))?;

        let path = self.path_for(name);
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| Error::local_io(&path, e))?;

        debug!(?path, %name, "Allocated cache file");
        Ok((CacheFile { path: Some(path) }, file))
    }
}

/// Owns one scratch file and deletes it when removed or dropped
#[derive(Debug)]
pub struct CacheFile {
    path: Option<PathBuf>,
}

impl CacheFile {
    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    /// Delete the scratch file now
    pub async fn remove(mut self) -> Result<()> {
        let Some(path) = self.path.take() else {
            return Ok(());
        };
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(?path, "Removed cache file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::local_io(path, e)),
        }
    }
}

/// Removes the file with a blocking syscall on the dropping thread. Prefer
/// [`CacheFile::remove`] inside async code.
impl Drop for CacheFile {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(?path, error = %e, "Failed to remove dropped cache file");
                }
            }
        }
    }
}

/// Keep file names portable: anything but `[A-Za-z0-9._-]` becomes `_`
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_FRAGMENT)
        .collect()
}

/// Outcome of one maintenance sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stale scratch files deleted
    pub removed: usize,

    /// Scratch files younger than the threshold, left alone
    pub retained: usize,

    /// Entries that could not be inspected or deleted
    pub failures: usize,
}

enum Visit {
    Descend(PathBuf),
    Removed,
    Retained,
    Ignored,
}

/// Delete scratch files older than `max_age` below `dir`
///
/// Runs on the blocking pool; see [`sweep_blocking`].
pub async fn sweep(dir: impl Into<PathBuf>, max_age: Duration) -> Result<SweepReport> {
    let dir = dir.into();
    tokio::task::spawn_blocking(move || sweep_blocking(&dir, max_age))
        .await
        .map_err(|e| Error::Internal {
            message: format!("cache sweep task failed: {}", e),
        })
}

/// Delete scratch files older than `max_age` below `dir`
///
/// Meant to run once at startup to reclaim files orphaned by a crashed
/// process. Only files carrying the `.cache` extension are considered.
/// Failures on individual entries are logged and counted, never returned,
/// and a panic while handling one entry does not stop the walk.
///
/// `max_age` must exceed the lifetime of any live handle: the sweep takes no
/// lock against handles that are open concurrently.
pub fn sweep_blocking(dir: &Path, max_age: Duration) -> SweepReport {
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut report = SweepReport::default();

    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && current == dir => {
                debug!(?current, "Cache directory does not exist, nothing to sweep");
                continue;
            }
            Err(e) => {
                warn!(?current, error = %e, "Cache sweep could not read directory");
                report.failures += 1;
                continue;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(?current, error = %e, "Cache sweep could not read entry");
                    report.failures += 1;
                    continue;
                }
            };

            let path = entry.path();
            match catch_unwind(AssertUnwindSafe(|| visit(&entry, cutoff))) {
                Ok(Ok(Visit::Descend(sub))) => stack.push(sub),
                Ok(Ok(Visit::Removed)) => report.removed += 1,
                Ok(Ok(Visit::Retained)) => report.retained += 1,
                Ok(Ok(Visit::Ignored)) => {}
                Ok(Err(e)) => {
                    warn!(?path, error = %e, "Cache sweep failed on entry");
                    report.failures += 1;
                }
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(?path, %reason, "Cache sweep recovered from panic");
                    report.failures += 1;
                }
            }
        }
    }

    info!(
        dir = %dir.display(),
        max_age_secs = max_age.as_secs(),
        removed = report.removed,
        retained = report.retained,
        failures = report.failures,
        "Cache sweep complete"
    );
    report
}

fn visit(entry: &std::fs::DirEntry, cutoff: SystemTime) -> std::io::Result<Visit> {
    let path = entry.path();
    if entry.file_type()?.is_dir() {
        return Ok(Visit::Descend(path));
    }
    if path.extension().and_then(|ext| ext.to_str()) != Some(CACHE_FILE_EXT) {
        return Ok(Visit::Ignored);
    }

    let modified = std::fs::metadata(&path)?.modified()?;
    if modified >= cutoff {
        return Ok(Visit::Retained);
    }

    std::fs::remove_file(&path)?;
    debug!(?path, "Removed stale cache file");
    Ok(Visit::Removed)
}
