//! Local filesystem storage backend
//!
//! Maps object keys onto files under a root directory so the store can be
//! exercised without a remote service. Uploads are atomic (write to a hidden
//! temp file, then rename).

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use cloudstore_core::{Error, ListPage, ListRequest, ObjectMeta, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::backend::{BlobReader, BlobSink, StorageBackend};
use crate::folders::folder_for_key;

const BACKEND: &str = "localfs";

/// Local filesystem storage backend
///
/// Stores objects in a local directory with support for:
/// - Atomic writes (write to .tmp, then rename)
/// - Automatic directory creation
/// - Key-ordered, cursor-paged listing with delimiter roll-up
#[derive(Debug, Clone)]
pub struct LocalStorage {
    /// Base path for all storage operations
    base_path: PathBuf,
}

impl LocalStorage {
    /// Create a new LocalStorage instance
    ///
    /// # Arguments
    /// * `base_path` - Directory to use as the storage root
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Create the root directory if needed and return the backend
    pub async fn create<P: AsRef<Path>>(base_path: P) -> Result<Self> {
        let storage = Self::new(base_path);
        fs::create_dir_all(&storage.base_path)
            .await
            .map_err(|e| Error::local_io(&storage.base_path, e))?;
        Ok(storage)
    }

    /// Get the base path
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve an object key to a path below the root
    fn resolve_path(&self, name: &str) -> Result<PathBuf> {
        let invalid = |reason: &str| Error::InvalidKey {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if name.is_empty() {
            return Err(invalid("empty key"));
        }

        for segment in name.split('/') {
            match segment {
                "" => return Err(invalid("empty path segment")),
                "." | ".." => return Err(invalid("key must not contain '.' or '..' segments")),
                s if is_temp_name(s) => return Err(invalid("reserved temp file name")),
                _ => {}
            }
        }

        let relative = Path::new(name);
        if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(invalid("key must be a relative path"));
        }

        Ok(self.base_path.join(relative))
    }

    /// Generate a unique temporary file path next to the target
    fn temp_path(full_path: &Path) -> PathBuf {
        let temp_name = format!(
            ".{}.{}.tmp",
            full_path.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4()
        );
        full_path.with_file_name(temp_name)
    }

    /// Collect every stored object whose key starts with `prefix`, in key order
    async fn walk(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        // Start at the deepest directory the prefix pins down
        let dir_to_scan = match prefix.rfind('/') {
            Some(idx) => {
                let dir = &prefix[..idx];
                if dir.split('/').any(|s| s == "." || s == "..") || dir.starts_with('/') {
                    return Ok(Vec::new());
                }
                self.base_path.join(dir)
            }
            None => self.base_path.clone(),
        };

        let mut results = Vec::new();
        let mut stack = vec![dir_to_scan];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if is_missing(&e) => continue,
                Err(e) => {
                    return Err(Error::remote_with(
                        BACKEND,
                        format!("Failed to read directory {:?}", dir),
                        e,
                    ))
                }
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::remote_with(BACKEND, "Failed to read directory entry", e))?
            {
                let entry_path = entry.path();
                let metadata = match entry.metadata().await {
                    Ok(m) => m,
                    Err(e) => {
                        // Raced with a delete
                        debug!(?entry_path, error = %e, "Skipping vanished entry");
                        continue;
                    }
                };

                if metadata.is_dir() {
                    stack.push(entry_path);
                    continue;
                }
                if !metadata.is_file() || is_temp_name(&entry.file_name().to_string_lossy()) {
                    continue;
                }

                let Some(name) = self.key_for(&entry_path) else {
                    warn!(?entry_path, "Skipping file with non UTF-8 path");
                    continue;
                };
                if name.starts_with(prefix) {
                    results.push(ObjectMeta {
                        name,
                        size: metadata.len(),
                        updated: modified_time(metadata.modified()),
                    });
                }
            }
        }

        results.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(results)
    }

    /// Convert a path below the root back into a '/'-joined key
    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.base_path).ok()?;
        let parts = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join("/"))
    }

    /// Remove now-empty directories between `path` and the root
    async fn prune_empty_dirs(&self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.base_path || !dir.starts_with(&self.base_path) {
                break;
            }
            if fs::remove_dir(dir).await.is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

fn is_temp_name(file_name: &str) -> bool {
    file_name.starts_with('.') && file_name.ends_with(".tmp")
}

fn modified_time(modified: std::io::Result<SystemTime>) -> DateTime<Utc> {
    modified.map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now())
}

/// No such path, including when an ancestor component is a file
fn is_missing(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
    )
}

fn map_io_error(name: &str, operation: &str, e: std::io::Error) -> Error {
    if is_missing(&e) {
        Error::not_found(name)
    } else {
        Error::remote_with(BACKEND, format!("Failed to {} {}", operation, name), e)
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn backend_type(&self) -> &'static str {
        BACKEND
    }

    fn location(&self) -> String {
        format!("localfs://{}", self.base_path.display())
    }

    fn lists_sorted(&self) -> bool {
        true
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn head(&self, name: &str) -> Result<ObjectMeta> {
        let full_path = self.resolve_path(name)?;
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| map_io_error(name, "stat", e))?;
        if !metadata.is_file() {
            return Err(Error::not_found(name));
        }

        Ok(ObjectMeta {
            name: name.to_string(),
            size: metadata.len(),
            updated: modified_time(metadata.modified()),
        })
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn open_read(&self, name: &str) -> Result<BlobReader> {
        let full_path = self.resolve_path(name)?;
        debug!(?full_path, "Opening file for read");

        let file = fs::File::open(&full_path)
            .await
            .map_err(|e| map_io_error(name, "open", e))?;
        let metadata = file
            .metadata()
            .await
            .map_err(|e| map_io_error(name, "stat", e))?;
        if !metadata.is_file() {
            return Err(Error::not_found(name));
        }

        Ok(Box::new(file))
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn open_write(&self, name: &str) -> Result<Box<dyn BlobSink>> {
        let full_path = self.resolve_path(name)?;
        let temp_path = Self::temp_path(&full_path);

        // Ensure parent directory exists
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io_error(name, "create directory for", e))?;
        }

        let file = fs::File::create(&temp_path)
            .await
            .map_err(|e| map_io_error(name, "create temp file for", e))?;

        debug!(?full_path, ?temp_path, "Started atomic write");
        Ok(Box::new(LocalSink {
            name: name.to_string(),
            full_path,
            temp_path,
            file: Some(file),
            size: 0,
        }))
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn delete(&self, name: &str) -> Result<()> {
        let full_path = self.resolve_path(name)?;
        debug!(?full_path, "Deleting file");

        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| map_io_error(name, "stat", e))?;
        if !metadata.is_file() {
            return Err(Error::not_found(name));
        }

        fs::remove_file(&full_path)
            .await
            .map_err(|e| map_io_error(name, "delete", e))?;
        self.prune_empty_dirs(&full_path).await;
        Ok(())
    }

    #[instrument(skip(self, request), fields(backend = BACKEND, prefix = %request.prefix))]
    async fn list_page(&self, request: &ListRequest) -> Result<ListPage> {
        let objects = self.walk(&request.prefix).await?;

        // (sort key, object) where None marks a rolled-up common prefix
        let mut entries: Vec<(String, Option<ObjectMeta>)> = Vec::with_capacity(objects.len());
        for meta in objects {
            let folder = request
                .delimiter
                .as_deref()
                .and_then(|delim| folder_for_key(&request.prefix, delim, &meta.name));
            match folder {
                Some(folder) => entries.push((folder, None)),
                None => entries.push((meta.name.clone(), Some(meta))),
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.dedup_by(|a, b| a.0 == b.0);

        let start = match &request.cursor {
            Some(cursor) => entries.partition_point(|(key, _)| key.as_str() <= cursor.as_str()),
            None => 0,
        };
        let total = entries.len();
        let end = (start + request.page_size.max(1)).min(total);

        let mut page = ListPage::default();
        let mut last_key = None;
        for (key, meta) in entries.drain(start..end) {
            match meta {
                Some(meta) => page.objects.push(meta),
                None => page.common_prefixes.push(key.clone()),
            }
            last_key = Some(key);
        }
        if end < total {
            page.next_cursor = last_key;
        }

        debug!(
            objects = page.objects.len(),
            prefixes = page.common_prefixes.len(),
            more = page.next_cursor.is_some(),
            "Listed page"
        );
        Ok(page)
    }
}

/// Pending atomic upload to a hidden temp file
struct LocalSink {
    name: String,
    full_path: PathBuf,
    temp_path: PathBuf,
    file: Option<fs::File>,
    size: u64,
}

#[async_trait]
impl BlobSink for LocalSink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(|| Error::InvalidState {
            message: format!("upload of {} already finished", self.name),
        })?;
        file.write_all(&chunk)
            .await
            .map_err(|e| map_io_error(&self.name, "write", e))?;
        self.size += chunk.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<ObjectMeta> {
        let file = self.file.take().ok_or_else(|| Error::InvalidState {
            message: format!("upload of {} already finished", self.name),
        })?;

        file.sync_all()
            .await
            .map_err(|e| map_io_error(&self.name, "sync", e))?;
        drop(file);

        // Atomic rename
        fs::rename(&self.temp_path, &self.full_path)
            .await
            .map_err(|e| map_io_error(&self.name, "rename", e))?;

        let metadata = fs::metadata(&self.full_path)
            .await
            .map_err(|e| map_io_error(&self.name, "stat", e))?;
        debug!(full_path = ?self.full_path, size = self.size, "File written successfully");

        Ok(ObjectMeta {
            name: self.name.clone(),
            size: metadata.len(),
            updated: modified_time(metadata.modified()),
        })
    }
}

impl Drop for LocalSink {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            // Abandoned before finish, the target is untouched
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}
