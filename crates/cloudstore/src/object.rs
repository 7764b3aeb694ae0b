//! Objects and the cache-backed handles used to read and write them
//!
//! An [`ObjectHandle`] materializes the remote content into a local scratch
//! file on open. Reads, writes, seeks and truncation all hit that file, and
//! closing a mutated read/write handle uploads the whole file as a full
//! overwrite of the remote object.
//!
//! At most one handle per object name should be open at a time within a
//! process. This is a caller contract: nothing here serializes handles on
//! the same name, and concurrent handles race on upload.

use std::fmt;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use cloudstore_core::{AccessMode, Error, ObjectMeta, OpContext, Result};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, info, instrument, warn};

use crate::backend::StorageBackend;
use crate::cache::{CacheFile, CacheFiles};

/// Chunk size used when moving bytes between the backend and a cache file
pub(crate) const TRANSFER_CHUNK_SIZE: usize = 1024 * 1024;

/// Shared pieces every object of one store needs
#[derive(Clone)]
pub(crate) struct ObjectSource {
    pub(crate) backend: Arc<dyn StorageBackend>,
    pub(crate) cache: Arc<CacheFiles>,
}

impl ObjectSource {
    pub(crate) fn existing(&self, meta: ObjectMeta) -> Object {
        Object {
            name: meta.name.clone(),
            meta: Some(meta),
            source: self.clone(),
        }
    }

    pub(crate) fn fresh(&self, name: &str) -> Object {
        Object {
            name: name.to_string(),
            meta: None,
            source: self.clone(),
        }
    }
}

/// A named remote entry, either stored already or about to be created
#[derive(Clone)]
pub struct Object {
    name: String,
    meta: Option<ObjectMeta>,
    source: ObjectSource,
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("name", &self.name)
            .field("backend", &self.source.backend.backend_type())
            .field("meta", &self.meta)
            .finish()
    }
}

impl Object {
    /// Full object key
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the object exists in the backend
    pub fn exists(&self) -> bool {
        self.meta.is_some()
    }

    /// Last-modified time; `None` for an object not yet committed
    pub fn updated(&self) -> Option<DateTime<Utc>> {
        self.meta.as_ref().map(|m| m.updated)
    }

    /// Stored size in bytes; `None` for an object not yet committed
    pub fn size(&self) -> Option<u64> {
        self.meta.as_ref().map(|m| m.size)
    }

    pub fn meta(&self) -> Option<&ObjectMeta> {
        self.meta.as_ref()
    }

    /// Open the object through a local scratch file
    ///
    /// Existing content is downloaded in full before this returns. A new
    /// object opened read/write starts out empty.
    ///
    /// # Errors
    /// `NotFound` when opening a non-existing object read-only, `LocalIo`
    /// for scratch-file failures, backend errors from the download.
    #[instrument(skip(self, ctx), fields(name = %self.name, backend = self.source.backend.backend_type()))]
    pub async fn open(self, ctx: &OpContext, mode: AccessMode) -> Result<ObjectHandle> {
        if !self.exists() && !mode.is_writable() {
            return Err(Error::not_found(&self.name));
        }

        let (cache, mut file) = self.source.cache.create(&self.name).await?;

        if self.exists() {
            let backend = Arc::clone(&self.source.backend);
            let downloaded = ctx
                .run("download", download(backend.as_ref(), &self.name, cache.path(), &mut file))
                .await?;
            debug!(bytes = downloaded, "Downloaded object into cache file");

            if !mode.is_writable() {
                // Read-only handles read through a read-only descriptor
                file = File::open(cache.path())
                    .await
                    .map_err(|e| Error::local_io(cache.path(), e))?;
            }
        }

        Ok(ObjectHandle {
            object: self,
            mode,
            cache,
            file,
            mutated: false,
        })
    }

    /// Delete the object from the backend
    ///
    /// # Errors
    /// `NotFound` if the object doesn't exist
    pub async fn delete(self, ctx: &OpContext) -> Result<()> {
        let backend = Arc::clone(&self.source.backend);
        ctx.run("delete", backend.delete(&self.name)).await?;
        info!(name = %self.name, "Deleted object");
        Ok(())
    }
}

/// Copy the remote content into the scratch file and rewind it
async fn download(
    backend: &dyn StorageBackend,
    name: &str,
    path: &Path,
    file: &mut File,
) -> Result<u64> {
    let mut reader = backend.open_read(name).await?;
    let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await.map_err(|e| {
            Error::remote_with(backend.backend_type(), format!("read {} failed", name), e)
        })?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])
            .await
            .map_err(|e| Error::local_io(path, e))?;
        total += n as u64;
    }

    file.flush().await.map_err(|e| Error::local_io(path, e))?;
    file.seek(io::SeekFrom::Start(0))
        .await
        .map_err(|e| Error::local_io(path, e))?;
    Ok(total)
}

/// Stream the scratch file to the backend as a full overwrite
async fn upload(backend: &dyn StorageBackend, name: &str, path: &Path) -> Result<ObjectMeta> {
    let mut file = File::open(path).await.map_err(|e| Error::local_io(path, e))?;
    let mut sink = backend.open_write(name).await?;
    let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE];

    loop {
        let n = file.read(&mut buf).await.map_err(|e| Error::local_io(path, e))?;
        if n == 0 {
            break;
        }
        sink.write(Bytes::copy_from_slice(&buf[..n])).await?;
    }

    sink.finish().await
}

/// An open object: random access over a local scratch file
///
/// Implements tokio's `AsyncRead`, `AsyncWrite` and `AsyncSeek`, so the
/// usual extension traits and `BufWriter`/`BufReader` apply. Writes through
/// a read-only handle fail with `PermissionDenied`.
///
/// Dropping a handle without [`close`](ObjectHandle::close) discards its
/// changes and deletes the scratch file.
pub struct ObjectHandle {
    object: Object,
    mode: AccessMode,
    cache: CacheFile,
    file: File,
    mutated: bool,
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("name", &self.object.name)
            .field("mode", &self.mode)
            .field("cache_path", &self.cache.path())
            .field("mutated", &self.mutated)
            .finish()
    }
}

impl ObjectHandle {
    pub fn name(&self) -> &str {
        &self.object.name
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// The object this handle was opened from
    pub fn object(&self) -> &Object {
        &self.object
    }

    /// Location of the backing scratch file
    pub fn cache_path(&self) -> &Path {
        self.cache.path()
    }

    /// Whether close will upload
    pub fn needs_upload(&self) -> bool {
        self.mode.is_writable() && (self.mutated || !self.object.exists())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.mode.is_writable() {
            Ok(())
        } else {
            Err(Error::InvalidState {
                message: format!("{} was opened read-only", self.object.name),
            })
        }
    }

    /// Current size of the local content
    pub async fn len(&self) -> Result<u64> {
        let metadata = self
            .file
            .metadata()
            .await
            .map_err(|e| Error::local_io(self.cache.path(), e))?;
        Ok(metadata.len())
    }

    /// Resize the local content
    ///
    /// Shrinking discards trailing bytes, growing zero-fills. The offset is
    /// left where it was.
    pub async fn truncate(&mut self, size: u64) -> Result<()> {
        self.ensure_writable()?;
        self.file
            .set_len(size)
            .await
            .map_err(|e| Error::local_io(self.cache.path(), e))?;
        self.mutated = true;
        Ok(())
    }

    /// Flush buffered writes to the scratch file; the remote is untouched
    pub async fn sync(&mut self) -> Result<()> {
        self.file
            .flush()
            .await
            .map_err(|e| Error::local_io(self.cache.path(), e))?;
        if self.mode.is_writable() {
            self.file
                .sync_data()
                .await
                .map_err(|e| Error::local_io(self.cache.path(), e))?;
        }
        Ok(())
    }

    /// Commit and release the handle
    ///
    /// A read/write handle that was mutated (or opened on a new object) is
    /// uploaded as a full overwrite; on success the returned object carries
    /// the refreshed `updated` time. The scratch file is deleted whatever
    /// the outcome. Nothing is retried, and an upload aborted by `ctx`
    /// commits nothing.
    #[instrument(skip(self, ctx), fields(name = %self.object.name, mode = ?self.mode))]
    pub async fn close(self, ctx: &OpContext) -> Result<Object> {
        let needs_upload = self.needs_upload();
        let ObjectHandle {
            mut object,
            cache,
            mut file,
            ..
        } = self;

        let committed = if needs_upload {
            let flushed = file
                .flush()
                .await
                .map_err(|e| Error::local_io(cache.path(), e));
            drop(file);

            match flushed {
                Ok(()) => {
                    let backend = Arc::clone(&object.source.backend);
                    ctx.run("upload", upload(backend.as_ref(), &object.name, cache.path()))
                        .await
                        .map(Some)
                }
                Err(e) => Err(e),
            }
        } else {
            drop(file);
            Ok(None)
        };

        let removed = cache.remove().await;

        match committed {
            Ok(Some(meta)) => {
                info!(size = meta.size, updated = %meta.updated, "Committed object");
                object.meta = Some(meta);
            }
            Ok(None) => debug!("Closed without changes"),
            Err(e) => {
                warn!(error = %e, "Upload on close failed");
                if let Err(remove_err) = removed {
                    warn!(error = %remove_err, "Failed to remove cache file");
                }
                return Err(e);
            }
        }

        removed?;
        Ok(object)
    }
}

fn read_only_error(name: &str) -> io::Error {
    Error::InvalidState {
        message: format!("{} was opened read-only", name),
    }
    .into()
}

impl AsyncRead for ObjectHandle {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_read(cx, buf)
    }
}

impl AsyncWrite for ObjectHandle {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if !this.mode.is_writable() {
            return Poll::Ready(Err(read_only_error(&this.object.name)));
        }

        let result = Pin::new(&mut this.file).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                this.mutated = true;
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_shutdown(cx)
    }
}

impl AsyncSeek for ObjectHandle {
    fn start_seek(self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        Pin::new(&mut self.get_mut().file).start_seek(position)
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.get_mut().file).poll_complete(cx)
    }
}
