//! Storage backend trait definition
//!
//! Defines the async interface every blob store adapter implements. The
//! store core only ever talks to a backend through this trait.

use async_trait::async_trait;
use bytes::Bytes;
use cloudstore_core::{ListPage, ListRequest, ObjectMeta, Result};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Byte source streaming one stored object in order
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Byte sink for one object upload
///
/// Nothing becomes visible in the backend until `finish` succeeds. Dropping
/// a sink without finishing it abandons the upload.
#[async_trait]
pub trait BlobSink: Send {
    /// Append a chunk to the pending upload
    async fn write(&mut self, chunk: Bytes) -> Result<()>;

    /// Commit the upload as a full overwrite of the object
    ///
    /// # Returns
    /// Metadata of the object as now stored
    async fn finish(self: Box<Self>) -> Result<ObjectMeta>;
}

/// Async trait for blob store backends
///
/// Implementors provide full-object get/put, delete and paged listing over
/// a flat key space.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Stable identifier of the backend family (e.g. "localfs", "s3")
    fn backend_type(&self) -> &'static str;

    /// Human readable location of this backend instance
    fn location(&self) -> String;

    /// Whether listings come back in ascending key order across all pages
    ///
    /// When false, the query engine merges pages itself before yielding a
    /// sorted sequence.
    fn lists_sorted(&self) -> bool {
        false
    }

    /// Fetch the metadata of a stored object
    ///
    /// # Errors
    /// `NotFound` if the object doesn't exist
    async fn head(&self, name: &str) -> Result<ObjectMeta>;

    /// Open a streaming reader over a stored object
    ///
    /// # Errors
    /// `NotFound` if the object doesn't exist
    async fn open_read(&self, name: &str) -> Result<BlobReader>;

    /// Start an upload that replaces the object when finished
    async fn open_write(&self, name: &str) -> Result<Box<dyn BlobSink>>;

    /// Delete a stored object
    ///
    /// # Errors
    /// `NotFound` if the object doesn't exist
    async fn delete(&self, name: &str) -> Result<()>;

    /// Fetch one page of a listing
    ///
    /// Keys under `request.prefix` are returned; when a delimiter is set
    /// backends may roll deeper keys up into `common_prefixes`.
    async fn list_page(&self, request: &ListRequest) -> Result<ListPage>;

    /// Read a whole object into memory
    async fn get(&self, name: &str) -> Result<Bytes> {
        let mut reader = self.open_read(name).await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.map_err(|e| {
            cloudstore_core::Error::remote_with(self.backend_type(), format!("read {} failed", name), e)
        })?;
        Ok(Bytes::from(buf))
    }

    /// Replace an object with `data`
    async fn put(&self, name: &str, data: Bytes) -> Result<ObjectMeta> {
        let mut sink = self.open_write(name).await?;
        sink.write(data).await?;
        sink.finish().await
    }

    /// Check if an object exists
    async fn exists(&self, name: &str) -> Result<bool> {
        match self.head(name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
