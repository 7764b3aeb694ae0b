//! Sequential readers and writers that bypass the scratch-file cache

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use cloudstore_core::{Error, ObjectMeta, OpContext, Result};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tracing::{debug, info};

use crate::backend::{BlobReader, BlobSink};
use crate::object::TRANSFER_CHUNK_SIZE;

/// Streams one stored object's bytes in order
pub struct ObjectReader {
    name: String,
    inner: BlobReader,
}

impl ObjectReader {
    pub(crate) fn new(name: impl Into<String>, inner: BlobReader) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ObjectReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectReader").field("name", &self.name).finish()
    }
}

impl AsyncRead for ObjectReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

/// Streams bytes into one object; nothing is visible until [`close`]
///
/// Dropping the writer without closing it abandons the upload.
///
/// [`close`]: ObjectWriter::close
pub struct ObjectWriter {
    name: String,
    sink: Box<dyn BlobSink>,
    ctx: OpContext,
    written: u64,
}

impl fmt::Debug for ObjectWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectWriter")
            .field("name", &self.name)
            .field("written", &self.written)
            .finish()
    }
}

impl ObjectWriter {
    pub(crate) fn new(name: impl Into<String>, sink: Box<dyn BlobSink>, ctx: OpContext) -> Self {
        Self {
            name: name.into(),
            sink,
            ctx,
            written: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes accepted so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append `buf` to the pending upload
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.write_bytes(Bytes::copy_from_slice(buf)).await
    }

    /// Append an owned chunk to the pending upload
    pub async fn write_bytes(&mut self, chunk: Bytes) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let len = chunk.len() as u64;
        self.ctx.run("write", self.sink.write(chunk)).await?;
        self.written += len;
        Ok(())
    }

    /// Pump everything `reader` yields into the upload
    ///
    /// # Returns
    /// Number of bytes copied
    pub async fn write_from<R>(&mut self, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE];
        let mut copied = 0u64;
        loop {
            let n = self
                .ctx
                .run("read", async {
                    reader.read(&mut buf).await.map_err(|e| Error::Remote {
                        backend: "reader".to_string(),
                        message: format!("read while writing {} failed", self.name),
                        source: Some(Box::new(e)),
                    })
                })
                .await?;
            if n == 0 {
                break;
            }
            self.write_bytes(Bytes::copy_from_slice(&buf[..n])).await?;
            copied += n as u64;
        }
        debug!(name = %self.name, copied, "Copied stream into writer");
        Ok(copied)
    }

    /// Commit the upload
    ///
    /// # Returns
    /// Metadata of the object as now stored
    pub async fn close(self) -> Result<ObjectMeta> {
        let ObjectWriter {
            name,
            sink,
            ctx,
            written,
        } = self;
        let meta = ctx.run("commit", sink.finish()).await?;
        info!(%name, written, "Committed streamed object");
        Ok(meta)
    }
}
